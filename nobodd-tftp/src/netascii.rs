//! RFC 764 netascii framing: CR -> CR NUL, LF -> CR LF.

use std::io::{self, Read};

/// Wraps a byte-oriented `Read` and applies the netascii transform as bytes
/// flow through. One source byte may expand into two wire bytes, so a
/// transformed byte is held in `pending` across `read` calls when the
/// caller's buffer boundary falls between them.
pub struct NetasciiEncoder<R> {
    inner: R,
    pending: Option<u8>,
}

impl<R: Read> NetasciiEncoder<R> {
    pub fn new(inner: R) -> Self {
        NetasciiEncoder {
            inner,
            pending: None,
        }
    }
}

impl<R: Read> Read for NetasciiEncoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if let Some(b) = self.pending.take() {
                buf[filled] = b;
                filled += 1;
                continue;
            }
            let mut one = [0u8; 1];
            if self.inner.read(&mut one)? == 0 {
                break;
            }
            match one[0] {
                b'\r' => {
                    buf[filled] = b'\r';
                    self.pending = Some(0);
                }
                b'\n' => {
                    buf[filled] = b'\r';
                    self.pending = Some(b'\n');
                }
                b => buf[filled] = b,
            }
            filled += 1;
        }
        Ok(filled)
    }
}

/// The length of `reader`'s contents after netascii transformation, for
/// precomputing `tsize` when a client negotiates it in netascii mode.
/// Consumes the reader.
pub fn encoded_length<R: Read>(reader: R) -> io::Result<u64> {
    let mut encoder = NetasciiEncoder::new(reader);
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = encoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_all(data: &[u8]) -> Vec<u8> {
        let mut encoder = NetasciiEncoder::new(Cursor::new(data));
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn lf_becomes_cr_lf() {
        assert_eq!(encode_all(b"a\nb"), b"a\r\nb");
    }

    #[test]
    fn cr_becomes_cr_nul() {
        assert_eq!(encode_all(b"a\rb"), b"a\r\0b");
    }

    #[test]
    fn leaves_plain_bytes_untouched() {
        assert_eq!(encode_all(b"hello"), b"hello");
    }

    #[test]
    fn encoded_length_matches_manual_transform() {
        let data = b"one\ntwo\rthree\n";
        let manual = encode_all(data);
        assert_eq!(encoded_length(Cursor::new(data)).unwrap(), manual.len() as u64);
    }

    #[test]
    fn survives_single_byte_read_buffers() {
        // Exercise the pending-byte carry path across many tiny reads.
        let mut encoder = NetasciiEncoder::new(Cursor::new(b"\n\n\n".to_vec()));
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = encoder.read(&mut byte).unwrap();
            if n == 0 {
                break;
            }
            out.push(byte[0]);
        }
        assert_eq!(out, b"\r\n\r\n\r\n");
    }
}

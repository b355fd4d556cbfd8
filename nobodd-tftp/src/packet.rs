//! Wire encoding and decoding of RFC 1350 / RFC 2347 packets.

use crate::error::{Error, Result};

pub const OP_RRQ: u16 = 1;
pub const OP_WRQ: u16 = 2;
pub const OP_DATA: u16 = 3;
pub const OP_ACK: u16 = 4;
pub const OP_ERROR: u16 = 5;
pub const OP_OACK: u16 = 6;

pub const ERR_UNDEFINED: u16 = 0;
pub const ERR_FILE_NOT_FOUND: u16 = 1;
pub const ERR_ACCESS_VIOLATION: u16 = 2;
pub const ERR_ILLEGAL_OPERATION: u16 = 4;
pub const ERR_UNKNOWN_TID: u16 = 5;
pub const ERR_TERMINATE_OPTION: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Octet,
    NetAscii,
}

impl Mode {
    fn parse(raw: &str) -> Result<Mode> {
        match raw.to_ascii_lowercase().as_str() {
            "octet" => Ok(Mode::Octet),
            "netascii" => Ok(Mode::NetAscii),
            other => Err(Error::UnsupportedMode(other.to_string())),
        }
    }
}

/// A decoded TFTP packet. `Wrq` is decoded (so the dispatcher can reply with
/// a proper ERROR rather than ignoring it as unparseable) but the rest of
/// this crate never constructs or acts on one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: Mode,
        options: Vec<(String, String)>,
    },
    Wrq,
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: Vec<(String, String)>,
    },
}

fn decode_filename(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn take_cstr(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let start = *pos;
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::UnterminatedString)?;
    *pos = start + end + 1;
    Ok(buf[start..start + end].to_vec())
}

fn decode_options(buf: &[u8], pos: &mut usize) -> Result<Vec<(String, String)>> {
    let mut options = Vec::new();
    while *pos < buf.len() {
        let name = decode_filename(&take_cstr(buf, pos)?);
        let value = decode_filename(&take_cstr(buf, pos)?);
        options.push((name, value));
    }
    Ok(options)
}

impl Packet {
    pub fn decode(buf: &[u8]) -> Result<Packet> {
        if buf.len() < 2 {
            return Err(Error::Truncated);
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let mut pos = 2;
        match opcode {
            OP_RRQ => {
                let filename = decode_filename(&take_cstr(buf, &mut pos)?);
                let mode_raw = decode_filename(&take_cstr(buf, &mut pos)?);
                let mode = Mode::parse(&mode_raw)?;
                let options = decode_options(buf, &mut pos)?;
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    options,
                })
            }
            OP_WRQ => Ok(Packet::Wrq),
            OP_DATA => {
                if buf.len() < 4 {
                    return Err(Error::Truncated);
                }
                let block = u16::from_be_bytes([buf[2], buf[3]]);
                Ok(Packet::Data {
                    block,
                    payload: buf[4..].to_vec(),
                })
            }
            OP_ACK => {
                if buf.len() < 4 {
                    return Err(Error::Truncated);
                }
                let block = u16::from_be_bytes([buf[2], buf[3]]);
                Ok(Packet::Ack { block })
            }
            OP_ERROR => {
                if buf.len() < 4 {
                    return Err(Error::Truncated);
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                let mut pos = 4;
                let message = decode_filename(&take_cstr(buf, &mut pos)?);
                Ok(Packet::Error { code, message })
            }
            OP_OACK => {
                let options = decode_options(buf, &mut pos)?;
                Ok(Packet::Oack { options })
            }
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::Rrq { .. } | Packet::Wrq => {
                unreachable!("server never sends a request packet")
            }
            Packet::Data { block, payload } => {
                out.extend_from_slice(&OP_DATA.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                out.extend_from_slice(&OP_ACK.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&OP_ERROR.to_be_bytes());
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(message.as_bytes());
                out.push(0);
            }
            Packet::Oack { options } => {
                out.extend_from_slice(&OP_OACK.to_be_bytes());
                encode_options(&mut out, options);
            }
        }
        out
    }
}

fn encode_options(out: &mut Vec<u8>, options: &[(String, String)]) {
    for (name, value) in options {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
}

/// Encode an RRQ packet; used only by the integration test's miniature
/// client, never by the server itself.
pub fn encode_rrq(filename: &str, mode: &str, options: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&OP_RRQ.to_be_bytes());
    out.extend_from_slice(filename.as_bytes());
    out.push(0);
    out.extend_from_slice(mode.as_bytes());
    out.push(0);
    encode_options(&mut out, options);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ack() {
        let p = Packet::Ack { block: 42 };
        let encoded = p.encode();
        assert_eq!(Packet::decode(&encoded).unwrap(), p);
    }

    #[test]
    fn round_trips_data() {
        let p = Packet::Data {
            block: 7,
            payload: vec![1, 2, 3],
        };
        let encoded = p.encode();
        assert_eq!(Packet::decode(&encoded).unwrap(), p);
    }

    #[test]
    fn decodes_rrq_with_options() {
        let raw = encode_rrq(
            "abc/hello",
            "octet",
            &[("blksize".into(), "1024".into())],
        );
        let decoded = Packet::decode(&raw).unwrap();
        match decoded {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => {
                assert_eq!(filename, "abc/hello");
                assert_eq!(mode, Mode::Octet);
                assert_eq!(options, vec![("blksize".to_string(), "1024".to_string())]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert_eq!(
            Packet::decode(&[0, 9]),
            Err(Error::UnknownOpcode(9))
        );
    }

    #[test]
    fn rejects_unsupported_mode() {
        let raw = encode_rrq("x", "mail", &[]);
        assert!(matches!(
            Packet::decode(&raw),
            Err(Error::UnsupportedMode(_))
        ));
    }
}

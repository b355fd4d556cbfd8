//! RFC 2347 option negotiation: `blksize`, `timeout`, `utimeout`, `tsize`.

use std::time::Duration;

pub const DEFAULT_BLKSIZE: u16 = 512;
pub const MIN_BLKSIZE: i64 = 8;
pub const MAX_BLKSIZE: i64 = 65464;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MIN_TIMEOUT_SECS: i64 = 1;
pub const MAX_TIMEOUT_SECS: i64 = 255;

pub const MIN_UTIMEOUT_US: i64 = 10_000;
pub const MAX_UTIMEOUT_US: i64 = 255_000_000;

/// The options actually in force for a transfer, after clamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub blksize: u16,
    pub timeout: Duration,
    /// `Some(len)` once a `tsize` request has been answered with the real
    /// file length; `None` if the client never asked.
    pub tsize: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            blksize: DEFAULT_BLKSIZE,
            timeout: DEFAULT_TIMEOUT,
            tsize: None,
        }
    }
}

impl Options {
    /// Negotiate this transfer's effective options against the options
    /// requested in an RRQ. Returns the effective options and the
    /// `(name, value)` pairs that should be echoed back in an OACK -- empty
    /// if the RRQ requested none (or requested only unrecognized options),
    /// in which case the transfer skips OACK entirely per RFC 2347.
    pub fn negotiate(requested: &[(String, String)], file_size: u64) -> (Options, Vec<(String, String)>) {
        let mut opts = Options::default();
        let mut ack = Vec::new();
        let mut timeout_from_utimeout = false;

        for (name, value) in requested {
            match name.to_ascii_lowercase().as_str() {
                "blksize" => {
                    if let Ok(v) = value.parse::<i64>() {
                        let clamped = v.clamp(MIN_BLKSIZE, MAX_BLKSIZE) as u16;
                        opts.blksize = clamped;
                        ack.push(("blksize".to_string(), clamped.to_string()));
                    }
                }
                "timeout" => {
                    if let Ok(v) = value.parse::<i64>() {
                        let clamped = v.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
                        ack.push(("timeout".to_string(), clamped.to_string()));
                        if !timeout_from_utimeout {
                            opts.timeout = Duration::from_secs(clamped as u64);
                        }
                    }
                }
                "utimeout" => {
                    if let Ok(v) = value.parse::<i64>() {
                        let clamped = v.clamp(MIN_UTIMEOUT_US, MAX_UTIMEOUT_US);
                        ack.push(("utimeout".to_string(), clamped.to_string()));
                        opts.timeout = Duration::from_micros(clamped as u64);
                        timeout_from_utimeout = true;
                    }
                }
                "tsize" => {
                    if value.trim().parse::<u64>().is_ok() {
                        opts.tsize = Some(file_size);
                        ack.push(("tsize".to_string(), file_size.to_string()));
                    }
                }
                _ => {} // unknown option: silently ignored, never echoed
            }
        }

        (opts, ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_options_means_no_oack() {
        let (opts, ack) = Options::negotiate(&[], 100);
        assert_eq!(opts, Options::default());
        assert!(ack.is_empty());
    }

    #[test]
    fn blksize_within_range_is_echoed_unchanged() {
        let (opts, ack) = Options::negotiate(&[("blksize".into(), "1024".into())], 100);
        assert_eq!(opts.blksize, 1024);
        assert_eq!(ack, vec![("blksize".to_string(), "1024".to_string())]);
    }

    #[test]
    fn blksize_out_of_range_is_clamped_and_echoed() {
        let (opts, ack) = Options::negotiate(&[("blksize".into(), "99999".into())], 100);
        assert_eq!(opts.blksize, MAX_BLKSIZE as u16);
        assert_eq!(ack, vec![("blksize".to_string(), MAX_BLKSIZE.to_string())]);
    }

    #[test]
    fn utimeout_wins_over_timeout_regardless_of_order() {
        let (opts, _) = Options::negotiate(
            &[
                ("timeout".into(), "2".into()),
                ("utimeout".into(), "50000".into()),
            ],
            0,
        );
        assert_eq!(opts.timeout, Duration::from_micros(50_000));

        let (opts, _) = Options::negotiate(
            &[
                ("utimeout".into(), "50000".into()),
                ("timeout".into(), "2".into()),
            ],
            0,
        );
        assert_eq!(opts.timeout, Duration::from_micros(50_000));
    }

    #[test]
    fn tsize_echoes_actual_file_size() {
        let (opts, ack) = Options::negotiate(&[("tsize".into(), "0".into())], 12345);
        assert_eq!(opts.tsize, Some(12345));
        assert_eq!(ack, vec![("tsize".to_string(), "12345".to_string())]);
    }

    #[test]
    fn unknown_options_are_ignored() {
        let (opts, ack) = Options::negotiate(&[("windowsize".into(), "4".into())], 0);
        assert_eq!(opts, Options::default());
        assert!(ack.is_empty());
    }
}

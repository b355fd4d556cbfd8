use thiserror::Error;

/// Failure to decode a datagram as a well-formed TFTP packet. Never
/// surfaced to a peer directly -- the dispatcher maps a decode failure to
/// `ERROR(4, "illegal TFTP operation")`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("packet shorter than the minimum opcode field")]
    Truncated,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("string field is missing its NUL terminator")]
    UnterminatedString,

    #[error("unsupported transfer mode {0:?}")]
    UnsupportedMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

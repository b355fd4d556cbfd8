use std::net::IpAddr;

use thiserror::Error;

/// Failures that abort startup or a configuration reload outright. Per-RRQ
/// failures never reach this type -- they are mapped directly to a TFTP
/// ERROR packet by the boot server (see `bootserver::Resolved`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read configuration file `{path}`")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file `{path}`")]
    ConfigParse {
        path: String,
        #[source]
        source: ini::Error,
    },

    #[error("invalid glob pattern `{pattern}` in includedir")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("[board:{serial}] is missing required key `image`")]
    MissingImage { serial: String },

    #[error("[board:{serial}] has invalid `partition` value `{value}`")]
    InvalidPartition { serial: String, value: String },

    #[error("[board:{serial}] has invalid `ip` value `{value}`")]
    InvalidIp { serial: String, value: String },

    #[error("invalid --board argument `{0}`, expected SERIAL,PATH[,PART[,IP]]")]
    InvalidBoardArg(String),

    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown listen address form `{0}`")]
    UnknownListenForm(String),

    #[error("unknown port or service name `{0}`")]
    UnknownPortForm(String),

    #[error("fd inherited via {0} is not a valid socket")]
    InheritedFdInvalid(&'static str),

    /// Not a failure in the usual sense: the event loop returned because it
    /// was asked to shut down. Carried through as an `Err` so `main` has a
    /// single place that maps outcomes to process exit codes.
    #[error("interrupted by signal {0}")]
    Interrupted(i32),
}

impl Error {
    /// The process exit code this failure should produce, per the CLI's
    /// documented exit-code contract: 2 for a bind failure, 1 for any other
    /// startup/config error, 128+signal for a signal-triggered shutdown
    /// (130 for the common `SIGINT` case).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Bind { .. } => 2,
            Error::Interrupted(signal) => 128 + signal,
            _ => 1,
        }
    }
}

/// A per-client, per-RRQ failure. Never fatal to the server -- the
/// dispatcher turns this into a TFTP ERROR reply (or, for `Damaged`, a
/// server-side log entry plus ERROR(0)).
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unknown board serial `{0}`")]
    UnknownSerial(String),

    #[error("source address {addr} does not match board's IP ACL")]
    IpAclMismatch { addr: IpAddr },

    #[error(transparent)]
    Fat(#[from] nobodd_fat::Error),

    #[error("failed to open partition window")]
    Partition(#[source] anyhow::Error),

    /// The FAT filesystem for this board's (image, partition) pair could
    /// not be mounted at all (cached across requests so a damaged board
    /// doesn't re-parse its BPB on every RRQ).
    #[error("board's FAT filesystem is damaged: {0}")]
    Damaged(String),
}

use thiserror::Error;

/// Everything that can go wrong while parsing or walking a FAT filesystem.
#[derive(Debug, Error)]
pub enum Error {
    /// The BPB failed validation (bad signature, inconsistent geometry, …) and
    /// the filesystem cannot be mounted at all.
    #[error("damaged FAT filesystem: {0}")]
    Damaged(&'static str),

    /// A read past the end of the underlying byte window.
    #[error("read of {len} bytes at offset {offset} is out of range (window is {window_len} bytes)")]
    OutOfRange {
        offset: u64,
        len: u64,
        window_len: u64,
    },

    /// The FAT contains the bad-cluster marker while walking a chain.
    #[error("bad cluster {0} encountered while walking cluster chain")]
    BadCluster(u32),

    /// A cluster chain revisits a cluster it has already walked.
    #[error("cluster chain cycle detected at cluster {0}")]
    Cycle(u32),

    /// A path component did not match any directory entry.
    #[error("path not found: {0}")]
    NotFound(String),

    /// A non-terminal path component named a file, not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Underlying I/O error from the byte window.
    #[error("I/O error reading FAT structures: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

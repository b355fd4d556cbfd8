//! A read-only FAT12/16/32 reader over a random-access byte window.
//!
//! This crate knows nothing about files, mmap, or partitions — it consumes
//! anything implementing [`RandomRead`] and exposes path resolution,
//! directory listing, and seekable file reads over it. The binary crate
//! supplies the concrete, memory-mapped backing.

mod bpb;
mod dir;
mod error;
mod fat_table;
mod file;
mod fs;
mod path;
mod timestamp;
mod window;

pub use bpb::FatType;
pub use dir::Entry;
pub use error::{Error, Result};
pub use file::FatFile;
pub use fs::FatFileSystem;
pub use path::FatPath;
pub use window::{MemoryWindow, RandomRead, Window};

//! Memory-mapped disk images: the concrete [`nobodd_fat::RandomRead`]
//! backing for the server binary.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use memmap2::Mmap;
use nobodd_fat::RandomRead;

/// An immutable, memory-mapped view of a whole disk image file. Opened once
/// per distinct image path and shared (via `Window`'s `Arc`) across every
/// board and transfer that references it.
pub struct DiskImage {
    path: PathBuf,
    mmap: Mmap,
}

impl DiskImage {
    pub fn open(path: &Path) -> anyhow::Result<DiskImage> {
        let file = File::open(path)
            .with_context(|| format!("failed to open disk image `{}`", path.display()))?;
        // SAFETY: the server treats disk images as read-only for its entire
        // lifetime; concurrent external modification of the backing file is
        // the same hazard any read-only mmap consumer accepts.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map disk image `{}`", path.display()))?;
        Ok(DiskImage { path: path.to_path_buf(), mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RandomRead for DiskImage {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::InvalidInput)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(io::ErrorKind::InvalidInput)?;
        let slice = self
            .mmap
            .get(start..end)
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(slice);
        Ok(())
    }
}

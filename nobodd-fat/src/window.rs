use std::sync::Arc;

use crate::error::{Error, Result};

/// Random-access read access to a fixed-length byte region.
///
/// Implemented by whatever concrete storage backs a partition (a
/// memory-mapped disk image slice in the server binary, a plain `Vec<u8>`
/// in tests). The FAT reader never assumes anything about the storage
/// beyond this trait.
pub trait RandomRead: Send + Sync {
    /// Total length of the region in bytes.
    fn len(&self) -> u64;

    /// Fill `buf` with bytes starting at `offset`. `offset + buf.len()`
    /// must not exceed `len()`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

/// An in-memory `RandomRead` backing, mainly useful for tests and for small
/// embedded configuration blobs.
#[derive(Clone)]
pub struct MemoryWindow(Arc<[u8]>);

impl MemoryWindow {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self(data.into())
    }
}

impl RandomRead for MemoryWindow {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| std::io::ErrorKind::InvalidInput)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(std::io::ErrorKind::InvalidInput)?;
        let slice = self
            .0
            .get(start..end)
            .ok_or(std::io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(slice);
        Ok(())
    }
}

/// A byte-addressable region of some backing storage: a `(base, length)`
/// pair plus a shared reference to the storage itself. Clones are a pointer
/// and two integers — the backing storage is never copied.
#[derive(Clone)]
pub struct Window {
    inner: Arc<dyn RandomRead>,
    base: u64,
    len: u64,
}

impl Window {
    /// Wrap the whole of `inner` as a window.
    pub fn whole(inner: Arc<dyn RandomRead>) -> Self {
        let len = inner.len();
        Window {
            inner,
            base: 0,
            len,
        }
    }

    /// Length of this window in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read `len` bytes starting at `offset` (relative to this window) and
    /// return them as a freshly allocated buffer.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read into an existing buffer, failing if the read would run past the
    /// end of the window.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let want_end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OutOfRange {
                offset,
                len: buf.len() as u64,
                window_len: self.len,
            })?;
        if want_end > self.len {
            return Err(Error::OutOfRange {
                offset,
                len: buf.len() as u64,
                window_len: self.len,
            });
        }
        self.inner
            .read_at(self.base + offset, buf)
            .map_err(Error::Io)
    }

    /// Produce an independent sub-window `[offset, offset+len)` of this one.
    pub fn subwindow(&self, offset: u64, len: u64) -> Result<Window> {
        let end = offset.checked_add(len).ok_or(Error::OutOfRange {
            offset,
            len,
            window_len: self.len,
        })?;
        if end > self.len {
            return Err(Error::OutOfRange {
                offset,
                len,
                window_len: self.len,
            });
        }
        Ok(Window {
            inner: Arc::clone(&self.inner),
            base: self.base + offset,
            len,
        })
    }
}

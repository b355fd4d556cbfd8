//! Opening a directory entry as a seekable, read-only byte stream.

use std::io::{self, Read, Seek, SeekFrom};

use crate::bpb::Bpb;
use crate::error::Error;
use crate::fat_table::FatTable;
use crate::window::Window;

/// A read-only, seekable view of a file's contents, backed by its cluster
/// chain. The chain is walked once up front (catching a bad-cluster marker
/// or a cycle at open time rather than mid-transfer) and cached, so every
/// subsequent seek is an O(1) index into the cached cluster list.
pub struct FatFile {
    volume: Window,
    clusters: Vec<u32>,
    bytes_per_cluster: u64,
    data_offset: u64,
    size: u64,
    pos: u64,
}

impl FatFile {
    pub(crate) fn open(
        volume: &Window,
        bpb: &Bpb,
        fat: &FatTable,
        first_cluster: u32,
        size: u32,
    ) -> crate::error::Result<FatFile> {
        let size = u64::from(size);
        let clusters = if size == 0 {
            Vec::new()
        } else {
            fat.chain(first_cluster)
                .collect::<crate::error::Result<Vec<u32>>>()?
        };
        if size > 0 && clusters.is_empty() {
            return Err(Error::Damaged(
                "non-empty file has no cluster chain (first cluster is reserved/free)",
            ));
        }
        Ok(FatFile {
            volume: volume.clone(),
            clusters,
            bytes_per_cluster: bpb.bytes_per_cluster(),
            data_offset: bpb.data_offset(),
            size,
            pos: 0,
        })
    }

    /// Total size of the file in bytes, per its directory entry.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn cluster_byte_offset(&self, cluster: u32) -> u64 {
        self.data_offset + u64::from(cluster - 2) * self.bytes_per_cluster
    }
}

impl Read for FatFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let remaining = self.size - self.pos;
        let want = (buf.len() as u64).min(remaining);
        let mut filled: u64 = 0;

        while filled < want {
            let cluster_index = ((self.pos) / self.bytes_per_cluster) as usize;
            let in_cluster_offset = self.pos % self.bytes_per_cluster;
            let cluster = *self.clusters.get(cluster_index).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "short cluster chain")
            })?;

            let chunk_len = (want - filled).min(self.bytes_per_cluster - in_cluster_offset);
            let abs_offset = self.cluster_byte_offset(cluster) + in_cluster_offset;

            let dst = &mut buf[filled as usize..(filled + chunk_len) as usize];
            self.volume
                .read_into(abs_offset, dst)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            filled += chunk_len;
            self.pos += chunk_len;
        }
        Ok(filled as usize)
    }
}

impl Seek for FatFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.size as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

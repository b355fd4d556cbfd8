//! Top-level FAT filesystem: ties the BPB, FAT table, and directory walker
//! together into path resolution and file opening.

use chrono::{DateTime, FixedOffset};
use log::warn;

use crate::bpb::{Bpb, FatType};
use crate::dir::{self, Entry};
use crate::error::{Error, Result};
use crate::fat_table::FatTable;
use crate::file::FatFile;
use crate::path::FatPath;
use crate::timestamp;
use crate::window::Window;

/// A mounted, read-only FAT12/16/32 volume.
///
/// Holds the BPB and first FAT table for the lifetime of the mount; nothing
/// else is cached here (the binary crate's `FatFileSystem` cache is keyed on
/// `(image path, partition)` and holds one of these per entry, see the boot
/// server).
pub struct FatFileSystem {
    volume: Window,
    bpb: Bpb,
    fat: FatTable,
    tz: Option<FixedOffset>,
}

impl FatFileSystem {
    /// Mount `volume` (already sliced to the partition's extent) as a FAT
    /// filesystem. `tz` is applied when decoding directory entry timestamps;
    /// `None` means UTC.
    pub fn open(volume: Window, tz: Option<FixedOffset>) -> Result<FatFileSystem> {
        let bpb = Bpb::read(&volume)?;
        let fat = FatTable::open(&volume, &bpb)?;
        let fs = FatFileSystem {
            volume,
            bpb,
            fat,
            tz,
        };
        if fs.is_dirty()? {
            warn!("filesystem dirty bit is set (not cleanly unmounted); mounting read-only anyway");
        }
        Ok(fs)
    }

    pub fn fat_type(&self) -> FatType {
        self.bpb.fat_type
    }

    /// Whether the FAT32 FSInfo sector failed validation at mount time. The
    /// volume is still fully readable; this only flags that its free-cluster
    /// hints couldn't be trusted (irrelevant to a read-only server, but worth
    /// surfacing for diagnostics).
    pub fn is_damaged(&self) -> bool {
        self.bpb.fs_info_damaged
    }

    /// Whether the volume's dirty bit is set, meaning it was not cleanly
    /// unmounted. FAT12 carries no such bit and always reads clean.
    pub fn is_dirty(&self) -> Result<bool> {
        let entry1 = self.fat.read_entry(1)?;
        Ok(match self.bpb.fat_type {
            FatType::Fat12 => false,
            FatType::Fat16 => entry1 & 0x8000 == 0,
            FatType::Fat32 => entry1 & 0x0800_0000 == 0,
        })
    }

    fn read_cluster_chain(&self, start_cluster: u32) -> Result<Vec<u8>> {
        let bytes_per_cluster = self.bpb.bytes_per_cluster() as usize;
        let mut buf = Vec::new();
        for cluster in self.fat.chain(start_cluster) {
            let cluster = cluster?;
            let offset = self.bpb.cluster_offset(cluster);
            let start = buf.len();
            buf.resize(start + bytes_per_cluster, 0);
            self.volume.read_into(offset, &mut buf[start..])?;
        }
        Ok(buf)
    }

    fn root_dir_bytes(&self) -> Result<Vec<u8>> {
        match self.bpb.fat_type {
            FatType::Fat32 => self.read_cluster_chain(self.bpb.root_cluster),
            FatType::Fat12 | FatType::Fat16 => {
                let len = u64::from(self.bpb.root_dir_sectors()) * u64::from(self.bpb.bytes_per_sector);
                self.volume.read(self.bpb.root_dir_offset(), len as usize)
            }
        }
    }

    fn dir_entries(&self, dir: &Entry) -> Result<Vec<Entry>> {
        Ok(dir::iter_entries(&self.read_cluster_chain(dir.first_cluster)?).collect())
    }

    /// Entries of the root directory, including the volume-ID pseudo-entry
    /// if one is present (callers that want plain files should filter with
    /// `Entry::is_volume_id`).
    pub fn root_entries(&self) -> Result<Vec<Entry>> {
        Ok(dir::iter_entries(&self.root_dir_bytes()?).collect())
    }

    /// List the entries of the directory at `path`.
    pub fn read_dir(&self, path: &FatPath) -> Result<Vec<Entry>> {
        if path.is_root() {
            return self.root_entries();
        }
        let entry = self.resolve(path)?;
        if !entry.is_directory() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }
        self.dir_entries(&entry)
    }

    /// Resolve `path` to its directory entry, descending component by
    /// component from the root, matching case-insensitively against either
    /// the long or short name.
    pub fn resolve(&self, path: &FatPath) -> Result<Entry> {
        let components = path.components();
        if components.is_empty() {
            return Err(Error::NotFound(path.display().to_string()));
        }

        let mut entries = self.root_entries()?;
        let mut found = None;
        for (i, component) in components.iter().enumerate() {
            let matched = entries
                .iter()
                .find(|e| !e.is_volume_id() && e.name_matches(component))
                .cloned()
                .ok_or_else(|| Error::NotFound(path.display().to_string()))?;

            if i + 1 < components.len() {
                if !matched.is_directory() {
                    return Err(Error::NotADirectory(matched.display_name().to_string()));
                }
                entries = self.dir_entries(&matched)?;
            }
            found = Some(matched);
        }
        Ok(found.expect("components is non-empty"))
    }

    /// Open the file at `path` as a seekable byte stream.
    pub fn open_file(&self, path: &FatPath) -> Result<FatFile> {
        let entry = self.resolve(path)?;
        if entry.is_directory() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }
        FatFile::open(&self.volume, &self.bpb, &self.fat, entry.first_cluster, entry.size)
    }

    /// Decode an entry's last-written timestamp using this filesystem's
    /// configured timezone offset.
    pub fn written_datetime(&self, entry: &Entry) -> Option<DateTime<FixedOffset>> {
        timestamp::decode_datetime(entry.written_date, entry.written_time, 0, self.tz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::MemoryWindow;
    use std::io::Read;
    use std::sync::Arc;

    /// Build a tiny FAT16 image in memory: one root directory entry naming a
    /// two-cluster file, via the `fatfs` crate so the fixture matches a real
    /// on-disk layout rather than our own (possibly self-consistently wrong)
    /// encoding.
    fn fixture_image() -> Vec<u8> {
        use fatfs::{FatType as FsFatType, Write as _};

        let size = 2 * 1024 * 1024;
        let mut data = vec![0u8; size];
        fatfs::format_volume(
            &mut std::io::Cursor::new(&mut data[..]),
            fatfs::FormatVolumeOptions::new().fat_type(FsFatType::Fat16),
        )
        .unwrap();
        {
            let fs = fatfs::FileSystem::new(
                std::io::Cursor::new(&mut data[..]),
                fatfs::FsOptions::new(),
            )
            .unwrap();
            let root = fs.root_dir();
            let mut file = root.create_file("CONFIG.TXT").unwrap();
            file.write_all(&vec![b'x'; 9000]).unwrap();
        }
        data
    }

    #[test]
    fn mounts_and_reads_file_written_by_fatfs() {
        let data = fixture_image();
        let window = Window::whole(Arc::new(MemoryWindow::new(data)));
        let fs = FatFileSystem::open(window, None).unwrap();
        assert_eq!(fs.fat_type(), FatType::Fat16);

        let mut file = fs.open_file(&FatPath::new("/CONFIG.TXT")).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 9000);
        assert!(out.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn not_found_for_missing_path() {
        let data = fixture_image();
        let window = Window::whole(Arc::new(MemoryWindow::new(data)));
        let fs = FatFileSystem::open(window, None).unwrap();
        assert!(matches!(
            fs.open_file(&FatPath::new("/NOPE.TXT")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn not_a_directory_for_file_in_path_prefix() {
        let data = fixture_image();
        let window = Window::whole(Arc::new(MemoryWindow::new(data)));
        let fs = FatFileSystem::open(window, None).unwrap();
        assert!(matches!(
            fs.open_file(&FatPath::new("/CONFIG.TXT/NOPE")),
            Err(Error::NotADirectory(_))
        ));
    }
}

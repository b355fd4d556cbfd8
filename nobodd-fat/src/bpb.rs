//! Parsing and validation of the BIOS Parameter Block (BPB).

use crate::error::{Error, Result};
use crate::window::Window;

/// The three FAT flavors, distinguished purely by cluster count (never by
/// any label or explicit tag in the BPB — DOS never wrote one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// The first "reserved/end-of-chain" value for this FAT flavor; any
    /// table entry at or above this value terminates a cluster chain.
    pub fn end_of_chain_min(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// The exact "bad cluster" marker value for this FAT flavor.
    pub fn bad_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }
}

/// Decoded, validated BPB geometry. This is everything later components need
/// to locate the FAT tables, the root directory, and the data region.
#[derive(Debug, Clone)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors: u32,
    pub fat_size: u32,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub volume_label: [u8; 11],
    pub fat_type: FatType,
    pub cluster_count: u32,
    /// `true` if the FAT32 FSInfo sector's signatures did not validate.
    /// The filesystem stays mountable, read-only, but is flagged degraded.
    pub fs_info_damaged: bool,
}

const SECTOR_SIGNATURE_OFFSET: usize = 510;
const SECTOR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl Bpb {
    /// Read and validate the BPB from sector 0 of `window`.
    ///
    /// Returns `Error::Damaged` if the sector signature is missing or the
    /// claimed geometry is internally inconsistent (per the original spec's
    /// "decline construction" rule); other malformed-but-plausible BPBs are
    /// accepted read-only.
    pub fn read(window: &Window) -> Result<Bpb> {
        let sector = window.read(0, 512)?;

        if sector[SECTOR_SIGNATURE_OFFSET..SECTOR_SIGNATURE_OFFSET + 2] != SECTOR_SIGNATURE {
            return Err(Error::Damaged("missing 0x55AA boot sector signature"));
        }

        let bytes_per_sector = u16_at(&sector, 11);
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(Error::Damaged("bytes-per-sector out of range"));
        }

        let sectors_per_cluster = sector[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(Error::Damaged("sectors-per-cluster is not a power of two"));
        }

        let reserved_sector_count = u16_at(&sector, 14);
        if reserved_sector_count < 1 {
            return Err(Error::Damaged("reserved sector count is zero"));
        }

        let num_fats = sector[16];
        if !matches!(num_fats, 1 | 2) {
            return Err(Error::Damaged("number of FATs must be 1 or 2"));
        }

        let root_entry_count = u16_at(&sector, 17);

        let total_sectors_16 = u16_at(&sector, 19);
        let total_sectors_32 = u32_at(&sector, 32);
        let total_sectors = if total_sectors_16 != 0 {
            u32::from(total_sectors_16)
        } else {
            total_sectors_32
        };

        let fat_size_16 = u16_at(&sector, 22);
        let (fat_size, root_cluster, fs_info_sector) = if fat_size_16 != 0 {
            (u32::from(fat_size_16), 0, 0)
        } else {
            // FAT32 extended BPB.
            let fat_size_32 = u32_at(&sector, 36);
            let root_cluster = u32_at(&sector, 44);
            let fs_info_sector = u16_at(&sector, 48);
            (fat_size_32, root_cluster, fs_info_sector)
        };
        if fat_size == 0 {
            return Err(Error::Damaged("FAT size is zero"));
        }

        let root_dir_sectors = (u32::from(root_entry_count) * 32
            + u32::from(bytes_per_sector)
            - 1)
            / u32::from(bytes_per_sector);

        let data_sectors = total_sectors
            .checked_sub(u32::from(reserved_sector_count))
            .and_then(|v| v.checked_sub(u32::from(num_fats) * fat_size))
            .and_then(|v| v.checked_sub(root_dir_sectors))
            .ok_or(Error::Damaged("geometry fields overflow total sector count"))?;

        let cluster_count = data_sectors / u32::from(sectors_per_cluster);

        let fat_type = if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        // Cross-check: a volume claiming to be FAT32 (fat_size_16 == 0, i.e.
        // we took the extended-BPB branch above) must land in the FAT32
        // bucket, and vice versa -- this is the "cluster_count is
        // inconsistent with the claimed type-specific fields" decline rule.
        let claims_fat32 = fat_size_16 == 0;
        if claims_fat32 != matches!(fat_type, FatType::Fat32) {
            return Err(Error::Damaged(
                "cluster count inconsistent with FAT12/16 vs FAT32 BPB layout",
            ));
        }

        let mut volume_label = [0u8; 11];
        let mut fs_info_damaged = false;
        if matches!(fat_type, FatType::Fat32) {
            volume_label.copy_from_slice(&sector[71..82]);

            fs_info_damaged = match Self::check_fs_info(window, fs_info_sector, bytes_per_sector) {
                Ok(valid) => !valid,
                Err(_) => true,
            };
        } else {
            volume_label.copy_from_slice(&sector[43..54]);
        }

        Ok(Bpb {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            num_fats,
            root_entry_count,
            total_sectors,
            fat_size,
            root_cluster,
            fs_info_sector,
            volume_label,
            fat_type,
            cluster_count,
            fs_info_damaged,
        })
    }

    fn check_fs_info(window: &Window, fs_info_sector: u16, bytes_per_sector: u16) -> Result<bool> {
        let offset = u64::from(fs_info_sector) * u64::from(bytes_per_sector);
        let sector = window.read(offset, 512)?;
        let lead = u32_at(&sector, 0);
        let struct_sig = u32_at(&sector, 484);
        let trail = u32_at(&sector, 508);
        Ok(lead == 0x4161_5252 && struct_sig == 0x6141_7272 && trail == 0xAA55_0000)
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_cluster)
    }

    pub fn root_dir_sectors(&self) -> u32 {
        (u32::from(self.root_entry_count) * 32 + u32::from(self.bytes_per_sector) - 1)
            / u32::from(self.bytes_per_sector)
    }

    /// Offset (in bytes, from the start of the volume) of the first FAT.
    pub fn fat_offset(&self) -> u64 {
        u64::from(self.reserved_sector_count) * u64::from(self.bytes_per_sector)
    }

    /// Offset of the fixed-size root directory region (FAT12/16 only).
    pub fn root_dir_offset(&self) -> u64 {
        self.fat_offset() + u64::from(self.num_fats) * u64::from(self.fat_size) * u64::from(self.bytes_per_sector)
    }

    /// Offset of the first data cluster (cluster #2).
    pub fn data_offset(&self) -> u64 {
        self.root_dir_offset() + u64::from(self.root_dir_sectors()) * u64::from(self.bytes_per_sector)
    }

    /// Byte offset of the start of `cluster` within the data region.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + u64::from(cluster - 2) * self.bytes_per_cluster()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_fat16_sector() -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[11..13].copy_from_slice(&512u16.to_le_bytes()); // bytes/sector
        s[13] = 4; // sectors/cluster
        s[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        s[16] = 2; // num fats
        s[17..19].copy_from_slice(&512u16.to_le_bytes()); // root entries
        s[19..21].copy_from_slice(&20000u16.to_le_bytes()); // total sectors 16
        s[22..24].copy_from_slice(&100u16.to_le_bytes()); // fat size 16
        s[43..54].copy_from_slice(b"NOBODD     ");
        s[510..512].copy_from_slice(&SECTOR_SIGNATURE);
        s
    }

    #[test]
    fn parses_plausible_fat16() {
        let sector = synthetic_fat16_sector();
        let win = Window::whole(std::sync::Arc::new(crate::window::MemoryWindow::new(sector)));
        let bpb = Bpb::read(&win).unwrap();
        assert_eq!(bpb.fat_type, FatType::Fat16);
        assert_eq!(bpb.bytes_per_sector, 512);
    }

    #[test]
    fn missing_signature_is_damaged() {
        let mut sector = synthetic_fat16_sector();
        sector[510] = 0;
        sector[511] = 0;
        let win = Window::whole(std::sync::Arc::new(crate::window::MemoryWindow::new(sector)));
        assert!(matches!(Bpb::read(&win), Err(Error::Damaged(_))));
    }

    #[test]
    fn non_power_of_two_cluster_size_is_damaged() {
        let mut sector = synthetic_fat16_sector();
        sector[13] = 3;
        let win = Window::whole(std::sync::Arc::new(crate::window::MemoryWindow::new(sector)));
        assert!(matches!(Bpb::read(&win), Err(Error::Damaged(_))));
    }
}

//! Directory entry decoding and VFAT long-filename (LFN) reassembly.

use std::collections::BTreeMap;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LFN: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

const LAST_LFN_ENTRY: u8 = 0x40;
const ENTRY_FREE: u8 = 0xE5;
const ENTRY_END: u8 = 0x00;

/// A fully decoded directory entry: the raw 8.3 short name, the
/// reassembled long name if one was present and checksum-valid, and the
/// fields needed to open the entry as a file or descend into it as a
/// directory.
#[derive(Debug, Clone)]
pub struct Entry {
    pub short_name: String,
    pub long_name: Option<String>,
    pub attributes: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub created_date: u16,
    pub created_time: u16,
    pub created_tenths: u8,
    pub accessed_date: u16,
    pub written_date: u16,
    pub written_time: u16,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_id(&self) -> bool {
        self.attributes & ATTR_VOLUME_ID != 0
    }

    /// The name that should be used for display and for matching against a
    /// user-supplied path component: the long name if one reassembled
    /// correctly, the short name otherwise.
    pub fn display_name(&self) -> &str {
        self.long_name.as_deref().unwrap_or(&self.short_name)
    }

    /// Case-insensitive match against either the long or short name.
    pub fn name_matches(&self, component: &str) -> bool {
        self.short_name.eq_ignore_ascii_case(component)
            || self
                .long_name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(component))
    }
}

fn format_short_name(raw: &[u8; 11]) -> String {
    let base = String::from_utf8_lossy(&raw[0..8]);
    let ext = String::from_utf8_lossy(&raw[8..11]);
    let base = base.trim_end();
    let ext = ext.trim_end();
    if ext.is_empty() {
        base.to_string()
    } else {
        format!("{base}.{ext}")
    }
}

/// The checksum DOS/VFAT binds an LFN sequence to its 8.3 short-name
/// entry with: a rotate-right-8-and-add over the 11 raw short-name bytes.
pub fn short_name_checksum(raw: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in raw {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

/// Accumulates LFN slots for the directory entries currently "in flight"
/// (i.e. seen since the last short entry, deletion, or checksum mismatch).
/// Tied to a single pass over one directory's entries; never reused across
/// directories.
#[derive(Default)]
struct LfnAccumulator {
    checksum: Option<u8>,
    slots: BTreeMap<u8, [u16; 13]>,
}

impl LfnAccumulator {
    fn reset(&mut self) {
        self.checksum = None;
        self.slots.clear();
    }

    fn push(&mut self, raw: &[u8; 32]) {
        let order = raw[0];
        let seq = order & 0x1F;
        let checksum = raw[13];

        // A new sequence (or one with a different checksum) invalidates
        // whatever was accumulated before it -- treat it as starting fresh.
        if self.checksum.is_some_and(|c| c != checksum) {
            self.slots.clear();
        }
        self.checksum = Some(checksum);

        let mut chars = [0u16; 13];
        for i in 0..5 {
            chars[i] = u16::from_le_bytes([raw[1 + i * 2], raw[2 + i * 2]]);
        }
        for i in 0..6 {
            chars[5 + i] = u16::from_le_bytes([raw[14 + i * 2], raw[15 + i * 2]]);
        }
        for i in 0..2 {
            chars[11 + i] = u16::from_le_bytes([raw[28 + i * 2], raw[29 + i * 2]]);
        }

        self.slots.insert(seq, chars);
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reassemble the accumulated slots into a name, provided the checksum
    /// matches the short entry that follows. Consumes the accumulator state
    /// (the caller always resets after emission or mismatch).
    fn finish(&self, short_name_raw: &[u8; 11]) -> Option<String> {
        let checksum = self.checksum?;
        if short_name_checksum(short_name_raw) != checksum {
            return None;
        }
        // Sequence numbers are 1-based and contiguous; if any is missing
        // the LFN is corrupt and we fall back to the short name.
        let n = self.slots.len() as u8;
        let mut units = Vec::with_capacity(self.slots.len() * 13);
        for seq in 1..=n {
            let chars = self.slots.get(&seq)?;
            units.extend_from_slice(chars);
        }
        let end = units.iter().position(|&c| c == 0x0000 || c == 0xFFFF);
        let units = match end {
            Some(i) => &units[..i],
            None => &units[..],
        };
        Some(String::from_utf16_lossy(units))
    }
}

/// Walk a flat byte blob of 32-byte directory entries (already the full,
/// concatenated contents of a directory -- either the FAT12/16 fixed root
/// region or a FAT32/subdirectory cluster chain) yielding decoded `Entry`
/// values with LFN reassembly applied.
pub fn iter_entries(raw: &[u8]) -> impl Iterator<Item = Entry> + '_ {
    let mut lfn = LfnAccumulator::default();
    raw.chunks_exact(32).map_while(move |chunk| -> Option<Option<Entry>> {
        let chunk: &[u8; 32] = chunk.try_into().expect("chunks_exact(32)");
        if chunk[0] == ENTRY_END {
            return None;
        }
        if chunk[0] == ENTRY_FREE {
            lfn.reset();
            return Some(None);
        }
        let attributes = chunk[11];
        if attributes & ATTR_LFN == ATTR_LFN {
            lfn.push(chunk);
            return Some(None);
        }

        let mut short_name_raw = [0u8; 11];
        short_name_raw.copy_from_slice(&chunk[0..11]);

        let long_name = if lfn.is_empty() {
            None
        } else {
            let name = lfn.finish(&short_name_raw);
            lfn.reset();
            name
        };

        let first_cluster_hi = u16::from_le_bytes([chunk[20], chunk[21]]);
        let first_cluster_lo = u16::from_le_bytes([chunk[26], chunk[27]]);
        let first_cluster = (u32::from(first_cluster_hi) << 16) | u32::from(first_cluster_lo);

        let entry = Entry {
            short_name: format_short_name(&short_name_raw),
            long_name,
            attributes,
            first_cluster,
            size: u32::from_le_bytes([chunk[28], chunk[29], chunk[30], chunk[31]]),
            created_tenths: chunk[13],
            created_time: u16::from_le_bytes([chunk[14], chunk[15]]),
            created_date: u16::from_le_bytes([chunk[16], chunk[17]]),
            accessed_date: u16::from_le_bytes([chunk[18], chunk[19]]),
            written_time: u16::from_le_bytes([chunk[22], chunk[23]]),
            written_date: u16::from_le_bytes([chunk[24], chunk[25]]),
        };
        Some(Some(entry))
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_entry(name: &[u8; 11], attrs: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[0..11].copy_from_slice(name);
        e[11] = attrs;
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }

    fn lfn_entry(seq: u8, last: bool, text: &str, checksum: u8) -> [u8; 32] {
        let mut e = [0u8; 32];
        let mut units: Vec<u16> = text.encode_utf16().collect();
        units.push(0x0000);
        while units.len() < 13 {
            units.push(0xFFFF);
        }
        e[0] = seq | if last { LAST_LFN_ENTRY } else { 0 };
        for i in 0..5 {
            e[1 + i * 2..3 + i * 2].copy_from_slice(&units[i].to_le_bytes());
        }
        e[11] = ATTR_LFN;
        e[13] = checksum;
        for i in 0..6 {
            e[14 + i * 2..16 + i * 2].copy_from_slice(&units[5 + i].to_le_bytes());
        }
        for i in 0..2 {
            e[28 + i * 2..30 + i * 2].copy_from_slice(&units[11 + i].to_le_bytes());
        }
        e
    }

    #[test]
    fn checksum_matches_known_vector() {
        // short name "README  TXT" (8.3 packed, no dot)
        let raw = *b"README  TXT";
        let sum = short_name_checksum(&raw);
        // recompute by hand using the same algorithm to cross-check determinism
        let mut expect = 0u8;
        for &b in raw.iter() {
            expect = ((expect & 1) << 7).wrapping_add(expect >> 1).wrapping_add(b);
        }
        assert_eq!(sum, expect);
    }

    #[test]
    fn reassembles_valid_lfn_sequence() {
        let short_raw = *b"SOMELO~1TXT";
        let checksum = short_name_checksum(&short_raw);
        let long = "Some Long Filename.txt";
        // Split across entries in reverse logical order, 13 chars each.
        let chars: Vec<char> = long.chars().collect();
        let part1: String = chars[13..].iter().collect(); // last physical entry, highest seq
        let part2: String = chars[0..13].iter().collect();

        let mut raw = Vec::new();
        raw.extend_from_slice(&lfn_entry(2, true, &part1, checksum));
        raw.extend_from_slice(&lfn_entry(1, false, &part2, checksum));
        raw.extend_from_slice(&short_entry(&short_raw, 0x20, 5, 100));

        let entries: Vec<Entry> = iter_entries(&raw).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name(), long);
        assert!(entries[0].name_matches("some long filename.txt"));
    }

    #[test]
    fn checksum_mismatch_falls_back_to_short_name() {
        let short_raw = *b"SOMELO~1TXT";
        let wrong_checksum = short_name_checksum(&short_raw).wrapping_add(1);
        let mut raw = Vec::new();
        raw.extend_from_slice(&lfn_entry(1, true, "Some Long Filename.txt", wrong_checksum));
        raw.extend_from_slice(&short_entry(&short_raw, 0x20, 5, 100));

        let entries: Vec<Entry> = iter_entries(&raw).collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].long_name.is_none());
        assert_eq!(entries[0].display_name(), "SOMELO~1.TXT");
    }

    #[test]
    fn deleted_entry_clears_pending_lfn_and_is_skipped() {
        let short_raw = *b"SOMELO~1TXT";
        let checksum = short_name_checksum(&short_raw);
        let mut raw = Vec::new();
        raw.extend_from_slice(&lfn_entry(1, true, "orphaned", checksum));
        let mut deleted = short_entry(&short_raw, 0x20, 5, 100);
        deleted[0] = ENTRY_FREE;
        raw.extend_from_slice(&deleted);
        raw.extend_from_slice(&short_entry(b"REAL    TXT", 0x20, 6, 50));

        let entries: Vec<Entry> = iter_entries(&raw).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].short_name, "REAL.TXT");
        assert!(entries[0].long_name.is_none());
    }

    #[test]
    fn stops_at_first_end_marker() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&short_entry(b"A          ", 0x20, 5, 1));
        raw.extend_from_slice(&[0u8; 32]);
        raw.extend_from_slice(&short_entry(b"B          ", 0x20, 6, 1));
        let entries: Vec<Entry> = iter_entries(&raw).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].short_name, "A");
    }
}

//! Partition-table reading: given a disk image window and a 1-based
//! partition index, produce the byte window of that partition's extent.
//!
//! The original spec treats this purely as an interface ("given a disk
//! image, produce a byte window for partition N"); this binary actually
//! implements it by repurposing the `mbrman`/`gpt` crates the bootloader
//! teacher pulled in for *writing* partition tables, reading with them
//! instead. A protective MBR (partition 1, type `0xEE`) is auto-detected
//! and defers to the GPT backend.

use std::io::{self, Read, Seek, SeekFrom, Write};

use anyhow::Context;
use nobodd_fat::Window;

const PROTECTIVE_MBR_TYPE: u8 = 0xEE;

/// Adapts a [`Window`]'s random-access reads to the `Read + Write + Seek`
/// interface `mbrman` and `gpt` expect. Writes always fail: this server
/// never writes a partition table.
struct WindowCursor {
    window: Window,
    pos: u64,
}

impl std::fmt::Debug for WindowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCursor")
            .field("len", &self.window.len())
            .field("pos", &self.pos)
            .finish()
    }
}

impl WindowCursor {
    fn new(window: Window) -> Self {
        WindowCursor { window, pos: 0 }
    }
}

impl Read for WindowCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.window.len().saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.window
            .read_into(self.pos, &mut buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for WindowCursor {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "partition table backend is read-only in this server",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for WindowCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.window.len() as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

/// Locate `partition` (1-based) within `image` and return its byte window.
pub fn locate(image: &Window, partition: u32) -> anyhow::Result<Window> {
    #[cfg(feature = "mbr")]
    {
        let mut cursor = WindowCursor::new(image.clone());
        let mbr = mbrman::MBR::read_from(&mut cursor, 512).context("failed to read MBR")?;

        let is_protective_mbr = mbr
            .get(1)
            .map(|p| p.sys == PROTECTIVE_MBR_TYPE)
            .unwrap_or(false);

        #[cfg(feature = "gpt")]
        if is_protective_mbr {
            return locate_gpt(image, partition);
        }
        #[cfg(not(feature = "gpt"))]
        if is_protective_mbr {
            anyhow::bail!(
                "image has a protective MBR (GPT) but this build has the `gpt` feature disabled"
            );
        }

        return locate_mbr(&mbr, image, partition);
    }

    #[cfg(all(not(feature = "mbr"), feature = "gpt"))]
    {
        return locate_gpt(image, partition);
    }

    #[cfg(not(any(feature = "mbr", feature = "gpt")))]
    {
        anyhow::bail!("no partition-table backend compiled in")
    }
}

#[cfg(feature = "mbr")]
fn locate_mbr(mbr: &mbrman::MBR, image: &Window, partition: u32) -> anyhow::Result<Window> {
    let index = usize::try_from(partition).context("partition index out of range")?;
    let entry = mbr
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("MBR has no partition {partition}"))?;
    if entry.is_unused() {
        anyhow::bail!("MBR partition {partition} is unused");
    }
    let sector_size = u64::from(mbr.sector_size);
    let base = u64::from(entry.starting_lba) * sector_size;
    let len = u64::from(entry.sectors) * sector_size;
    image
        .subwindow(base, len)
        .context("MBR partition extent is out of range of the image")
}

#[cfg(feature = "gpt")]
fn locate_gpt(image: &Window, partition: u32) -> anyhow::Result<Window> {
    let cursor = WindowCursor::new(image.clone());
    let disk = gpt::GptConfig::new()
        .writable(false)
        .open_from_device(Box::new(cursor))
        .context("failed to read GPT header")?;

    let entry = disk
        .partitions()
        .get(&partition)
        .ok_or_else(|| anyhow::anyhow!("GPT has no partition {partition}"))?;
    let block_size = disk.logical_block_size();
    let start = entry
        .bytes_start(*block_size)
        .context("failed to compute GPT partition start offset")?;
    let len = entry
        .bytes_len(*block_size)
        .context("failed to compute GPT partition length")?;
    image
        .subwindow(start, len)
        .context("GPT partition extent is out of range of the image")
}

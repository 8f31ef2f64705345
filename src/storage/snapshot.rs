//! Fragment snapshot files.
//!
//! A snapshot is the durable image of one fragment: a fixed header plus
//! block records ordered by (row, block). Written to a temp file and
//! renamed into place, so a crash mid-flush leaves the previous
//! snapshot intact. Read back via mmap with full validation; any
//! violation (bad magic, bad bounds, bad checksum) is `Corrupt`.
//!
//! ```text
//! [Header 16 bytes]
//!   0  4  magic: b"BGF1"
//!   4  2  version: u16 = 1
//!   6  2  reserved: 0x0000
//!   8  8  record_count: u64
//! [Block records × record_count]
//!   [row: u64] [block: u32] [len: u32] [payload: len bytes] [blake3(payload)[0..4]]
//! ```
//!
//! All integers little-endian.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{GridError, Result};

/// Magic bytes for fragment snapshot files.
pub const MAGIC: [u8; 4] = *b"BGF1";

/// Format version.
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// One block record read back from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub row: u64,
    pub block: u32,
    pub payload: Vec<u8>,
}

/// Read u32 from byte slice at offset (little-endian).
#[inline]
fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Read u64 from byte slice at offset (little-endian).
#[inline]
fn read_u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

/// Write a snapshot atomically: `<path>.tmp`, fsync, rename.
///
/// `records` must be ordered by (row, block); the reader checks this.
pub fn write(path: &Path, records: &[(u64, u32, Vec<u8>)]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&(records.len() as u64).to_le_bytes())?;

        for (row, block, payload) in records {
            writer.write_all(&row.to_le_bytes())?;
            writer.write_all(&block.to_le_bytes())?;
            writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            writer.write_all(payload)?;
            writer.write_all(&blake3::hash(payload).as_bytes()[0..4])?;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and validate a snapshot, returning its records in file order.
pub fn read(path: &Path) -> Result<Vec<SnapshotRecord>> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    from_bytes(&mmap)
}

/// Parse a snapshot from a byte slice (for testing / embedding).
pub fn from_bytes(data: &[u8]) -> Result<Vec<SnapshotRecord>> {
    if data.len() < HEADER_SIZE {
        return Err(GridError::Corrupt("snapshot smaller than header".into()));
    }
    if data[0..4] != MAGIC {
        return Err(GridError::Corrupt(format!(
            "not a snapshot: expected BGF1, got {:?}",
            &data[0..4]
        )));
    }
    let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(GridError::Corrupt(format!(
            "unsupported snapshot version: {version}"
        )));
    }
    let record_count = read_u64_at(data, 8) as usize;

    let mut records = Vec::with_capacity(record_count);
    let mut pos = HEADER_SIZE;
    let mut prev: Option<(u64, u32)> = None;

    for i in 0..record_count {
        if pos + 16 > data.len() {
            return Err(GridError::Corrupt(format!(
                "snapshot truncated at record {i}"
            )));
        }
        let row = read_u64_at(data, pos);
        let block = read_u32_at(data, pos + 8);
        let len = read_u32_at(data, pos + 12) as usize;
        let payload_start = pos + 16;
        let payload_end = payload_start + len;
        if payload_end + 4 > data.len() {
            return Err(GridError::Corrupt(format!(
                "record {i} payload runs past end of snapshot"
            )));
        }

        let payload = &data[payload_start..payload_end];
        let sum = &data[payload_end..payload_end + 4];
        if blake3::hash(payload).as_bytes()[0..4] != *sum {
            return Err(GridError::Corrupt(format!(
                "checksum mismatch at record {i} (row {row}, block {block})"
            )));
        }

        if let Some(p) = prev {
            if p >= (row, block) {
                return Err(GridError::Corrupt(format!(
                    "records out of order at index {i}"
                )));
            }
        }
        prev = Some((row, block));

        records.push(SnapshotRecord {
            row,
            block,
            payload: payload.to_vec(),
        });
        pos = payload_end + 4;
    }
    Ok(records)
}

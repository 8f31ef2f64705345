//! Write-ahead log for fragment mutations.
//!
//! Every set/clear is appended here before it touches in-memory state,
//! so a crash between write and flush loses nothing: on open the log is
//! replayed in order on top of the last snapshot. Replay is idempotent
//! because it reapplies the same set/clear sequence.
//!
//! Frame layout (one per entry):
//!
//! ```text
//! [len: u32 LE] [payload: bincode(WalEntry)] [checksum: blake3(payload)[0..4]]
//! ```
//!
//! A truncated frame at the tail (torn write) ends replay without error;
//! a checksum mismatch inside the log is `Corrupt`.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GridError, Result};

/// Upper bound on one frame's payload. A bincode `WalEntry` is around
/// 20 bytes; a length prefix past this is garbage, not a real frame,
/// and must not drive the read-side allocation.
pub const MAX_FRAME: usize = 256;

/// Mutation kind recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Set,
    Clear,
}

/// One logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub row: u64,
    pub col: u64,
    pub op: WalOp,
}

/// Append-only mutation log for one fragment.
pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    /// Open (or create) the log at `path`, positioned for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Append one entry and sync it to disk.
    ///
    /// Any IO failure is surfaced as `WriteFailure`; the caller treats
    /// it as a failed write, no internal retry.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let payload = bincode::serialize(entry)?;
        let mut frame = Vec::with_capacity(4 + payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&blake3::hash(&payload).as_bytes()[0..4]);

        self.file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data())
            .map_err(GridError::WriteFailure)
    }

    /// Read all entries in append order.
    ///
    /// Stops silently at a torn tail (short frame); fails with
    /// `Corrupt` on a checksum mismatch.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME {
                warn!(
                    path = %self.path.display(),
                    len, "implausible frame length at log tail, stopping replay"
                );
                break;
            }

            let mut body = vec![0u8; len + 4];
            match reader.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(path = %self.path.display(), "torn frame at log tail, stopping replay");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let (payload, sum) = body.split_at(len);
            if blake3::hash(payload).as_bytes()[0..4] != *sum {
                return Err(GridError::Corrupt(format!(
                    "checksum mismatch in {} after {} entries",
                    self.path.display(),
                    entries.len()
                )));
            }
            entries.push(bincode::deserialize(payload)?);
        }
        Ok(entries)
    }

    /// Discard all entries. Called after a successful snapshot flush.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn byte_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

//! Fragment: the storage unit for one (index, frame, slice).
//!
//! Owns the row → bitmap mapping for its slice of the column space,
//! a write-ahead log for crash recovery, and a snapshot file for
//! durable state. Mutations are serialized by an exclusive lock; reads
//! share the lock and always observe fully-merged blocks.
//!
//! Two mutation paths exist and nothing else:
//! - client set/clear: range-checked, WAL-logged, then applied
//! - anti-entropy `apply_block`: merge-only union of a remote block
//!
//! Lock order is WAL then core, on every path that takes both.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::bitmap::{Bitmap, BlockDigest, BLOCK_WIDTH, SLICE_WIDTH};
use crate::error::{GridError, Result};
use crate::storage::snapshot;
use crate::storage::wal::{Wal, WalEntry, WalOp};
use crate::storage::FragmentKey;

/// Ordered per-block digests of a whole fragment. Two fragments hold
/// identical data iff their digest sequences are equal entry-for-entry.
pub type FragmentDigest = Vec<BlockDigest>;

/// Mutable state behind the fragment's lock.
struct FragmentCore {
    rows: BTreeMap<u64, Bitmap>,
    /// (row, block) pairs changed since the last flush.
    dirty: HashSet<(u64, u32)>,
    /// Cached digest, dropped whenever a block is dirtied.
    digest_cache: Option<Arc<FragmentDigest>>,
}

impl FragmentCore {
    fn empty() -> Self {
        Self {
            rows: BTreeMap::new(),
            dirty: HashSet::new(),
            digest_cache: None,
        }
    }

    fn touch(&mut self, row: u64, block: u32) {
        self.dirty.insert((row, block));
        self.digest_cache = None;
    }
}

/// Storage unit for one (index, frame, slice).
pub struct Fragment {
    key: FragmentKey,
    /// Column range `[col_lo, col_hi)` this fragment accepts.
    col_lo: u64,
    col_hi: u64,
    snapshot_path: PathBuf,
    core: RwLock<FragmentCore>,
    wal: Mutex<Wal>,
}

impl Fragment {
    /// Open (or create) the fragment under `dir`, loading the snapshot
    /// and replaying the write-ahead log on top before accepting writes.
    pub fn open(key: FragmentKey, dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let snapshot_path = dir.join(format!("{}.snap", key.slice));
        let wal_path = dir.join(format!("{}.wal", key.slice));

        let col_lo = key.slice * SLICE_WIDTH;
        let col_hi = col_lo + SLICE_WIDTH;

        let mut core = FragmentCore::empty();
        if snapshot_path.exists() {
            for record in snapshot::read(&snapshot_path)? {
                core.rows
                    .entry(record.row)
                    .or_default()
                    .decode_and_merge_block(record.block, &record.payload)?;
            }
        }

        let wal = Wal::open(&wal_path)?;
        let replayed = wal.replay()?;
        let replay_count = replayed.len();
        for entry in replayed {
            Self::apply_entry(&mut core, &entry);
        }
        if replay_count > 0 {
            debug!(key = %key, entries = replay_count, "replayed write-ahead log");
        }

        Ok(Self {
            key,
            col_lo,
            col_hi,
            snapshot_path,
            core: RwLock::new(core),
            wal: Mutex::new(wal),
        })
    }

    /// Apply one logged mutation to in-memory state, dirty-marking the
    /// touched block. Idempotent: reapplying is a no-op.
    fn apply_entry(core: &mut FragmentCore, entry: &WalEntry) {
        let block = Bitmap::block_of(entry.col);
        let changed = match entry.op {
            WalOp::Set => core.rows.entry(entry.row).or_default().set(entry.col),
            WalOp::Clear => match core.rows.get_mut(&entry.row) {
                Some(bitmap) => {
                    let changed = bitmap.clear(entry.col);
                    if bitmap.is_empty() {
                        core.rows.remove(&entry.row);
                    }
                    changed
                }
                None => false,
            },
        };
        if changed {
            core.touch(entry.row, block);
        }
    }

    fn check_range(&self, col: u64) -> Result<()> {
        if col < self.col_lo || col >= self.col_hi {
            return Err(GridError::OutOfRange {
                col,
                lo: self.col_lo,
                hi: self.col_hi,
            });
        }
        Ok(())
    }

    /// Set a bit. Logs to the WAL before applying; a failed append is a
    /// failed write and in-memory state stays untouched. Returns true
    /// if the bit was not already set.
    pub fn set_bit(&self, row: u64, col: u64) -> Result<bool> {
        self.check_range(col)?;
        let entry = WalEntry {
            row,
            col,
            op: WalOp::Set,
        };
        let mut wal = self.wal.lock().unwrap();
        wal.append(&entry)?;

        let mut core = self.core.write().unwrap();
        let changed = core.rows.entry(row).or_default().set(col);
        if changed {
            core.touch(row, Bitmap::block_of(col));
        }
        Ok(changed)
    }

    /// Clear a bit. Returns true if the bit was set.
    pub fn clear_bit(&self, row: u64, col: u64) -> Result<bool> {
        self.check_range(col)?;
        let entry = WalEntry {
            row,
            col,
            op: WalOp::Clear,
        };
        let mut wal = self.wal.lock().unwrap();
        wal.append(&entry)?;

        let mut core = self.core.write().unwrap();
        let changed = match core.rows.get_mut(&row) {
            Some(bitmap) => {
                let changed = bitmap.clear(col);
                if bitmap.is_empty() {
                    core.rows.remove(&row);
                }
                changed
            }
            None => false,
        };
        if changed {
            core.touch(row, Bitmap::block_of(col));
        }
        Ok(changed)
    }

    /// Read-only snapshot of one row. Unknown rows read as the empty
    /// bitmap, never an error.
    pub fn row(&self, row: u64) -> Bitmap {
        self.core
            .read()
            .unwrap()
            .rows
            .get(&row)
            .cloned()
            .unwrap_or_default()
    }

    /// True if the row has at least one bit set for `col`.
    pub fn contains(&self, row: u64, col: u64) -> bool {
        self.core
            .read()
            .unwrap()
            .rows
            .get(&row)
            .is_some_and(|b| b.contains(col))
    }

    /// Fragment digest, ordered by (row, block). Computed lazily and
    /// cached until a block is dirtied.
    pub fn digest(&self) -> Result<Arc<FragmentDigest>> {
        if let Some(cached) = self.core.read().unwrap().digest_cache.clone() {
            return Ok(cached);
        }

        let mut core = self.core.write().unwrap();
        // Another writer may have filled it between the locks.
        if let Some(cached) = core.digest_cache.clone() {
            return Ok(cached);
        }
        let mut digest = Vec::new();
        for (&row, bitmap) in &core.rows {
            digest.extend(bitmap.digest(row)?);
        }
        let digest = Arc::new(digest);
        core.digest_cache = Some(digest.clone());
        Ok(digest)
    }

    /// Canonical encoding of one (row, block), or None if absent.
    pub fn encode_block(&self, row: u64, block: u32) -> Result<Option<Vec<u8>>> {
        match self.core.read().unwrap().rows.get(&row) {
            Some(bitmap) => bitmap.encode_block(block),
            None => Ok(None),
        }
    }

    /// Merge a remote encoded block into this fragment. The one
    /// mutation path anti-entropy uses: union only, never overwrite.
    /// A block either merges completely or (on corrupt payload) not at
    /// all. Returns true if any bit was newly set.
    pub fn apply_block(&self, row: u64, block: u32, bytes: &[u8]) -> Result<bool> {
        let block_lo = (self.col_lo / BLOCK_WIDTH) as u32;
        let block_hi = (self.col_hi / BLOCK_WIDTH) as u32;
        if block < block_lo || block >= block_hi {
            return Err(GridError::Corrupt(format!(
                "block {block} outside slice blocks {block_lo}..{block_hi}"
            )));
        }

        let mut core = self.core.write().unwrap();
        let merged = core
            .rows
            .entry(row)
            .or_default()
            .decode_and_merge_block(block, bytes);
        match merged {
            Ok(true) => core.touch(row, block),
            // No-op merge or corrupt payload into a fresh row: drop the
            // stub so representations stay canonical.
            _ => {
                if core.rows.get(&row).is_some_and(|b| b.is_empty()) {
                    core.rows.remove(&row);
                }
            }
        }
        merged
    }

    /// Persist dirty state: write the snapshot atomically, truncate the
    /// log, clear the dirty set. On failure dirty state is retained and
    /// the next flush retries; locks are released on every exit path.
    pub fn flush(&self) -> Result<()> {
        let mut wal = self.wal.lock().unwrap();
        let mut core = self.core.write().unwrap();
        if core.dirty.is_empty() {
            return Ok(());
        }

        let mut records = Vec::new();
        for (&row, bitmap) in &core.rows {
            for (block, _) in bitmap.iter_blocks() {
                let payload = bitmap.encode_block(block)?.ok_or_else(|| {
                    GridError::Corrupt(format!(
                        "block {block} of row {row} vanished during flush"
                    ))
                })?;
                records.push((row, block, payload));
            }
        }
        snapshot::write(&self.snapshot_path, &records)?;
        wal.truncate()?;
        core.dirty.clear();
        debug!(key = %self.key, blocks = records.len(), "flushed fragment");
        Ok(())
    }

    /// Fragment identity.
    pub fn key(&self) -> &FragmentKey {
        &self.key
    }

    /// Inclusive-exclusive column range this fragment accepts.
    pub fn col_range(&self) -> (u64, u64) {
        (self.col_lo, self.col_hi)
    }

    /// Total set bits across all rows.
    pub fn bit_count(&self) -> u64 {
        self.core
            .read()
            .unwrap()
            .rows
            .values()
            .map(Bitmap::count)
            .sum()
    }

    /// Highest row with any bit set.
    pub fn max_row(&self) -> Option<u64> {
        self.core.read().unwrap().rows.keys().next_back().copied()
    }

    /// True if there are unflushed changes.
    pub fn is_dirty(&self) -> bool {
        !self.core.read().unwrap().dirty.is_empty()
    }
}

impl Drop for Fragment {
    fn drop(&mut self) {
        if self.is_dirty() {
            if let Err(e) = self.flush() {
                warn!(key = %self.key, error = %e, "flush on drop failed");
            }
        }
    }
}

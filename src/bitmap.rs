//! Block-partitioned bitmap: the storage primitive for one row of a frame.
//!
//! A `Bitmap` is a set of column IDs grouped into fixed-width blocks of
//! `BLOCK_WIDTH` columns. Blocks are the unit of digesting and repair:
//! replicas exchange per-block checksums, then pull whole encoded blocks
//! and merge them in. Merge is set union (commutative, associative,
//! idempotent), so replicas converge regardless of delivery order or
//! duplication.
//!
//! Block boundaries are fixed at `BLOCK_WIDTH` and never renumbered;
//! renumbering would invalidate every stored digest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Columns per slice. Slice `s` covers `[s*SLICE_WIDTH, (s+1)*SLICE_WIDTH)`.
pub const SLICE_WIDTH: u64 = 1 << 20;

/// Columns per block. A slice spans exactly `SLICE_WIDTH / BLOCK_WIDTH`
/// block indices. Block index of a column is global: `col / BLOCK_WIDTH`.
pub const BLOCK_WIDTH: u64 = 1 << 16;

/// 64-bit words per block bitset.
pub const BLOCK_WORDS: usize = (BLOCK_WIDTH / 64) as usize;

// ── Block ──────────────────────────────────────────────────────────

/// Fixed-width bitset covering `BLOCK_WIDTH` consecutive columns.
///
/// Stored dense (1024 words = 8 KiB) for O(1) set/clear/contains and
/// word-wise union. The encoded form trims trailing zero words, so two
/// blocks holding the same set always encode to identical bytes, which
/// is the property the digest-equality invariant rests on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    words: Box<[u64; BLOCK_WORDS]>,
}

impl Block {
    /// Create an all-zeros block.
    pub fn new() -> Self {
        Self {
            words: Box::new([0u64; BLOCK_WORDS]),
        }
    }

    /// Set bit at offset within the block. Returns true if it changed.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= BLOCK_WIDTH` (callers mask first).
    pub fn set(&mut self, offset: u64) -> bool {
        assert!(offset < BLOCK_WIDTH, "offset outside block");
        let word = (offset / 64) as usize;
        let mask = 1u64 << (offset % 64);
        let changed = self.words[word] & mask == 0;
        self.words[word] |= mask;
        changed
    }

    /// Clear bit at offset within the block. Returns true if it changed.
    pub fn clear(&mut self, offset: u64) -> bool {
        assert!(offset < BLOCK_WIDTH, "offset outside block");
        let word = (offset / 64) as usize;
        let mask = 1u64 << (offset % 64);
        let changed = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        changed
    }

    /// Check bit at offset within the block.
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        let word = (offset / 64) as usize;
        self.words[word] & (1u64 << (offset % 64)) != 0
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// True if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Word-wise union of `other` into self. Returns true if any bit
    /// was newly set.
    pub fn merge_from(&mut self, other: &Block) -> bool {
        let mut changed = false;
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *dst | *src;
            if merged != *dst {
                changed = true;
                *dst = merged;
            }
        }
        changed
    }

    /// Encode to the canonical wire/disk form: bincode of the word
    /// vector with trailing zero words trimmed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let last = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        let trimmed: Vec<u64> = self.words[..last].to_vec();
        Ok(bincode::serialize(&trimmed)?)
    }

    /// Decode an encoded block. Payloads longer than `BLOCK_WORDS`
    /// words are rejected as corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let words: Vec<u64> = bincode::deserialize(bytes)
            .map_err(|e| GridError::Corrupt(format!("undecodable block: {e}")))?;
        if words.len() > BLOCK_WORDS {
            return Err(GridError::Corrupt(format!(
                "block payload has {} words, max {BLOCK_WORDS}",
                words.len()
            )));
        }
        let mut block = Block::new();
        block.words[..words.len()].copy_from_slice(&words);
        Ok(block)
    }

    /// Digest of the canonical encoding: (byte length, blake3 sum).
    pub fn digest(&self) -> Result<(u32, [u8; 32])> {
        let encoded = self.encode()?;
        let sum = *blake3::hash(&encoded).as_bytes();
        Ok((encoded.len() as u32, sum))
    }

    /// Iterate set offsets within the block, ascending.
    pub fn iter_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64).filter_map(move |b| {
                if w & (1u64 << b) != 0 {
                    Some(i as u64 * 64 + b)
                } else {
                    None
                }
            })
        })
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

// ── Digest Types ───────────────────────────────────────────────────

/// Fingerprint of one (row, block) pair: byte length + blake3 sum of
/// the block's canonical encoding. Two replicas hold identical data for
/// a (row, block) iff their BlockDigests are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDigest {
    /// Row this block belongs to (stamped by the fragment).
    pub row: u64,
    /// Global block index (`col / BLOCK_WIDTH`).
    pub block: u32,
    /// Byte length of the canonical encoding.
    pub len: u32,
    /// blake3 of the canonical encoding.
    pub sum: [u8; 32],
}

// ── Bitmap ─────────────────────────────────────────────────────────

/// Set of column IDs, stored as non-empty blocks keyed by block index.
///
/// Empty blocks are removed from the map on clear, so equal sets always
/// have equal representations (and therefore equal digests).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    blocks: BTreeMap<u32, Block>,
}

impl Bitmap {
    /// Create empty bitmap.
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    /// Block index covering a column.
    #[inline]
    pub fn block_of(col: u64) -> u32 {
        (col / BLOCK_WIDTH) as u32
    }

    /// Add a column. Returns true if it was not already present.
    pub fn set(&mut self, col: u64) -> bool {
        let block = self.blocks.entry(Self::block_of(col)).or_default();
        block.set(col % BLOCK_WIDTH)
    }

    /// Remove a column. Returns true if it was present.
    ///
    /// Drops the block entirely if the clear empties it, keeping the
    /// representation canonical.
    pub fn clear(&mut self, col: u64) -> bool {
        let idx = Self::block_of(col);
        let Some(block) = self.blocks.get_mut(&idx) else {
            return false;
        };
        let changed = block.clear(col % BLOCK_WIDTH);
        if changed && block.is_empty() {
            self.blocks.remove(&idx);
        }
        changed
    }

    /// Membership test.
    pub fn contains(&self, col: u64) -> bool {
        self.blocks
            .get(&Self::block_of(col))
            .is_some_and(|b| b.contains(col % BLOCK_WIDTH))
    }

    /// Number of set columns.
    pub fn count(&self) -> u64 {
        self.blocks.values().map(Block::count).sum()
    }

    /// True if no column is set.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Non-mutating union: returns a new bitmap holding `self ∪ other`.
    pub fn union(&self, other: &Bitmap) -> Bitmap {
        let mut result = self.clone();
        result.merge_from(other);
        result
    }

    /// Mutating union of `other` into self. Returns true if any bit was
    /// newly set. Idempotent: merging the same bitmap twice is a no-op
    /// the second time.
    pub fn merge_from(&mut self, other: &Bitmap) -> bool {
        let mut changed = false;
        for (&idx, src) in &other.blocks {
            match self.blocks.get_mut(&idx) {
                Some(dst) => {
                    if dst.merge_from(src) {
                        changed = true;
                    }
                }
                None => {
                    self.blocks.insert(idx, src.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Per-block digests, ordered by block index. `row` is stamped into
    /// each entry so fragment digests sort by (row, block).
    pub fn digest(&self, row: u64) -> Result<Vec<BlockDigest>> {
        let mut digests = Vec::with_capacity(self.blocks.len());
        for (&block, data) in &self.blocks {
            let (len, sum) = data.digest()?;
            digests.push(BlockDigest {
                row,
                block,
                len,
                sum,
            });
        }
        Ok(digests)
    }

    /// Canonical encoding of one block, or None if the block is absent
    /// (absent means empty: there is nothing to exchange).
    pub fn encode_block(&self, block: u32) -> Result<Option<Vec<u8>>> {
        match self.blocks.get(&block) {
            Some(data) => Ok(Some(data.encode()?)),
            None => Ok(None),
        }
    }

    /// Decode an encoded block and union it in at `block`. Returns true
    /// if any bit was newly set. Never overwrites: existing bits always
    /// survive.
    pub fn decode_and_merge_block(&mut self, block: u32, bytes: &[u8]) -> Result<bool> {
        let decoded = Block::decode(bytes)?;
        if decoded.is_empty() {
            return Ok(false);
        }
        match self.blocks.get_mut(&block) {
            Some(dst) => Ok(dst.merge_from(&decoded)),
            None => {
                self.blocks.insert(block, decoded);
                Ok(true)
            }
        }
    }

    /// Iterate (block index, block) pairs, ascending.
    pub fn iter_blocks(&self) -> impl Iterator<Item = (u32, &Block)> {
        self.blocks.iter().map(|(&idx, b)| (idx, b))
    }

    /// Iterate set columns, ascending.
    pub fn iter_cols(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks.iter().flat_map(|(&idx, block)| {
            let base = idx as u64 * BLOCK_WIDTH;
            block.iter_offsets().map(move |off| base + off)
        })
    }
}

impl FromIterator<u64> for Bitmap {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut bitmap = Bitmap::new();
        for col in iter {
            bitmap.set(col);
        }
        bitmap
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_contains_clear() {
        let mut bm = Bitmap::new();
        assert!(bm.set(42));
        assert!(!bm.set(42)); // already present
        assert!(bm.contains(42));
        assert!(!bm.contains(43));
        assert!(bm.clear(42));
        assert!(!bm.clear(42)); // already absent
        assert!(!bm.contains(42));
        assert!(bm.is_empty());
    }

    #[test]
    fn test_count_across_blocks() {
        let mut bm = Bitmap::new();
        bm.set(0);
        bm.set(BLOCK_WIDTH - 1);
        bm.set(BLOCK_WIDTH); // second block
        bm.set(3 * BLOCK_WIDTH + 7);
        assert_eq!(bm.count(), 4);
        assert_eq!(bm.iter_blocks().count(), 3);
    }

    #[test]
    fn test_union_non_mutating() {
        let a: Bitmap = [1u64, 2, 3].into_iter().collect();
        let b: Bitmap = [3u64, 4].into_iter().collect();
        let u = a.union(&b);
        assert_eq!(u.iter_cols().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(a.count(), 3, "union must not mutate the receiver");
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a: Bitmap = [1u64, 2].into_iter().collect();
        let b: Bitmap = [2u64, 70_000].into_iter().collect();
        assert!(a.merge_from(&b));
        let after_first = a.clone();
        assert!(!a.merge_from(&b), "second merge must change nothing");
        assert_eq!(a, after_first);
    }

    #[test]
    fn test_cleared_block_dropped_for_digest_agreement() {
        let mut a = Bitmap::new();
        a.set(5);
        a.clear(5);
        let b = Bitmap::new();
        assert_eq!(a, b);
        assert_eq!(a.digest(0).unwrap(), b.digest(0).unwrap());
    }

    #[test]
    fn test_empty_bitmap_digest_is_empty_sequence() {
        let bm = Bitmap::new();
        assert!(bm.digest(9).unwrap().is_empty());
    }

    #[test]
    fn test_digest_differs_only_at_changed_block() {
        let mut a = Bitmap::new();
        a.set(10);
        a.set(BLOCK_WIDTH + 10);
        let mut b = a.clone();
        b.set(BLOCK_WIDTH + 11); // touch second block only

        let da = a.digest(0).unwrap();
        let db = b.digest(0).unwrap();
        assert_eq!(da.len(), 2);
        assert_eq!(da[0], db[0], "untouched block digest must agree");
        assert_ne!(da[1], db[1], "changed block digest must differ");
    }

    #[test]
    fn test_encode_decode_merge_roundtrip() {
        let mut a = Bitmap::new();
        a.set(100);
        a.set(BLOCK_WIDTH - 1);
        let encoded = a.encode_block(0).unwrap().unwrap();

        let mut b = Bitmap::new();
        b.set(7);
        assert!(b.decode_and_merge_block(0, &encoded).unwrap());
        assert!(b.contains(7), "merge must not overwrite existing bits");
        assert!(b.contains(100));
        assert!(b.contains(BLOCK_WIDTH - 1));
    }

    #[test]
    fn test_encode_absent_block() {
        let bm = Bitmap::new();
        assert!(bm.encode_block(3).unwrap().is_none());
    }

    #[test]
    fn test_decode_garbage_is_corrupt() {
        let mut bm = Bitmap::new();
        let err = bm.decode_and_merge_block(0, &[0xff; 3]).unwrap_err();
        assert_eq!(err.code(), "CORRUPT");
    }

    #[test]
    fn test_decode_oversized_payload_is_corrupt() {
        let words = vec![1u64; BLOCK_WORDS + 1];
        let bytes = bincode::serialize(&words).unwrap();
        let err = Block::decode(&bytes).unwrap_err();
        assert_eq!(err.code(), "CORRUPT");
    }

    #[test]
    fn test_canonical_encoding_trims_trailing_words() {
        let mut a = Bitmap::new();
        a.set(3); // only word 0 used
        let encoded = a.encode_block(0).unwrap().unwrap();
        let full = bincode::serialize(&vec![0u64; BLOCK_WORDS]).unwrap();
        assert!(encoded.len() < full.len());
    }

    proptest! {
        #[test]
        fn prop_merge_idempotent(cols in prop::collection::vec(0u64..4 * SLICE_WIDTH, 0..200)) {
            let other: Bitmap = cols.iter().copied().collect();
            let mut bm = Bitmap::new();
            bm.merge_from(&other);
            let once = bm.clone();
            bm.merge_from(&other);
            prop_assert_eq!(bm, once);
        }

        #[test]
        fn prop_merge_commutative(
            a in prop::collection::vec(0u64..4 * SLICE_WIDTH, 0..200),
            b in prop::collection::vec(0u64..4 * SLICE_WIDTH, 0..200),
        ) {
            let ba: Bitmap = a.iter().copied().collect();
            let bb: Bitmap = b.iter().copied().collect();

            let mut ab = ba.clone();
            ab.merge_from(&bb);
            let mut ba2 = bb.clone();
            ba2.merge_from(&ba);

            prop_assert_eq!(&ab, &ba2);
            prop_assert_eq!(ab.digest(0).unwrap(), ba2.digest(0).unwrap());
        }

        #[test]
        fn prop_digest_agreement(cols in prop::collection::vec(0u64..4 * SLICE_WIDTH, 0..200)) {
            // Same content built in different insertion orders digests equal.
            let forward: Bitmap = cols.iter().copied().collect();
            let reverse: Bitmap = cols.iter().rev().copied().collect();
            prop_assert_eq!(forward.digest(1).unwrap(), reverse.digest(1).unwrap());
        }

        #[test]
        fn prop_block_roundtrip(cols in prop::collection::vec(0u64..BLOCK_WIDTH, 1..100)) {
            let src: Bitmap = cols.iter().copied().collect();
            let encoded = src.encode_block(0).unwrap().unwrap();
            let mut dst = Bitmap::new();
            dst.decode_and_merge_block(0, &encoded).unwrap();
            prop_assert_eq!(src, dst);
        }
    }
}

//! Fragment storage: write-ahead log, snapshot files, and the fragment
//! unit that ties them together.
//!
//! One fragment per (index, frame, slice); one snapshot file plus one
//! WAL file per fragment on disk.

pub mod fragment;
pub mod snapshot;
pub mod wal;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use fragment::{Fragment, FragmentDigest};

/// Identity of one storage unit: (index, frame, slice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentKey {
    pub index: String,
    pub frame: String,
    pub slice: u64,
}

impl FragmentKey {
    pub fn new(index: impl Into<String>, frame: impl Into<String>, slice: u64) -> Self {
        Self {
            index: index.into(),
            frame: frame.into(),
            slice,
        }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.index, self.frame, self.slice)
    }
}

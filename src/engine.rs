//! Node-level engine: the surface the server (and tests) drive.
//!
//! The engine owns nothing exotic. It maps columns to slices, consults
//! the topology for ownership, and routes to fragments through the
//! catalog. Writes land locally regardless of ownership; a write that
//! arrives at a non-owner is applied, logged and counted, because
//! forwarding it to the owner is a front-end concern and dropping data
//! is never the right default for a store whose merge is a union.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bitmap::{Bitmap, SLICE_WIDTH};
use crate::catalog::Catalog;
use crate::cluster::{Node, Topology};
use crate::config::Config;
use crate::error::Result;
use crate::stats::{self, StatsSink};
use crate::storage::{FragmentDigest, FragmentKey};
use crate::wire::WriteOp;

pub struct Engine {
    catalog: Arc<Catalog>,
    topology: Arc<Topology>,
    local: Node,
    stats: Arc<dyn StatsSink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the engine over `config.data_dir`, reopening any fragments
    /// already on disk.
    pub fn open(config: &Config, stats: Arc<dyn StatsSink>) -> Result<Self> {
        let catalog = Arc::new(Catalog::open(&config.data_dir)?);
        let topology = Arc::new(Topology::new(config.members.clone(), config.replication));
        Ok(Self {
            catalog,
            topology,
            local: config.local_node(),
            stats,
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Set or clear one bit. Returns whether the bit actually changed.
    ///
    /// The slice is derived from the column, so callers never name
    /// slices on the write path.
    pub fn write(
        &self,
        index: &str,
        frame: &str,
        row: u64,
        col: u64,
        op: WriteOp,
    ) -> Result<bool> {
        let key = FragmentKey::new(index, frame, col / SLICE_WIDTH);
        if !self.topology.is_owner(&self.local, &key) {
            self.stats.increment(stats::OWNERSHIP_MISMATCH);
            warn!(key = %key, col, "write applied on non-owner node");
        }

        let fragment = self.catalog.fragment(&key)?;
        let changed = match op {
            WriteOp::Set => fragment.set_bit(row, col)?,
            WriteOp::Clear => fragment.clear_bit(row, col)?,
        };
        self.stats.increment(stats::FRAGMENT_WRITES);
        debug!(key = %key, row, col, ?op, changed, "write");
        Ok(changed)
    }

    /// Union of `row` across every local fragment of the frame. A frame
    /// this node has never seen reads as an empty row, not an error.
    pub fn read(&self, index: &str, frame: &str, row: u64) -> Bitmap {
        let mut out = Bitmap::new();
        for fragment in self.catalog.frame_fragments(index, frame) {
            out.merge_from(&fragment.row(row));
        }
        out
    }

    /// Digest for the peer-facing side of anti-entropy. A fragment this
    /// node does not hold digests as empty, so a reconciling peer sees
    /// "nothing here to pull" rather than an error.
    pub fn digest(&self, key: &FragmentKey) -> Result<FragmentDigest> {
        match self.catalog.get(key) {
            Some(fragment) => Ok((*fragment.digest()?).clone()),
            None => Ok(Vec::new()),
        }
    }

    /// One encoded block for a reconciling peer. None when the block
    /// (or the whole fragment) is absent.
    pub fn encoded_block(
        &self,
        key: &FragmentKey,
        row: u64,
        block: u32,
    ) -> Result<Option<Vec<u8>>> {
        match self.catalog.get(key) {
            Some(fragment) => fragment.encode_block(row, block),
            None => Ok(None),
        }
    }

    /// Flush every dirty fragment to its snapshot.
    pub fn flush_all(&self) -> Result<()> {
        let started = std::time::Instant::now();
        self.catalog.flush_all()?;
        self.stats.increment(stats::FRAGMENT_FLUSHES);
        self.stats.observe(stats::FLUSH_TIME, started.elapsed());
        Ok(())
    }
}

//! Deterministic slice-to-replica assignment.
//!
//! Maps (index, frame, slice) keys to an ordered replica set using
//! blake3 hashing over a node ring. Ownership is a pure function of
//! (key, member list, replication factor): two nodes holding the same
//! membership view always compute identical owner lists, which is what
//! lets anti-entropy peers agree on who should hold a fragment without
//! a coordination round-trip.
//!
//! Membership change = build a new `Topology`. Ownership is recomputed,
//! never persisted; slices that move to a new owner are not pushed,
//! the new owner discovers them on its next anti-entropy pass and pulls.

use serde::{Deserialize, Serialize};

use crate::storage::FragmentKey;

/// Ring points per node. Spreads each node around the ring so slice
/// placement stays roughly balanced as members come and go.
const VNODES: u32 = 16;

/// A cluster member, identified by its listen address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
}

impl Node {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host)
    }
}

/// What slices exist for one frame: ownership enumeration needs the
/// highest slice seen so far, not the full fragment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInventory {
    pub index: String,
    pub frame: String,
    pub max_slice: u64,
}

/// Reduce a string key to a position on the ring.
fn ring_position(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap())
}

/// Immutable membership view: ordered member list, replication factor,
/// and the precomputed hash ring.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    replication: usize,
    /// (ring position, index into `nodes`), sorted by position.
    ring: Vec<(u64, usize)>,
}

impl Topology {
    /// Build a topology from a member list and replication factor.
    ///
    /// # Panics
    ///
    /// Panics if `replication` is 0.
    pub fn new(nodes: Vec<Node>, replication: usize) -> Self {
        assert!(replication > 0, "replication must be > 0");
        let mut ring = Vec::with_capacity(nodes.len() * VNODES as usize);
        for (idx, node) in nodes.iter().enumerate() {
            for v in 0..VNODES {
                ring.push((ring_position(&format!("{}#{v}", node.host)), idx));
            }
        }
        ring.sort_unstable();
        Self {
            nodes,
            replication,
            ring,
        }
    }

    /// All members, in construction order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Configured replication factor.
    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Ordered replica set for a fragment key: exactly `replication`
    /// distinct nodes, or every node if the cluster is smaller.
    ///
    /// Hashes the key onto the ring, then walks forward collecting
    /// distinct nodes. Pure and deterministic for a fixed view.
    pub fn owners_of(&self, key: &FragmentKey) -> Vec<Node> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let want = self.replication.min(self.nodes.len());
        let pos = ring_position(&key.to_string());
        let start = self.ring.partition_point(|&(p, _)| p < pos);

        let mut owner_idx: Vec<usize> = Vec::with_capacity(want);
        for step in 0..self.ring.len() {
            let (_, idx) = self.ring[(start + step) % self.ring.len()];
            if !owner_idx.contains(&idx) {
                owner_idx.push(idx);
                if owner_idx.len() == want {
                    break;
                }
            }
        }
        owner_idx.into_iter().map(|i| self.nodes[i].clone()).collect()
    }

    /// True if `node` is one of the replicas for `key`.
    pub fn is_owner(&self, node: &Node, key: &FragmentKey) -> bool {
        self.owners_of(key).iter().any(|n| n == node)
    }

    /// Nodes `node` reconciles `key` with: the owner list minus the
    /// node itself. For a non-owner holding a stale copy this is the
    /// full owner list, so the stale holder keeps pulling from owners.
    pub fn peers_for(&self, node: &Node, key: &FragmentKey) -> Vec<Node> {
        self.owners_of(key)
            .into_iter()
            .filter(|n| n != node)
            .collect()
    }

    /// Every (index, frame, slice) this node must materialize, given
    /// the known frames and their highest slices.
    pub fn local_slices(&self, node: &Node, inventory: &[FrameInventory]) -> Vec<FragmentKey> {
        let mut keys = Vec::new();
        for frame in inventory {
            for slice in 0..=frame.max_slice {
                let key = FragmentKey::new(&frame.index, &frame.frame, slice);
                if self.is_owner(node, &key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

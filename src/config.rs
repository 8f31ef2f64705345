//! Typed engine configuration.
//!
//! The engine consumes these values as-is; parsing files, flags or
//! environment variables is the caller's job (the server binary does a
//! minimal argv pass). Defaults match a single-node instance.

use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::Node;

/// Everything the engine needs to run on one node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for fragment snapshots and write-ahead logs.
    pub data_dir: PathBuf,
    /// Address this node listens on. Also the node's cluster identity.
    pub bind: String,
    /// Full cluster member list, including this node.
    pub members: Vec<Node>,
    /// Replicas per slice. Clamped to cluster size at ownership time.
    pub replication: usize,
    /// Pause between anti-entropy cycles.
    pub anti_entropy_interval: Duration,
    /// Max concurrent peer exchanges per cycle.
    pub anti_entropy_concurrency: usize,
    /// How long shutdown waits for in-flight reconciliations.
    pub drain_timeout: Duration,
    /// Per-request timeout for peer digest/block exchanges.
    pub peer_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let bind = "127.0.0.1:10501".to_string();
        Self {
            data_dir: PathBuf::from("./bitgrid-data"),
            members: vec![Node::new(&bind)],
            bind,
            replication: 1,
            anti_entropy_interval: Duration::from_secs(60),
            anti_entropy_concurrency: 8,
            drain_timeout: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// The node this configuration describes.
    pub fn local_node(&self) -> Node {
        Node::new(&self.bind)
    }
}

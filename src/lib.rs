//! BitGrid: a distributed bitmap-index engine.
//!
//! Data is boolean facts: `row` (an attribute) by `column` (an entity),
//! organized under named indexes and frames. Columns partition into
//! fixed-width slices, each slice of a frame is a [`storage::Fragment`]
//! with its own write-ahead log and snapshot, and fragments replicate
//! across the cluster by consistent hashing ([`cluster::Topology`]).
//! Replicas converge through a pull-based anti-entropy protocol
//! ([`antientropy::AntiEntropy`]) built on per-block digests; merge is
//! set union, so repair is idempotent and order-free.
//!
//! [`engine::Engine`] is the node-level entry point; the server binary
//! speaks the MessagePack protocol in [`wire`].

pub mod antientropy;
pub mod bitmap;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod stats;
pub mod storage;
pub mod wire;

pub use bitmap::{Bitmap, BlockDigest, BLOCK_WIDTH, SLICE_WIDTH};
pub use catalog::Catalog;
pub use cluster::{Node, Topology};
pub use config::Config;
pub use engine::Engine;
pub use error::{GridError, Result};
pub use storage::{Fragment, FragmentKey};

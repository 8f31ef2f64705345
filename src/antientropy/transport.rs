//! Peer transport for anti-entropy exchanges.
//!
//! The reconciliation algorithm only needs two request/response calls:
//! fetch a peer's fragment digest, fetch one encoded block. Keeping
//! that behind `PeerTransport` decouples the protocol from networking:
//! `TcpTransport` speaks the real wire, `InProcessTransport` wires
//! catalogs together directly so convergence can be tested without
//! sockets or timers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::catalog::Catalog;
use crate::cluster::Node;
use crate::error::{GridError, Result};
use crate::storage::fragment::FragmentDigest;
use crate::storage::FragmentKey;
use crate::wire::{self, Request, Response};

/// Boxed future, so the trait stays object-safe.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Request/response channel to one peer. Implementations must apply a
/// timeout and surface any failure as `Unreachable`; the engine treats
/// that as "skip this peer until the next cycle".
pub trait PeerTransport: Send + Sync {
    /// Fetch the peer's digest sequence for a fragment. A peer that
    /// does not hold the fragment answers with an empty sequence.
    fn fetch_digest<'a>(
        &'a self,
        peer: &'a Node,
        key: &'a FragmentKey,
    ) -> TransportFuture<'a, FragmentDigest>;

    /// Fetch one encoded block. None means the block is absent (empty).
    fn fetch_block<'a>(
        &'a self,
        peer: &'a Node,
        key: &'a FragmentKey,
        row: u64,
        block: u32,
    ) -> TransportFuture<'a, Option<Vec<u8>>>;
}

// ── TcpTransport ───────────────────────────────────────────────────

/// Real wire transport: one TCP connection per request, bounded by a
/// per-request timeout.
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn unreachable(peer: &Node, reason: impl std::fmt::Display) -> GridError {
        GridError::Unreachable {
            host: peer.host.clone(),
            reason: reason.to_string(),
        }
    }

    /// Send one request and await its response, mapping every IO and
    /// timeout failure to `Unreachable`.
    async fn exchange(&self, peer: &Node, request: &Request) -> Result<Response> {
        let io = async {
            let mut stream = TcpStream::connect(&peer.host).await?;
            wire::write_frame(&mut stream, &wire::encode(request)?).await?;
            match wire::read_frame(&mut stream).await? {
                Some(payload) => wire::decode::<Response>(&payload),
                None => Err(GridError::Protocol("peer closed before responding".into())),
            }
        };
        match tokio::time::timeout(self.timeout, io).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Self::unreachable(peer, e)),
            Err(_) => Err(Self::unreachable(peer, "request timed out")),
        }
    }
}

impl PeerTransport for TcpTransport {
    fn fetch_digest<'a>(
        &'a self,
        peer: &'a Node,
        key: &'a FragmentKey,
    ) -> TransportFuture<'a, FragmentDigest> {
        Box::pin(async move {
            let request = Request::Digest {
                index: key.index.clone(),
                frame: key.frame.clone(),
                slice: key.slice,
            };
            match self.exchange(peer, &request).await? {
                Response::Digest { digest } => Ok(digest),
                Response::Error { code, message } => {
                    Err(GridError::Protocol(format!("{code}: {message}")))
                }
                other => Err(GridError::Protocol(format!(
                    "unexpected digest response: {other:?}"
                ))),
            }
        })
    }

    fn fetch_block<'a>(
        &'a self,
        peer: &'a Node,
        key: &'a FragmentKey,
        row: u64,
        block: u32,
    ) -> TransportFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let request = Request::Block {
                index: key.index.clone(),
                frame: key.frame.clone(),
                slice: key.slice,
                row,
                block,
            };
            match self.exchange(peer, &request).await? {
                Response::Block { payload } => Ok(payload),
                Response::Error { code, message } => {
                    Err(GridError::Protocol(format!("{code}: {message}")))
                }
                other => Err(GridError::Protocol(format!(
                    "unexpected block response: {other:?}"
                ))),
            }
        })
    }
}

// ── InProcessTransport ─────────────────────────────────────────────

/// Transport that answers from other nodes' catalogs in the same
/// process. Used by tests (and embedded multi-node setups) to exercise
/// the reconciliation protocol deterministically.
#[derive(Default)]
pub struct InProcessTransport {
    peers: std::sync::RwLock<HashMap<Node, Arc<Catalog>>>,
    /// Hosts that answer `Unreachable`, for failure-path tests.
    down: std::sync::RwLock<Vec<Node>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's catalog.
    pub fn register(&self, node: Node, catalog: Arc<Catalog>) {
        self.peers.write().unwrap().insert(node, catalog);
    }

    /// Mark a node as unreachable until `bring_up`.
    pub fn take_down(&self, node: &Node) {
        self.down.write().unwrap().push(node.clone());
    }

    /// Clear the unreachable mark.
    pub fn bring_up(&self, node: &Node) {
        self.down.write().unwrap().retain(|n| n != node);
    }

    fn catalog_of(&self, peer: &Node) -> Result<Arc<Catalog>> {
        if self.down.read().unwrap().contains(peer) {
            return Err(GridError::Unreachable {
                host: peer.host.clone(),
                reason: "marked down".into(),
            });
        }
        self.peers
            .read()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| GridError::Unreachable {
                host: peer.host.clone(),
                reason: "unknown peer".into(),
            })
    }
}

impl PeerTransport for InProcessTransport {
    fn fetch_digest<'a>(
        &'a self,
        peer: &'a Node,
        key: &'a FragmentKey,
    ) -> TransportFuture<'a, FragmentDigest> {
        Box::pin(async move {
            let catalog = self.catalog_of(peer)?;
            match catalog.get(key) {
                Some(fragment) => Ok(fragment.digest()?.as_ref().clone()),
                None => Ok(Vec::new()),
            }
        })
    }

    fn fetch_block<'a>(
        &'a self,
        peer: &'a Node,
        key: &'a FragmentKey,
        row: u64,
        block: u32,
    ) -> TransportFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let catalog = self.catalog_of(peer)?;
            match catalog.get(key) {
                Some(fragment) => fragment.encode_block(row, block),
                None => Ok(None),
            }
        })
    }
}

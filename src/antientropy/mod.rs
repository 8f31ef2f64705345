//! Anti-entropy: the background repair protocol that makes eventual
//! consistency actually hold.
//!
//! Once per interval the engine walks every locally relevant fragment,
//! compares its digest against each replica peer, and pulls whichever
//! blocks the peer holds more of. Merge is union, idempotent and
//! commutative, so repeated cycles converge no matter how many
//! exchanges are dropped, duplicated or reordered. There is no global
//! barrier: every (fragment, peer) pair reconciles independently, up to
//! a configured number in flight at once.
//!
//! Repair is pull-only: any block the peer digests differently (or
//! that is missing locally) is fetched and union-merged. Both sides of
//! a divergence may pull the same block in the same round; idempotence
//! makes that a wasted fetch, never a wrong state. No failure in here
//! ever escalates past the engine: unreachable peers are skipped until
//! the next cycle, corrupt blocks are discarded and counted.

pub mod transport;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::cluster::{Node, Topology};
use crate::error::{GridError, Result};
use crate::stats::{self, StatsSink};
use crate::storage::{Fragment, FragmentKey};

pub use transport::{InProcessTransport, PeerTransport, TcpTransport};

/// Tuning for the repair loop.
#[derive(Debug, Clone)]
pub struct AntiEntropyOptions {
    /// Pause between cycles.
    pub interval: Duration,
    /// Max (fragment, peer) exchanges in flight at once.
    pub concurrency: usize,
    /// How long `stop` waits before abandoning in-flight exchanges.
    pub drain_timeout: Duration,
}

impl Default for AntiEntropyOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            concurrency: 8,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Fragments considered this cycle.
    pub fragments: usize,
    /// (fragment, peer) exchanges attempted.
    pub exchanges: usize,
    /// Blocks pulled and merged.
    pub repaired_blocks: u64,
    /// Exchanges skipped because the peer was unreachable.
    pub unreachable_peers: usize,
    /// Blocks discarded as undecodable.
    pub corrupt_blocks: u64,
}

/// Outcome of reconciling one fragment against one peer.
#[derive(Debug, Default)]
struct ReconcileOutcome {
    repaired: u64,
    corrupt: u64,
}

/// Per-node background repair engine.
///
/// Construction takes every collaborator explicitly (catalog, topology,
/// transport, stats), so tests can run a single deterministic cycle
/// against a synthetic cluster instead of racing a timer.
pub struct AntiEntropy {
    catalog: Arc<Catalog>,
    topology: Arc<Topology>,
    local: Node,
    transport: Arc<dyn PeerTransport>,
    stats: Arc<dyn StatsSink>,
    opts: AntiEntropyOptions,
    /// Last successful reconciliation per (peer, fragment), for
    /// observability. Never read by the protocol itself.
    completions: Mutex<HashMap<(Node, FragmentKey), Instant>>,
}

impl AntiEntropy {
    pub fn new(
        catalog: Arc<Catalog>,
        topology: Arc<Topology>,
        local: Node,
        transport: Arc<dyn PeerTransport>,
        stats: Arc<dyn StatsSink>,
        opts: AntiEntropyOptions,
    ) -> Self {
        Self {
            catalog,
            topology,
            local,
            transport,
            stats,
            opts,
            completions: Mutex::new(HashMap::new()),
        }
    }

    /// Fragments this cycle must look at: everything open locally plus
    /// everything ownership says we should hold. Owned-but-missing
    /// fragments are created empty so the first exchange pulls their
    /// data in; local fragments we no longer own are logged and still
    /// offered for repair.
    fn cycle_keys(&self) -> Vec<(FragmentKey, Option<Arc<Fragment>>)> {
        let mut keys: BTreeSet<FragmentKey> = self.catalog.keys().into_iter().collect();
        keys.extend(
            self.topology
                .local_slices(&self.local, &self.catalog.inventory()),
        );

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if self.topology.is_owner(&self.local, &key) {
                match self.catalog.fragment(&key) {
                    Ok(fragment) => out.push((key, Some(fragment))),
                    Err(e) => {
                        warn!(key = %key, error = %e, "cannot open owned fragment");
                        out.push((key, None));
                    }
                }
            } else {
                self.stats.increment(stats::OWNERSHIP_MISMATCH);
                warn!(key = %key, "fragment no longer owned by this node");
                let fragment = self.catalog.get(&key);
                out.push((key, fragment));
            }
        }
        out
    }

    /// Run one full reconciliation pass and wait for it to finish.
    pub async fn run_cycle(&self) -> CycleStats {
        let started = Instant::now();
        let mut cycle = CycleStats::default();
        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency.max(1)));
        let mut tasks: JoinSet<(Node, FragmentKey, Result<ReconcileOutcome>)> = JoinSet::new();

        for (key, fragment) in self.cycle_keys() {
            cycle.fragments += 1;
            let Some(fragment) = fragment else { continue };

            for peer in self.topology.peers_for(&self.local, &key) {
                cycle.exchanges += 1;
                let semaphore = Arc::clone(&semaphore);
                let transport = Arc::clone(&self.transport);
                let stats = Arc::clone(&self.stats);
                let key = key.clone();
                let fragment = Arc::clone(&fragment);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    let outcome =
                        reconcile_fragment(transport, stats, &peer, &key, &fragment).await;
                    (peer, key, outcome)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, key, Ok(outcome))) => {
                    cycle.repaired_blocks += outcome.repaired;
                    cycle.corrupt_blocks += outcome.corrupt;
                    self.completions
                        .lock()
                        .unwrap()
                        .insert((peer, key), Instant::now());
                }
                Ok((_, _, Err(GridError::Unreachable { host, reason }))) => {
                    cycle.unreachable_peers += 1;
                    self.stats.increment(stats::PEER_UNREACHABLE);
                    debug!(host, reason, "peer skipped this cycle");
                }
                Ok((_, _, Err(e))) => {
                    warn!(error = %e, "reconciliation failed");
                }
                Err(e) => {
                    warn!(error = %e, "reconciliation task panicked");
                }
            }
        }

        self.stats.increment(stats::ANTIENTROPY_CYCLES);
        self.stats
            .observe(stats::ANTIENTROPY_CYCLE_TIME, started.elapsed());
        debug!(
            fragments = cycle.fragments,
            exchanges = cycle.exchanges,
            repaired = cycle.repaired_blocks,
            unreachable = cycle.unreachable_peers,
            "anti-entropy cycle complete"
        );
        cycle
    }

    /// When a (peer, fragment) pair last reconciled successfully.
    pub fn last_completion(&self, peer: &Node, key: &FragmentKey) -> Option<Instant> {
        self.completions
            .lock()
            .unwrap()
            .get(&(peer.clone(), key.clone()))
            .copied()
    }

    /// Spawn the repair loop. The first cycle runs immediately, then
    /// once per interval until `AntiEntropyHandle::stop`.
    pub fn start(self: Arc<Self>) -> AntiEntropyHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let drain_timeout = self.opts.drain_timeout;
        let engine = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.opts.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.run_cycle().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("anti-entropy loop stopped");
        });

        AntiEntropyHandle {
            shutdown: shutdown_tx,
            task,
            drain_timeout,
        }
    }
}

/// Reconcile one fragment against one peer: digest compare, then pull
/// every divergent block. Runs as a spawned task, so it borrows nothing
/// from the engine.
async fn reconcile_fragment(
    transport: Arc<dyn PeerTransport>,
    stats_sink: Arc<dyn StatsSink>,
    peer: &Node,
    key: &FragmentKey,
    fragment: &Fragment,
) -> Result<ReconcileOutcome> {
    let local_digest = fragment.digest()?;
    let peer_digest = transport.fetch_digest(peer, key).await?;

    let local_by_block: HashMap<(u64, u32), (u32, [u8; 32])> = local_digest
        .iter()
        .map(|d| ((d.row, d.block), (d.len, d.sum)))
        .collect();

    let mut outcome = ReconcileOutcome::default();
    for remote in &peer_digest {
        // Encoded length does not order set containment (trailing zero
        // words are trimmed), so any difference means pull. Union merge
        // makes a redundant pull harmless.
        let pull = match local_by_block.get(&(remote.row, remote.block)) {
            None => true,
            Some(&(len, sum)) => sum != remote.sum || len != remote.len,
        };
        if !pull {
            continue;
        }

        stats_sink.increment(stats::DIGEST_MISMATCH);

        let Some(bytes) = transport
            .fetch_block(peer, key, remote.row, remote.block)
            .await?
        else {
            // Peer digested it but no longer has it; next cycle.
            continue;
        };
        match fragment.apply_block(remote.row, remote.block, &bytes) {
            Ok(changed) => {
                if changed {
                    outcome.repaired += 1;
                    stats_sink.increment(stats::BLOCKS_REPAIRED);
                }
            }
            Err(GridError::Corrupt(reason)) => {
                outcome.corrupt += 1;
                stats_sink.increment(stats::CORRUPT_BLOCK);
                warn!(
                    key = %key, peer = %peer, row = remote.row, block = remote.block,
                    reason, "discarded corrupt block from peer"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Ok(outcome)
}

/// Start/stop contract for the background loop.
pub struct AntiEntropyHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    drain_timeout: Duration,
}

impl AntiEntropyHandle {
    /// Signal shutdown and wait up to the drain timeout for the current
    /// cycle to finish; abandon it after that. Blocks are merged
    /// atomically, so abandonment never leaves a half-merged fragment.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(self.drain_timeout, &mut self.task)
            .await
            .is_err()
        {
            warn!("anti-entropy drain timeout exceeded, abandoning cycle");
            self.task.abort();
        }
    }
}

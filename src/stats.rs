//! Counters and timers the engine emits.
//!
//! The sink is injected, not owned: the engine calls `increment` /
//! `observe` through a trait object and never depends on where the
//! numbers go. `NoopStats` keeps tests quiet; `AtomicStats` backs the
//! server's Status command with lock-free counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Counter names emitted by the engine. Kept as constants so the server
// and tests reference the same spelling.
pub const FRAGMENT_WRITES: &str = "fragment_writes";
pub const FRAGMENT_FLUSHES: &str = "fragment_flushes";
pub const ANTIENTROPY_CYCLES: &str = "antientropy_cycles";
pub const DIGEST_MISMATCH: &str = "digest_mismatch";
pub const BLOCKS_REPAIRED: &str = "blocks_repaired";
pub const PEER_UNREACHABLE: &str = "peer_unreachable";
pub const CORRUPT_BLOCK: &str = "corrupt_block";
pub const OWNERSHIP_MISMATCH: &str = "ownership_mismatch";

/// Timer names observed by the engine.
pub const ANTIENTROPY_CYCLE_TIME: &str = "antientropy_cycle_time";
pub const FLUSH_TIME: &str = "flush_time";

/// Injected metrics sink.
///
/// Implementations must be cheap and non-blocking on the hot path;
/// `increment` is called on every client write.
pub trait StatsSink: Send + Sync {
    /// Bump a named counter by one.
    fn increment(&self, name: &str);

    /// Record a named duration.
    fn observe(&self, name: &str, duration: Duration);
}

/// Sink that discards everything. Default for tests.
#[derive(Debug, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn increment(&self, _name: &str) {}
    fn observe(&self, _name: &str, _duration: Duration) {}
}

/// Accumulated state for one named timer.
#[derive(Debug, Default)]
struct TimerCell {
    count: AtomicU64,
    total_micros: AtomicU64,
    last_micros: AtomicU64,
}

/// Lock-free named counters plus per-timer totals.
///
/// Counter cells are created on first use under a short-lived mutex and
/// then bumped with relaxed atomics; the map itself is append-only.
#[derive(Debug, Default)]
pub struct AtomicStats {
    counters: Mutex<HashMap<String, &'static AtomicU64>>,
    timers: Mutex<HashMap<String, &'static TimerCell>>,
}

impl AtomicStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, name: &str) -> &'static AtomicU64 {
        let mut map = self.counters.lock().unwrap();
        if let Some(cell) = map.get(name) {
            return cell;
        }
        // Leaked once per distinct counter name; the name set is small
        // and fixed for the life of the process.
        let cell: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(0)));
        map.insert(name.to_string(), cell);
        cell
    }

    fn timer(&self, name: &str) -> &'static TimerCell {
        let mut map = self.timers.lock().unwrap();
        if let Some(cell) = map.get(name) {
            return cell;
        }
        let cell: &'static TimerCell = Box::leak(Box::new(TimerCell::default()));
        map.insert(name.to_string(), cell);
        cell
    }

    /// Read a counter value (0 if never incremented).
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time copy of all counters and timers, for the Status
    /// wire command.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .counters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .timers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, cell)| {
                (
                    name.clone(),
                    TimerSnapshot {
                        count: cell.count.load(Ordering::Relaxed),
                        total_micros: cell.total_micros.load(Ordering::Relaxed),
                        last_micros: cell.last_micros.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        StatsSnapshot { counters, timers }
    }
}

impl StatsSink for AtomicStats {
    fn increment(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    fn observe(&self, name: &str, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let cell = self.timer(name);
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.total_micros.fetch_add(micros, Ordering::Relaxed);
        cell.last_micros.store(micros, Ordering::Relaxed);
    }
}

/// Wire-serializable view of one timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_micros: u64,
    pub last_micros: u64,
}

/// Wire-serializable view of all stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerSnapshot>,
}

//! Cache hit/miss accounting.
//!
//! Two counter sets: lifetime counters that only ever grow, and a rolling
//! window that is reported through `tracing` and reset every
//! [`REPORT_INTERVAL`] misses.

use crate::ctrl::StatsMsg;
use std::sync::atomic::{AtomicU64, Ordering};

/// A statistics line is emitted (and the window reset) every this many
/// misses.
pub const REPORT_INTERVAL: u64 = 10_000;

/// Point-in-time copy of the lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful reads.
    pub hits: u64,
    /// Reads that faulted or found nothing.
    pub misses: u64,
    /// Misses whose object identity was still in the victim cache.
    pub victim_hits: u64,
    /// Total construct time across misses, in nanoseconds.
    pub miss_cycles: u64,
    /// Total bytes produced by construct callbacks.
    pub miss_bytes: u64,
}

impl StatsSnapshot {
    /// Hit ratio over all recorded operations, or 0 when idle.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-pool cache statistics.
pub struct CacheStats {
    name: String,

    hits: AtomicU64,
    misses: AtomicU64,
    victim_hits: AtomicU64,
    miss_cycles: AtomicU64,
    miss_bytes: AtomicU64,

    win_hits: AtomicU64,
    win_misses: AtomicU64,
    win_victim_hits: AtomicU64,
    win_miss_cycles: AtomicU64,
    win_miss_bytes: AtomicU64,
}

impl CacheStats {
    /// Create counters for the named pool.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            victim_hits: AtomicU64::new(0),
            miss_cycles: AtomicU64::new(0),
            miss_bytes: AtomicU64::new(0),
            win_hits: AtomicU64::new(0),
            win_misses: AtomicU64::new(0),
            win_victim_hits: AtomicU64::new(0),
            win_miss_cycles: AtomicU64::new(0),
            win_miss_bytes: AtomicU64::new(0),
        }
    }

    /// Count a hit.
    pub fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.win_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a miss, emitting the periodic statistics line when the window
    /// fills.
    pub fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        let win = self.win_misses.fetch_add(1, Ordering::Relaxed) + 1;
        if win >= REPORT_INTERVAL {
            self.report_window();
        }
    }

    /// Count a victim-cache hit (in addition to the miss it refines).
    pub fn inc_victim_hit(&self) {
        self.victim_hits.fetch_add(1, Ordering::Relaxed);
        self.win_victim_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the cost of one construct invocation.
    pub fn record_miss_penalty(&self, nanos: u64, bytes: u64) {
        self.miss_cycles.fetch_add(nanos, Ordering::Relaxed);
        self.miss_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.win_miss_cycles.fetch_add(nanos, Ordering::Relaxed);
        self.win_miss_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Lifetime counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            victim_hits: self.victim_hits.load(Ordering::Relaxed),
            miss_cycles: self.miss_cycles.load(Ordering::Relaxed),
            miss_bytes: self.miss_bytes.load(Ordering::Relaxed),
        }
    }

    /// Wire-format snapshot for a coordinator `ProfStats` poll.
    pub fn to_stats_msg(&self, headroom: u32) -> StatsMsg {
        let snap = self.snapshot();
        let penalty = if snap.misses == 0 {
            0.0
        } else {
            snap.miss_cycles as f64 / snap.misses as f64
        };
        StatsMsg {
            hits: snap.hits,
            misses: snap.misses,
            miss_penalty: penalty,
            vhits: snap.victim_hits.min(u32::MAX as u64) as u32,
            headroom,
        }
    }

    fn report_window(&self) {
        let hits = self.win_hits.swap(0, Ordering::Relaxed);
        let misses = self.win_misses.swap(0, Ordering::Relaxed);
        let victim_hits = self.win_victim_hits.swap(0, Ordering::Relaxed);
        let cycles = self.win_miss_cycles.swap(0, Ordering::Relaxed);
        let bytes = self.win_miss_bytes.swap(0, Ordering::Relaxed);
        let total = hits + misses;
        let ratio = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        let penalty = if misses == 0 {
            0.0
        } else {
            cycles as f64 / misses as f64
        };
        tracing::info!(
            pool = %self.name,
            hits,
            misses,
            victim_hits,
            hit_ratio = ratio,
            avg_miss_penalty_ns = penalty,
            miss_bytes = bytes,
            "cache stats window"
        );
    }
}

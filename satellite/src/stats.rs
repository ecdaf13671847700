//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub snapshots: AtomicU64,
    pub oplog_captured: AtomicU64,
    pub oplog_gc: AtomicU64,
    pub transactions_applied: AtomicU64,
    pub compensations: AtomicU64,
    pub subscriptions_established: AtomicU64,
    pub subscriptions_cancelled: AtomicU64,
}

/// Point-in-time copy handed to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub snapshots: u64,
    pub oplog_captured: u64,
    pub oplog_gc: u64,
    pub transactions_applied: u64,
    pub compensations: u64,
    pub subscriptions_established: u64,
    pub subscriptions_cancelled: u64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            snapshots: self.snapshots.load(Ordering::Relaxed),
            oplog_captured: self.oplog_captured.load(Ordering::Relaxed),
            oplog_gc: self.oplog_gc.load(Ordering::Relaxed),
            transactions_applied: self.transactions_applied.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            subscriptions_established: self.subscriptions_established.load(Ordering::Relaxed),
            subscriptions_cancelled: self.subscriptions_cancelled.load(Ordering::Relaxed),
        }
    }
}

//! Per-dispatcher counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared between a dispatcher and its handles
#[derive(Debug, Default)]
pub struct DispatcherStats {
    executed: AtomicU64,
    executed_inline: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    suspensions: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub executed: u64,
    pub executed_inline: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub suspensions: u64,
    pub timed_out: u64,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_executed(&self, inline: bool) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if inline {
            self.executed_inline.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_cancelled(&self, n: u64) {
        self.cancelled.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_suspensions(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            executed_inline: self.executed_inline.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = DispatcherStats::new();
        stats.inc_executed(false);
        stats.inc_executed(true);
        stats.inc_failed();
        stats.add_cancelled(3);

        let snap = stats.snapshot();
        assert_eq!(snap.executed, 2);
        assert_eq!(snap.executed_inline, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.cancelled, 3);
        assert_eq!(snap.timed_out, 0);
    }
}

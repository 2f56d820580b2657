//! Metrics for the sync engine
//!
//! Global counters/histograms go through the `metrics` facade so any
//! installed recorder picks them up. Each dispatcher additionally keeps its
//! own [`DispatcherStats`] readable without a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

mod collector;

pub use collector::{DispatcherStats, StatsSnapshot};

pub const SNAPSHOTS_EMITTED: &str = "sync.snapshots.emitted";
pub const PATCHES_EMITTED: &str = "sync.patches.emitted";
pub const INCOMING_APPLIED: &str = "sync.incoming.applied";
pub const INCOMING_REJECTED: &str = "sync.incoming.rejected";
pub const VERSION_CONFLICTS: &str = "sync.version_conflicts";
pub const UNITS_EXECUTED: &str = "dispatcher.units.executed";
pub const UNITS_FAILED: &str = "dispatcher.units.failed";
pub const UNITS_CANCELLED: &str = "dispatcher.units.cancelled";
pub const SUSPEND_DURATION_MS: &str = "dispatcher.suspend.duration_ms";

/// Register descriptions for every metric the engine emits
pub fn init_metrics() {
    describe_counter!(SNAPSHOTS_EMITTED, "Full container snapshots emitted");
    describe_counter!(PATCHES_EMITTED, "Granular container patches emitted");
    describe_counter!(INCOMING_APPLIED, "Peer updates applied to server state");
    describe_counter!(INCOMING_REJECTED, "Peer updates rejected by access policy");
    describe_counter!(VERSION_CONFLICTS, "Stale peer updates discarded");
    describe_counter!(UNITS_EXECUTED, "Dispatcher work units executed");
    describe_counter!(UNITS_FAILED, "Dispatcher work units that failed or panicked");
    describe_counter!(UNITS_CANCELLED, "Queued work units dropped at shutdown");
    describe_histogram!(SUSPEND_DURATION_MS, "Time spent suspended waiting on the peer");
}

pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.name).record(elapsed_ms);
        elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_without_recorder() {
        init_metrics();
        record_counter(SNAPSHOTS_EMITTED, 1);
        record_histogram(SUSPEND_DURATION_MS, 2.5);
    }

    #[test]
    fn test_timer_reports_elapsed() {
        let timer = Timer::new(SUSPEND_DURATION_MS);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() >= 5.0);
    }
}

//! Multi metrics (counters only, exported through snapshots and debug events)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters recorded by one multi
#[derive(Debug, Default)]
pub struct Metrics {
    handles_added: AtomicU64,
    completed_ok: AtomicU64,
    completed_failed: AtomicU64,
    cancelled: AtomicU64,
    poll_iterations: AtomicU64,
    poll_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_added(&self) {
        self.handles_added.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "handles_added", "Metric incremented");
    }

    pub fn handle_completed(&self, success: bool) {
        if success {
            self.completed_ok.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(counter = "completed_ok", "Metric incremented");
        } else {
            self.completed_failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(counter = "completed_failed", "Metric incremented");
        }
    }

    pub fn handle_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "cancelled", "Metric incremented");
    }

    pub fn poll_iteration(&self) {
        self.poll_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "poll_errors", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handles_added: self.handles_added.load(Ordering::Relaxed),
            completed_ok: self.completed_ok.load(Ordering::Relaxed),
            completed_failed: self.completed_failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            poll_iterations: self.poll_iterations.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub handles_added: u64,
    pub completed_ok: u64,
    pub completed_failed: u64,
    pub cancelled: u64,
    pub poll_iterations: u64,
    pub poll_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.handle_added();
        metrics.handle_added();
        metrics.handle_completed(true);
        metrics.handle_completed(false);
        metrics.handle_cancelled();
        metrics.poll_iteration();
        metrics.poll_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.handles_added, 2);
        assert_eq!(snapshot.completed_ok, 1);
        assert_eq!(snapshot.completed_failed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.poll_iterations, 1);
        assert_eq!(snapshot.poll_errors, 1);
    }
}

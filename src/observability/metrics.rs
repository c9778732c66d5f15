use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Counters shared by the controller, the requests and the mergers.
#[derive(Debug, Default)]
pub struct PlaybackMetrics {
    requests_started: AtomicU64,
    requests_finished: AtomicU64,
    requests_failed: AtomicU64,
    frames_delivered: AtomicU64,
    malformed_discarded: AtomicU64,
    stale_discarded: AtomicU64,
    late_dropped: AtomicU64,
    rejected_transitions: AtomicU64,
    total_pull_latency_us: AtomicU64,
    pull_samples: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub frames_delivered: u64,
    pub malformed_discarded: u64,
    pub stale_discarded: u64,
    pub late_dropped: u64,
    pub rejected_transitions: u64,
    pub avg_pull_latency_us: u64,
}

impl PlaybackMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_finished(&self) {
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame fetched for a request that was superseded meanwhile.
    pub fn record_stale(&self) {
        self.stale_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_drop(&self) {
        self.late_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_transition(&self) {
        self.rejected_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_pull(&self) -> Instant {
        Instant::now()
    }

    pub fn finish_pull(&self, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_pull_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.pull_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_started(&self) -> u64 {
        self.requests_started.load(Ordering::Relaxed)
    }

    pub fn requests_finished(&self) -> u64 {
        self.requests_finished.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn malformed_discarded(&self) -> u64 {
        self.malformed_discarded.load(Ordering::Relaxed)
    }

    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded.load(Ordering::Relaxed)
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped.load(Ordering::Relaxed)
    }

    pub fn rejected_transitions(&self) -> u64 {
        self.rejected_transitions.load(Ordering::Relaxed)
    }

    pub fn avg_pull_latency_us(&self) -> u64 {
        let samples = self.pull_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_pull_latency_us.load(Ordering::Relaxed) / samples
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_started: self.requests_started(),
            requests_finished: self.requests_finished(),
            requests_failed: self.requests_failed(),
            frames_delivered: self.frames_delivered(),
            malformed_discarded: self.malformed_discarded(),
            stale_discarded: self.stale_discarded(),
            late_dropped: self.late_dropped(),
            rejected_transitions: self.rejected_transitions(),
            avg_pull_latency_us: self.avg_pull_latency_us(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = PlaybackMetrics::new();
        metrics.record_request_started();
        metrics.record_frame_delivered();
        metrics.record_frame_delivered();
        metrics.record_late_drop();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_started, 1);
        assert_eq!(snapshot.frames_delivered, 2);
        assert_eq!(snapshot.late_dropped, 1);
        assert_eq!(snapshot.avg_pull_latency_us, 0);
    }
}

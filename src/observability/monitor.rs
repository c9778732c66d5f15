use std::sync::Arc;

use super::PlaybackMetrics;

pub struct PlaybackMonitor {
    metrics: Arc<PlaybackMetrics>,
}

fn plural(count: u64, noun: &str) -> String {
    format!("{} {}{}", count, noun, if count == 1 { "" } else { "s" })
}

impl PlaybackMonitor {
    pub fn new(metrics: Arc<PlaybackMetrics>) -> Self {
        Self { metrics }
    }

    pub fn generate_report(&self) -> String {
        let s = self.metrics.snapshot();

        if s.requests_started == 0 {
            return "No requests handled".to_string();
        }

        let mut report = String::from("=== Playback Metrics ===\n");
        report.push_str(&format!(
            "  Requests: {} started, {} finished, {} failed\n",
            s.requests_started, s.requests_finished, s.requests_failed
        ));
        report.push_str(&format!("  Delivered: {}\n", plural(s.frames_delivered, "frame")));
        report.push_str(&format!(
            "  Discarded: {} malformed, {} stale, {} out of order\n",
            s.malformed_discarded, s.stale_discarded, s.late_dropped
        ));
        report.push_str(&format!(
            "  Rejected transitions: {}\n  Avg Pull Latency: {}μs\n",
            s.rejected_transitions, s.avg_pull_latency_us
        ));

        report
    }

    pub fn metrics(&self) -> &Arc<PlaybackMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report() {
        let monitor = PlaybackMonitor::new(Arc::new(PlaybackMetrics::new()));
        assert_eq!(monitor.generate_report(), "No requests handled");
    }

    #[test]
    fn test_report_lists_counters() {
        let metrics = Arc::new(PlaybackMetrics::new());
        metrics.record_request_started();
        metrics.record_frame_delivered();
        let report = PlaybackMonitor::new(metrics).generate_report();

        assert!(report.contains("1 started"));
        assert!(report.contains("Delivered: 1 frame\n"));
    }
}

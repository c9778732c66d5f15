pub mod metrics;
pub mod monitor;

pub use metrics::{MetricsSnapshot, PlaybackMetrics};
pub use monitor::PlaybackMonitor;

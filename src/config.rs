use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::ChannelRef;

/// How continuous requests combine their channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Time-ordered merge over one connection per channel when exactly two
    /// channels are configured, arrival order otherwise.
    #[default]
    Auto,
    /// Always one connection per channel with a time-ordered merge.
    PerChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Channels retrieved by every request
    pub channels: Vec<ChannelRef>,
    /// Channels used for discrete searches, bounds and the rate display.
    /// Empty means the first entry of `channels`.
    pub reference_channels: Vec<ChannelRef>,
    /// Nominal frame step for forward searches (seconds)
    pub one_frame_step: f64,
    /// Step for backward searches; small and negative so a search does not
    /// land on the frame it started from.
    pub one_frame_back_step: f64,
    /// Extra fetches after an empty discrete search
    pub search_retries: u32,
    pub poll_timeout_ms: u64,
    /// Bounded probe for the lagging side of a time-ordered merge
    pub probe_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    /// Limit for the decoder handshake (format, prefetch, start)
    pub startup_timeout_ms: u64,
    pub event_capacity: usize,
    pub rate_smoothing: f64,
    pub merge_strategy: MergeStrategy,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            reference_channels: Vec::new(),
            one_frame_step: 1.0,
            one_frame_back_step: -0.01,
            search_retries: 1,
            poll_timeout_ms: 1000,
            probe_timeout_ms: 20,
            drain_timeout_ms: 500,
            startup_timeout_ms: 5000,
            event_capacity: 64,
            rate_smoothing: 0.5,
            merge_strategy: MergeStrategy::Auto,
        }
    }
}

impl PlaybackConfig {
    pub fn new<I, C>(channels: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelRef>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Build from JSON, either the bare object or wrapped in `playback_config`.
    pub fn from_json(config: Value) -> Result<Self> {
        let body = match config.get("playback_config") {
            Some(inner) => inner.clone(),
            None => config,
        };
        let parsed: PlaybackConfig =
            serde_json::from_value(body).context("Failed to parse playback config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .context(format!("Failed to read playback config from {:?}", path))?;
        let value: Value =
            serde_json::from_str(&json).context("Failed to deserialize playback config")?;
        Self::from_json(value)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(anyhow!("At least one channel is required"));
        }
        if let Some(missing) = self
            .reference_channels
            .iter()
            .find(|c| !self.channels.contains(c))
        {
            return Err(anyhow!("Reference channel {} is not a configured channel", missing));
        }
        if !(self.one_frame_step > 0.0) {
            return Err(anyhow!("one_frame_step must be positive"));
        }
        if !(self.one_frame_back_step < 0.0) {
            return Err(anyhow!("one_frame_back_step must be negative"));
        }
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.rate_smoothing) {
            return Err(anyhow!("rate_smoothing must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn with_reference_channels<I, C>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelRef>,
    {
        self.reference_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn reference(&self) -> Vec<ChannelRef> {
        if self.reference_channels.is_empty() {
            self.channels.iter().take(1).cloned().collect()
        } else {
            self.reference_channels.clone()
        }
    }

    /// Time-ordered merge across per-channel connections?
    pub fn merges_per_channel(&self) -> bool {
        match self.merge_strategy {
            MergeStrategy::Auto => self.channels.len() == 2,
            MergeStrategy::PerChannel => self.channels.len() > 1,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = PlaybackConfig::from_json(json!({ "channels": ["cam/video"] })).unwrap();
        assert_eq!(config.one_frame_step, 1.0);
        assert_eq!(config.one_frame_back_step, -0.01);
        assert_eq!(config.search_retries, 1);
        assert_eq!(config.merge_strategy, MergeStrategy::Auto);
        assert_eq!(config.reference(), vec![ChannelRef::from("cam/video")]);
    }

    #[test]
    fn test_wrapped_config() {
        let config = PlaybackConfig::from_json(json!({
            "playback_config": {
                "channels": ["v", "a"],
                "reference_channels": ["a"],
                "merge_strategy": "per_channel",
                "probe_timeout_ms": 5
            }
        }))
        .unwrap();

        assert_eq!(config.reference(), vec![ChannelRef::from("a")]);
        assert_eq!(config.probe_timeout(), Duration::from_millis(5));
        assert!(config.merges_per_channel());
    }

    #[test]
    fn test_validation_failures() {
        assert!(PlaybackConfig::from_json(json!({})).is_err());
        assert!(PlaybackConfig::from_json(json!({ "channels": ["v"], "one_frame_step": 0.0 })).is_err());
        assert!(PlaybackConfig::from_json(json!({ "channels": ["v"], "one_frame_back_step": 0.5 })).is_err());
        assert!(PlaybackConfig::from_json(json!({ "channels": ["v"], "event_capacity": 0 })).is_err());
        assert!(PlaybackConfig::from_json(json!({ "channels": ["v"], "rate_smoothing": 1.5 })).is_err());
        assert!(PlaybackConfig::from_json(json!({
            "channels": ["v"],
            "reference_channels": ["x"]
        }))
        .is_err());
    }

    #[test]
    fn test_auto_merge_only_for_two_channels() {
        assert!(!PlaybackConfig::new(["v"]).merges_per_channel());
        assert!(PlaybackConfig::new(["v", "a"]).merges_per_channel());
        assert!(!PlaybackConfig::new(["v", "a", "d"]).merges_per_channel());
        assert!(PlaybackConfig::new(["v", "a", "d"])
            .with_merge_strategy(MergeStrategy::PerChannel)
            .merges_per_channel());
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::RetrievalError;

/// Name or path of one time-series track on the remote source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRef(String);

impl ChannelRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChannelRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open interval `[start, end)` in media time (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn from_duration(start: f64, duration: f64) -> Self {
        Self::new(start, start + duration)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// One channel's data inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPayload {
    pub channel: ChannelRef,
    pub start: f64,
    pub duration: f64,
    /// Content type as registered by the producer, used to pick a decoder
    pub mime: Option<String>,
    pub data: Arc<Vec<u8>>,
}

impl ChannelPayload {
    pub fn new(channel: impl Into<ChannelRef>, start: f64, duration: f64, data: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            start,
            duration,
            mime: None,
            data: Arc::new(data),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::from_duration(self.start, self.duration)
    }

    /// A payload is usable only with a finite start and a finite, non-negative duration.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        let reason = if !self.start.is_finite() {
            Some(format!("start time {} is not finite", self.start))
        } else if !self.duration.is_finite() || self.duration < 0.0 {
            Some(format!("duration {} is not a finite non-negative value", self.duration))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(RetrievalError::MalformedChannelData {
                channel: self.channel.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Descriptor handed to the decoder so it can choose a format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub channel: ChannelRef,
    pub mime: Option<String>,
}

/// Bundle of channel payloads returned by a single fetch or stream read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub payloads: Vec<ChannelPayload>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(payload: ChannelPayload) -> Self {
        Self {
            payloads: vec![payload],
        }
    }

    pub fn push(&mut self, payload: ChannelPayload) {
        self.payloads.push(payload);
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Span covered by all payloads, `None` for an empty frame.
    pub fn time_range(&self) -> Option<TimeRange> {
        self.payloads
            .iter()
            .map(ChannelPayload::range)
            .reduce(|acc, range| acc.union(&range))
    }

    /// Earliest payload start.
    pub fn start(&self) -> Option<f64> {
        self.time_range().map(|range| range.start)
    }

    pub fn contains_channel(&self, channel: &ChannelRef) -> bool {
        self.payloads.iter().any(|p| &p.channel == channel)
    }

    pub fn contains_any(&self, channels: &[ChannelRef]) -> bool {
        channels.iter().any(|c| self.contains_channel(c))
    }

    pub fn metadata(&self) -> Vec<ChannelMetadata> {
        self.payloads
            .iter()
            .map(|p| ChannelMetadata {
                channel: p.channel.clone(),
                mime: p.mime.clone(),
            })
            .collect()
    }

    /// Splits off payloads lacking a usable timestamp or duration.
    ///
    /// The returned frame holds only valid payloads; the errors describe what
    /// was discarded.
    pub fn into_valid(self) -> (Frame, Vec<RetrievalError>) {
        let mut valid = Frame::new();
        let mut rejected = Vec::new();

        for payload in self.payloads {
            match payload.validate() {
                Ok(()) => valid.push(payload),
                Err(e) => rejected.push(e),
            }
        }

        (valid, rejected)
    }
}

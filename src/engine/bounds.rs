use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{ChannelRef, Frame, RetrievalError, RetrievalResult, Selector, TimeRange};
use crate::source::ManagedConnection;

/// Known `[min, max]` media time available on the reference channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    /// Never shrinks.
    pub fn widen(&mut self, range: &TimeRange) {
        self.min = self.min.min(range.start);
        self.max = self.max.max(range.end);
    }

    pub fn merged(mut self, other: &Bounds) -> Bounds {
        self.widen(&TimeRange::new(other.min, other.max));
        self
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.min && time <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Position of `time` as a fraction of the span, clamped to `[0, 1]`.
    pub fn fraction(&self, time: f64) -> f64 {
        if self.span() <= 0.0 {
            return 0.0;
        }
        ((time - self.min) / self.span()).clamp(0.0, 1.0)
    }

    /// Inverse of `fraction`, used to map a slider position to media time.
    pub fn time_at(&self, fraction: f64) -> f64 {
        self.min + self.span() * fraction.clamp(0.0, 1.0)
    }
}

impl From<TimeRange> for Bounds {
    fn from(range: TimeRange) -> Self {
        Bounds::new(range.start, range.end)
    }
}

fn valid_range(frame: Option<Frame>) -> Option<TimeRange> {
    let (frame, rejected) = frame?.into_valid();
    for err in rejected {
        warn!(%err, "ignoring malformed payload while probing limits");
    }
    frame.time_range()
}

/// Oldest and newest data on `channels`, `None` when either probe comes back empty.
///
/// Must run on a connection with no active stream; the connection wrapper
/// rejects the fetch otherwise.
pub async fn fetch_limits(
    connection: &mut ManagedConnection,
    channels: &[ChannelRef],
) -> RetrievalResult<Option<Bounds>> {
    let oldest = connection
        .fetch_once(channels, 0.0, 0.0, Selector::Oldest)
        .await?;
    let newest = connection
        .fetch_once(channels, 0.0, 0.0, Selector::Newest)
        .await?;

    Ok(match (valid_range(oldest), valid_range(newest)) {
        (Some(first), Some(last)) => Some(Bounds::new(first.start, last.end.max(first.end))),
        _ => None,
    })
}

/// Running `[min, max]` over every refresh and delivered frame.
#[derive(Debug, Default)]
pub struct BoundsTracker {
    bounds: Option<Bounds>,
}

impl BoundsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Probe the source and fold the result into the running bounds.
    ///
    /// `NoDataAvailable` is returned distinctly from transport failures, and
    /// leaves the tracked bounds untouched.
    pub async fn refresh(
        &mut self,
        connection: &mut ManagedConnection,
        channels: &[ChannelRef],
    ) -> RetrievalResult<Bounds> {
        let probed = fetch_limits(connection, channels)
            .await?
            .ok_or(RetrievalError::NoDataAvailable)?;

        let bounds = match self.bounds {
            Some(current) => current.merged(&probed),
            None => probed,
        };
        debug!(min = bounds.min, max = bounds.max, "bounds refreshed");
        self.bounds = Some(bounds);
        Ok(bounds)
    }

    /// Widen with data seen outside a refresh (e.g. delivered frames).
    pub fn observe(&mut self, range: &TimeRange) -> Bounds {
        let bounds = match self.bounds {
            Some(mut current) => {
                current.widen(range);
                current
            }
            None => Bounds::from(*range),
        };
        self.bounds = Some(bounds);
        bounds
    }
}

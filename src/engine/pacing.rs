use std::time::Duration;
use tokio::time::Instant;

use crate::core::{Direction, TimeRange};

/// Wall-clock / media-time pair captured on the first frame of a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingAnchor {
    pub wall: Instant,
    pub media: f64,
}

/// Computes how long to hold each frame so media time advances at 1x.
///
/// Real time is allowed to catch up: a late frame gets a zero wait, nothing
/// is ever skipped here.
#[derive(Debug, Clone)]
pub struct PacingController {
    direction: Direction,
    paced: bool,
    anchor: Option<PacingAnchor>,
}

impl PacingController {
    pub fn new(direction: Direction, paced: bool) -> Self {
        Self {
            direction,
            paced,
            anchor: None,
        }
    }

    pub fn anchor(&self) -> Option<PacingAnchor> {
        self.anchor
    }

    fn media_time(&self, range: &TimeRange) -> f64 {
        match self.direction {
            Direction::Backward => range.end,
            Direction::Forward | Direction::Frozen => range.start,
        }
    }

    /// Wait before releasing the frame covering `range`, observed at `now`.
    pub fn wait(&mut self, range: &TimeRange, now: Instant) -> Duration {
        let media = self.media_time(range);
        let anchor = *self.anchor.get_or_insert(PacingAnchor { wall: now, media });

        if !self.paced {
            return Duration::ZERO;
        }

        let elapsed_media = match self.direction {
            Direction::Backward => anchor.media - media,
            Direction::Forward | Direction::Frozen => media - anchor.media,
        };
        let elapsed_wall = now.saturating_duration_since(anchor.wall).as_secs_f64();

        let wait = elapsed_media - elapsed_wall;
        if wait > 0.0 && wait.is_finite() {
            Duration::from_secs_f64(wait)
        } else {
            Duration::ZERO
        }
    }
}

/// Exponentially smoothed frames-per-second estimate, for display only.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    rate: f64,
    smoothing: f64,
    last: Option<Instant>,
}

impl RateEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            rate: 0.0,
            smoothing: smoothing.clamp(0.0, 1.0),
            last: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Record a frame boundary at `now` and return the updated estimate.
    pub fn observe(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let delta = now.saturating_duration_since(last).as_secs_f64();
            // Two frames in the same tick keep the previous estimate.
            if delta <= 0.0 {
                return self.rate;
            }
            self.rate = self.smoothing * (1.0 / delta) + (1.0 - self.smoothing) * self.rate;
        }
        self.last = Some(now);
        self.rate
    }

    /// Start a fresh measurement interval but keep the estimate.
    pub fn restart(&mut self) {
        self.last = None;
    }
}

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::bounds::fetch_limits;
use super::pacing::PacingController;
use super::signal::StopListener;
use super::sync::{ArrivalOrderMerger, ChannelSynchronizer, FrameMerger, MergeOutcome};
use crate::config::PlaybackConfig;
use crate::core::{
    ChannelRef, Direction, Frame, PlaybackMode, Regime, RequestDuration, RetrievalResult,
    Selector, TimeRange,
};
use crate::observability::PlaybackMetrics;
use crate::source::{DataSource, ManagedConnection};

/// Identifier of a submitted request; equals its stop-signal generation.
pub type RequestId = u64;

/// A playback intent as submitted by the command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub id: RequestId,
    pub mode: PlaybackMode,
    pub target: Option<f64>,
    /// Set while the position slider is being dragged
    pub tracking: bool,
}

/// Why a request stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    EndOfData,
    NoDataAvailable,
}

/// A retrieved frame plus how long to hold it before delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PacedFrame {
    pub frame: Frame,
    pub range: TimeRange,
    pub wait: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    Frame(PacedFrame),
    End(EndReason),
}

/// One playback intent and the bookkeeping needed to produce its frames.
///
/// The retrieval regime is fixed at construction. Discrete requests search
/// with single-shot fetches on a connection lent by the caller; continuous
/// requests own their stream connections through a merger created by `arm`.
/// A request never sleeps: every frame carries the wait computed by its
/// pacing controller.
pub struct FrameRequest {
    spec: RequestSpec,
    regime: Regime,
    config: Arc<PlaybackConfig>,
    reference_channels: Vec<ChannelRef>,
    /// Time range of the last frame shown by the previous request
    seed: Option<TimeRange>,
    last_frame: Option<Frame>,
    last_range: Option<TimeRange>,
    observed: Option<TimeRange>,
    pacing: PacingController,
    merger: Option<Box<dyn FrameMerger>>,
    pulls: u64,
    metrics: Arc<PlaybackMetrics>,
}

impl FrameRequest {
    pub fn new(
        spec: RequestSpec,
        seed: Option<TimeRange>,
        config: Arc<PlaybackConfig>,
        metrics: Arc<PlaybackMetrics>,
    ) -> Self {
        let regime = spec.mode.regime().unwrap_or(Regime::Discrete);
        let pacing = PacingController::new(spec.mode.direction(), spec.mode.is_paced());
        let reference_channels = config.reference();

        Self {
            spec,
            regime,
            config,
            reference_channels,
            seed,
            last_frame: None,
            last_range: None,
            observed: None,
            pacing,
            merger: None,
            pulls: 0,
            metrics,
        }
    }

    pub fn id(&self) -> RequestId {
        self.spec.id
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    pub fn mode(&self) -> PlaybackMode {
        self.spec.mode
    }

    pub fn direction(&self) -> Direction {
        self.spec.mode.direction()
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    pub fn is_tracking(&self) -> bool {
        self.spec.tracking
    }

    /// Cumulative `[observed-start, observed-end]` of the frames produced so far.
    pub fn observed(&self) -> Option<TimeRange> {
        self.observed
    }

    pub fn last_range(&self) -> Option<TimeRange> {
        self.last_range
    }

    pub fn pacing(&self) -> &PacingController {
        &self.pacing
    }

    fn step(&self) -> Option<f64> {
        match self.direction() {
            Direction::Forward => Some(self.config.one_frame_step),
            Direction::Backward => Some(self.config.one_frame_back_step),
            Direction::Frozen => None,
        }
    }

    /// Reference time of the next discrete fetch; `None` when the request is done.
    fn next_reference(&self) -> Option<Option<f64>> {
        if self.pulls == 0 {
            let reference = match (self.spec.target, self.direction()) {
                (Some(target), _) => Some(target),
                (None, Direction::Forward) => self.seed.map(|r| r.end),
                (None, Direction::Backward | Direction::Frozen) => self.seed.map(|r| r.start),
            };
            return Some(reference);
        }

        if self.spec.mode.duration() == RequestDuration::OneFrame {
            return None;
        }
        let last = self.last_range?;
        Some(Some(match self.direction() {
            Direction::Backward => last.start,
            Direction::Forward | Direction::Frozen => last.end,
        }))
    }

    /// Open the stream connections of a continuous request. No-op for
    /// discrete requests or when already armed.
    pub async fn arm(&mut self, source: &dyn DataSource, stop: StopListener) -> RetrievalResult<()> {
        if self.regime != Regime::Continuous || self.merger.is_some() {
            return Ok(());
        }

        let channels = self.config.channels.clone();
        let poll = self.config.poll_timeout();

        if self.spec.mode == PlaybackMode::RealTime {
            let mut connection = ManagedConnection::open(source, "monitor").await?;
            if let Err(e) = connection.monitor(&channels).await {
                let _ = connection.close().await;
                return Err(e);
            }
            self.merger = Some(Box::new(ArrivalOrderMerger::spawn(
                connection,
                poll,
                stop,
                self.metrics.clone(),
            )));
            return Ok(());
        }

        let (start, selector) = match (self.spec.target, self.seed) {
            (Some(target), _) => (target, Selector::Absolute),
            (None, Some(seed)) => (seed.end, Selector::Next),
            (None, None) => (0.0, Selector::Oldest),
        };
        debug!(request = self.id(), start, selector = selector.as_str(), "subscribing");

        let merger: Box<dyn FrameMerger> = if self.config.merges_per_channel() {
            let mut connections = Vec::with_capacity(channels.len());
            for channel in &channels {
                match subscribe(source, std::slice::from_ref(channel), start, selector).await {
                    Ok(connection) => connections.push(connection),
                    Err(e) => {
                        for mut opened in connections {
                            let _ = opened.close().await;
                        }
                        return Err(e);
                    }
                }
            }
            Box::new(ChannelSynchronizer::spawn(
                connections,
                poll,
                self.config.probe_timeout(),
                stop,
                self.metrics.clone(),
            ))
        } else {
            let connection = subscribe(source, &channels, start, selector).await?;
            Box::new(ArrivalOrderMerger::spawn(connection, poll, stop, self.metrics.clone()))
        };

        self.merger = Some(merger);
        Ok(())
    }

    /// Produce the next frame. `connection` serves discrete searches and must
    /// not be streaming; continuous requests read from their merger instead.
    pub async fn pull(&mut self, connection: &mut ManagedConnection) -> RetrievalResult<Pulled> {
        match self.regime {
            Regime::Discrete => self.pull_discrete(connection).await,
            Regime::Continuous => self.pull_continuous().await,
        }
    }

    async fn pull_continuous(&mut self) -> RetrievalResult<Pulled> {
        let Some(merger) = self.merger.as_mut() else {
            warn!(request = self.id(), "pull on a continuous request that was never armed");
            return Ok(Pulled::End(EndReason::EndOfData));
        };

        match merger.next_frame().await? {
            MergeOutcome::Frame(frame) => Ok(self.accept(frame)),
            MergeOutcome::Ended => Ok(Pulled::End(EndReason::EndOfData)),
        }
    }

    async fn pull_discrete(&mut self, connection: &mut ManagedConnection) -> RetrievalResult<Pulled> {
        let Some(mut reference) = self.next_reference() else {
            return Ok(Pulled::End(EndReason::EndOfData));
        };
        self.pulls += 1;

        if reference.map_or(false, |r| !r.is_finite()) {
            debug!(request = self.id(), "unusable reference time");
            return Ok(Pulled::End(EndReason::EndOfData));
        }

        let selector = self.spec.mode.selector();
        let mut retries = 0;

        loop {
            if let Some(frame) = self.fetch(connection, reference, selector).await? {
                return Ok(self.accept(frame));
            }

            let Some(limits) = fetch_limits(connection, &self.reference_channels).await? else {
                return Ok(Pulled::End(EndReason::NoDataAvailable));
            };
            // Frozen searches have no step to retry with.
            let Some(step) = self.step() else {
                return Ok(Pulled::End(EndReason::NoDataAvailable));
            };
            let Some(current) = reference else {
                return Ok(Pulled::End(EndReason::EndOfData));
            };
            if retries >= self.config.search_retries {
                return Ok(Pulled::End(EndReason::EndOfData));
            }

            let next = current + step;
            if !limits.contains(next) {
                trace!(request = self.id(), next, min = limits.min, max = limits.max, "search left bounds");
                return Ok(Pulled::End(EndReason::EndOfData));
            }
            retries += 1;
            reference = Some(next);
        }
    }

    /// Single fetch; malformed payloads and a repeat of the last frame count as empty.
    async fn fetch(
        &self,
        connection: &mut ManagedConnection,
        reference: Option<f64>,
        selector: Selector,
    ) -> RetrievalResult<Option<Frame>> {
        // Without a reference, backward searches start from the newest data.
        let reference = reference.unwrap_or(match self.direction() {
            Direction::Backward => f64::MAX,
            Direction::Forward | Direction::Frozen => 0.0,
        });
        let fetched = connection
            .fetch_once(&self.reference_channels, reference, 0.0, selector)
            .await?;
        let Some(frame) = fetched else {
            return Ok(None);
        };

        let (frame, rejected) = frame.into_valid();
        for err in &rejected {
            warn!(request = self.id(), %err, "discarding malformed payload");
            self.metrics.record_malformed();
        }

        if frame.is_empty() || self.last_frame.as_ref() == Some(&frame) {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn accept(&mut self, frame: Frame) -> Pulled {
        let Some(range) = frame.time_range() else {
            return Pulled::End(EndReason::EndOfData);
        };

        self.observed = Some(match self.observed {
            Some(observed) => observed.union(&range),
            None => range,
        });
        self.last_range = Some(range);
        self.last_frame = Some(frame.clone());

        let wait = self.pacing.wait(&range, Instant::now());
        Pulled::Frame(PacedFrame { frame, range, wait })
    }

    /// Stop and join the stream readers, if any.
    pub async fn shutdown(&mut self, drain: Duration) {
        if let Some(mut merger) = self.merger.take() {
            merger.shutdown(drain).await;
        }
    }
}

async fn subscribe(
    source: &dyn DataSource,
    channels: &[ChannelRef],
    start: f64,
    selector: Selector,
) -> RetrievalResult<ManagedConnection> {
    let label = channels
        .iter()
        .map(ChannelRef::as_str)
        .collect::<Vec<_>>()
        .join("+");
    let mut connection = ManagedConnection::open(source, label).await?;
    if let Err(e) = connection.subscribe(channels, start, selector).await {
        let _ = connection.close().await;
        return Err(e);
    }
    Ok(connection)
}

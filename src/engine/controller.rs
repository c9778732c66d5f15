use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bounds::{Bounds, BoundsTracker};
use super::pacing::RateEstimator;
use super::request::{EndReason, FrameRequest, PacedFrame, Pulled, RequestId, RequestSpec};
use super::signal::{RequestSlot, StopListener, StopSignal};
use super::state::{PlaybackState, StateEvent};
use crate::config::PlaybackConfig;
use crate::consumer::{DecoderEvent, DecoderEvents, FrameConsumer};
use crate::core::{ChannelRef, PlaybackMode, Regime, RetrievalError, RetrievalResult, TimeRange};
use crate::observability::{PlaybackMetrics, PlaybackMonitor};
use crate::source::{DataSource, ManagedConnection};

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RequestOutcome {
    Completed(EndReason),
    Paused,
    /// A newer request was submitted before this one finished.
    Superseded,
    Failed(RetrievalError),
}

/// Non-fatal retrieval errors end the request cleanly; only fatal ones fail it.
impl From<RetrievalError> for RequestOutcome {
    fn from(error: RetrievalError) -> Self {
        match error {
            RetrievalError::NoDataAvailable => Self::Completed(EndReason::NoDataAvailable),
            e if !e.is_fatal() => {
                debug!(error = %e, "non-fatal retrieval error ends request");
                Self::Completed(EndReason::EndOfData)
            }
            e => Self::Failed(e),
        }
    }
}

/// Lifecycle notifications broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlaybackEvent {
    RequestStarted { id: RequestId, mode: PlaybackMode },
    StateChanged { from: PlaybackState, to: PlaybackState },
    RequestFinished { id: RequestId, outcome: RequestOutcome },
    /// Sent once per failed request, before its `RequestFinished`.
    Failure { id: RequestId, error: RetrievalError },
    Terminated,
}

struct Shared {
    config: Arc<PlaybackConfig>,
    next: RequestSlot<RequestSpec>,
    stop: StopSignal,
    submit_lock: Mutex<()>,
    state: watch::Sender<PlaybackState>,
    bounds: watch::Sender<Option<Bounds>>,
    rate: watch::Sender<f64>,
    position: watch::Sender<Option<f64>>,
    /// Highest request id fully handled by the worker
    settled: watch::Sender<RequestId>,
    events: broadcast::Sender<PlaybackEvent>,
    metrics: Arc<PlaybackMetrics>,
}

impl Shared {
    fn emit(&self, event: PlaybackEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn settle(&self, id: RequestId) {
        self.settled.send_modify(|settled| *settled = (*settled).max(id));
    }
}

/// Top-level playback state machine.
///
/// Commands are accepted from any thread and placed in a single "next
/// request" slot; one worker task takes requests from the slot and runs them
/// to completion, so at most one request retrieves at a time. Submitting
/// stops the running request at once through the stop signal; the worker
/// then tears it down before the new one becomes current.
pub struct PlaybackController {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackController {
    /// Start the retrieval worker. Must be called inside a tokio runtime.
    pub fn spawn(
        config: PlaybackConfig,
        source: Arc<dyn DataSource>,
        consumer: Box<dyn FrameConsumer>,
    ) -> Result<Self> {
        config.validate().context("Invalid playback config")?;
        let runtime = tokio::runtime::Handle::try_current()
            .context("PlaybackController must be spawned inside a tokio runtime")?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            next: RequestSlot::new(),
            stop: StopSignal::new(),
            submit_lock: Mutex::new(()),
            state: watch::channel(PlaybackState::Idle).0,
            bounds: watch::channel(None).0,
            rate: watch::channel(0.0).0,
            position: watch::channel(None).0,
            settled: watch::channel(0).0,
            events,
            metrics: Arc::new(PlaybackMetrics::new()),
        });

        info!(source = source.name(), "playback controller started");
        let worker = Worker::new(shared.clone(), source, consumer);
        let handle = runtime.spawn(worker.run());

        Ok(Self {
            shared,
            worker: Some(handle),
        })
    }

    /// Arm a new request; last writer wins if the worker has not taken the
    /// previous one yet. Never blocks on retrieval.
    pub fn submit(&self, mode: PlaybackMode, target: Option<f64>, tracking: bool) -> RequestId {
        let _guard = self
            .shared
            .submit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let id = self.shared.stop.advance();
        self.shared.next.put(RequestSpec {
            id,
            mode,
            target,
            tracking,
        });
        debug!(id, mode = mode.name(), ?target, tracking, "request submitted");
        id
    }

    pub fn set_position(&self, time: f64, tracking: bool) -> RequestId {
        self.submit(PlaybackMode::SetPosition, Some(time), tracking)
    }

    /// Wait until request `id` has been handled and the controller is idle.
    pub async fn wait_idle(&self, id: RequestId) {
        let mut settled = self.shared.settled.subscribe();
        let _ = settled.wait_for(|settled| *settled >= id).await;
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(PlaybackState::is_idle).await;
    }

    /// Pause and block until `Idle` is observed.
    pub async fn stop(&self) -> RequestId {
        let id = self.submit(PlaybackMode::Pause, None, false);
        self.wait_idle(id).await;
        id
    }

    /// Stop the worker and wait for it to exit. Without a worker this is a no-op.
    pub async fn terminate(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            debug!("terminate without a running worker ignored");
            return Ok(());
        };
        self.submit(PlaybackMode::Terminate, None, false);
        handle
            .await
            .map_err(|e| anyhow!("playback worker panicked: {}", e))
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn query_bounds(&self) -> Option<Bounds> {
        *self.shared.bounds.borrow()
    }

    pub fn query_rate_estimate(&self) -> f64 {
        *self.shared.rate.borrow()
    }

    /// Start time of the last delivered frame; not updated while tracking.
    pub fn position(&self) -> Option<f64> {
        *self.shared.position.borrow()
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<PlaybackMetrics> {
        self.shared.metrics.clone()
    }

    pub fn report(&self) -> String {
        PlaybackMonitor::new(self.shared.metrics.clone()).generate_report()
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.shared.config
    }
}

/// Only sends the terminate request; use `terminate()` to wait for the worker.
impl Drop for PlaybackController {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.submit(PlaybackMode::Terminate, None, false);
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    source: Arc<dyn DataSource>,
    consumer: Box<dyn FrameConsumer>,
    /// Connection for discrete fetches and bounds probes; never streams
    discrete: Option<ManagedConnection>,
    tracker: BoundsTracker,
    rate: RateEstimator,
    reference: Vec<ChannelRef>,
    /// Range of the last frame handed to the consumer, seeds the next request
    last_shown: Option<TimeRange>,
}

impl Worker {
    fn new(shared: Arc<Shared>, source: Arc<dyn DataSource>, consumer: Box<dyn FrameConsumer>) -> Self {
        let rate = RateEstimator::new(shared.config.rate_smoothing);
        let reference = shared.config.reference();
        Self {
            shared,
            source,
            consumer,
            discrete: None,
            tracker: BoundsTracker::new(),
            rate,
            reference,
            last_shown: None,
        }
    }

    async fn run(mut self) {
        loop {
            let spec = self.shared.next.next().await;
            if spec.mode == PlaybackMode::Terminate {
                self.shared.settle(spec.id);
                break;
            }
            self.handle(spec).await;
        }

        if let Some(mut connection) = self.discrete.take() {
            let _ = connection.close().await;
        }
        // Wake every waiter, including those for requests submitted after terminate.
        self.shared.settle(RequestId::MAX);
        self.shared.emit(PlaybackEvent::Terminated);
        info!("playback worker exited");
    }

    /// Run one request to its outcome. A failed bounds refresh ends the
    /// request before a decoder is realized, so the consumer sees nothing from it,
    /// not even an end-of-stream.
    async fn handle(&mut self, spec: RequestSpec) {
        let stop = self.shared.stop.listener(spec.id);
        if stop.is_stopped() {
            debug!(id = spec.id, "request superseded before start");
            self.shared.settle(spec.id);
            return;
        }

        info!(id = spec.id, mode = spec.mode.name(), target = ?spec.target, "request started");
        self.shared.metrics.record_request_started();
        self.shared.emit(PlaybackEvent::RequestStarted {
            id: spec.id,
            mode: spec.mode,
        });

        let outcome = match self.refresh_bounds(&spec).await {
            Err(e) => RequestOutcome::from(e),
            Ok(()) if spec.mode == PlaybackMode::Pause => RequestOutcome::Paused,
            Ok(()) => self.play(&spec, &stop).await,
        };

        self.finish(spec.id, outcome);
    }

    async fn refresh_bounds(&mut self, spec: &RequestSpec) -> RetrievalResult<()> {
        // A dragged slider must not wait on the source.
        if spec.tracking {
            return Ok(());
        }
        let mut connection = self.take_discrete().await?;
        let refreshed = self.tracker.refresh(&mut connection, &self.reference).await;
        self.restore_discrete(connection, refreshed.as_ref().err()).await;

        let bounds = refreshed?;
        self.shared.bounds.send_replace(Some(bounds));
        Ok(())
    }

    async fn take_discrete(&mut self) -> RetrievalResult<ManagedConnection> {
        match self.discrete.take() {
            Some(connection) => Ok(connection),
            None => ManagedConnection::open(self.source.as_ref(), "discrete").await,
        }
    }

    /// Keep the discrete connection unless the transport failed; it is then
    /// reopened by the next request.
    async fn restore_discrete(&mut self, mut connection: ManagedConnection, error: Option<&RetrievalError>) {
        if let Some(RetrievalError::CommunicationFailure(_)) = error {
            debug!("dropping discrete connection after communication failure");
            let _ = connection.close().await;
        } else {
            self.discrete = Some(connection);
        }
    }

    async fn play(&mut self, spec: &RequestSpec, stop: &StopListener) -> RequestOutcome {
        let mut connection = match self.take_discrete().await {
            Ok(connection) => connection,
            Err(e) => return RequestOutcome::Failed(e),
        };

        let mut request = FrameRequest::new(
            spec.clone(),
            self.last_shown,
            self.shared.config.clone(),
            self.shared.metrics.clone(),
        );
        let (events, mut decoder) = DecoderEvents::channel();
        self.rate.restart();

        let outcome = self
            .drive(&mut request, &mut connection, stop, events, &mut decoder)
            .await;

        let drain = self.shared.config.drain_timeout();
        request.shutdown(drain).await;
        let error = match &outcome {
            RequestOutcome::Failed(e) => Some(e),
            _ => None,
        };
        self.restore_discrete(connection, error).await;

        if outcome == RequestOutcome::Superseded {
            // The decoder is torn down without seeing anything more from this request.
            if let Err(e) = self.consumer.stop().await {
                warn!(id = spec.id, "consumer stop failed: {}", e);
            }
        } else {
            if let Err(e) = self.consumer.deliver(None).await {
                warn!(id = spec.id, "end of stream not delivered: {}", e);
            }
            if let Err(e) = self.consumer.stop().await {
                warn!(id = spec.id, "consumer stop failed: {}", e);
            }
            self.await_decoder_stopped(&mut decoder, drain).await;
        }
        self.force_idle();

        outcome
    }

    async fn drive(
        &mut self,
        request: &mut FrameRequest,
        connection: &mut ManagedConnection,
        stop: &StopListener,
        events: DecoderEvents,
        decoder: &mut mpsc::Receiver<DecoderEvent>,
    ) -> RequestOutcome {
        if let Err(e) = self.transition(StateEvent::Realize) {
            return RequestOutcome::Failed(e);
        }
        if let Err(e) = self.consumer.realize(events, request.mode().audible()).await {
            return RequestOutcome::Failed(RetrievalError::ConsumerFailure(e.to_string()));
        }
        if let Err(e) = request.arm(self.source.as_ref(), stop.clone()).await {
            return RequestOutcome::Failed(e);
        }

        loop {
            if stop.is_stopped() {
                return RequestOutcome::Superseded;
            }

            while let Ok(event) = decoder.try_recv() {
                if let Err(e) = self.on_decoder_event(event).await {
                    return RequestOutcome::Failed(e);
                }
            }

            let state = self.current_state();
            if !state.accepts_frames() {
                let startup = self.shared.config.startup_timeout();
                let event = tokio::select! {
                    biased;
                    _ = stop.stopped() => return RequestOutcome::Superseded,
                    event = tokio::time::timeout(startup, decoder.recv()) => event,
                };
                let result = match event {
                    Ok(Some(event)) => self.on_decoder_event(event).await,
                    Ok(None) => Err(RetrievalError::ConsumerFailure(
                        "decoder event channel closed".to_string(),
                    )),
                    Err(_) => Err(RetrievalError::DecoderStalled {
                        state: state.name().to_string(),
                    }),
                };
                if let Err(e) = result {
                    return RequestOutcome::Failed(e);
                }
                continue;
            }

            let started = self.shared.metrics.start_pull();
            let pulled = match request.regime() {
                Regime::Continuous => tokio::select! {
                    biased;
                    _ = stop.stopped() => return RequestOutcome::Superseded,
                    pulled = request.pull(&mut *connection) => pulled,
                },
                Regime::Discrete => {
                    // Fetches run to completion; a late result is discarded.
                    let pulled = request.pull(&mut *connection).await;
                    if stop.is_stopped() {
                        if let Ok(Pulled::Frame(_)) = pulled {
                            self.shared.metrics.record_stale();
                        }
                        return RequestOutcome::Superseded;
                    }
                    pulled
                }
            };
            self.shared.metrics.finish_pull(started);

            let paced = match pulled {
                Ok(Pulled::Frame(paced)) => paced,
                Ok(Pulled::End(reason)) => return RequestOutcome::Completed(reason),
                Err(e) => return RequestOutcome::from(e),
            };

            if !paced.wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => {
                        self.shared.metrics.record_stale();
                        return RequestOutcome::Superseded;
                    }
                    _ = tokio::time::sleep(paced.wait) => {}
                }
            }

            // The stop may have landed after the pull resolved.
            if stop.is_stopped() {
                self.shared.metrics.record_stale();
                return RequestOutcome::Superseded;
            }
            let delivered = tokio::select! {
                biased;
                _ = stop.stopped() => {
                    self.shared.metrics.record_stale();
                    return RequestOutcome::Superseded;
                }
                delivered = self.consumer.deliver(Some(paced.frame.clone())) => delivered,
            };
            if let Err(e) = delivered {
                return RequestOutcome::Failed(RetrievalError::ConsumerFailure(e.to_string()));
            }
            self.on_delivered(request, &paced);
        }
    }

    async fn on_decoder_event(&mut self, event: DecoderEvent) -> RetrievalResult<()> {
        if event == DecoderEvent::Stopped {
            return Err(RetrievalError::ConsumerFailure(
                "decoder stopped during playback".to_string(),
            ));
        }
        if let DecoderEvent::FormatDetermined(metadata) = &event {
            debug!(channels = metadata.len(), "decoder format determined");
        }

        // Out-of-order decoder notifications are rejected and counted, not fatal.
        if self.transition(event.state_event()).is_err() {
            return Ok(());
        }
        if event == DecoderEvent::PrefetchComplete {
            self.consumer
                .start()
                .await
                .map_err(|e| RetrievalError::ConsumerFailure(e.to_string()))?;
        }
        Ok(())
    }

    fn on_delivered(&mut self, request: &FrameRequest, paced: &PacedFrame) {
        self.shared.metrics.record_frame_delivered();

        if paced.frame.contains_any(&self.reference) {
            let rate = self.rate.observe(Instant::now());
            self.shared.rate.send_replace(rate);
        }

        let bounds = self.tracker.observe(&paced.range);
        self.shared.bounds.send_replace(Some(bounds));

        if !request.is_tracking() {
            self.shared.position.send_replace(Some(paced.range.start));
        }
        self.last_shown = Some(paced.range);
    }

    async fn await_decoder_stopped(&mut self, decoder: &mut mpsc::Receiver<DecoderEvent>, drain: Duration) {
        let deadline = Instant::now() + drain;
        loop {
            match tokio::time::timeout_at(deadline, decoder.recv()).await {
                Ok(Some(DecoderEvent::Stopped)) => return,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    debug!("decoder did not confirm stop, forcing idle");
                    return;
                }
            }
        }
    }

    fn current_state(&self) -> PlaybackState {
        *self.shared.state.borrow()
    }

    fn transition(&self, event: StateEvent) -> RetrievalResult<PlaybackState> {
        let current = self.current_state();
        match current.on_event(event) {
            Ok(next) => {
                if next != current {
                    debug!(from = current.name(), to = next.name(), "state changed");
                    self.shared.state.send_replace(next);
                    self.shared.emit(PlaybackEvent::StateChanged { from: current, to: next });
                }
                Ok(next)
            }
            Err(e) => {
                warn!(state = current.name(), event = event.name(), "rejected transition");
                self.shared.metrics.record_rejected_transition();
                Err(e)
            }
        }
    }

    fn force_idle(&self) {
        let _ = self.transition(StateEvent::Stopped);
    }

    fn finish(&self, id: RequestId, outcome: RequestOutcome) {
        match &outcome {
            RequestOutcome::Failed(error) => {
                warn!(id, %error, "request failed");
                self.shared.metrics.record_request_failed();
                self.shared.emit(PlaybackEvent::Failure {
                    id,
                    error: error.clone(),
                });
            }
            _ => {
                info!(id, outcome = ?outcome, "request finished");
                self.shared.metrics.record_request_finished();
            }
        }
        self.shared.emit(PlaybackEvent::RequestFinished { id, outcome });
        self.shared.settle(id);
    }
}

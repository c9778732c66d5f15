use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::signal::StopListener;
use crate::core::{Frame, RetrievalError, RetrievalResult};
use crate::observability::PlaybackMetrics;
use crate::source::{ManagedConnection, StreamRead};

/// What a subscription reader hands to its merger.
#[derive(Debug)]
pub enum SideEvent {
    Frame(Frame),
    Ended,
    Failed(RetrievalError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Frame(Frame),
    /// Every stream ended.
    Ended,
}

/// Turns one or more live streams into a single sequence of frames.
#[async_trait]
pub trait FrameMerger: Send + Sync {
    /// Next frame to deliver. Cancel-safe: frames already received are kept
    /// for the following call.
    async fn next_frame(&mut self) -> RetrievalResult<MergeOutcome>;

    /// Stop the readers and wait up to `drain` for them to close their connections.
    async fn shutdown(&mut self, drain: Duration);
}

/// Spawn a reader task that owns `connection` and forwards every read into a
/// single-slot mailbox. The task exits on stream end, on failure, when the
/// request is stopped or when the merger goes away, closing the connection.
/// Every exit drops the sender and wakes the merger, which then sees the side
/// as ended.
pub fn spawn_reader(
    mut connection: ManagedConnection,
    poll: Duration,
    stop: StopListener,
    tx: mpsc::Sender<SideEvent>,
    notify: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let read = tokio::select! {
                _ = stop.stopped() => break,
                _ = tx.closed() => break,
                read = connection.read(poll) => read,
            };

            let event = match read {
                Ok(StreamRead::Frame(frame)) => SideEvent::Frame(frame),
                Ok(StreamRead::TimedOut) => continue,
                Ok(StreamRead::Ended) => SideEvent::Ended,
                Err(e) => SideEvent::Failed(e),
            };
            let last = !matches!(event, SideEvent::Frame(_));

            let sent = tokio::select! {
                _ = stop.stopped() => break,
                sent = tx.send(event) => sent,
            };
            if sent.is_err() {
                break;
            }
            notify.notify_one();

            if last {
                break;
            }
        }

        drop(tx);
        notify.notify_one();

        if let Err(e) = connection.close().await {
            debug!(connection = connection.label(), %e, "close after read loop failed");
        }
        trace!(connection = connection.label(), "reader exited");
    })
}

/// Drop malformed payloads, counting them. `None` if nothing usable remains.
fn usable(frame: Frame, metrics: &PlaybackMetrics) -> Option<Frame> {
    let (frame, rejected) = frame.into_valid();
    for err in &rejected {
        warn!(%err, "discarding malformed payload");
        metrics.record_malformed();
    }
    if frame.is_empty() {
        None
    } else {
        Some(frame)
    }
}

async fn join_readers(handles: &mut Vec<JoinHandle<()>>, drain: Duration) {
    for mut handle in handles.drain(..) {
        if tokio::time::timeout(drain, &mut handle).await.is_err() {
            warn!("reader did not drain in time, aborting");
            handle.abort();
        }
    }
}

struct Side {
    rx: mpsc::Receiver<SideEvent>,
    held: Option<(f64, Frame)>,
    last_emitted: Option<f64>,
    delta: Option<f64>,
    ended: bool,
}

impl Side {
    fn new(rx: mpsc::Receiver<SideEvent>) -> Self {
        Self {
            rx,
            held: None,
            last_emitted: None,
            delta: None,
            ended: false,
        }
    }

    fn is_waiting(&self) -> bool {
        self.held.is_none() && !self.ended
    }

    /// Advisory timestamp of this side's next frame; never fabricates data.
    fn predicted(&self) -> Option<f64> {
        Some(self.last_emitted? + self.delta?)
    }

    fn accept(&mut self, event: Option<SideEvent>, metrics: &PlaybackMetrics) -> RetrievalResult<()> {
        match event {
            Some(SideEvent::Frame(frame)) => {
                if let Some(frame) = usable(frame, metrics) {
                    if let Some(start) = frame.start() {
                        self.held = Some((start, frame));
                    }
                }
            }
            Some(SideEvent::Ended) | None => self.ended = true,
            Some(SideEvent::Failed(e)) => return Err(e),
        }
        Ok(())
    }

    fn try_fill(&mut self, metrics: &PlaybackMetrics) -> RetrievalResult<()> {
        if !self.is_waiting() {
            return Ok(());
        }
        match self.rx.try_recv() {
            Ok(event) => self.accept(Some(event), metrics),
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => self.accept(None, metrics),
        }
    }

    fn take(&mut self) -> Option<(f64, Frame)> {
        let (at, frame) = self.held.take()?;
        if let Some(previous) = self.last_emitted {
            let delta = at - previous;
            if delta > 0.0 {
                self.delta = Some(delta);
            }
        }
        self.last_emitted = Some(at);
        Some((at, frame))
    }
}

/// Time-ordered merge of N independently delivered streams.
///
/// Each side has its own reader task and connection. The merger holds at
/// most one frame per side, probes a lagging side for a bounded time when it
/// could still deliver something earlier than what is held, then releases the
/// earliest held frame (lowest side index on ties). Output timestamps never
/// decrease: a frame arriving after a later one was already released is dropped.
pub struct ChannelSynchronizer {
    sides: Vec<Side>,
    notify: Arc<Notify>,
    probe: Duration,
    watermark: Option<f64>,
    metrics: Arc<PlaybackMetrics>,
    handles: Vec<JoinHandle<()>>,
}

impl ChannelSynchronizer {
    pub fn spawn(
        connections: Vec<ManagedConnection>,
        poll: Duration,
        probe: Duration,
        stop: StopListener,
        metrics: Arc<PlaybackMetrics>,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let mut sides = Vec::with_capacity(connections.len());
        let mut handles = Vec::with_capacity(connections.len());

        for connection in connections {
            let (tx, rx) = mpsc::channel(1);
            handles.push(spawn_reader(connection, poll, stop.clone(), tx, notify.clone()));
            sides.push(Side::new(rx));
        }

        debug!(sides = sides.len(), "channel synchronizer started");
        Self {
            sides,
            notify,
            probe,
            watermark: None,
            metrics,
            handles,
        }
    }

    fn earliest_held(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, side) in self.sides.iter().enumerate() {
            if let Some((at, _)) = &side.held {
                if best.map_or(true, |(_, b)| *at < b) {
                    best = Some((idx, *at));
                }
            }
        }
        best
    }

    /// Give lagging sides a bounded chance to deliver something earlier than `earliest`.
    async fn probe_lagging(&mut self, earliest: f64) -> RetrievalResult<()> {
        for side in self.sides.iter_mut().filter(|s| s.is_waiting()) {
            if side.predicted().map_or(false, |next| next > earliest) {
                continue;
            }
            if let Ok(event) = tokio::time::timeout(self.probe, side.rx.recv()).await {
                side.accept(event, &self.metrics)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FrameMerger for ChannelSynchronizer {
    async fn next_frame(&mut self) -> RetrievalResult<MergeOutcome> {
        loop {
            for side in &mut self.sides {
                side.try_fill(&self.metrics)?;
            }

            let Some((_, earliest)) = self.earliest_held() else {
                if self.sides.iter().all(|s| s.ended) {
                    return Ok(MergeOutcome::Ended);
                }
                self.notify.notified().await;
                continue;
            };

            self.probe_lagging(earliest).await?;

            let Some((idx, _)) = self.earliest_held() else {
                continue;
            };
            let Some((at, frame)) = self.sides[idx].take() else {
                continue;
            };

            if self.watermark.map_or(false, |mark| at < mark) {
                debug!(side = idx, at, "dropping out-of-order frame");
                self.metrics.record_late_drop();
                continue;
            }
            self.watermark = Some(at);
            trace!(side = idx, at, "merged frame");
            return Ok(MergeOutcome::Frame(frame));
        }
    }

    async fn shutdown(&mut self, drain: Duration) {
        for side in &mut self.sides {
            side.rx.close();
        }
        join_readers(&mut self.handles, drain).await;
    }
}

/// Frames from a single stream, in arrival order.
pub struct ArrivalOrderMerger {
    rx: mpsc::Receiver<SideEvent>,
    metrics: Arc<PlaybackMetrics>,
    handles: Vec<JoinHandle<()>>,
    ended: bool,
}

impl ArrivalOrderMerger {
    pub fn spawn(
        connection: ManagedConnection,
        poll: Duration,
        stop: StopListener,
        metrics: Arc<PlaybackMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn_reader(connection, poll, stop, tx, Arc::new(Notify::new()));
        Self {
            rx,
            metrics,
            handles: vec![handle],
            ended: false,
        }
    }
}

#[async_trait]
impl FrameMerger for ArrivalOrderMerger {
    async fn next_frame(&mut self) -> RetrievalResult<MergeOutcome> {
        while !self.ended {
            match self.rx.recv().await {
                Some(SideEvent::Frame(frame)) => {
                    if let Some(frame) = usable(frame, &self.metrics) {
                        return Ok(MergeOutcome::Frame(frame));
                    }
                }
                Some(SideEvent::Failed(e)) => return Err(e),
                Some(SideEvent::Ended) | None => self.ended = true,
            }
        }
        Ok(MergeOutcome::Ended)
    }

    async fn shutdown(&mut self, drain: Duration) {
        self.rx.close();
        join_readers(&mut self.handles, drain).await;
    }
}

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Connection, DataSource, StreamRead};
use crate::core::{ChannelPayload, ChannelRef, Frame, RetrievalError, RetrievalResult, Selector};

/// Depth of each monitor's live feed; older data is dropped when a monitor lags.
const MONITOR_DEPTH: usize = 64;

/// Poll interval for monitor reads while the live feed is empty.
const MONITOR_POLL: Duration = Duration::from_millis(5);

struct LiveFeed {
    channels: Vec<ChannelRef>,
    tx: Sender<ChannelPayload>,
}

struct Store {
    tracks: RwLock<BTreeMap<ChannelRef, Vec<ChannelPayload>>>,
    appended: Notify,
    feeds: Mutex<Vec<LiveFeed>>,
    sealed: AtomicBool,
    offline: AtomicBool,
    connections_opened: AtomicU64,
}

/// In-memory append-only archive of time-stamped channel payloads.
///
/// Behaves like a remote data server: archived data is served through
/// request/response fetches and time-based subscriptions, newly appended data
/// is pushed to monitors. Used by the tests and the demo binary.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    store: Arc<Store>,
}

pub struct MemorySourceBuilder {
    name: String,
    tracks: BTreeMap<ChannelRef, Vec<ChannelPayload>>,
    sealed: bool,
}

impl MemorySourceBuilder {
    /// Add `count` evenly spaced payloads of `period` seconds starting at `start`.
    pub fn track(
        mut self,
        channel: impl Into<ChannelRef>,
        mime: &str,
        start: f64,
        period: f64,
        count: usize,
    ) -> Self {
        let channel = channel.into();
        for idx in 0..count {
            let at = start + idx as f64 * period;
            let payload = ChannelPayload::new(channel.clone(), at, period, at.to_le_bytes().to_vec())
                .with_mime(mime);
            self = self.payload(payload);
        }
        self
    }

    /// Add a single payload at an arbitrary time.
    pub fn payload(mut self, payload: ChannelPayload) -> Self {
        let track = self.tracks.entry(payload.channel.clone()).or_default();
        insert_sorted(track, payload);
        self
    }

    /// No further data will be appended; subscriptions end once drained.
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn build(self) -> MemorySource {
        MemorySource {
            name: self.name,
            store: Arc::new(Store {
                tracks: RwLock::new(self.tracks),
                appended: Notify::new(),
                feeds: Mutex::new(Vec::new()),
                sealed: AtomicBool::new(self.sealed),
                offline: AtomicBool::new(false),
                connections_opened: AtomicU64::new(0),
            }),
        }
    }
}

fn insert_sorted(track: &mut Vec<ChannelPayload>, payload: ChannelPayload) {
    let at = track.partition_point(|p| p.start <= payload.start);
    track.insert(at, payload);
}

/// Index of the first payload strictly after `reference`. A payload starting
/// exactly at `reference` only qualifies if it has a duration, so that
/// stepping from a frame's end lands on the adjacent frame.
fn next_index(track: &[ChannelPayload], reference: f64) -> usize {
    track.partition_point(|p| p.start < reference || (p.start == reference && p.duration <= 0.0))
}

fn find(track: &[ChannelPayload], reference: f64, duration: f64, selector: Selector) -> Vec<ChannelPayload> {
    let picked = match selector {
        Selector::Oldest => track.first(),
        Selector::Newest => track.last(),
        Selector::Next => track.get(next_index(track, reference)),
        Selector::Previous => {
            let idx = track.partition_point(|p| p.start < reference);
            idx.checked_sub(1).and_then(|i| track.get(i))
        }
        Selector::Absolute if duration > 0.0 => {
            return track
                .iter()
                .filter(|p| p.start >= reference && p.start < reference + duration)
                .cloned()
                .collect();
        }
        Selector::Absolute => {
            let idx = track.partition_point(|p| p.start <= reference);
            idx.checked_sub(1).and_then(|i| track.get(i))
        }
    };
    picked.cloned().into_iter().collect()
}

impl MemorySource {
    pub fn builder(name: impl Into<String>) -> MemorySourceBuilder {
        MemorySourceBuilder {
            name: name.into(),
            tracks: BTreeMap::new(),
            sealed: false,
        }
    }

    /// Append live data and push it to every monitor following its channel.
    pub async fn append(&self, payload: ChannelPayload) {
        {
            let mut tracks = self.store.tracks.write().await;
            insert_sorted(tracks.entry(payload.channel.clone()).or_default(), payload.clone());
        }

        let mut feeds = self.store.feeds.lock().await;
        feeds.retain(|feed| {
            if !feed.channels.contains(&payload.channel) {
                return true;
            }
            match feed.tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!(channel = %payload.channel, "monitor lagging, dropped live payload");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        drop(feeds);

        self.store.appended.notify_waiters();
    }

    /// Mark the archive complete; drained subscriptions report end of stream.
    pub fn seal(&self) {
        self.store.sealed.store(true, Ordering::SeqCst);
        self.store.appended.notify_waiters();
    }

    /// Simulate a transport outage: every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.store.offline.store(offline, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> u64 {
        self.store.connections_opened.load(Ordering::SeqCst)
    }

    pub async fn payload_count(&self, channel: &ChannelRef) -> usize {
        self.store
            .tracks
            .read()
            .await
            .get(channel)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_connection(&self) -> RetrievalResult<Box<dyn Connection>> {
        if self.store.offline.load(Ordering::SeqCst) {
            return Err(RetrievalError::communication(format!(
                "{} is unreachable",
                self.name
            )));
        }
        self.store.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
            stream: Stream::Idle,
        }))
    }
}

enum Stream {
    Idle,
    Subscription {
        channels: Vec<ChannelRef>,
        cursors: Vec<usize>,
    },
    Monitor(Receiver<ChannelPayload>),
    Closed,
}

struct MemoryConnection {
    store: Arc<Store>,
    stream: Stream,
}

impl MemoryConnection {
    fn check_online(&self) -> RetrievalResult<()> {
        if self.store.offline.load(Ordering::SeqCst) {
            Err(RetrievalError::communication("connection reset"))
        } else if matches!(self.stream, Stream::Closed) {
            Err(RetrievalError::communication("connection closed"))
        } else {
            Ok(())
        }
    }

    /// Earliest unread payload across the subscribed channels.
    async fn next_subscribed(&mut self) -> Option<ChannelPayload> {
        let Stream::Subscription { channels, cursors } = &mut self.stream else {
            return None;
        };
        let tracks = self.store.tracks.read().await;

        let mut best: Option<(usize, &ChannelPayload)> = None;
        for (idx, channel) in channels.iter().enumerate() {
            let candidate = tracks.get(channel).and_then(|t| t.get(cursors[idx]));
            if let Some(payload) = candidate {
                if best.map_or(true, |(_, b)| payload.start < b.start) {
                    best = Some((idx, payload));
                }
            }
        }

        best.map(|(idx, payload)| {
            cursors[idx] += 1;
            payload.clone()
        })
    }

    async fn read_subscription(&mut self, timeout: Duration) -> RetrievalResult<StreamRead> {
        let deadline = Instant::now() + timeout;
        let store = self.store.clone();

        loop {
            self.check_online()?;

            let appended = store.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(payload) = self.next_subscribed().await {
                return Ok(StreamRead::Frame(Frame::single(payload)));
            }
            if store.sealed.load(Ordering::SeqCst) {
                return Ok(StreamRead::Ended);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(StreamRead::TimedOut);
            }
        }
    }

    async fn read_monitor(&mut self, timeout: Duration) -> RetrievalResult<StreamRead> {
        let deadline = Instant::now() + timeout;

        loop {
            self.check_online()?;
            let Stream::Monitor(rx) = &self.stream else {
                return Ok(StreamRead::Ended);
            };

            match rx.try_recv() {
                Ok(payload) => return Ok(StreamRead::Frame(Frame::single(payload))),
                Err(TryRecvError::Disconnected) => return Ok(StreamRead::Ended),
                Err(TryRecvError::Empty) => {
                    if self.store.sealed.load(Ordering::SeqCst) {
                        return Ok(StreamRead::Ended);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(StreamRead::TimedOut);
                    }
                    tokio::time::sleep(MONITOR_POLL.min(deadline - now)).await;
                }
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn fetch_once(
        &mut self,
        channels: &[ChannelRef],
        reference: f64,
        duration: f64,
        selector: Selector,
    ) -> RetrievalResult<Option<Frame>> {
        self.check_online()?;
        let tracks = self.store.tracks.read().await;

        let mut frame = Frame::new();
        for channel in channels {
            if let Some(track) = tracks.get(channel) {
                for payload in find(track, reference, duration, selector) {
                    frame.push(payload);
                }
            }
        }

        Ok(if frame.is_empty() { None } else { Some(frame) })
    }

    async fn subscribe(
        &mut self,
        channels: &[ChannelRef],
        start: f64,
        selector: Selector,
    ) -> RetrievalResult<()> {
        self.check_online()?;
        let tracks = self.store.tracks.read().await;

        let cursors = channels
            .iter()
            .map(|channel| {
                let track = tracks.get(channel).map(Vec::as_slice).unwrap_or(&[]);
                match selector {
                    Selector::Oldest => 0,
                    Selector::Newest => track.len().saturating_sub(1),
                    Selector::Next => next_index(track, start),
                    Selector::Previous => track
                        .partition_point(|p| p.start < start)
                        .saturating_sub(1),
                    Selector::Absolute => track.partition_point(|p| p.start < start),
                }
            })
            .collect();

        self.stream = Stream::Subscription {
            channels: channels.to_vec(),
            cursors,
        };
        Ok(())
    }

    async fn monitor(&mut self, channels: &[ChannelRef]) -> RetrievalResult<()> {
        self.check_online()?;
        let (tx, rx) = crossbeam_channel::bounded(MONITOR_DEPTH);
        self.store.feeds.lock().await.push(LiveFeed {
            channels: channels.to_vec(),
            tx,
        });
        self.stream = Stream::Monitor(rx);
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> RetrievalResult<StreamRead> {
        match self.stream {
            Stream::Subscription { .. } => self.read_subscription(timeout).await,
            Stream::Monitor(_) => self.read_monitor(timeout).await,
            Stream::Idle | Stream::Closed => {
                Err(RetrievalError::communication("no active stream on connection"))
            }
        }
    }

    async fn close(&mut self) -> RetrievalResult<()> {
        // Dropping a monitor receiver disconnects its feed; `append` prunes it.
        self.stream = Stream::Closed;
        debug!("memory connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(starts: &[f64]) -> Vec<ChannelPayload> {
        starts
            .iter()
            .map(|s| ChannelPayload::new("v", *s, 1.0, vec![]))
            .collect()
    }

    #[test]
    fn test_next_lands_on_adjacent_frame() {
        let t = track(&[100.0, 101.0, 102.0]);
        let found = find(&t, 101.0, 0.0, Selector::Next);
        assert_eq!(found[0].start, 101.0);
        let found = find(&t, 100.5, 0.0, Selector::Next);
        assert_eq!(found[0].start, 101.0);
    }

    #[test]
    fn test_previous_is_strictly_before() {
        let t = track(&[100.0, 101.0, 102.0]);
        assert_eq!(find(&t, 101.0, 0.0, Selector::Previous)[0].start, 100.0);
        assert!(find(&t, 100.0, 0.0, Selector::Previous).is_empty());
    }

    #[test]
    fn test_absolute_returns_frame_at_or_before() {
        let t = track(&[100.0, 101.0, 102.0]);
        assert_eq!(find(&t, 101.7, 0.0, Selector::Absolute)[0].start, 101.0);
        assert!(find(&t, 99.0, 0.0, Selector::Absolute).is_empty());
        assert_eq!(find(&t, 100.0, 2.0, Selector::Absolute).len(), 2);
    }

    #[test]
    fn test_zero_duration_point_is_not_repeated_by_next() {
        let t = vec![
            ChannelPayload::new("v", 5.0, 0.0, vec![]),
            ChannelPayload::new("v", 6.0, 0.0, vec![]),
        ];
        assert_eq!(find(&t, 5.0, 0.0, Selector::Next)[0].start, 6.0);
    }
}

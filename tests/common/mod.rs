#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trackplay::consumer::AutoAck;
use trackplay::core::{ChannelPayload, ChannelRef, Frame, RetrievalResult, Selector};
use trackplay::source::{Connection, ManagedConnection, StreamRead};
use trackplay::{DecoderEvents, FrameConsumer};

pub fn frame_at(channel: &str, start: f64, duration: f64) -> Frame {
    Frame::single(ChannelPayload::new(channel, start, duration, vec![0u8; 4]))
}

#[derive(Debug, Default)]
struct Log {
    deliveries: Vec<Option<Frame>>,
    realized: Vec<bool>,
    starts: usize,
    stops: usize,
}

/// Shared view of everything a `RecordingConsumer` saw.
#[derive(Clone, Default)]
pub struct Recording {
    log: Arc<Mutex<Log>>,
}

impl Recording {
    pub fn frames(&self) -> Vec<Frame> {
        self.log
            .lock()
            .unwrap()
            .deliveries
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn frame_count(&self) -> usize {
        self.frames().len()
    }

    pub fn starts(&self) -> Vec<f64> {
        self.frames().iter().filter_map(Frame::start).collect()
    }

    /// Number of end-of-stream deliveries.
    pub fn ends(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .deliveries
            .iter()
            .filter(|d| d.is_none())
            .count()
    }

    pub fn deliveries(&self) -> usize {
        self.log.lock().unwrap().deliveries.len()
    }

    pub fn realized(&self) -> Vec<bool> {
        self.log.lock().unwrap().realized.clone()
    }

    pub fn stops(&self) -> usize {
        self.log.lock().unwrap().stops
    }

    pub async fn wait_for_frames(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.frame_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.frame_count() >= count
    }
}

/// Decoder stand-in that records every call and acknowledges the handshake at once.
pub struct RecordingConsumer {
    ack: AutoAck,
    recording: Recording,
}

impl RecordingConsumer {
    pub fn new() -> (Self, Recording) {
        let recording = Recording::default();
        let consumer = Self {
            ack: AutoAck::default(),
            recording: recording.clone(),
        };
        (consumer, recording)
    }
}

#[async_trait]
impl FrameConsumer for RecordingConsumer {
    async fn realize(&mut self, events: DecoderEvents, audible: bool) -> Result<()> {
        self.recording.log.lock().unwrap().realized.push(audible);
        self.ack.realize(events);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.recording.log.lock().unwrap().starts += 1;
        self.ack.start();
        Ok(())
    }

    async fn deliver(&mut self, frame: Option<Frame>) -> Result<()> {
        if let Some(frame) = &frame {
            self.ack.frame(frame);
        }
        self.recording.log.lock().unwrap().deliveries.push(frame);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.recording.log.lock().unwrap().stops += 1;
        self.ack.stop();
        Ok(())
    }
}

/// Stream connection replaying a fixed script of reads, each after a delay.
/// Reports `Ended` once the script runs out.
pub struct ScriptedConnection {
    script: VecDeque<(Duration, RetrievalResult<StreamRead>)>,
}

impl ScriptedConnection {
    pub fn new(script: Vec<(Duration, RetrievalResult<StreamRead>)>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// One frame per entry of `starts`, `gap` apart in wall-clock time.
    pub fn frames(channel: &str, starts: &[f64], gap: Duration) -> Self {
        Self::new(
            starts
                .iter()
                .map(|s| (gap, Ok(StreamRead::Frame(frame_at(channel, *s, 0.5)))))
                .collect(),
        )
    }

    /// Wrap in a managed connection that is already subscribed.
    pub async fn subscribed(self, label: &str) -> ManagedConnection {
        let mut connection = ManagedConnection::new(Box::new(self), label);
        connection
            .subscribe(&[ChannelRef::from(label)], 0.0, Selector::Oldest)
            .await
            .unwrap();
        connection
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn fetch_once(
        &mut self,
        _channels: &[ChannelRef],
        _reference: f64,
        _duration: f64,
        _selector: Selector,
    ) -> RetrievalResult<Option<Frame>> {
        Ok(None)
    }

    async fn subscribe(
        &mut self,
        _channels: &[ChannelRef],
        _start: f64,
        _selector: Selector,
    ) -> RetrievalResult<()> {
        Ok(())
    }

    async fn monitor(&mut self, _channels: &[ChannelRef]) -> RetrievalResult<()> {
        Ok(())
    }

    async fn read(&mut self, _timeout: Duration) -> RetrievalResult<StreamRead> {
        match self.script.pop_front() {
            Some((delay, read)) => {
                tokio::time::sleep(delay).await;
                read
            }
            None => Ok(StreamRead::Ended),
        }
    }

    async fn close(&mut self) -> RetrievalResult<()> {
        Ok(())
    }
}

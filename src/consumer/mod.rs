pub mod logging;

pub use logging::LoggingConsumer;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::{ChannelMetadata, Frame};
use crate::engine::state::StateEvent;

/// Pending decoder notifications per request; the handshake never needs more.
const DECODER_EVENT_DEPTH: usize = 16;

/// Notifications from the external decoder back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    FormatDetermined(Vec<ChannelMetadata>),
    PrefetchComplete,
    Started,
    Stopped,
}

impl DecoderEvent {
    pub fn state_event(&self) -> StateEvent {
        match self {
            Self::FormatDetermined(_) => StateEvent::FormatDetermined,
            Self::PrefetchComplete => StateEvent::PrefetchComplete,
            Self::Started => StateEvent::Started,
            Self::Stopped => StateEvent::Stopped,
        }
    }
}

/// Handle a decoder uses to report its progress. Handed out once per request
/// on `realize`; events sent through the handle of a finished request are ignored.
#[derive(Debug, Clone)]
pub struct DecoderEvents {
    tx: mpsc::Sender<DecoderEvent>,
}

impl DecoderEvents {
    pub fn channel() -> (Self, mpsc::Receiver<DecoderEvent>) {
        let (tx, rx) = mpsc::channel(DECODER_EVENT_DEPTH);
        (Self { tx }, rx)
    }

    fn emit(&self, event: DecoderEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("decoder event not delivered: {}", e);
        }
    }

    pub fn format_determined(&self, metadata: Vec<ChannelMetadata>) {
        self.emit(DecoderEvent::FormatDetermined(metadata));
    }

    pub fn prefetch_complete(&self) {
        self.emit(DecoderEvent::PrefetchComplete);
    }

    pub fn started(&self) {
        self.emit(DecoderEvent::Started);
    }

    pub fn stopped(&self) {
        self.emit(DecoderEvent::Stopped);
    }
}

/// External media decoder/renderer fed by the playback controller.
#[async_trait]
pub trait FrameConsumer: Send {
    /// Build a decoder for a new request. `audible` is false for modes that
    /// should play without sound.
    async fn realize(&mut self, events: DecoderEvents, audible: bool) -> Result<()>;

    /// Issued once the decoder reported prefetch completion.
    async fn start(&mut self) -> Result<()>;

    /// One frame per call; `None` marks the end of the current request's stream.
    async fn deliver(&mut self, frame: Option<Frame>) -> Result<()>;

    /// Tear the decoder down.
    async fn stop(&mut self) -> Result<()>;
}

/// Acknowledges the decoder handshake immediately, for consumers that need
/// no real decoder: the format is reported with the first frame.
#[derive(Debug, Default)]
pub struct AutoAck {
    events: Option<DecoderEvents>,
    format_reported: bool,
}

impl AutoAck {
    pub fn realize(&mut self, events: DecoderEvents) {
        self.events = Some(events);
        self.format_reported = false;
    }

    pub fn frame(&mut self, frame: &Frame) {
        if self.format_reported {
            return;
        }
        if let Some(events) = &self.events {
            events.format_determined(frame.metadata());
            events.prefetch_complete();
            self.format_reported = true;
        }
    }

    pub fn start(&self) {
        if let Some(events) = &self.events {
            events.started();
        }
    }

    pub fn stop(&mut self) {
        if let Some(events) = self.events.take() {
            events.stopped();
        }
    }
}

/// Forwards delivered frames to a bounded channel read by the application.
pub struct ForwardingConsumer {
    tx: mpsc::Sender<Option<Frame>>,
    ack: AutoAck,
    audible: bool,
}

impl ForwardingConsumer {
    /// Sending blocks while the receiver holds `capacity` unread frames.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Option<Frame>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let consumer = Self {
            tx,
            ack: AutoAck::default(),
            audible: false,
        };
        (consumer, rx)
    }

    pub fn audible(&self) -> bool {
        self.audible
    }
}

#[async_trait]
impl FrameConsumer for ForwardingConsumer {
    async fn realize(&mut self, events: DecoderEvents, audible: bool) -> Result<()> {
        self.audible = audible;
        self.ack.realize(events);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.ack.start();
        Ok(())
    }

    async fn deliver(&mut self, frame: Option<Frame>) -> Result<()> {
        if let Some(frame) = &frame {
            self.ack.frame(frame);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("frame receiver dropped"))
    }

    async fn stop(&mut self) -> Result<()> {
        self.ack.stop();
        Ok(())
    }
}

use std::time::Duration;
use tracing::{debug, trace};

use super::{Connection, DataSource, StreamRead};
use crate::core::{ChannelRef, Frame, RetrievalError, RetrievalResult, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Subscribed,
    Monitoring,
    /// Stream finished; only `close` is allowed.
    Ended,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Subscribed => "Subscribed",
            Self::Monitoring => "Monitoring",
            Self::Ended => "Ended",
            Self::Closed => "Closed",
        }
    }
}

/// Wraps a `Connection` with state checks so that a fetch can never run
/// while a stream is active on the same handle.
pub struct ManagedConnection {
    inner: Box<dyn Connection>,
    state: ConnectionState,
    label: String,
}

impl ManagedConnection {
    pub fn new(inner: Box<dyn Connection>, label: impl Into<String>) -> Self {
        Self {
            inner,
            state: ConnectionState::Open,
            label: label.into(),
        }
    }

    pub async fn open(source: &dyn DataSource, label: impl Into<String>) -> RetrievalResult<Self> {
        let label = label.into();
        let inner = source.open_connection().await?;
        debug!(source = source.name(), connection = %label, "connection opened");
        Ok(Self::new(inner, label))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn require(&self, expected: &[ConnectionState], operation: &str) -> RetrievalResult<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(RetrievalError::invalid_transition(self.state.name(), operation))
        }
    }

    pub async fn fetch_once(
        &mut self,
        channels: &[ChannelRef],
        reference: f64,
        duration: f64,
        selector: Selector,
    ) -> RetrievalResult<Option<Frame>> {
        self.require(&[ConnectionState::Open], "fetch")?;
        trace!(
            connection = %self.label,
            selector = selector.as_str(),
            reference,
            "fetch"
        );
        self.inner.fetch_once(channels, reference, duration, selector).await
    }

    pub async fn subscribe(
        &mut self,
        channels: &[ChannelRef],
        start: f64,
        selector: Selector,
    ) -> RetrievalResult<()> {
        self.require(&[ConnectionState::Open], "subscribe")?;
        self.inner.subscribe(channels, start, selector).await?;
        self.state = ConnectionState::Subscribed;
        debug!(connection = %self.label, start, channels = channels.len(), "subscribed");
        Ok(())
    }

    pub async fn monitor(&mut self, channels: &[ChannelRef]) -> RetrievalResult<()> {
        self.require(&[ConnectionState::Open], "monitor")?;
        self.inner.monitor(channels).await?;
        self.state = ConnectionState::Monitoring;
        debug!(connection = %self.label, channels = channels.len(), "monitoring");
        Ok(())
    }

    pub async fn read(&mut self, timeout: Duration) -> RetrievalResult<StreamRead> {
        if self.state == ConnectionState::Ended {
            return Ok(StreamRead::Ended);
        }
        self.require(
            &[ConnectionState::Subscribed, ConnectionState::Monitoring],
            "read",
        )?;

        let read = self.inner.read(timeout).await?;
        if read == StreamRead::Ended {
            debug!(connection = %self.label, "stream ended");
            self.state = ConnectionState::Ended;
        }
        Ok(read)
    }

    pub async fn close(&mut self) -> RetrievalResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.inner.close().await?;
        debug!(connection = %self.label, "connection closed");
        Ok(())
    }
}

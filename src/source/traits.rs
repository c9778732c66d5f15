use async_trait::async_trait;
use std::time::Duration;

use crate::core::{ChannelRef, Frame, RetrievalResult, Selector};

/// Result of one blocking pull on a subscription or monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRead {
    Frame(Frame),
    /// Nothing arrived within the read timeout; the stream is still open.
    TimedOut,
    /// The server ended the stream; the connection must be reopened before reuse.
    Ended,
}

/// Remote data server that hands out connections.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Identifier used in logs (e.g. server address)
    fn name(&self) -> &str;

    /// Open a fresh connection; every concurrent reader needs its own.
    async fn open_connection(&self) -> RetrievalResult<Box<dyn Connection>>;
}

/// One connection to the remote data server.
///
/// A connection is used by a single worker at a time. Fetches are only valid
/// while no subscription or monitor is active on it.
#[async_trait]
pub trait Connection: Send {
    /// Single-shot request/response fetch. `Ok(None)` when nothing matches.
    async fn fetch_once(
        &mut self,
        channels: &[ChannelRef],
        reference: f64,
        duration: f64,
        selector: Selector,
    ) -> RetrievalResult<Option<Frame>>;

    /// Start a time-based subscription at `start`.
    async fn subscribe(
        &mut self,
        channels: &[ChannelRef],
        start: f64,
        selector: Selector,
    ) -> RetrievalResult<()>;

    /// Follow newly arriving data only.
    async fn monitor(&mut self, channels: &[ChannelRef]) -> RetrievalResult<()>;

    /// Pull the next streamed frame, waiting at most `timeout`.
    async fn read(&mut self, timeout: Duration) -> RetrievalResult<StreamRead>;

    async fn close(&mut self) -> RetrievalResult<()>;
}

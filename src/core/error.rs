use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the retrieval engine.
///
/// `NoDataAvailable` and `MalformedChannelData` are normally absorbed inside
/// the engine (they end a request cleanly or drop a payload); the remaining
/// variants abort the current request and are reported once to the caller.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum RetrievalError {
    #[error("no data is available")]
    NoDataAvailable,

    #[error("communication failure: {0}")]
    CommunicationFailure(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("malformed data on channel '{channel}': {reason}")]
    MalformedChannelData { channel: String, reason: String },

    #[error("consumer failure: {0}")]
    ConsumerFailure(String),

    #[error("decoder stalled in state {state}")]
    DecoderStalled { state: String },
}

impl RetrievalError {
    pub fn communication(message: impl Into<String>) -> Self {
        Self::CommunicationFailure(message.into())
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Fatal errors end the current request and force the controller idle.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NoDataAvailable | Self::MalformedChannelData { .. } | Self::InvalidTransition { .. }
        )
    }
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;

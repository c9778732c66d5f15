pub mod config;
pub mod consumer;
pub mod core;
pub mod engine;
pub mod observability;
pub mod source;

pub use config::{MergeStrategy, PlaybackConfig};
pub use consumer::{DecoderEvent, DecoderEvents, ForwardingConsumer, FrameConsumer, LoggingConsumer};
pub use self::core::{
    ChannelMetadata, ChannelPayload, ChannelRef, Direction, Frame, PlaybackMode, RetrievalError,
    RetrievalResult, Selector, TimeRange,
};
pub use engine::{Bounds, PlaybackController, PlaybackEvent, PlaybackState, RequestId, RequestOutcome};
pub use source::{Connection, DataSource, MemorySource, StreamRead};

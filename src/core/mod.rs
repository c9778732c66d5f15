pub mod error;
pub mod frame;
pub mod mode;

pub use error::{RetrievalError, RetrievalResult};
pub use frame::{ChannelMetadata, ChannelPayload, ChannelRef, Frame, TimeRange};
pub use mode::{Direction, PlaybackMode, Regime, RequestDuration, Selector};

pub mod bounds;
pub mod controller;
pub mod pacing;
pub mod request;
pub mod signal;
pub mod state;
pub mod sync;

pub use bounds::{fetch_limits, Bounds, BoundsTracker};
pub use controller::{PlaybackController, PlaybackEvent, RequestOutcome};
pub use pacing::{PacingAnchor, PacingController, RateEstimator};
pub use request::{EndReason, FrameRequest, PacedFrame, Pulled, RequestId, RequestSpec};
pub use signal::{RequestSlot, StopListener, StopSignal};
pub use state::{PlaybackState, StateEvent};
pub use sync::{ArrivalOrderMerger, ChannelSynchronizer, FrameMerger, MergeOutcome, SideEvent};

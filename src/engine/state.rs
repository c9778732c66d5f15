use serde::{Deserialize, Serialize};

use crate::core::{RetrievalError, RetrievalResult};

/// Decode pipeline states of the playback controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    /// No active decode pipeline
    #[default]
    Idle,
    /// Decoder is being constructed for the data shape of the first frame
    Realizing,
    /// Decoder is pre-buffering
    Prefetching,
    /// Start command issued, waiting for confirmation
    Starting,
    /// Frames are flowing to the consumer
    Running,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// A retrieving request begins building the decoder.
    Realize,
    FormatDetermined,
    PrefetchComplete,
    Started,
    /// Decoder torn down or request forced to stop.
    Stopped,
}

impl StateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Realize => "Realize",
            Self::FormatDetermined => "FormatDetermined",
            Self::PrefetchComplete => "PrefetchComplete",
            Self::Started => "Started",
            Self::Stopped => "Stopped",
        }
    }
}

impl PlaybackState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &PlaybackState) -> bool {
        use PlaybackState::*;

        matches!(
            (self, target),
            (Idle, Realizing)
                | (Realizing, Prefetching)
                | (Prefetching, Starting)
                | (Starting, Running)
                // forced stop
                | (_, Idle)
        )
    }

    /// The single transition function. Events that do not apply in the
    /// current state are rejected, never silently ignored.
    pub fn on_event(&self, event: StateEvent) -> RetrievalResult<PlaybackState> {
        use PlaybackState::*;

        let target = match (self, event) {
            (_, StateEvent::Stopped) => Idle,
            (Idle, StateEvent::Realize) => Realizing,
            (Realizing, StateEvent::FormatDetermined) => Prefetching,
            (Prefetching, StateEvent::PrefetchComplete) => Starting,
            (Starting, StateEvent::Started) => Running,
            _ => return Err(RetrievalError::invalid_transition(self.name(), event.name())),
        };

        debug_assert!(self.can_transition_to(&target));
        Ok(target)
    }

    /// Frames may be pulled in every state but `Prefetching`, where the
    /// decoder is expected to finish buffering what it already received.
    pub fn accepts_frames(&self) -> bool {
        !matches!(self, PlaybackState::Idle | PlaybackState::Prefetching)
    }

    pub fn is_idle(&self) -> bool {
        *self == PlaybackState::Idle
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Realizing => "Realizing",
            Self::Prefetching => "Prefetching",
            Self::Starting => "Starting",
            Self::Running => "Running",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let idle = PlaybackState::Idle;
        let realizing = PlaybackState::Realizing;

        assert!(idle.can_transition_to(&realizing));
        assert!(!idle.can_transition_to(&PlaybackState::Running));
        assert!(realizing.can_transition_to(&PlaybackState::Idle));
    }

    #[test]
    fn test_full_handshake() {
        let mut state = PlaybackState::Idle;
        for event in [
            StateEvent::Realize,
            StateEvent::FormatDetermined,
            StateEvent::PrefetchComplete,
            StateEvent::Started,
        ] {
            state = state.on_event(event).unwrap();
        }
        assert_eq!(state, PlaybackState::Running);
        assert_eq!(state.on_event(StateEvent::Stopped).unwrap(), PlaybackState::Idle);
    }

    #[test]
    fn test_out_of_order_event_is_rejected() {
        let err = PlaybackState::Idle
            .on_event(StateEvent::PrefetchComplete)
            .unwrap_err();
        assert_eq!(err, RetrievalError::invalid_transition("Idle", "PrefetchComplete"));

        assert!(PlaybackState::Running.on_event(StateEvent::Realize).is_err());
    }

    #[test]
    fn test_stop_is_accepted_everywhere() {
        for state in [
            PlaybackState::Idle,
            PlaybackState::Realizing,
            PlaybackState::Prefetching,
            PlaybackState::Starting,
            PlaybackState::Running,
        ] {
            assert_eq!(state.on_event(StateEvent::Stopped), Ok(PlaybackState::Idle));
        }
    }

    #[test]
    fn test_no_pulls_while_prefetching() {
        assert!(PlaybackState::Realizing.accepts_frames());
        assert!(!PlaybackState::Prefetching.accepts_frames());
        assert!(PlaybackState::Running.accepts_frames());
    }
}

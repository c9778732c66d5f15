use serde::{Deserialize, Serialize};

/// User playback intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    JumpToStart,
    StepBackward,
    PlayBackward,
    Pause,
    StepForward,
    PlayForward,
    JumpToEnd,
    RealTime,
    SetPosition,
    Terminate,
}

/// Direction of travel through media time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
    Frozen,
}

/// How many frames a request is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestDuration {
    OneFrame,
    Continuous,
}

/// How a request obtains its frames; fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    /// Single-shot request/response fetches.
    Discrete,
    /// Long-lived subscription or monitor.
    Continuous,
}

/// Search mode of a discrete fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Oldest,
    Newest,
    Previous,
    Next,
    Absolute,
}

impl Selector {
    pub fn as_str(self) -> &'static str {
        match self {
            Selector::Oldest => "oldest",
            Selector::Newest => "newest",
            Selector::Previous => "previous",
            Selector::Next => "next",
            Selector::Absolute => "absolute",
        }
    }
}

impl PlaybackMode {
    pub fn direction(self) -> Direction {
        use PlaybackMode::*;

        match self {
            JumpToEnd | StepForward | PlayForward | RealTime => Direction::Forward,
            JumpToStart | StepBackward | PlayBackward => Direction::Backward,
            Pause | SetPosition | Terminate => Direction::Frozen,
        }
    }

    pub fn duration(self) -> RequestDuration {
        use PlaybackMode::*;

        match self {
            JumpToStart | JumpToEnd | StepBackward | StepForward | SetPosition => {
                RequestDuration::OneFrame
            }
            PlayBackward | PlayForward | RealTime | Pause | Terminate => RequestDuration::Continuous,
        }
    }

    /// `None` for modes that never retrieve (pause, terminate).
    pub fn regime(self) -> Option<Regime> {
        use PlaybackMode::*;

        match self {
            PlayForward | RealTime => Some(Regime::Continuous),
            Pause | Terminate => None,
            _ => Some(Regime::Discrete),
        }
    }

    pub fn selector(self) -> Selector {
        use PlaybackMode::*;

        match self {
            JumpToStart => Selector::Oldest,
            JumpToEnd => Selector::Newest,
            StepBackward | PlayBackward => Selector::Previous,
            StepForward | PlayForward => Selector::Next,
            _ => Selector::Absolute,
        }
    }

    /// Play modes advance at 1x wall-clock speed; everything else is released immediately.
    pub fn is_paced(self) -> bool {
        matches!(self, PlaybackMode::PlayForward | PlaybackMode::PlayBackward)
    }

    /// Whether audio channels should be audible for this request.
    pub fn audible(self) -> bool {
        matches!(self, PlaybackMode::PlayForward | PlaybackMode::RealTime)
    }

    pub fn retrieves(self) -> bool {
        self.regime().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JumpToStart => "jump-to-start",
            Self::StepBackward => "step-backward",
            Self::PlayBackward => "play-backward",
            Self::Pause => "pause",
            Self::StepForward => "step-forward",
            Self::PlayForward => "play-forward",
            Self::JumpToEnd => "jump-to-end",
            Self::RealTime => "real-time",
            Self::SetPosition => "set-position",
            Self::Terminate => "terminate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_table() {
        assert_eq!(PlaybackMode::JumpToEnd.direction(), Direction::Forward);
        assert_eq!(PlaybackMode::RealTime.direction(), Direction::Forward);
        assert_eq!(PlaybackMode::JumpToStart.direction(), Direction::Backward);
        assert_eq!(PlaybackMode::StepBackward.direction(), Direction::Backward);
        assert_eq!(PlaybackMode::SetPosition.direction(), Direction::Frozen);
        assert_eq!(PlaybackMode::Pause.direction(), Direction::Frozen);
    }

    #[test]
    fn test_selector_follows_direction() {
        assert_eq!(PlaybackMode::JumpToStart.selector(), Selector::Oldest);
        assert_eq!(PlaybackMode::JumpToEnd.selector(), Selector::Newest);
        assert_eq!(PlaybackMode::StepForward.selector(), Selector::Next);
        assert_eq!(PlaybackMode::PlayBackward.selector(), Selector::Previous);
        assert_eq!(PlaybackMode::SetPosition.selector(), Selector::Absolute);
    }

    #[test]
    fn test_regime_selection() {
        assert_eq!(PlaybackMode::PlayForward.regime(), Some(Regime::Continuous));
        assert_eq!(PlaybackMode::RealTime.regime(), Some(Regime::Continuous));
        assert_eq!(PlaybackMode::PlayBackward.regime(), Some(Regime::Discrete));
        assert_eq!(PlaybackMode::SetPosition.regime(), Some(Regime::Discrete));
        assert_eq!(PlaybackMode::Pause.regime(), None);
        assert!(!PlaybackMode::Terminate.retrieves());
    }

    #[test]
    fn test_only_play_modes_are_paced() {
        assert!(PlaybackMode::PlayForward.is_paced());
        assert!(PlaybackMode::PlayBackward.is_paced());
        assert!(!PlaybackMode::RealTime.is_paced());
        assert!(!PlaybackMode::StepForward.is_paced());
    }

    #[test]
    fn test_mode_deserializes_from_snake_case() {
        let mode: PlaybackMode = serde_json::from_str("\"play_forward\"").unwrap();
        assert_eq!(mode, PlaybackMode::PlayForward);
    }
}

use std::fmt;

use crate::error::PipelineError;

/// Call state owned by the session controller.
///
/// `Error` and `Closed` are terminal: a session is single-use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Error,
    Closed,
}

/// What moved the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    TransportOpened,
    /// An inbound audio chunk arrived.
    AudioArrived,
    /// Turn complete and playback drained.
    TurnDrained,
    /// Barge-in.
    Interrupted,
    Fatal,
    Stop,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    /// Transport is open and the call is in progress.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }

    /// Legal-transition table. `None` means the trigger is ignored in this state.
    pub fn next(self, trigger: Trigger) -> Option<SessionState> {
        use SessionState::*;
        match (self, trigger) {
            (Idle, Trigger::Start) => Some(Connecting),
            (Connecting, Trigger::TransportOpened) => Some(Listening),
            (Listening | Speaking, Trigger::AudioArrived) => Some(Speaking),
            (Speaking, Trigger::TurnDrained) => Some(Listening),
            (Listening | Speaking, Trigger::Interrupted) => Some(Listening),
            (Error | Closed, _) => None,
            (_, Trigger::Fatal) => Some(Error),
            (_, Trigger::Stop) => Some(Closed),
            _ => None,
        }
    }

    pub fn transition(self, trigger: Trigger) -> Result<SessionState, PipelineError> {
        self.next(trigger).ok_or(PipelineError::InvalidTransition {
            from: self,
            trigger: trigger.as_str(),
        })
    }
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::TransportOpened => "transport-open",
            Trigger::AudioArrived => "audio",
            Trigger::TurnDrained => "turn-drained",
            Trigger::Interrupted => "interrupted",
            Trigger::Fatal => "fatal",
            Trigger::Stop => "stop",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

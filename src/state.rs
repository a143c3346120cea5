//! Conversation state machine
//!
//! `Idle → Connecting → Listening ⇄ Speaking → Idle`, with `Error` reachable
//! from every live state. The engine actor is the only caller, so transitions
//! are already serialized; this type only decides which ones are legal.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Error,
}

impl ConversationState {
    /// States in which a session holds devices and a stream.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Listening | Self::Speaking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// User asked to start a session.
    Start,
    /// Stream is open and capture is wired.
    Connected,
    /// First audio or text output of the current turn.
    ModelOutput,
    /// Turn complete and all scheduled playback has finished.
    Drained,
    /// Server reported barge-in.
    Interrupted,
    /// User asked to stop.
    Stop,
    /// Fatal channel or device failure.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} on {trigger:?}")]
pub struct InvalidTransition {
    pub from: ConversationState,
    pub trigger: Trigger,
}

#[derive(Debug)]
pub struct StateMachine {
    state: ConversationState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConversationState::Idle,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Target state for `trigger`, without applying it.
    pub fn next(&self, trigger: Trigger) -> Result<ConversationState, InvalidTransition> {
        use ConversationState::*;

        let next = match (self.state, trigger) {
            (Idle | Error, Trigger::Start) => Connecting,
            (Connecting, Trigger::Connected) => Listening,
            (Listening | Speaking, Trigger::ModelOutput) => Speaking,
            (Listening | Speaking, Trigger::Drained) => Listening,
            (Listening | Speaking, Trigger::Interrupted) => Listening,
            (_, Trigger::Stop) => Idle,
            (Connecting | Listening | Speaking, Trigger::Fail) => Error,
            (from, trigger) => return Err(InvalidTransition { from, trigger }),
        };
        Ok(next)
    }

    /// Apply `trigger`, returning `(from, to)`.
    pub fn apply(
        &mut self,
        trigger: Trigger,
    ) -> Result<(ConversationState, ConversationState), InvalidTransition> {
        let from = self.state;
        let to = self.next(trigger)?;
        self.state = to;
        Ok((from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationState::*;

    fn machine_in(state: ConversationState) -> StateMachine {
        StateMachine { state }
    }

    #[test]
    fn test_happy_path() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.apply(Trigger::Start).unwrap(), (Idle, Connecting));
        assert_eq!(machine.apply(Trigger::Connected).unwrap(), (Connecting, Listening));
        assert_eq!(machine.apply(Trigger::ModelOutput).unwrap(), (Listening, Speaking));
        assert_eq!(machine.apply(Trigger::ModelOutput).unwrap(), (Speaking, Speaking));
        assert_eq!(machine.apply(Trigger::Drained).unwrap(), (Speaking, Listening));
        assert_eq!(machine.apply(Trigger::Stop).unwrap(), (Listening, Idle));
    }

    #[test]
    fn test_stop_is_legal_everywhere() {
        for state in [Idle, Connecting, Listening, Speaking, Error] {
            assert_eq!(machine_in(state).next(Trigger::Stop).unwrap(), Idle);
        }
    }

    #[test]
    fn test_failure_only_from_live_states() {
        for state in [Connecting, Listening, Speaking] {
            assert_eq!(machine_in(state).next(Trigger::Fail).unwrap(), Error);
        }
        assert!(machine_in(Idle).next(Trigger::Fail).is_err());
        assert!(machine_in(Error).next(Trigger::Fail).is_err());
    }

    #[test]
    fn test_interrupt_returns_to_listening() {
        assert_eq!(machine_in(Speaking).next(Trigger::Interrupted).unwrap(), Listening);
        assert_eq!(machine_in(Listening).next(Trigger::Interrupted).unwrap(), Listening);
        assert!(machine_in(Idle).next(Trigger::Interrupted).is_err());
    }

    #[test]
    fn test_rejects_out_of_order_triggers() {
        let err = machine_in(Listening).next(Trigger::Start).unwrap_err();
        assert_eq!(err.from, Listening);
        assert!(machine_in(Idle).next(Trigger::Connected).is_err());
        assert!(machine_in(Connecting).next(Trigger::ModelOutput).is_err());
        assert!(machine_in(Idle).next(Trigger::Drained).is_err());
    }

    #[test]
    fn test_retry_from_error() {
        let mut machine = machine_in(Error);
        assert_eq!(machine.apply(Trigger::Start).unwrap(), (Error, Connecting));
    }
}

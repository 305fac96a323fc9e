//! Interaction state tags broadcast on every transition of the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the event carrying [`InteractionState`] payloads.
pub const STATE_CHANGE_EVENT: &str = "stateChange";

/// Where the current interaction cycle is.
///
/// `Frozen` is a sticky idle: the backend refused access (401/403/429) and the
/// host UI should block further attempts until the developer intervenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionState {
    #[serde(rename = "STATE_IDLE")]
    Idle,
    #[serde(rename = "STATE_LISTENING_START")]
    ListeningStart,
    #[serde(rename = "STATE_THINKING_START")]
    ThinkingStart,
    #[serde(rename = "STATE_SPEAKING_START")]
    SpeakingStart,
    #[serde(rename = "STATE_FROZEN")]
    Frozen,
}

impl InteractionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionState::Idle => "STATE_IDLE",
            InteractionState::ListeningStart => "STATE_LISTENING_START",
            InteractionState::ThinkingStart => "STATE_THINKING_START",
            InteractionState::SpeakingStart => "STATE_SPEAKING_START",
            InteractionState::Frozen => "STATE_FROZEN",
        }
    }

    /// Resting states: a cycle is over once one of these has been emitted.
    pub fn is_resting(&self) -> bool {
        matches!(self, InteractionState::Idle | InteractionState::Frozen)
    }
}

impl Default for InteractionState {
    fn default() -> Self {
        InteractionState::Idle
    }
}

impl fmt::Display for InteractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_wire_tags() {
        let json = serde_json::to_string(&InteractionState::ThinkingStart).unwrap();
        assert_eq!(json, "\"STATE_THINKING_START\"");
        let back: InteractionState = serde_json::from_str("\"STATE_FROZEN\"").unwrap();
        assert_eq!(back, InteractionState::Frozen);
    }

    #[test]
    fn resting_states() {
        assert!(InteractionState::Idle.is_resting());
        assert!(InteractionState::Frozen.is_resting());
        assert!(!InteractionState::SpeakingStart.is_resting());
        assert_eq!(InteractionState::default(), InteractionState::Idle);
    }
}

//! Cooperative control protocol between an observer and a running workflow.

use serde::{Deserialize, Serialize};

/// Directive issued by an external observer and polled by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ControlSignal {
    Pause,
    Resume,
    Cancel,
}

/// A node failure recorded for observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub node_id: String,
    pub error: String,
}

/// Read-only view of the run's control state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ControlState {
    /// Signal behind the latest pause, resume or cancel transition. A resume
    /// that arrives while the run is not paused is not a transition.
    pub signal: Option<ControlSignal>,
    /// Node at which the run is currently suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,
    #[serde(default)]
    pub failed_steps: Vec<FailedStep>,
}

impl ControlState {
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

/// Newline-delimited JSON messages accepted on a runner's stdin.
///
/// ```
/// use stepforge_types::{ControlSignal, InboundMessage};
///
/// let message: InboundMessage = serde_json::from_str(r#"{"type":"control","signal":"pause"}"#).unwrap();
/// assert_eq!(message, InboundMessage::Control { signal: ControlSignal::Pause });
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Control { signal: ControlSignal },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_state_serializes_null_signal() {
        let state = ControlState::default();
        let json = serde_json::to_value(&state).expect("serialize control state");
        assert_eq!(json, serde_json::json!({ "signal": null, "failedSteps": [] }));
    }

    #[test]
    fn control_message_round_trips_wire_shape() {
        let message = InboundMessage::Control {
            signal: ControlSignal::Cancel,
        };
        assert_eq!(
            serde_json::to_string(&message).expect("serialize"),
            r#"{"type":"control","signal":"cancel"}"#
        );
    }
}

//! Run event records streamed to observers.
//!
//! Every occurrence during a run becomes one [`RunEvent`]: a common envelope
//! (`runId`, `at`) flattened together with a payload discriminated by `type`.
//! The wire names (`node:start`, `map:item:end`, ...) are part of the external
//! contract consumed by dashboards and the process relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    control::ControlState,
    graph::NodeKind,
    status::{IterationStatus, MapCounts, MapSpotlight, MapStatus, NodeStatus, RunOutcome, SerializedError},
};

/// Severity of a `node:log` line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One timestamped occurrence within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: RunEventPayload,
}

impl RunEvent {
    /// Stamps `payload` with the current time.
    pub fn now(run_id: impl Into<String>, payload: RunEventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            at: Utc::now(),
            payload,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RunEventPayload {
    #[serde(rename = "run:start", rename_all = "camelCase")]
    RunStarted { workflow_id: String, name: String, version: String },
    #[serde(rename = "run:end", rename_all = "camelCase")]
    RunFinished {
        status: RunOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    #[serde(rename = "run:paused", rename_all = "camelCase")]
    RunPaused {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    #[serde(rename = "run:resumed", rename_all = "camelCase")]
    RunResumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    #[serde(rename = "run:control_state")]
    ControlStateChanged { state: ControlState },

    #[serde(rename = "node:start", rename_all = "camelCase")]
    NodeStarted {
        node_id: String,
        node_title: String,
        kind: NodeKind,
        attempt: u32,
        max_attempts: u32,
    },
    #[serde(rename = "node:retry", rename_all = "camelCase")]
    NodeRetrying {
        node_id: String,
        node_title: String,
        attempt: u32,
        max_attempts: u32,
        backoff_ms: u64,
        error: SerializedError,
    },
    #[serde(rename = "node:end", rename_all = "camelCase")]
    NodeFinished {
        node_id: String,
        node_title: String,
        status: NodeStatus,
        duration_ms: u64,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "node:output", rename_all = "camelCase")]
    NodeOutput {
        node_id: String,
        node_title: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration_id: Option<String>,
    },
    #[serde(rename = "node:log", rename_all = "camelCase")]
    NodeLog {
        node_id: String,
        level: LogLevel,
        msg: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration_id: Option<String>,
    },
    #[serde(rename = "node:progress", rename_all = "camelCase")]
    NodeProgress {
        node_id: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration_id: Option<String>,
    },

    #[serde(rename = "map:start", rename_all = "camelCase")]
    MapStarted { map_node_id: String, total: usize, counts: MapCounts },
    #[serde(rename = "map:progress", rename_all = "camelCase")]
    MapProgress {
        map_node_id: String,
        counts: MapCounts,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spotlight: Option<MapSpotlight>,
    },
    #[serde(rename = "map:end", rename_all = "camelCase")]
    MapFinished {
        map_node_id: String,
        status: MapStatus,
        counts: MapCounts,
    },
    #[serde(rename = "map:item:start", rename_all = "camelCase")]
    MapItemStarted {
        map_node_id: String,
        iteration_id: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    #[serde(rename = "map:item:end", rename_all = "camelCase")]
    MapItemFinished {
        map_node_id: String,
        iteration_id: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        status: IterationStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    #[serde(rename = "map:templateStep:start", rename_all = "camelCase")]
    TemplateStepStarted {
        map_node_id: String,
        iteration_id: String,
        template_node_id: String,
        attempt: u32,
        max_attempts: u32,
    },
    #[serde(rename = "map:templateStep:end", rename_all = "camelCase")]
    TemplateStepFinished {
        map_node_id: String,
        iteration_id: String,
        template_node_id: String,
        status: IterationStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
}

impl RunEventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run:start",
            Self::RunFinished { .. } => "run:end",
            Self::RunPaused { .. } => "run:paused",
            Self::RunResumed { .. } => "run:resumed",
            Self::ControlStateChanged { .. } => "run:control_state",
            Self::NodeStarted { .. } => "node:start",
            Self::NodeRetrying { .. } => "node:retry",
            Self::NodeFinished { .. } => "node:end",
            Self::NodeOutput { .. } => "node:output",
            Self::NodeLog { .. } => "node:log",
            Self::NodeProgress { .. } => "node:progress",
            Self::MapStarted { .. } => "map:start",
            Self::MapProgress { .. } => "map:progress",
            Self::MapFinished { .. } => "map:end",
            Self::MapItemStarted { .. } => "map:item:start",
            Self::MapItemFinished { .. } => "map:item:end",
            Self::TemplateStepStarted { .. } => "map:templateStep:start",
            Self::TemplateStepFinished { .. } => "map:templateStep:end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_event_flattens_envelope_and_payload() {
        let event = RunEvent::now(
            "run-1",
            RunEventPayload::NodeFinished {
                node_id: "root/step-0".into(),
                node_title: "Deploy".into(),
                status: NodeStatus::Success,
                duration_ms: 12,
                attempts: 1,
                error: None,
                message: None,
            },
        );

        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["type"], "node:end");
        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["nodeId"], "root/step-0");
        assert_eq!(json["nodeTitle"], "Deploy");
        assert_eq!(json["status"], "success");
        assert_eq!(json["durationMs"], 12);
        assert!(json.get("error").is_none());
        assert!(json["at"].is_string());
    }

    #[test]
    fn map_event_deserializes_from_wire_shape() {
        let wire = json!({
            "type": "map:item:end",
            "runId": "run-9",
            "at": "2024-05-01T10:00:00Z",
            "mapNodeId": "root/map-1",
            "iterationId": "root/map-1#0",
            "index": 0,
            "key": "item-1",
            "status": "failed",
            "durationMs": 40,
            "error": { "message": "boom" }
        });

        let event: RunEvent = serde_json::from_value(wire).expect("deserialize event");
        assert_eq!(event.type_name(), "map:item:end");
        match event.payload {
            RunEventPayload::MapItemFinished { status, key, error, .. } => {
                assert_eq!(status, IterationStatus::Failed);
                assert_eq!(key.as_deref(), Some("item-1"));
                assert_eq!(error.map(|error| error.message).as_deref(), Some("boom"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}

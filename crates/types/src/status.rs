//! Lifecycle statuses and the aggregate payloads reported for map nodes.

use std::error::Error;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single node within a run.
///
/// `Pending -> Running -> (Success | Failure | Skipped | Warning)`; terminal states are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
    /// A soft-fail check that did not pass. The run keeps going.
    Warning,
}

impl NodeStatus {
    /// Returns true once the node can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Skipped | Self::Warning)
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failure,
    Canceled,
}

/// Final status reported in `map:end`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MapStatus {
    Success,
    Failed,
    Canceled,
}

/// Terminal status of one map iteration (and of a template node inside it).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Success,
    Failed,
    Skipped,
}

/// Aggregate iteration counters for a map node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MapCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl MapCounts {
    /// Initial counts for a map with `total` items: everything pending.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            pending: total,
            ..Default::default()
        }
    }

    pub fn start_item(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.running += 1;
    }

    pub fn complete_item(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
    }

    pub fn fail_item(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.failed += 1;
    }

    /// A running item that was interrupted before finishing.
    pub fn skip_item(&mut self) {
        self.running = self.running.saturating_sub(1);
        self.skipped += 1;
    }

    /// Moves every still-pending item to skipped.
    pub fn skip_pending(&mut self) {
        self.skipped += self.pending;
        self.pending = 0;
    }
}

/// The iteration currently in focus while a map runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MapSpotlight {
    pub iteration_id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_template_node_id: Option<String>,
}

/// Error rendered for event payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedError {
    pub message: String,
    /// Cause chain, one cause per line, when the error had any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Renders an error and its `source()` chain.
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            stack: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

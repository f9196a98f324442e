//! Mutable bookkeeping of one run.

use indexmap::IndexMap;
use serde_json::Value;
use stepforge_types::{IterationStatus, NodeKind, NodeStatus, SerializedError, WorkflowGraph};

use crate::context::LoopContext;

/// Node statuses, attempt counters and iteration outcomes. Owned by the executor.
#[derive(Debug)]
pub(crate) struct RunState {
    pub(crate) statuses: IndexMap<String, NodeStatus>,
    pub(crate) attempts: IndexMap<String, u32>,
    pub(crate) iteration_statuses: IndexMap<String, IndexMap<String, IterationStatus>>,
    /// First hard failure of the run.
    pub(crate) failure: Option<SerializedError>,
}

impl RunState {
    pub(crate) fn new(graph: &WorkflowGraph) -> Self {
        let statuses = graph
            .nodes
            .values()
            .filter(|node| node.kind != NodeKind::Root)
            .map(|node| (node.id.clone(), NodeStatus::Pending))
            .collect();
        Self {
            statuses,
            attempts: IndexMap::new(),
            iteration_statuses: IndexMap::new(),
            failure: None,
        }
    }

    pub(crate) fn status(&self, node_id: &str) -> NodeStatus {
        self.statuses.get(node_id).copied().unwrap_or_default()
    }

    pub(crate) fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        self.statuses.insert(node_id.to_string(), status);
    }

    pub(crate) fn set_attempts(&mut self, node_id: &str, attempts: u32) {
        self.attempts.insert(node_id.to_string(), attempts);
    }

    pub(crate) fn record_iteration(&mut self, map_node_id: &str, iteration_id: &str, status: IterationStatus) {
        self.iteration_statuses
            .entry(map_node_id.to_string())
            .or_default()
            .insert(iteration_id.to_string(), status);
    }

    /// Ids of nodes that never started, in declaration order.
    pub(crate) fn unstarted(&self) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Values attached through `ctx.output`.
#[derive(Debug, Default)]
pub(crate) struct OutputLedger {
    pub(crate) outputs: IndexMap<String, Value>,
    /// map node id → iteration id → node id → value
    pub(crate) map_outputs: IndexMap<String, IndexMap<String, IndexMap<String, Value>>>,
}

impl OutputLedger {
    pub(crate) fn record(&mut self, node_id: &str, loop_ctx: Option<&LoopContext>, data: Value) {
        if let Some(loop_ctx) = loop_ctx {
            self.map_outputs
                .entry(loop_ctx.map_node_id.clone())
                .or_default()
                .entry(loop_ctx.iteration_id.clone())
                .or_default()
                .insert(node_id.to_string(), data.clone());
        }
        self.outputs.insert(node_id.to_string(), data);
    }
}

/// Folds per-iteration results of template nodes into one status per node.
#[derive(Debug, Default)]
pub(crate) struct TemplateTally {
    seen: IndexMap<String, (NodeStatus, u32)>,
}

impl TemplateTally {
    pub(crate) fn record(&mut self, node_id: &str, status: NodeStatus, attempts: u32) {
        let entry = self.seen.entry(node_id.to_string()).or_insert((NodeStatus::Skipped, 0));
        if severity(status) > severity(entry.0) {
            entry.0 = status;
        }
        entry.1 = entry.1.max(attempts);
    }

    /// Writes the aggregate into the run state; nodes that never ran are skipped.
    pub(crate) fn apply<'a>(self, state: &mut RunState, template: impl IntoIterator<Item = &'a str>) {
        for node_id in template {
            let (status, attempts) = self.seen.get(node_id).copied().unwrap_or((NodeStatus::Skipped, 0));
            state.set_status(node_id, status);
            state.set_attempts(node_id, attempts);
        }
    }
}

fn severity(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Failure => 3,
        NodeStatus::Warning => 2,
        NodeStatus::Success => 1,
        NodeStatus::Pending | NodeStatus::Running | NodeStatus::Skipped => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tally_keeps_most_severe_outcome() {
        let mut tally = TemplateTally::default();
        tally.record("t", NodeStatus::Success, 1);
        tally.record("t", NodeStatus::Failure, 3);
        tally.record("t", NodeStatus::Success, 1);
        tally.record("w", NodeStatus::Warning, 1);

        let mut state = RunState {
            statuses: IndexMap::new(),
            attempts: IndexMap::new(),
            iteration_statuses: IndexMap::new(),
            failure: None,
        };
        tally.apply(&mut state, ["t", "w", "never"]);

        assert_eq!(state.status("t"), NodeStatus::Failure);
        assert_eq!(state.attempts["t"], 3);
        assert_eq!(state.status("w"), NodeStatus::Warning);
        assert_eq!(state.status("never"), NodeStatus::Skipped);
    }

    #[test]
    fn iteration_outputs_are_keyed_twice() {
        let mut ledger = OutputLedger::default();
        let loop_ctx = LoopContext {
            map_node_id: "root/map-0".into(),
            iteration_id: "root/map-0#1".into(),
            index: 1,
            key: None,
            item: json!(2),
        };
        ledger.record("root/map-0/step-0", Some(&loop_ctx), json!({ "ok": true }));

        assert_eq!(ledger.outputs["root/map-0/step-0"], json!({ "ok": true }));
        assert_eq!(
            ledger.map_outputs["root/map-0"]["root/map-0#1"]["root/map-0/step-0"],
            json!({ "ok": true })
        );
    }
}

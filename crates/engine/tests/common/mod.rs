#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use serde_json::{Map as JsonMap, Value};
use stepforge_engine::{BuiltWorkflow, CollectingSink, RunOptions, RunReport, WorkflowDefinition, execute};
use stepforge_types::{NodeStatus, RunEvent, RunEventPayload};

/// Shared invocation counter that can be moved into `Fn` bodies.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicU32>);

impl Calls {
    pub fn hit(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn build(definition: &WorkflowDefinition) -> BuiltWorkflow {
    definition.build_graph("test", "1").expect("workflow builds")
}

/// Runs with no inputs and no control source, returning the report and every event.
pub async fn run(definition: &WorkflowDefinition) -> (RunReport, Vec<RunEvent>) {
    run_with(definition, JsonMap::new(), RunOptions::new("run-test")).await
}

pub async fn run_with(definition: &WorkflowDefinition, inputs: JsonMap<String, Value>, options: RunOptions) -> (RunReport, Vec<RunEvent>) {
    let sink = CollectingSink::new();
    let report = execute(&build(definition), inputs, options.events(sink.clone()))
        .await
        .expect("run starts");
    (report, sink.events())
}

pub fn types(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::type_name).collect()
}

pub fn count(events: &[RunEvent], type_name: &str) -> usize {
    events.iter().filter(|event| event.type_name() == type_name).count()
}

/// `(node id, status)` of every `node:end` in emission order.
pub fn node_ends(events: &[RunEvent]) -> Vec<(String, NodeStatus)> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            RunEventPayload::NodeFinished { node_id, status, .. } => Some((node_id.clone(), *status)),
            _ => None,
        })
        .collect()
}

pub fn node_end<'a>(events: &'a [RunEvent], id: &str) -> &'a RunEventPayload {
    events
        .iter()
        .map(|event| &event.payload)
        .find(|payload| matches!(payload, RunEventPayload::NodeFinished { node_id, .. } if node_id == id))
        .unwrap_or_else(|| panic!("no node:end for {id}"))
}

//! Single-pass execution of a built workflow.
//!
//! The executor walks the containment tree depth first. Inside one scope it
//! follows the `sequence` chain, so a group's children all finish before the
//! group's successor starts. Map nodes hand their whole subtree to the map
//! sub-engine. Every node start is preceded by a control checkpoint; nodes
//! that never started are swept to `skipped` once the walk stops.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures_util::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use stepforge_types::{
    ControlState, GraphNode, IterationStatus, NodeKind, NodeStatus, RunEventPayload, RunOutcome, SerializedError,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

mod map;
mod node;
mod state;

use crate::{
    builder::{BuildError, NodeBody},
    config::EngineConfig,
    context::LoopContext,
    control::{Cancelled, ControlGate, ControlSource, ControlStateCallback, NoControl},
    definition::{BuiltWorkflow, WorkflowDefinition},
    events::{EventEmitter, EventSink, NullSink},
    inputs::{InputError, resolve_inputs},
    store::ScopedStore,
};
use state::{OutputLedger, RunState};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Inputs(#[from] InputError),
    #[error("{kind} node '{node_id}' has no executable body")]
    MissingBody { node_id: String, kind: NodeKind },
}

/// Per-run wiring: identity, event sink, control source and tuning.
#[derive(Clone)]
pub struct RunOptions {
    run_id: String,
    events: Arc<dyn EventSink>,
    control: Arc<dyn ControlSource>,
    on_control_state_change: Option<ControlStateCallback>,
    config: EngineConfig,
}

impl RunOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Arc::new(NullSink),
            control: Arc::new(NoControl),
            on_control_state_change: None,
            config: EngineConfig::default(),
        }
    }

    pub fn events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Arc::new(sink);
        self
    }

    pub fn shared_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn control(mut self, source: impl ControlSource + 'static) -> Self {
        self.control = Arc::new(source);
        self
    }

    pub fn on_control_state_change(mut self, callback: impl Fn(&ControlState) + Send + Sync + 'static) -> Self {
        self.on_control_state_change = Some(Arc::new(callback));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    pub statuses: IndexMap<String, NodeStatus>,
    pub attempts: IndexMap<String, u32>,
    pub outputs: IndexMap<String, Value>,
    pub map_outputs: IndexMap<String, IndexMap<String, IndexMap<String, Value>>>,
    pub iteration_statuses: IndexMap<String, IndexMap<String, IterationStatus>>,
    pub run_store: IndexMap<String, Value>,
    pub control: ControlState,
}

impl RunReport {
    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).copied()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }
}

/// Builds `definition` and executes it.
pub async fn execute_definition(
    definition: &WorkflowDefinition,
    workflow_id: &str,
    version: &str,
    inputs: JsonMap<String, Value>,
    options: RunOptions,
) -> Result<RunReport, EngineError> {
    let built = definition.build_graph(workflow_id, version)?;
    execute(&built, inputs, options).await
}

/// Runs `workflow` once. Node failures are reported in the returned
/// [`RunReport`]; only problems detected before the first node starts are errors.
pub async fn execute(workflow: &BuiltWorkflow, inputs: JsonMap<String, Value>, options: RunOptions) -> Result<RunReport, EngineError> {
    let inputs = resolve_inputs(&workflow.inputs, inputs)?;
    ensure_bodies(workflow)?;

    let emitter = EventEmitter::new(options.run_id.clone(), options.events);
    let gate = ControlGate::new(
        options.control,
        emitter.clone(),
        options.on_control_state_change,
        options.config.control_poll_interval,
    );
    let runtime = Arc::new(RunRuntime {
        run_id: options.run_id,
        emitter,
        gate,
        outputs: Mutex::new(OutputLedger::default()),
    });

    let executor = Executor {
        workflow,
        order: workflow.graph.execution_order(),
        run_store: ScopedStore::run_scoped(inputs.clone()),
        inputs: Arc::new(inputs),
        state: RunState::new(&workflow.graph),
        runtime,
    };
    Ok(executor.run().await)
}

fn ensure_bodies(workflow: &BuiltWorkflow) -> Result<(), EngineError> {
    for node in workflow.graph.nodes.values() {
        let needs_body = matches!(node.kind, NodeKind::Step | NodeKind::Check | NodeKind::Map);
        let has_body = workflow.body(&node.id).is_some_and(|body| body.kind() == node.kind);
        if needs_body && !has_body {
            return Err(EngineError::MissingBody {
                node_id: node.id.clone(),
                kind: node.kind,
            });
        }
    }
    Ok(())
}

/// Run-wide services shared with every [`StepContext`](crate::StepContext).
pub(crate) struct RunRuntime {
    pub(crate) run_id: String,
    pub(crate) emitter: EventEmitter,
    pub(crate) gate: ControlGate,
    outputs: Mutex<OutputLedger>,
}

impl RunRuntime {
    pub(crate) fn record_output(&self, node_id: &str, loop_ctx: Option<&LoopContext>, data: Value) {
        self.outputs
            .lock()
            .expect("output ledger lock poisoned")
            .record(node_id, loop_ctx, data);
    }
}

/// How the walk of a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Failed,
    Cancelled,
}

pub(crate) struct Executor<'w> {
    workflow: &'w BuiltWorkflow,
    order: HashMap<String, Vec<String>>,
    runtime: Arc<RunRuntime>,
    inputs: Arc<JsonMap<String, Value>>,
    run_store: ScopedStore,
    state: RunState,
}

impl<'w> Executor<'w> {
    async fn run(mut self) -> RunReport {
        let workflow = self.workflow;
        let graph = &workflow.graph;
        info!(run_id = %self.runtime.run_id, workflow_id = %graph.workflow_id, version = %graph.version, "run started");
        self.runtime.emitter.emit(RunEventPayload::RunStarted {
            workflow_id: graph.workflow_id.clone(),
            name: graph.name.clone(),
            version: graph.version.clone(),
        });

        let flow = self.run_scope(graph.root_id.clone()).await;
        self.skip_unstarted();

        let (outcome, error) = match flow {
            Flow::Continue => (RunOutcome::Success, None),
            Flow::Failed => (RunOutcome::Failure, self.state.failure.clone()),
            Flow::Cancelled => (RunOutcome::Canceled, Some(SerializedError::from_error(&Cancelled))),
        };
        info!(run_id = %self.runtime.run_id, outcome = ?outcome, "run finished");
        self.runtime.emitter.emit(RunEventPayload::RunFinished {
            status: outcome,
            error: error.clone(),
        });
        self.into_report(outcome, error)
    }

    /// Children of `parent_id` in execution order.
    fn scope_nodes(&self, parent_id: &str) -> Vec<&'w GraphNode> {
        let workflow = self.workflow;
        let graph = &workflow.graph;
        self.order
            .get(parent_id)
            .map(|ids| ids.iter().filter_map(|id| graph.node(id)).collect())
            .unwrap_or_default()
    }

    fn run_scope(&mut self, parent_id: String) -> BoxFuture<'_, Flow> {
        async move {
            for node in self.scope_nodes(&parent_id) {
                match self.run_node(node).await {
                    Flow::Continue => {}
                    halted => return halted,
                }
            }
            Flow::Continue
        }
        .boxed()
    }

    async fn run_node(&mut self, node: &'w GraphNode) -> Flow {
        if self.runtime.gate.checkpoint(&node.id).await.is_err() {
            info!(node_id = %node.id, "cancel observed before node start");
            return Flow::Cancelled;
        }
        match node.kind {
            NodeKind::Root | NodeKind::Group => self.run_group(node).await,
            NodeKind::Step | NodeKind::Check => self.run_step(node).await,
            NodeKind::Map => self.run_map(node).await,
        }
    }

    async fn run_group(&mut self, node: &'w GraphNode) -> Flow {
        let started = Instant::now();
        self.begin_node(node);
        let flow = self.run_scope(node.id.clone()).await;
        let status = match flow {
            Flow::Continue if self.any_child_warned(&node.id) => NodeStatus::Warning,
            Flow::Continue => NodeStatus::Success,
            Flow::Failed => NodeStatus::Failure,
            Flow::Cancelled => NodeStatus::Skipped,
        };
        self.finish_node(node, status, started, 1, None, None);
        flow
    }

    async fn run_step(&mut self, node: &'w GraphNode) -> Flow {
        let outcome = self.run_leaf(node, None).await;
        self.finish_node(
            node,
            outcome.status,
            outcome.started,
            outcome.attempts,
            outcome.error.clone(),
            outcome.message,
        );
        match (outcome.status, outcome.error) {
            (NodeStatus::Failure, Some(error)) => {
                self.fail_run(&node.id, error);
                Flow::Failed
            }
            (NodeStatus::Failure, None) => Flow::Failed,
            (NodeStatus::Skipped, _) => Flow::Cancelled,
            _ => Flow::Continue,
        }
    }

    fn any_child_warned(&self, parent_id: &str) -> bool {
        self.workflow
            .graph
            .children(parent_id)
            .any(|child| self.state.status(&child.id) == NodeStatus::Warning)
    }

    /// Marks a container node running and announces it.
    fn begin_node(&mut self, node: &GraphNode) {
        info!(node_id = %node.id, kind = %node.kind, "node started");
        self.state.set_status(&node.id, NodeStatus::Running);
        self.state.set_attempts(&node.id, 1);
        self.runtime.emitter.emit(RunEventPayload::NodeStarted {
            node_id: node.id.clone(),
            node_title: node.title.clone(),
            kind: node.kind,
            attempt: 1,
            max_attempts: 1,
        });
    }

    fn finish_node(
        &mut self,
        node: &GraphNode,
        status: NodeStatus,
        started: Instant,
        attempts: u32,
        error: Option<SerializedError>,
        message: Option<String>,
    ) {
        let duration_ms = elapsed_ms(started);
        match status {
            NodeStatus::Failure => warn!(node_id = %node.id, attempts, duration_ms, "node failed"),
            _ => info!(node_id = %node.id, status = ?status, attempts, duration_ms, "node finished"),
        }
        self.state.set_status(&node.id, status);
        self.state.set_attempts(&node.id, attempts);
        self.runtime.emitter.emit(RunEventPayload::NodeFinished {
            node_id: node.id.clone(),
            node_title: node.title.clone(),
            status,
            duration_ms,
            attempts,
            error,
            message,
        });
    }

    /// Records a hard failure for observers; the first one becomes the run error.
    fn fail_run(&mut self, node_id: &str, error: SerializedError) {
        self.runtime.gate.record_failure(node_id, error.message.clone());
        self.state.failure.get_or_insert(error);
    }

    /// Every node the walk never reached ends `skipped`. Map template nodes
    /// are settled silently; their map node already reported.
    fn skip_unstarted(&mut self) {
        let workflow = self.workflow;
        let graph = &workflow.graph;
        for node_id in self.state.unstarted() {
            let Some(node) = graph.node(&node_id) else {
                continue;
            };
            self.state.set_status(&node_id, NodeStatus::Skipped);
            let inside_map = node
                .parent_id
                .as_deref()
                .and_then(|parent_id| graph.node(parent_id))
                .is_some_and(|parent| parent.kind == NodeKind::Map);
            if inside_map {
                continue;
            }
            self.runtime.emitter.emit(RunEventPayload::NodeFinished {
                node_id: node.id.clone(),
                node_title: node.title.clone(),
                status: NodeStatus::Skipped,
                duration_ms: 0,
                attempts: self.state.attempts.get(&node_id).copied().unwrap_or(0),
                error: None,
                message: None,
            });
        }
    }

    fn into_report(self, outcome: RunOutcome, error: Option<SerializedError>) -> RunReport {
        let ledger = std::mem::take(&mut *self.runtime.outputs.lock().expect("output ledger lock poisoned"));
        RunReport {
            run_id: self.runtime.run_id.clone(),
            outcome,
            error,
            statuses: self.state.statuses,
            attempts: self.state.attempts,
            outputs: ledger.outputs,
            map_outputs: ledger.map_outputs,
            iteration_statuses: self.state.iteration_statuses,
            run_store: self.run_store.snapshot(),
            control: self.runtime.gate.snapshot(),
        }
    }

    fn body(&self, node_id: &str) -> Option<&'w NodeBody> {
        self.workflow.body(node_id)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

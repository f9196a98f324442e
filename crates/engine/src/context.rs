//! What a node body sees while it runs.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value};
use stepforge_types::{LogLevel, RunEventPayload};
use tracing::{debug, error, info, warn};

use crate::{control::Cancelled, events::EventEmitter, executor::RunRuntime, store::ScopedStore};

/// Position of the current map iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopContext {
    pub map_node_id: String,
    pub iteration_id: String,
    pub index: usize,
    pub key: Option<String>,
    pub item: Value,
}

impl LoopContext {
    pub fn item_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.item.clone())
            .with_context(|| format!("item {} of map '{}' has an unexpected shape", self.index, self.map_node_id))
    }
}

/// Structured log lines attributed to one node.
///
/// Each line is emitted as a `node:log` event and mirrored to `tracing`.
#[derive(Clone)]
pub struct NodeLogger {
    node_id: String,
    map_node_id: Option<String>,
    iteration_id: Option<String>,
    emitter: EventEmitter,
}

impl NodeLogger {
    pub(crate) fn new(node_id: impl Into<String>, emitter: EventEmitter, loop_ctx: Option<&LoopContext>) -> Self {
        Self {
            node_id: node_id.into(),
            map_node_id: loop_ctx.map(|ctx| ctx.map_node_id.clone()),
            iteration_id: loop_ctx.map(|ctx| ctx.iteration_id.clone()),
            emitter,
        }
    }

    pub fn log(&self, level: LogLevel, msg: impl Into<String>, data: Option<Value>) {
        let msg = msg.into();
        let node_id = self.node_id.as_str();
        match level {
            LogLevel::Debug => debug!(node_id, "{msg}"),
            LogLevel::Info => info!(node_id, "{msg}"),
            LogLevel::Warn => warn!(node_id, "{msg}"),
            LogLevel::Error => error!(node_id, "{msg}"),
        }
        self.emitter.emit(RunEventPayload::NodeLog {
            node_id: self.node_id.clone(),
            level,
            msg,
            data,
            map_node_id: self.map_node_id.clone(),
            iteration_id: self.iteration_id.clone(),
        });
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.log(LogLevel::Debug, msg, None);
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.log(LogLevel::Info, msg, None);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.log(LogLevel::Warn, msg, None);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.log(LogLevel::Error, msg, None);
    }

    pub fn debug_with(&self, msg: impl Into<String>, data: impl Into<Value>) {
        self.log(LogLevel::Debug, msg, Some(data.into()));
    }

    pub fn info_with(&self, msg: impl Into<String>, data: impl Into<Value>) {
        self.log(LogLevel::Info, msg, Some(data.into()));
    }

    pub fn warn_with(&self, msg: impl Into<String>, data: impl Into<Value>) {
        self.log(LogLevel::Warn, msg, Some(data.into()));
    }

    pub fn error_with(&self, msg: impl Into<String>, data: impl Into<Value>) {
        self.log(LogLevel::Error, msg, Some(data.into()));
    }
}

impl std::fmt::Debug for NodeLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLogger").field("node_id", &self.node_id).finish_non_exhaustive()
    }
}

/// Context passed to step and check bodies, one per attempt.
#[derive(Clone)]
pub struct StepContext {
    pub node_id: String,
    pub node_title: String,
    pub run_id: String,
    pub inputs: Arc<JsonMap<String, Value>>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub run: ScopedStore,
    pub log: NodeLogger,
    /// Set only for map template nodes.
    pub loop_ctx: Option<LoopContext>,
    /// Iteration-scoped store, set only for map template nodes.
    pub iteration: Option<ScopedStore>,
    pub(crate) runtime: Arc<RunRuntime>,
}

impl StepContext {
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn input_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .inputs
            .get(name)
            .cloned()
            .with_context(|| format!("input '{name}' was not provided"))?;
        serde_json::from_value(value).with_context(|| format!("input '{name}' has an unexpected shape"))
    }

    /// Loop position, failing when the node is not part of a map template.
    pub fn require_loop(&self) -> anyhow::Result<&LoopContext> {
        self.loop_ctx
            .as_ref()
            .with_context(|| format!("node '{}' is not running inside a map", self.node_id))
    }

    /// Attaches a value to this node. Later calls replace earlier ones.
    pub fn output(&self, data: impl Into<Value>) {
        let data = data.into();
        self.runtime.record_output(&self.node_id, self.loop_ctx.as_ref(), data.clone());
        self.runtime.emitter.emit(RunEventPayload::NodeOutput {
            node_id: self.node_id.clone(),
            node_title: self.node_title.clone(),
            data,
            map_node_id: self.loop_ctx.as_ref().map(|ctx| ctx.map_node_id.clone()),
            iteration_id: self.loop_ctx.as_ref().map(|ctx| ctx.iteration_id.clone()),
        });
    }

    pub fn progress(&self, data: impl Into<Value>) {
        self.runtime.emitter.emit(RunEventPayload::NodeProgress {
            node_id: self.node_id.clone(),
            data: data.into(),
            map_node_id: self.loop_ctx.as_ref().map(|ctx| ctx.map_node_id.clone()),
            iteration_id: self.loop_ctx.as_ref().map(|ctx| ctx.iteration_id.clone()),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.runtime.gate.is_cancelled(&self.node_id)
    }

    pub fn throw_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    pub fn is_paused(&self) -> bool {
        self.runtime.gate.is_paused()
    }

    /// Suspends the body while the run is paused.
    pub async fn wait_if_paused(&self) -> Result<(), Cancelled> {
        self.runtime.gate.checkpoint(&self.node_id).await
    }

    /// Pausable, cancellable wait. Time spent paused counts toward `duration`.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.runtime.gate.sleep(&self.node_id, duration).await
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("node_id", &self.node_id)
            .field("run_id", &self.run_id)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("loop_ctx", &self.loop_ctx)
            .finish_non_exhaustive()
    }
}

/// Context passed to a map's `items` function.
#[derive(Debug, Clone)]
pub struct MapItemsContext {
    pub map_node_id: String,
    pub run_id: String,
    pub inputs: Arc<JsonMap<String, Value>>,
    pub run: ScopedStore,
    pub log: NodeLogger,
}

//! Sequential execution of a map node's template, once per runtime item.

use std::sync::Arc;

use serde_json::Value;
use stepforge_types::{
    GraphNode, IterationStatus, MapCounts, MapErrorPolicy, MapSpotlight, MapStatus, NodeStatus, RunEventPayload,
    SerializedError,
};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Executor, Flow, elapsed_ms, node::catch_panic, state::TemplateTally};
use crate::{
    builder::{KeyFn, NodeBody},
    context::{LoopContext, MapItemsContext, NodeLogger},
    control::Cancelled,
    store::{ScopedStore, StoreScope},
};

/// Everything a template node sees of its iteration.
pub(super) struct IterationScope {
    pub(super) loop_ctx: LoopContext,
    pub(super) store: ScopedStore,
    /// Counts as of the iteration start, used for spotlight updates.
    pub(super) counts: MapCounts,
}

enum IterationResult {
    Completed,
    Failed(SerializedError),
    Cancelled,
}

impl<'w> Executor<'w> {
    pub(super) async fn run_map(&mut self, node: &'w GraphNode) -> Flow {
        let started = Instant::now();
        self.begin_node(node);

        let Some(NodeBody::Map { items, key, on_error }) = self.body(&node.id) else {
            let error = SerializedError::from_message(format!("map '{}' has no items function", node.id));
            self.finish_node(node, NodeStatus::Failure, started, 1, Some(error.clone()), None);
            self.fail_run(&node.id, error);
            return Flow::Failed;
        };

        let items_ctx = MapItemsContext {
            map_node_id: node.id.clone(),
            run_id: self.runtime.run_id.clone(),
            inputs: Arc::clone(&self.inputs),
            run: self.run_store.clone(),
            log: NodeLogger::new(node.id.clone(), self.runtime.emitter.clone(), None),
        };
        let items = match catch_panic(async move { items(items_ctx).await }).await {
            Ok(items) => items,
            Err(error) if error.is::<Cancelled>() => {
                let error = SerializedError::from_error(&*error);
                self.finish_node(node, NodeStatus::Skipped, started, 1, Some(error), None);
                return Flow::Cancelled;
            }
            Err(error) => {
                let error = SerializedError::from_error(&*error);
                self.finish_node(node, NodeStatus::Failure, started, 1, Some(error.clone()), None);
                self.fail_run(&node.id, error);
                return Flow::Failed;
            }
        };

        let template = self.scope_nodes(&node.id);
        let total = items.len();
        let mut counts = MapCounts::new(total);
        info!(map_node_id = %node.id, total, on_error = ?on_error, "map started");
        self.runtime.emitter.emit(RunEventPayload::MapStarted {
            map_node_id: node.id.clone(),
            total,
            counts,
        });

        let mut tally = TemplateTally::default();
        let mut failures = Vec::new();
        let mut cancelled = false;
        let mut unstarted_from = 0;

        for (index, item) in items.iter().enumerate() {
            if self.runtime.gate.checkpoint(&node.id).await.is_err() {
                cancelled = true;
                break;
            }
            unstarted_from = index + 1;

            let loop_ctx = LoopContext {
                map_node_id: node.id.clone(),
                iteration_id: iteration_id(&node.id, index),
                index,
                key: item_key(key.as_ref(), item, index),
                item: item.clone(),
            };
            counts.start_item();
            self.runtime.emitter.emit(RunEventPayload::MapItemStarted {
                map_node_id: node.id.clone(),
                iteration_id: loop_ctx.iteration_id.clone(),
                index,
                key: loop_ctx.key.clone(),
            });
            self.runtime.emitter.emit(RunEventPayload::MapProgress {
                map_node_id: node.id.clone(),
                counts,
                spotlight: Some(MapSpotlight {
                    iteration_id: loop_ctx.iteration_id.clone(),
                    index,
                    key: loop_ctx.key.clone(),
                    active_template_node_id: None,
                }),
            });

            let scope = IterationScope {
                loop_ctx,
                store: ScopedStore::new(StoreScope::Iteration),
                counts,
            };
            let item_started = Instant::now();
            let (status, error) = match self.run_iteration(&template, &scope, &mut tally).await {
                IterationResult::Completed => {
                    counts.complete_item();
                    (IterationStatus::Success, None)
                }
                IterationResult::Failed(error) => {
                    counts.fail_item();
                    failures.push(error.clone());
                    (IterationStatus::Failed, Some(error))
                }
                IterationResult::Cancelled => {
                    counts.skip_item();
                    cancelled = true;
                    (IterationStatus::Skipped, Some(SerializedError::from_error(&Cancelled)))
                }
            };

            let loop_ctx = scope.loop_ctx;
            debug!(map_node_id = %node.id, iteration_id = %loop_ctx.iteration_id, status = ?status, "iteration finished");
            self.state.record_iteration(&node.id, &loop_ctx.iteration_id, status);
            self.runtime.emitter.emit(RunEventPayload::MapItemFinished {
                map_node_id: node.id.clone(),
                iteration_id: loop_ctx.iteration_id,
                index,
                key: loop_ctx.key,
                status,
                duration_ms: elapsed_ms(item_started),
                error,
            });
            self.runtime.emitter.emit(RunEventPayload::MapProgress {
                map_node_id: node.id.clone(),
                counts,
                spotlight: None,
            });

            let stop_on_failure = status == IterationStatus::Failed && *on_error == MapErrorPolicy::FailFast;
            if cancelled || stop_on_failure {
                break;
            }
        }

        for (index, item) in items.iter().enumerate().skip(unstarted_from) {
            let iteration_id = iteration_id(&node.id, index);
            self.state.record_iteration(&node.id, &iteration_id, IterationStatus::Skipped);
            self.runtime.emitter.emit(RunEventPayload::MapItemFinished {
                map_node_id: node.id.clone(),
                iteration_id,
                index,
                key: item_key(key.as_ref(), item, index),
                status: IterationStatus::Skipped,
                duration_ms: 0,
                error: None,
            });
        }
        counts.skip_pending();

        let map_status = if cancelled {
            MapStatus::Canceled
        } else if failures.is_empty() {
            MapStatus::Success
        } else {
            MapStatus::Failed
        };
        info!(map_node_id = %node.id, status = ?map_status, completed = counts.completed, failed = counts.failed, skipped = counts.skipped, "map finished");
        self.runtime.emitter.emit(RunEventPayload::MapFinished {
            map_node_id: node.id.clone(),
            status: map_status,
            counts,
        });
        tally.apply(&mut self.state, template.iter().map(|template_node| template_node.id.as_str()));

        match map_status {
            MapStatus::Success => {
                self.finish_node(node, NodeStatus::Success, started, 1, None, None);
                Flow::Continue
            }
            MapStatus::Failed => {
                let error = map_failure(&failures, total);
                self.finish_node(node, NodeStatus::Failure, started, 1, Some(error), None);
                Flow::Failed
            }
            MapStatus::Canceled => {
                let error = SerializedError::from_error(&Cancelled);
                self.finish_node(node, NodeStatus::Skipped, started, 1, Some(error), None);
                Flow::Cancelled
            }
        }
    }

    /// Runs every template node once for the current item. Nodes after a
    /// failure or cancel in the same iteration are reported skipped.
    async fn run_iteration(
        &mut self,
        template: &[&'w GraphNode],
        scope: &IterationScope,
        tally: &mut TemplateTally,
    ) -> IterationResult {
        let mut result = IterationResult::Completed;
        for &template_node in template {
            if matches!(result, IterationResult::Completed) && self.runtime.gate.checkpoint(&template_node.id).await.is_err() {
                result = IterationResult::Cancelled;
            }
            if !matches!(result, IterationResult::Completed) {
                self.emit_template_end(scope, template_node, IterationStatus::Skipped, 0, None);
                tally.record(&template_node.id, NodeStatus::Skipped, 0);
                continue;
            }

            let outcome = self.run_leaf(template_node, Some(scope)).await;
            let status = match outcome.status {
                NodeStatus::Success | NodeStatus::Warning => IterationStatus::Success,
                NodeStatus::Failure => IterationStatus::Failed,
                NodeStatus::Pending | NodeStatus::Running | NodeStatus::Skipped => IterationStatus::Skipped,
            };
            self.emit_template_end(scope, template_node, status, elapsed_ms(outcome.started), outcome.error.clone());
            tally.record(&template_node.id, outcome.status, outcome.attempts);

            match outcome.status {
                NodeStatus::Failure => {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| SerializedError::from_message(format!("'{}' failed", template_node.title)));
                    self.fail_run(&template_node.id, error.clone());
                    result = IterationResult::Failed(error);
                }
                NodeStatus::Skipped => result = IterationResult::Cancelled,
                _ => {}
            }
        }
        result
    }

    fn emit_template_end(
        &self,
        scope: &IterationScope,
        template_node: &GraphNode,
        status: IterationStatus,
        duration_ms: u64,
        error: Option<SerializedError>,
    ) {
        self.runtime.emitter.emit(RunEventPayload::TemplateStepFinished {
            map_node_id: scope.loop_ctx.map_node_id.clone(),
            iteration_id: scope.loop_ctx.iteration_id.clone(),
            template_node_id: template_node.id.clone(),
            status,
            duration_ms,
            error,
        });
    }
}

fn iteration_id(map_node_id: &str, index: usize) -> String {
    format!("{map_node_id}#{index}")
}

fn item_key(key: Option<&KeyFn>, item: &Value, index: usize) -> Option<String> {
    key.map(|key| key(item, index))
}

fn map_failure(failures: &[SerializedError], total: usize) -> SerializedError {
    let first = failures.first().map(|error| error.message.as_str()).unwrap_or("unknown error");
    SerializedError {
        message: format!("{} of {} iterations failed", failures.len(), total),
        stack: Some(format!("caused by: {first}")),
    }
}

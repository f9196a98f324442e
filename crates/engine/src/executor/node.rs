//! Attempt loop shared by top-level leaves and map template nodes.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use stepforge_types::{GraphNode, MapSpotlight, NodeStatus, RunEventPayload, SerializedError};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{Executor, map::IterationScope};
use crate::{builder::NodeBody, context::{NodeLogger, StepContext}, control::Cancelled};

/// How a step or check ended after all of its attempts.
#[derive(Debug)]
pub(super) struct LeafOutcome {
    pub(super) status: NodeStatus,
    pub(super) attempts: u32,
    pub(super) error: Option<SerializedError>,
    /// Check message attached to a refuted predicate.
    pub(super) message: Option<String>,
    pub(super) started: Instant,
}

enum Attempt {
    Passed,
    Refuted,
    Errored(anyhow::Error),
    Cancelled,
}

impl Attempt {
    fn from_result(result: anyhow::Result<bool>) -> Self {
        match result {
            Ok(true) => Self::Passed,
            Ok(false) => Self::Refuted,
            Err(error) if error.is::<Cancelled>() => Self::Cancelled,
            Err(error) => Self::Errored(error),
        }
    }
}

impl<'w> Executor<'w> {
    /// Runs a step or check body until it passes, is cancelled, or runs out of attempts.
    ///
    /// Emits the start event (and `node:retry` per retry) but not the end
    /// event, which differs between top-level and template nodes.
    pub(super) async fn run_leaf(&mut self, node: &'w GraphNode, iteration: Option<&IterationScope>) -> LeafOutcome {
        let started = Instant::now();
        let finish = |status, attempts, error, message| LeafOutcome {
            status,
            attempts,
            error,
            message,
            started,
        };

        let Some(body) = self.body(&node.id) else {
            let error = SerializedError::from_message(format!("node '{}' has no executable body", node.id));
            return finish(NodeStatus::Failure, 0, Some(error), None);
        };
        let policy = body.retry();
        self.state.set_status(&node.id, NodeStatus::Running);
        self.announce_leaf(node, policy.max_attempts, iteration);

        let mut attempt = 1;
        loop {
            self.state.set_attempts(&node.id, attempt);
            let ctx = self.step_context(node, attempt, policy.max_attempts, iteration);
            let result = match body {
                NodeBody::Step { run, .. } => {
                    Attempt::from_result(catch_panic(async move { run(ctx).await }).await.map(|()| true))
                }
                NodeBody::Check { predicate, .. } => {
                    Attempt::from_result(catch_panic(async move { predicate(ctx).await }).await)
                }
                NodeBody::Map { .. } => Attempt::Errored(anyhow::anyhow!("map node '{}' cannot run as a leaf", node.id)),
            };

            let refuted = matches!(result, Attempt::Refuted);
            let error = match result {
                Attempt::Passed => return finish(NodeStatus::Success, attempt, None, None),
                Attempt::Cancelled => {
                    return finish(NodeStatus::Skipped, attempt, Some(SerializedError::from_error(&Cancelled)), None);
                }
                Attempt::Refuted => SerializedError::from_message(refutation_message(body, node)),
                Attempt::Errored(error) => SerializedError::from_error(&*error),
            };

            if attempt < policy.max_attempts {
                warn!(
                    node_id = %node.id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = policy.backoff_ms,
                    error = %error,
                    "attempt failed; retrying"
                );
                self.runtime.emitter.emit(RunEventPayload::NodeRetrying {
                    node_id: node.id.clone(),
                    node_title: node.title.clone(),
                    attempt,
                    max_attempts: policy.max_attempts,
                    backoff_ms: policy.backoff_ms,
                    error,
                });
                let backoff = Duration::from_millis(policy.backoff_ms);
                if self.runtime.gate.sleep(&node.id, backoff).await.is_err() {
                    return finish(NodeStatus::Skipped, attempt, Some(SerializedError::from_error(&Cancelled)), None);
                }
                attempt += 1;
                continue;
            }

            let soft_fail = matches!(body, NodeBody::Check { soft_fail: true, .. });
            let message = refuted.then(|| error.message.clone());
            if refuted && soft_fail {
                info!(node_id = %node.id, attempts = attempt, "check refuted; continuing with a warning");
                return finish(NodeStatus::Warning, attempt, Some(error), message);
            }
            return finish(NodeStatus::Failure, attempt, Some(error), message);
        }
    }

    fn announce_leaf(&self, node: &GraphNode, max_attempts: u32, iteration: Option<&IterationScope>) {
        info!(node_id = %node.id, kind = %node.kind, max_attempts, "node started");
        let Some(scope) = iteration else {
            self.runtime.emitter.emit(RunEventPayload::NodeStarted {
                node_id: node.id.clone(),
                node_title: node.title.clone(),
                kind: node.kind,
                attempt: 1,
                max_attempts,
            });
            return;
        };

        let loop_ctx = &scope.loop_ctx;
        self.runtime.emitter.emit(RunEventPayload::TemplateStepStarted {
            map_node_id: loop_ctx.map_node_id.clone(),
            iteration_id: loop_ctx.iteration_id.clone(),
            template_node_id: node.id.clone(),
            attempt: 1,
            max_attempts,
        });
        self.runtime.emitter.emit(RunEventPayload::MapProgress {
            map_node_id: loop_ctx.map_node_id.clone(),
            counts: scope.counts,
            spotlight: Some(MapSpotlight {
                iteration_id: loop_ctx.iteration_id.clone(),
                index: loop_ctx.index,
                key: loop_ctx.key.clone(),
                active_template_node_id: Some(node.id.clone()),
            }),
        });
    }

    fn step_context(&self, node: &GraphNode, attempt: u32, max_attempts: u32, iteration: Option<&IterationScope>) -> StepContext {
        let loop_ctx = iteration.map(|scope| scope.loop_ctx.clone());
        StepContext {
            node_id: node.id.clone(),
            node_title: node.title.clone(),
            run_id: self.runtime.run_id.clone(),
            inputs: Arc::clone(&self.inputs),
            attempt,
            max_attempts,
            run: self.run_store.clone(),
            log: NodeLogger::new(node.id.clone(), self.runtime.emitter.clone(), loop_ctx.as_ref()),
            iteration: iteration.map(|scope| scope.store.clone()),
            loop_ctx,
            runtime: Arc::clone(&self.runtime),
        }
    }
}

fn refutation_message(body: &NodeBody, node: &GraphNode) -> String {
    match body {
        NodeBody::Check {
            message: Some(message), ..
        } => message.clone(),
        _ => format!("check '{}' did not pass", node.title),
    }
}

/// Turns a panicking body into an ordinary node failure. Bodies are invoked
/// inside `body` so a panic before the first await is caught as well.
pub(super) async fn catch_panic<T>(body: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "node body panicked");
            Err(anyhow::anyhow!("panicked: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Runtime closures registered by the builder, keyed by node id.

use std::{fmt, future::Future, sync::Arc};

use futures_util::{FutureExt, future::BoxFuture};
use serde_json::Value;
use stepforge_types::{MapErrorPolicy, NodeKind, RetryPolicy};

use crate::context::{MapItemsContext, StepContext};

pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type CheckFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;
pub type ItemsFn = Arc<dyn Fn(MapItemsContext) -> BoxFuture<'static, anyhow::Result<Vec<Value>>> + Send + Sync>;
/// Derives a display label for one map item.
pub type KeyFn = Arc<dyn Fn(&Value, usize) -> String + Send + Sync>;

/// Executable payload of a step, check or map node.
#[derive(Clone)]
pub enum NodeBody {
    Step {
        run: StepFn,
        retry: RetryPolicy,
    },
    Check {
        predicate: CheckFn,
        retry: RetryPolicy,
        soft_fail: bool,
        message: Option<String>,
    },
    Map {
        items: ItemsFn,
        key: Option<KeyFn>,
        on_error: MapErrorPolicy,
    },
}

impl NodeBody {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Step { .. } => NodeKind::Step,
            Self::Check { .. } => NodeKind::Check,
            Self::Map { .. } => NodeKind::Map,
        }
    }

    /// Retry policy of a leaf body; maps always run once.
    pub fn retry(&self) -> RetryPolicy {
        match self {
            Self::Step { retry, .. } | Self::Check { retry, .. } => *retry,
            Self::Map { .. } => RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for NodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step { retry, .. } => f.debug_struct("Step").field("retry", retry).finish_non_exhaustive(),
            Self::Check {
                retry,
                soft_fail,
                message,
                ..
            } => f
                .debug_struct("Check")
                .field("retry", retry)
                .field("soft_fail", soft_fail)
                .field("message", message)
                .finish_non_exhaustive(),
            Self::Map { key, on_error, .. } => f
                .debug_struct("Map")
                .field("keyed", &key.is_some())
                .field("on_error", on_error)
                .finish_non_exhaustive(),
        }
    }
}

pub(crate) fn boxed_step<F, Fut>(body: F) -> StepFn
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| body(ctx).boxed())
}

pub(crate) fn boxed_check<F, Fut>(predicate: F) -> CheckFn
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |ctx| predicate(ctx).boxed())
}

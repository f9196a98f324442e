//! Per-call options accepted by the builder.

use std::{future::Future, sync::Arc};

use futures_util::FutureExt;
use serde_json::Value;
use stepforge_types::{AwsMeta, MapErrorPolicy, NodeMeta, RetryPolicy, UiMeta};

use super::body::{ItemsFn, KeyFn};
use crate::context::MapItemsContext;

/// Descriptive metadata shared by every node kind.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub icon: Option<String>,
    pub aws_service: Option<String>,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn aws_service(mut self, service: impl Into<String>) -> Self {
        self.aws_service = Some(service.into());
        self
    }

    pub(crate) fn into_meta(self) -> NodeMeta {
        NodeMeta {
            description: self.description,
            tags: self.tags,
            ui: self.icon.map(|icon| UiMeta { icon: Some(icon) }),
            aws: self.aws_service.map(|service| AwsMeta { service: Some(service) }),
            ..NodeMeta::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub node: NodeOptions,
    pub retry: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows up to `max_attempts` invocations with `backoff_ms` between them.
    pub fn retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = Some(RetryPolicy::new(max_attempts, backoff_ms));
        self
    }

    pub fn node(mut self, node: NodeOptions) -> Self {
        self.node = node;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub node: NodeOptions,
    /// Attached to the failure when the predicate returns false.
    pub message: Option<String>,
    /// A refuted check becomes a warning instead of failing the run.
    pub soft_fail: bool,
    pub retry: Option<RetryPolicy>,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn soft_fail(mut self) -> Self {
        self.soft_fail = true;
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = Some(RetryPolicy::new(max_attempts, backoff_ms));
        self
    }

    pub fn node(mut self, node: NodeOptions) -> Self {
        self.node = node;
        self
    }
}

/// Options of a map node. `items` is evaluated at run time, never at build time.
#[derive(Clone)]
pub struct MapOptions {
    pub(crate) items: ItemsFn,
    pub(crate) key: Option<KeyFn>,
    pub(crate) on_error: MapErrorPolicy,
    pub(crate) max_concurrency: Option<u32>,
    pub(crate) node: NodeOptions,
}

impl MapOptions {
    pub fn new<F, Fut>(items: F) -> Self
    where
        F: Fn(MapItemsContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send + 'static,
    {
        Self {
            items: Arc::new(move |ctx| items(ctx).boxed()),
            key: None,
            on_error: MapErrorPolicy::default(),
            max_concurrency: None,
            node: NodeOptions::default(),
        }
    }

    /// A fixed item list known at declaration time.
    pub fn fixed(items: Vec<Value>) -> Self {
        Self::new(move |_| {
            let items = items.clone();
            async move { Ok(items) }
        })
    }

    pub fn key(mut self, key: impl Fn(&Value, usize) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn on_error(mut self, policy: MapErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn continue_on_error(self) -> Self {
        self.on_error(MapErrorPolicy::Continue)
    }

    /// Only `1` is accepted; anything else fails the build.
    pub fn max_concurrency(mut self, value: u32) -> Self {
        self.max_concurrency = Some(value);
        self
    }

    pub fn node(mut self, node: NodeOptions) -> Self {
        self.node = node;
        self
    }
}

impl std::fmt::Debug for MapOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapOptions")
            .field("keyed", &self.key.is_some())
            .field("on_error", &self.on_error)
            .field("max_concurrency", &self.max_concurrency)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

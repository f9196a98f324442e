//! Turns an imperative declaration into a [`WorkflowGraph`] plus a closure table.
//!
//! Build state is threaded explicitly through nested builders: each builder
//! borrows the shared [`BuildState`] and owns its scope cursor (parent id,
//! next ordinal, previous sibling). Node ids are a pure function of that
//! position, `"{parent}/{kind}-{ordinal}"`, so rebuilding the same structural
//! shape yields the same ids even when titles change.

use std::{collections::HashMap, future::Future};

use indexmap::IndexMap;
use stepforge_types::{CheckMeta, GraphEdge, GraphError, GraphNode, MapMeta, NodeKind, NodeMeta, RetryPolicy, WorkflowGraph};
use thiserror::Error;

mod body;
mod options;

pub use body::{CheckFn, ItemsFn, KeyFn, NodeBody, StepFn};
pub use options::{CheckOptions, MapOptions, NodeOptions, StepOptions};

use crate::context::StepContext;
use body::{boxed_check, boxed_step};

pub const ROOT_ID: &str = "root";

/// Malformed declaration detected before any run starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("map '{node}' requests maxConcurrency {value}; iterations only run sequentially (1)")]
    UnsupportedConcurrency { node: String, value: u32 },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Accumulates nodes, edges and bodies during the single build pass.
pub(crate) struct BuildState {
    nodes: IndexMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    bodies: HashMap<String, NodeBody>,
    error: Option<BuildError>,
}

impl BuildState {
    pub(crate) fn new(root_title: &str) -> Self {
        let mut nodes = IndexMap::new();
        nodes.insert(
            ROOT_ID.to_string(),
            GraphNode {
                id: ROOT_ID.to_string(),
                kind: NodeKind::Root,
                title: root_title.to_string(),
                parent_id: None,
                meta: NodeMeta::default(),
            },
        );
        Self {
            nodes,
            edges: Vec::new(),
            bodies: HashMap::new(),
            error: None,
        }
    }

    /// Finalizes into a validated graph and its closure table.
    pub(crate) fn finish(
        self,
        workflow_id: &str,
        name: &str,
        version: &str,
    ) -> Result<(WorkflowGraph, HashMap<String, NodeBody>), BuildError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let graph = WorkflowGraph {
            workflow_id: workflow_id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            root_id: ROOT_ID.to_string(),
            nodes: self.nodes,
            edges: self.edges,
        };
        graph.validate()?;
        Ok((graph, self.bodies))
    }

    fn fail(&mut self, error: BuildError) {
        self.error.get_or_insert(error);
    }

    fn register(&mut self, scope: &mut Scope, kind: NodeKind, title: String, meta: NodeMeta, body: Option<NodeBody>) -> String {
        let id = format!("{}/{}-{}", scope.parent_id, kind, scope.ordinal);
        scope.ordinal += 1;

        self.nodes.insert(
            id.clone(),
            GraphNode {
                id: id.clone(),
                kind,
                title,
                parent_id: Some(scope.parent_id.clone()),
                meta,
            },
        );
        if let Some(previous) = scope.previous.replace(id.clone()) {
            self.edges.push(GraphEdge::sequence(previous, id.clone()));
        }
        if let Some(body) = body {
            self.bodies.insert(id.clone(), body);
        }
        id
    }

    fn register_step<F, Fut>(&mut self, scope: &mut Scope, title: String, options: StepOptions, body: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let retry = options.retry.unwrap_or_default();
        let mut meta = options.node.into_meta();
        meta.retry = options.retry;
        let body = NodeBody::Step {
            run: boxed_step(body),
            retry,
        };
        self.register(scope, NodeKind::Step, title, meta, Some(body))
    }

    fn register_check<F, Fut>(&mut self, scope: &mut Scope, title: String, options: CheckOptions, predicate: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let retry = options.retry.unwrap_or_default();
        let mut meta = options.node.into_meta();
        meta.retry = options.retry;
        meta.check = Some(CheckMeta {
            message: options.message.clone(),
            soft_fail: options.soft_fail,
        });
        let body = NodeBody::Check {
            predicate: boxed_check(predicate),
            retry,
            soft_fail: options.soft_fail,
            message: options.message,
        };
        self.register(scope, NodeKind::Check, title, meta, Some(body))
    }
}

/// Cursor of one parent scope.
struct Scope {
    parent_id: String,
    ordinal: usize,
    previous: Option<String>,
}

impl Scope {
    fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            ordinal: 0,
            previous: None,
        }
    }
}

/// Builder handed to a workflow declaration and to every nested group.
pub struct WorkflowBuilder<'s> {
    state: &'s mut BuildState,
    scope: Scope,
}

impl<'s> WorkflowBuilder<'s> {
    pub(crate) fn root(state: &'s mut BuildState) -> Self {
        Self {
            state,
            scope: Scope::new(ROOT_ID),
        }
    }

    /// Id of the scope nodes are currently added to.
    pub fn parent_id(&self) -> &str {
        &self.scope.parent_id
    }

    pub fn step<F, Fut>(&mut self, title: impl Into<String>, body: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.step_with(title, StepOptions::default(), body)
    }

    pub fn step_with<F, Fut>(&mut self, title: impl Into<String>, options: StepOptions, body: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state.register_step(&mut self.scope, title.into(), options, body)
    }

    pub fn check<F, Fut>(&mut self, title: impl Into<String>, predicate: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.check_with(title, CheckOptions::default(), predicate)
    }

    pub fn check_with<F, Fut>(&mut self, title: impl Into<String>, options: CheckOptions, predicate: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.state.register_check(&mut self.scope, title.into(), options, predicate)
    }

    /// Opens a nested scope. The group occupies one slot in this scope's sequence.
    pub fn group(&mut self, title: impl Into<String>, build: impl FnOnce(&mut WorkflowBuilder<'_>)) -> String {
        self.group_with(title, NodeOptions::default(), build)
    }

    pub fn group_with(
        &mut self,
        title: impl Into<String>,
        options: NodeOptions,
        build: impl FnOnce(&mut WorkflowBuilder<'_>),
    ) -> String {
        let id = self
            .state
            .register(&mut self.scope, NodeKind::Group, title.into(), options.into_meta(), None);
        let mut nested = WorkflowBuilder {
            state: &mut *self.state,
            scope: Scope::new(id.clone()),
        };
        build(&mut nested);
        id
    }

    /// Registers a map node and its template. The template is declared once
    /// and executed once per item at run time.
    pub fn map(&mut self, title: impl Into<String>, options: MapOptions, build: impl FnOnce(&mut LoopBuilder<'_>)) -> String {
        let MapOptions {
            items,
            key,
            on_error,
            max_concurrency,
            node,
        } = options;

        let mut meta = node.into_meta();
        meta.map = Some(MapMeta { on_error, max_concurrency });
        let body = NodeBody::Map { items, key, on_error };
        let id = self
            .state
            .register(&mut self.scope, NodeKind::Map, title.into(), meta, Some(body));

        if let Some(value) = max_concurrency.filter(|value| *value != 1) {
            self.state.fail(BuildError::UnsupportedConcurrency { node: id.clone(), value });
        }

        let mut template = LoopBuilder {
            state: &mut *self.state,
            scope: Scope::new(id.clone()),
        };
        build(&mut template);
        id
    }
}

/// Builder for a map template: steps and checks only.
pub struct LoopBuilder<'s> {
    state: &'s mut BuildState,
    scope: Scope,
}

impl LoopBuilder<'_> {
    /// Id of the owning map node.
    pub fn map_id(&self) -> &str {
        &self.scope.parent_id
    }

    pub fn step<F, Fut>(&mut self, title: impl Into<String>, body: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.step_with(title, StepOptions::default(), body)
    }

    pub fn step_with<F, Fut>(&mut self, title: impl Into<String>, options: StepOptions, body: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state.register_step(&mut self.scope, title.into(), options, body)
    }

    pub fn check<F, Fut>(&mut self, title: impl Into<String>, predicate: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.check_with(title, CheckOptions::default(), predicate)
    }

    pub fn check_with<F, Fut>(&mut self, title: impl Into<String>, options: CheckOptions, predicate: F) -> String
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.state.register_check(&mut self.scope, title.into(), options, predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepforge_types::EdgeType;

    fn build(declare: impl FnOnce(&mut WorkflowBuilder<'_>)) -> Result<(WorkflowGraph, HashMap<String, NodeBody>), BuildError> {
        let mut state = BuildState::new("Test");
        declare(&mut WorkflowBuilder::root(&mut state));
        state.finish("wf", "Test", "1")
    }

    #[test]
    fn ids_follow_declaration_position() {
        let (graph, bodies) = build(|wf| {
            wf.step("Fetch", |_| async { Ok(()) });
            wf.group("Deploy", |group| {
                group.step("Push", |_| async { Ok(()) });
                group.check("Healthy", |_| async { Ok(true) });
            });
            wf.map("Regions", MapOptions::fixed(vec![json!("a")]), |template| {
                template.step("Provision", |_| async { Ok(()) });
            });
        })
        .expect("valid declaration");

        let ids: Vec<_> = graph.nodes.keys().cloned().collect();
        assert_eq!(
            ids,
            vec![
                "root",
                "root/step-0",
                "root/group-1",
                "root/group-1/step-0",
                "root/group-1/check-1",
                "root/map-2",
                "root/map-2/step-0",
            ]
        );
        assert_eq!(bodies.len(), 5);
        assert!(!bodies.contains_key("root/group-1"));
        assert_eq!(bodies["root/map-2"].kind(), NodeKind::Map);
    }

    #[test]
    fn siblings_are_chained_by_sequence_edges() {
        let (graph, _) = build(|wf| {
            wf.step("A", |_| async { Ok(()) });
            wf.group("G", |group| {
                group.step("G1", |_| async { Ok(()) });
                group.step("G2", |_| async { Ok(()) });
            });
            wf.step("B", |_| async { Ok(()) });
        })
        .expect("valid declaration");

        let pairs: Vec<_> = graph
            .edges
            .iter()
            .map(|edge| {
                assert_eq!(edge.edge_type, EdgeType::Sequence);
                (edge.from.as_str(), edge.to.as_str())
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("root/step-0", "root/group-1"),
                ("root/group-1/step-0", "root/group-1/step-1"),
                ("root/group-1", "root/step-2"),
            ]
        );
        assert_eq!(graph.execution_order()["root"], vec!["root/step-0", "root/group-1", "root/step-2"]);
    }

    #[test]
    fn policies_are_mirrored_into_meta() {
        let (graph, bodies) = build(|wf| {
            wf.step_with(
                "Flaky",
                StepOptions::new().retry(3, 100).node(NodeOptions::new().icon("cloud").aws_service("ec2")),
                |_| async { Ok(()) },
            );
            wf.check_with("Gate", CheckOptions::new().message("not ready").soft_fail(), |_| async { Ok(false) });
        })
        .expect("valid declaration");

        let step = graph.node("root/step-0").expect("step");
        assert_eq!(step.meta.retry, Some(RetryPolicy::new(3, 100)));
        assert_eq!(step.meta.aws.as_ref().and_then(|aws| aws.service.as_deref()), Some("ec2"));
        assert_eq!(bodies["root/step-0"].retry().max_attempts, 3);

        let check = graph.node("root/check-1").expect("check");
        assert_eq!(
            check.meta.check,
            Some(CheckMeta {
                message: Some("not ready".into()),
                soft_fail: true
            })
        );
    }

    #[test]
    fn rejects_parallel_map() {
        for value in [0, 2, 8] {
            let error = build(|wf| {
                wf.map("Fan out", MapOptions::fixed(vec![]).max_concurrency(value), |template| {
                    template.step("Work", |_| async { Ok(()) });
                });
            })
            .expect_err("parallel maps are rejected");
            assert_eq!(
                error,
                BuildError::UnsupportedConcurrency {
                    node: "root/map-0".into(),
                    value
                }
            );
        }

        build(|wf| {
            wf.map("Serial", MapOptions::fixed(vec![]).max_concurrency(1), |_| {});
        })
        .expect("a concurrency of one is accepted");
    }
}

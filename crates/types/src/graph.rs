//! Immutable workflow graph produced by the builder.
//!
//! A graph is a containment tree (via `parent_id`) plus a set of ordering edges.
//! `sequence` edges chain siblings in declaration order; the engine walks that
//! chain per parent scope. `depends_on` edges are reserved for cross-branch
//! dependencies and are only validated, never scheduled.
//!
//! Nodes are kept in an [`IndexMap`] so serialization and iteration preserve
//! declaration order, which keeps rendered graphs and skip sweeps stable.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod validation;

pub use validation::GraphError;

/// Closed set of node kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Group,
    Step,
    Map,
    Check,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Group => "group",
            Self::Step => "step",
            Self::Map => "map",
            Self::Check => "check",
        }
    }

    /// Kinds that may enclose other nodes.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Root | Self::Group | Self::Map)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One vertex of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Stable identifier derived from the node's position in the declaration.
    pub id: String,
    pub kind: NodeKind,
    /// Display string; never used for identity.
    pub title: String,
    /// Enclosing group, map, or root. `None` only for the root.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "NodeMeta::is_empty")]
    pub meta: NodeMeta,
}

/// Descriptive payload attached to a node for observers.
///
/// The engine never branches on this data; policies that drive execution live
/// next to the node bodies and are mirrored here for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckMeta>,
}

impl NodeMeta {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UiMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AwsMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Per-node retry policy. `max_attempts` counts the first attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

/// How a map reacts to a failed iteration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MapErrorPolicy {
    /// Stop at the first failed iteration; later items are skipped.
    #[default]
    FailFast,
    /// Run every iteration; the map fails afterwards if any iteration failed.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MapMeta {
    pub on_error: MapErrorPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub soft_fail: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Sequence,
    DependsOn,
}

/// Ordering constraint between two node ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
}

impl GraphEdge {
    pub fn sequence(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            edge_type: EdgeType::Sequence,
        }
    }
}

/// The built, immutable graph for one (workflow, content version) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub workflow_id: String,
    pub name: String,
    pub version: String,
    pub root_id: String,
    pub nodes: IndexMap<String, GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Direct children of `parent_id` in declaration order.
    pub fn children<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a GraphNode> + 'a {
        self.nodes
            .values()
            .filter(move |node| node.parent_id.as_deref() == Some(parent_id))
    }

    /// Execution order of every container scope, keyed by container id.
    ///
    /// Each scope lists its children by following the `sequence` chain from the
    /// child without an incoming edge. Children that a malformed chain does not
    /// reach are appended in declaration order; [`WorkflowGraph::validate`]
    /// rejects such graphs before they are ever executed.
    pub fn execution_order(&self) -> HashMap<String, Vec<String>> {
        let mut next_sibling: HashMap<&str, &str> = HashMap::new();
        let mut has_predecessor: HashMap<&str, bool> = HashMap::new();
        for edge in self.edges.iter().filter(|edge| edge.edge_type == EdgeType::Sequence) {
            next_sibling.insert(edge.from.as_str(), edge.to.as_str());
            has_predecessor.insert(edge.to.as_str(), true);
        }

        let mut scopes: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for node in self.nodes.values() {
            if node.kind.is_container() {
                scopes.entry(node.id.as_str()).or_default();
            }
            if let Some(parent_id) = node.parent_id.as_deref() {
                scopes.entry(parent_id).or_default().push(node.id.as_str());
            }
        }

        scopes
            .into_iter()
            .map(|(parent_id, children)| {
                let mut ordered: Vec<String> = Vec::with_capacity(children.len());
                if let Some(head) = children.iter().find(|child| !has_predecessor.contains_key(*child)) {
                    let mut cursor = Some(*head);
                    while let Some(current) = cursor {
                        if ordered.iter().any(|seen| seen == current) || !children.contains(&current) {
                            break;
                        }
                        ordered.push(current.to_string());
                        cursor = next_sibling.get(current).copied();
                    }
                }
                for child in &children {
                    if !ordered.iter().any(|seen| seen == child) {
                        ordered.push((*child).to_string());
                    }
                }
                (parent_id.to_string(), ordered)
            })
            .collect()
    }

    /// Checks the structural invariants of the graph.
    pub fn validate(&self) -> Result<(), GraphError> {
        validation::validate_graph(self)
    }
}

//! Structural checks run once when a graph is built.
//!
//! A graph that passes these checks has a single root, a containment tree in
//! which every parent is a container kind, and exactly one linear `sequence`
//! chain per container scope.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::{EdgeType, NodeKind, WorkflowGraph};

/// Structural invariant violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("root node '{0}' is missing")]
    MissingRoot(String),
    #[error("root node '{0}' must have kind root and no parent")]
    MalformedRoot(String),
    #[error("node '{node}' is keyed as '{key}'")]
    MismatchedKey { key: String, node: String },
    #[error("node '{node}' has no parent")]
    Orphan { node: String },
    #[error("node '{node}' references unknown parent '{parent}'")]
    UnknownParent { node: String, parent: String },
    #[error("node '{node}' has parent '{parent}' of kind {kind}, which cannot contain nodes")]
    InvalidParentKind { node: String, parent: String, kind: NodeKind },
    #[error("parent chain of node '{node}' does not reach the root")]
    ParentCycle { node: String },
    #[error("edge '{from}' -> '{to}' references an unknown node")]
    UnknownEdgeEndpoint { from: String, to: String },
    #[error("sequence edge '{from}' -> '{to}' crosses parent scopes")]
    SequenceCrossesScope { from: String, to: String },
    #[error("node '{node}' has more than one sequence successor")]
    SequenceBranch { node: String },
    #[error("node '{node}' has more than one sequence predecessor")]
    SequenceMerge { node: String },
    #[error("sequence chain under '{parent}' does not cover every child exactly once")]
    SequenceBroken { parent: String },
}

pub(crate) fn validate_graph(graph: &WorkflowGraph) -> Result<(), GraphError> {
    let root = graph
        .nodes
        .get(&graph.root_id)
        .ok_or_else(|| GraphError::MissingRoot(graph.root_id.clone()))?;
    if root.kind != NodeKind::Root || root.parent_id.is_some() {
        return Err(GraphError::MalformedRoot(root.id.clone()));
    }

    for (key, node) in &graph.nodes {
        if key != &node.id {
            return Err(GraphError::MismatchedKey {
                key: key.clone(),
                node: node.id.clone(),
            });
        }
        if node.id == graph.root_id {
            continue;
        }
        if node.kind == NodeKind::Root {
            return Err(GraphError::MalformedRoot(node.id.clone()));
        }
        let parent_id = node.parent_id.as_ref().ok_or_else(|| GraphError::Orphan { node: node.id.clone() })?;
        let parent = graph.nodes.get(parent_id).ok_or_else(|| GraphError::UnknownParent {
            node: node.id.clone(),
            parent: parent_id.clone(),
        })?;
        if !parent.kind.is_container() {
            return Err(GraphError::InvalidParentKind {
                node: node.id.clone(),
                parent: parent.id.clone(),
                kind: parent.kind,
            });
        }
    }

    check_parent_chains(graph)?;
    check_sequence_chains(graph)
}

fn check_parent_chains(graph: &WorkflowGraph) -> Result<(), GraphError> {
    let limit = graph.nodes.len();
    for node in graph.nodes.values() {
        let mut cursor = node;
        let mut hops = 0usize;
        while let Some(parent_id) = cursor.parent_id.as_ref() {
            hops += 1;
            if hops > limit {
                return Err(GraphError::ParentCycle { node: node.id.clone() });
            }
            cursor = &graph.nodes[parent_id.as_str()];
        }
        if cursor.id != graph.root_id {
            return Err(GraphError::ParentCycle { node: node.id.clone() });
        }
    }
    Ok(())
}

fn check_sequence_chains(graph: &WorkflowGraph) -> Result<(), GraphError> {
    let mut successors: HashMap<&str, &str> = HashMap::new();
    let mut predecessors: HashSet<&str> = HashSet::new();

    for edge in &graph.edges {
        let (Some(from), Some(to)) = (graph.nodes.get(&edge.from), graph.nodes.get(&edge.to)) else {
            return Err(GraphError::UnknownEdgeEndpoint {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        };
        if edge.edge_type != EdgeType::Sequence {
            continue;
        }
        if from.parent_id != to.parent_id || from.id == to.id {
            return Err(GraphError::SequenceCrossesScope {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
        if successors.insert(from.id.as_str(), to.id.as_str()).is_some() {
            return Err(GraphError::SequenceBranch { node: from.id.clone() });
        }
        if !predecessors.insert(to.id.as_str()) {
            return Err(GraphError::SequenceMerge { node: to.id.clone() });
        }
    }

    let mut scopes: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in graph.nodes.values() {
        if let Some(parent_id) = node.parent_id.as_deref() {
            scopes.entry(parent_id).or_default().push(node.id.as_str());
        }
    }

    for (parent_id, children) in scopes {
        let heads: Vec<&str> = children
            .iter()
            .copied()
            .filter(|child| !predecessors.contains(child))
            .collect();
        let [head] = heads.as_slice() else {
            return Err(GraphError::SequenceBroken {
                parent: parent_id.to_string(),
            });
        };

        let mut visited = 1usize;
        let mut cursor = *head;
        while let Some(next) = successors.get(cursor) {
            visited += 1;
            if visited > children.len() {
                break;
            }
            cursor = *next;
        }
        if visited != children.len() {
            return Err(GraphError::SequenceBroken {
                parent: parent_id.to_string(),
            });
        }
    }

    Ok(())
}

//! Workflow definitions and their built form.

use std::{collections::HashMap, fmt, sync::Arc};

use stepforge_types::{InputParameter, WorkflowGraph};
use tracing::debug;

use crate::builder::{BuildError, BuildState, NodeBody, WorkflowBuilder};

type DeclareFn = Arc<dyn Fn(&mut WorkflowBuilder<'_>) + Send + Sync>;

/// A named declaration that can be built into a graph any number of times.
#[derive(Clone)]
pub struct WorkflowDefinition {
    name: String,
    inputs: Vec<InputParameter>,
    declare: DeclareFn,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, declare: impl Fn(&mut WorkflowBuilder<'_>) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            declare: Arc::new(declare),
        }
    }

    pub fn with_input(mut self, input: InputParameter) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[InputParameter] {
        &self.inputs
    }

    /// Runs the declaration once and validates the resulting graph.
    ///
    /// Bodies are only registered here, never invoked.
    pub fn build_graph(&self, workflow_id: &str, version: &str) -> Result<BuiltWorkflow, BuildError> {
        let mut state = BuildState::new(&self.name);
        (self.declare)(&mut WorkflowBuilder::root(&mut state));
        let (graph, bodies) = state.finish(workflow_id, &self.name, version)?;
        debug!(workflow_id, version, nodes = graph.nodes.len(), "built workflow graph");
        Ok(BuiltWorkflow {
            graph,
            bodies,
            inputs: self.inputs.clone(),
        })
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// A validated graph together with the closures that execute its nodes.
#[derive(Debug, Clone)]
pub struct BuiltWorkflow {
    pub graph: WorkflowGraph,
    pub bodies: HashMap<String, NodeBody>,
    pub inputs: Vec<InputParameter>,
}

impl BuiltWorkflow {
    pub fn body(&self, node_id: &str) -> Option<&NodeBody> {
        self.bodies.get(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepforge_types::InputParameter;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("Release", |wf| {
            wf.step("Build", |_| async { Ok(()) });
            wf.group("Ship", |group| {
                group.step("Upload", |_| async { Ok(()) });
            });
        })
        .with_input(InputParameter::string("channel", "Channel").with_default("beta"))
    }

    #[test]
    fn rebuilding_yields_identical_graphs() {
        let definition = definition();
        let first = definition.build_graph("release", "1").expect("build");
        let second = definition.build_graph("release", "1").expect("rebuild");

        assert_eq!(first.graph, second.graph);
        assert_eq!(first.inputs, definition.inputs());
    }

    #[test]
    fn version_is_stamped_on_the_graph() {
        let built = definition().build_graph("release", "abc123").expect("build");
        assert_eq!(built.graph.version, "abc123");
        assert_eq!(built.graph.name, "Release");
        assert!(built.body("root/group-1/step-0").is_some());
    }
}

//! Built-in workflow catalog exposed by the `stepforge` binary.

use anyhow::{Result, bail};
use stepforge_engine::WorkflowDefinition;

mod checks;
mod deployment;
mod map_example;
mod retry_demo;
mod shared_state;

/// Content version stamped on every catalog graph.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct CatalogEntry {
    pub id: &'static str,
    pub definition: WorkflowDefinition,
}

pub fn catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            id: "aws-deployment",
            definition: deployment::definition(),
        },
        CatalogEntry {
            id: "map-example",
            definition: map_example::definition(),
        },
        CatalogEntry {
            id: "retry-demo",
            definition: retry_demo::definition(),
        },
        CatalogEntry {
            id: "shared-state",
            definition: shared_state::definition(),
        },
        CatalogEntry {
            id: "health-checks",
            definition: checks::definition(),
        },
    ]
}

pub fn find(id: &str) -> Result<CatalogEntry> {
    match catalog().into_iter().find(|entry| entry.id == id) {
        Some(entry) => Ok(entry),
        None => {
            let known: Vec<&str> = catalog().iter().map(|entry| entry.id).collect();
            bail!("unknown workflow '{id}' (available: {})", known.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use stepforge_engine::{CollectingSink, RunOptions, execute};
    use stepforge_types::RunOutcome;

    use super::*;

    #[test]
    fn catalog_ids_are_unique_and_graphs_build() {
        let entries = catalog();
        let ids: HashSet<&str> = entries.iter().map(|entry| entry.id).collect();
        assert_eq!(ids.len(), entries.len());
        for entry in &entries {
            let built = entry.definition.build_graph(entry.id, VERSION).expect("catalog graph builds");
            assert_eq!(built.graph.workflow_id, entry.id);
            assert!(built.graph.nodes.len() > 1, "{} has no nodes", entry.id);
        }
    }

    #[test]
    fn unknown_id_lists_the_catalog() {
        let error = find("nope").err().expect("unknown id rejected");
        assert!(error.to_string().contains("retry-demo"), "{error}");
    }

    #[tokio::test(start_paused = true)]
    async fn every_catalog_workflow_succeeds_with_defaults() {
        for entry in catalog() {
            let built = entry.definition.build_graph(entry.id, VERSION).expect("graph");
            let sink = CollectingSink::new();
            let report = execute(&built, Default::default(), RunOptions::new("test-run").events(sink))
                .await
                .expect("run executes");
            assert_eq!(report.outcome, RunOutcome::Success, "{} did not succeed: {:?}", entry.id, report.error);
        }
    }
}

mod common;

use common::{Calls, count, run};
use serde_json::{Value, json};
use stepforge_engine::{MapOptions, StepOptions, WorkflowDefinition};
use stepforge_types::{IterationStatus, MapStatus, NodeStatus, RunEvent, RunEventPayload, RunOutcome};

fn item_ends(events: &[RunEvent]) -> Vec<(usize, IterationStatus)> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            RunEventPayload::MapItemFinished { index, status, .. } => Some((*index, *status)),
            _ => None,
        })
        .collect()
}

fn map_end(events: &[RunEvent]) -> (MapStatus, stepforge_types::MapCounts) {
    events
        .iter()
        .find_map(|event| match &event.payload {
            RunEventPayload::MapFinished { status, counts, .. } => Some((*status, *counts)),
            _ => None,
        })
        .expect("map:end emitted")
}

fn failing_on_two(options: MapOptions, calls: Calls) -> WorkflowDefinition {
    WorkflowDefinition::new("Map", move |wf| {
        let calls = calls.clone();
        wf.map("Items", options.clone(), move |template| {
            template.step("Process", move |ctx| {
                let calls = calls.clone();
                async move {
                    calls.hit();
                    let item: i64 = ctx.require_loop()?.item_as()?;
                    if item == 2 {
                        anyhow::bail!("item {item} rejected");
                    }
                    Ok(())
                }
            });
        });
        wf.step("After map", |_| async { Ok(()) });
    })
}

#[tokio::test]
async fn continue_policy_runs_every_iteration() {
    let calls = Calls::default();
    let options = MapOptions::fixed(vec![json!(1), json!(2), json!(3)]).continue_on_error();
    let (report, events) = run(&failing_on_two(options, calls.clone())).await;

    assert_eq!(calls.get(), 3);
    assert_eq!(
        item_ends(&events),
        vec![
            (0, IterationStatus::Success),
            (1, IterationStatus::Failed),
            (2, IterationStatus::Success)
        ]
    );
    let (status, counts) = map_end(&events);
    assert_eq!(status, MapStatus::Failed);
    assert_eq!((counts.completed, counts.failed, counts.skipped, counts.pending), (2, 1, 0, 0));
    assert_eq!(report.status("root/map-0"), Some(NodeStatus::Failure));
    assert_eq!(report.status("root/map-0/step-0"), Some(NodeStatus::Failure));
    assert_eq!(report.status("root/step-1"), Some(NodeStatus::Skipped));
    assert_eq!(report.outcome, RunOutcome::Failure);
    assert_eq!(report.iteration_statuses["root/map-0"]["root/map-0#1"], IterationStatus::Failed);
}

#[tokio::test]
async fn fail_fast_policy_skips_later_items() {
    let calls = Calls::default();
    let options = MapOptions::fixed(vec![json!(1), json!(2), json!(3), json!(4)]);
    let (report, events) = run(&failing_on_two(options, calls.clone())).await;

    assert_eq!(calls.get(), 2);
    assert_eq!(
        item_ends(&events),
        vec![
            (0, IterationStatus::Success),
            (1, IterationStatus::Failed),
            (2, IterationStatus::Skipped),
            (3, IterationStatus::Skipped)
        ]
    );
    let (status, counts) = map_end(&events);
    assert_eq!(status, MapStatus::Failed);
    assert_eq!((counts.completed, counts.failed, counts.skipped), (1, 1, 2));
    assert_eq!(report.error.as_ref().map(|error| error.message.as_str()), Some("item 2 rejected"));
}

#[tokio::test]
async fn retried_template_step_recovers_within_its_iteration() {
    let definition = WorkflowDefinition::new("Map retry", |wf| {
        wf.map("Items", MapOptions::fixed(vec![json!(1), json!(2)]), |template| {
            template.step_with("Process", StepOptions::new().retry(2, 0), |ctx| async move {
                let item: i64 = ctx.require_loop()?.item_as()?;
                if item == 2 && ctx.attempt == 1 {
                    anyhow::bail!("transient failure for {item}");
                }
                Ok(())
            });
        });
    });

    let (report, events) = run(&definition).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(map_end(&events).0, MapStatus::Success);
    assert_eq!(count(&events, "map:item:end"), 2);
    assert!(item_ends(&events).iter().all(|(_, status)| *status == IterationStatus::Success));
    assert_eq!(count(&events, "node:retry"), 1);
    assert_eq!(report.attempts["root/map-0/step-0"], 2);
}

#[tokio::test]
async fn failing_template_step_skips_the_rest_of_its_iteration() {
    let definition = WorkflowDefinition::new("Template", |wf| {
        wf.map("Items", MapOptions::fixed(vec![json!("a")]), |template| {
            template.step("Break", |_| async { anyhow::bail!("broken") });
            template.step("Unreached", |_| async { Ok(()) });
        });
    });

    let (report, events) = run(&definition).await;

    let template_ends: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.payload {
            RunEventPayload::TemplateStepFinished {
                template_node_id, status, ..
            } => Some((template_node_id.as_str(), *status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        template_ends,
        vec![
            ("root/map-0/step-0", IterationStatus::Failed),
            ("root/map-0/step-1", IterationStatus::Skipped)
        ]
    );
    assert_eq!(report.status("root/map-0/step-1"), Some(NodeStatus::Skipped));
    assert_eq!(report.control.failed_steps[0].node_id, "root/map-0/step-0");
}

#[tokio::test]
async fn iteration_store_is_fresh_per_item_and_isolated_from_run() {
    let definition = WorkflowDefinition::new("Stores", |wf| {
        wf.map(
            "Items",
            MapOptions::fixed(vec![json!("a"), json!("b")]).key(|item, index| format!("{}-{index}", item.as_str().unwrap_or("?"))),
            |template| {
                template.step("Write", |ctx| async move {
                    let iteration = ctx.iteration.clone().expect("iteration store");
                    assert!(iteration.get("seen").is_none());
                    iteration.set("seen", ctx.require_loop()?.item.clone());
                    Ok(())
                });
                template.step("Read", |ctx| async move {
                    let iteration = ctx.iteration.clone().expect("iteration store");
                    let seen = iteration.require("seen")?;
                    ctx.output(json!({ "seen": seen, "key": ctx.require_loop()?.key }));
                    Ok(())
                });
            },
        );
    });

    let (report, events) = run(&definition).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(!report.run_store.contains_key("seen"));
    let second = &report.map_outputs["root/map-0"]["root/map-0#1"]["root/map-0/step-1"];
    assert_eq!(second, &json!({ "seen": "b", "key": "b-1" }));

    let tagged_output = events.iter().any(|event| {
        matches!(
            &event.payload,
            RunEventPayload::NodeOutput { map_node_id: Some(map), iteration_id: Some(iteration), .. }
                if map == "root/map-0" && iteration == "root/map-0#0"
        )
    });
    assert!(tagged_output);
}

#[tokio::test]
async fn spotlight_follows_the_active_template_node() {
    let definition = WorkflowDefinition::new("Spotlight", |wf| {
        wf.map("Items", MapOptions::fixed(vec![json!(1)]), |template| {
            template.step("First", |_| async { Ok(()) });
            template.check("Second", |_| async { Ok(true) });
        });
    });

    let (_, events) = run(&definition).await;

    let active: Vec<Option<String>> = events
        .iter()
        .filter_map(|event| match &event.payload {
            RunEventPayload::MapProgress { spotlight: Some(spotlight), .. } => Some(spotlight.active_template_node_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        active,
        vec![
            None,
            Some("root/map-0/step-0".to_string()),
            Some("root/map-0/check-1".to_string())
        ]
    );
}

#[tokio::test]
async fn items_are_resolved_at_run_time() {
    let definition = WorkflowDefinition::new("Dynamic", |wf| {
        wf.step("Discover", |ctx| async move {
            ctx.run.set("targets", json!(["x", "y", "z"]));
            Ok(())
        });
        wf.map(
            "Targets",
            MapOptions::new(|ctx| async move {
                let targets: Vec<Value> = ctx.run.require_as("targets")?;
                ctx.log.info(format!("{} targets", targets.len()));
                Ok(targets)
            }),
            |template| {
                template.step("Touch", |_| async { Ok(()) });
            },
        );
    });

    let (report, events) = run(&definition).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(map_end(&events).1.total, 3);
}

#[tokio::test]
async fn empty_item_list_succeeds_without_iterations() {
    let definition = WorkflowDefinition::new("Empty", |wf| {
        wf.map("Nothing", MapOptions::fixed(Vec::new()), |template| {
            template.step("Never", |_| async { Ok(()) });
        });
    });

    let (report, events) = run(&definition).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(count(&events, "map:item:start"), 0);
    assert_eq!(report.status("root/map-0/step-0"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn panicking_items_function_fails_the_map() {
    let definition = WorkflowDefinition::new("Items panic", |wf| {
        wf.map(
            "Inventory",
            MapOptions::new(|ctx| async move {
                if ctx.run.get("inventory").is_none() {
                    panic!("inventory unavailable");
                }
                Ok(Vec::new())
            }),
            |template| {
                template.step("Work", |_| async { Ok(()) });
            },
        );
        wf.step("After", |_| async { Ok(()) });
    });

    let (report, events) = run(&definition).await;

    assert_eq!(report.outcome, RunOutcome::Failure);
    assert_eq!(report.status("root/map-0"), Some(NodeStatus::Failure));
    assert_eq!(report.status("root/step-1"), Some(NodeStatus::Skipped));
    assert_eq!(count(&events, "map:start"), 0);
    let message = report.error.map(|error| error.message).unwrap_or_default();
    assert!(message.contains("inventory unavailable"), "{message}");
    assert_eq!(events.last().map(|event| event.type_name()), Some("run:end"));
}

#[tokio::test]
async fn template_logs_are_node_logs_tagged_with_their_iteration() {
    let definition = WorkflowDefinition::new("Template logs", |wf| {
        wf.map("Items", MapOptions::fixed(vec![json!("a")]), |template| {
            template.step("Say", |ctx| async move {
                ctx.log.info("hello from the loop");
                Ok(())
            });
        });
    });

    let (_, events) = run(&definition).await;

    let tags: Vec<(String, Option<String>, Option<String>)> = events
        .iter()
        .filter_map(|event| match &event.payload {
            RunEventPayload::NodeLog {
                node_id,
                map_node_id,
                iteration_id,
                ..
            } => Some((node_id.clone(), map_node_id.clone(), iteration_id.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        tags,
        vec![(
            "root/map-0/step-0".to_string(),
            Some("root/map-0".to_string()),
            Some("root/map-0#0".to_string())
        )]
    );
}

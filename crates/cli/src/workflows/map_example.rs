//! Generates a batch of records, then validates, processes and saves each one.

use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stepforge_engine::{MapOptions, NodeOptions, WorkflowDefinition};
use stepforge_types::InputParameter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: String,
    value: u64,
}

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new("Map Example", |wf| {
        wf.step("Generate Items", |ctx| async move {
            let count: u64 = ctx.input_as("itemCount")?;
            let items: Vec<Record> = (1..=count)
                .map(|n| Record {
                    id: format!("item-{n}"),
                    value: (n * 37 + 11) % 100,
                })
                .collect();
            ctx.run.set_serialized("items", &items)?;
            ctx.log.info(format!("generated {count} items"));
            Ok(())
        });

        let items = MapOptions::new(|ctx| async move {
            let items = ctx.run.require("items")?;
            match items {
                Value::Array(items) => Ok(items),
                other => Err(anyhow!("expected an item list, found {other}")),
            }
        })
        .key(|item, index| {
            item.get("id")
                .and_then(Value::as_str)
                .map_or_else(|| format!("item-{index}"), str::to_string)
        })
        .node(NodeOptions::new().describe("One iteration per generated record"));

        wf.map("Process Items", items, |template| {
            template.step("Validate", |ctx| async move {
                let record: Record = ctx.require_loop()?.item_as()?;
                if record.id.is_empty() {
                    bail!("record without an id");
                }
                ctx.sleep(Duration::from_millis(100)).await?;
                Ok(())
            });
            template.step("Process", |ctx| async move {
                let record: Record = ctx.require_loop()?.item_as()?;
                ctx.sleep(Duration::from_millis(200)).await?;
                let processed = record.value * 2;
                if let Some(iteration) = &ctx.iteration {
                    iteration.set("processed", processed);
                }
                Ok(())
            });
            template.step("Save result", |ctx| async move {
                let record: Record = ctx.require_loop()?.item_as()?;
                let iteration = ctx.iteration.clone().ok_or_else(|| anyhow!("no iteration store"))?;
                let processed = iteration.require("processed")?;
                ctx.output(json!({ "id": record.id, "processed": processed }));
                Ok(())
            });
        });

        wf.step("Summarize", |ctx| async move {
            let items: Vec<Record> = ctx.run.require_as("items")?;
            let total: u64 = items.iter().map(|record| record.value).sum();
            ctx.output(json!({ "count": items.len(), "total": total }));
            Ok(())
        });
    })
    .with_input(
        InputParameter::number("itemCount", "Item Count")
            .describe("How many records to generate")
            .with_default(5),
    )
}

//! Transient failures recovered by step-level and template-level retries.

use std::time::Duration;

use anyhow::bail;
use serde_json::{Value, json};
use stepforge_engine::{MapOptions, StepOptions, WorkflowDefinition};

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new("Retry Demo", |wf| {
        wf.step_with("Standard Retry", StepOptions::new().retry(3, 500), |ctx| async move {
            ctx.log.info(format!("attempt {} of {}", ctx.attempt, ctx.max_attempts));
            ctx.sleep(Duration::from_millis(100)).await?;
            if ctx.attempt < 3 {
                bail!("flaky upstream on attempt {}", ctx.attempt);
            }
            ctx.output(json!({ "succeededOnAttempt": ctx.attempt }));
            Ok(())
        });

        wf.map(
            "Map Retry",
            MapOptions::fixed(vec![json!(1), json!(2)]).key(|item: &Value, _| format!("item-{item}")),
            |template| {
                template.step_with("Process Item", StepOptions::new().retry(2, 250), |ctx| async move {
                    let loop_ctx = ctx.require_loop()?;
                    let item: u64 = loop_ctx.item_as()?;
                    ctx.sleep(Duration::from_millis(100)).await?;
                    // even items need a second attempt
                    if item % 2 == 0 && ctx.attempt == 1 {
                        bail!("item {item} timed out");
                    }
                    ctx.output(json!({ "item": item, "attempt": ctx.attempt }));
                    Ok(())
                });
            },
        );
    })
}

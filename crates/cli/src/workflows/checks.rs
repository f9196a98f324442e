//! Hard and soft gates around a simulated service probe.

use std::time::Duration;

use serde_json::json;
use stepforge_engine::{CheckOptions, WorkflowDefinition};
use stepforge_types::InputParameter;

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new("Health Checks", |wf| {
        wf.step("Probe Service", |ctx| async move {
            let latency_ms: u64 = ctx.input_as("latencyMs")?;
            ctx.sleep(Duration::from_millis(latency_ms)).await?;
            ctx.run.set("latencyMs", latency_ms);
            ctx.run.set("healthy", true);
            Ok(())
        });

        wf.check_with(
            "Service Healthy",
            CheckOptions::new().message("service reported unhealthy"),
            |ctx| async move { Ok(ctx.run.require("healthy")? == json!(true)) },
        );

        wf.check_with(
            "Latency Budget",
            CheckOptions::new().soft_fail().message("latency above budget"),
            |ctx| async move {
                let latency: u64 = ctx.run.require_as("latencyMs")?;
                let budget: u64 = ctx.input_as("budgetMs")?;
                Ok(latency <= budget)
            },
        );
    })
    .with_input(InputParameter::number("latencyMs", "Simulated Latency (ms)").with_default(120))
    .with_input(InputParameter::number("budgetMs", "Latency Budget (ms)").with_default(250))
}

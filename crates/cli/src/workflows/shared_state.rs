//! Steps handing data to each other through the run store.

use std::time::Duration;

use serde_json::json;
use stepforge_engine::{CheckOptions, WorkflowDefinition};
use stepforge_types::InputParameter;

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new("Shared State", |wf| {
        wf.step("Fetch Release", |ctx| async move {
            let channel: String = ctx.input_as("channel")?;
            ctx.sleep(Duration::from_millis(200)).await?;
            ctx.run.set("release", json!({ "channel": channel, "build": 42 }));
            Ok(())
        });

        wf.group("Prepare", |group| {
            group.step("Render Manifest", |ctx| async move {
                let release = ctx.run.require("release")?;
                ctx.run.set("manifest", format!("release-{}", release["build"]));
                Ok(())
            });
            group.check_with(
                "Manifest Present",
                CheckOptions::new().message("manifest was not rendered"),
                |ctx| async move { Ok(ctx.run.contains("manifest")) },
            );
        });

        wf.step("Publish", |ctx| async move {
            let manifest = ctx.run.require("manifest")?;
            ctx.output(json!({ "published": manifest }));
            Ok(())
        });
    })
    .with_input(InputParameter::string("channel", "Release Channel").with_default("stable"))
}

//! Multi-stage application rollout with infrastructure grouped up front.

use std::time::Duration;

use serde_json::json;
use stepforge_engine::{CheckOptions, NodeOptions, StepOptions, WorkflowDefinition};
use stepforge_types::InputParameter;

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new("AWS Application Deployment", |wf| {
        wf.step_with(
            "Validate Configuration",
            StepOptions::new().node(
                NodeOptions::new()
                    .describe("Validate deployment configuration and AWS credentials")
                    .tag("validation")
                    .icon("shield-check"),
            ),
            |ctx| async move {
                let environment: String = ctx.input_as("environment")?;
                let region: String = ctx.input_as("region")?;
                ctx.log.info_with("validating configuration", json!({ "environment": environment, "region": region }));
                ctx.sleep(Duration::from_millis(500)).await?;
                ctx.run.set("target", json!({ "environment": environment, "region": region }));
                ctx.output(json!({ "valid": true }));
                Ok(())
            },
        );

        wf.group_with(
            "Infrastructure Setup",
            NodeOptions::new().describe("Provision the network and compute layer").tag("infrastructure"),
            |infra| {
                infra.step_with(
                    "Create VPC",
                    StepOptions::new().node(NodeOptions::new().aws_service("ec2").tag("network")),
                    |ctx| async move {
                        ctx.sleep(Duration::from_millis(800)).await?;
                        ctx.run.set("vpcId", "vpc-0a1b2c3d");
                        ctx.output(json!({ "vpcId": "vpc-0a1b2c3d" }));
                        Ok(())
                    },
                );
                infra.step_with(
                    "Launch Instances",
                    StepOptions::new()
                        .retry(2, 1000)
                        .node(NodeOptions::new().aws_service("ec2").tag("compute")),
                    |ctx| async move {
                        let count: u64 = ctx.input_as("instanceCount")?;
                        let vpc_id: String = ctx.run.require_as("vpcId")?;
                        for launched in 1..=count {
                            ctx.throw_if_cancelled()?;
                            ctx.sleep(Duration::from_millis(300)).await?;
                            ctx.progress(json!({ "launched": launched, "total": count }));
                        }
                        ctx.log.info(format!("{count} instances running in {vpc_id}"));
                        Ok(())
                    },
                );
                infra.step_with(
                    "Configure Load Balancer",
                    StepOptions::new().node(NodeOptions::new().aws_service("elbv2").tag("network")),
                    |ctx| async move {
                        ctx.sleep(Duration::from_millis(600)).await?;
                        ctx.run.set("endpoint", "https://app.example.internal");
                        Ok(())
                    },
                );
            },
        );

        wf.step_with(
            "Deploy Application",
            StepOptions::new()
                .retry(3, 2000)
                .node(NodeOptions::new().aws_service("ecs").tag("deployment").icon("rocket")),
            |ctx| async move {
                let endpoint = ctx.run.require("endpoint")?;
                ctx.sleep(Duration::from_millis(1200)).await?;
                ctx.output(json!({ "endpoint": endpoint }));
                Ok(())
            },
        );

        wf.step_with(
            "Setup Monitoring",
            StepOptions::new().node(NodeOptions::new().aws_service("cloudwatch").tag("observability")),
            |ctx| async move {
                let enabled: bool = ctx.input_as("enableMonitoring")?;
                if !enabled {
                    ctx.log.warn("monitoring disabled for this deployment");
                    return Ok(());
                }
                ctx.sleep(Duration::from_millis(400)).await?;
                ctx.log.info("dashboards and alarms created");
                Ok(())
            },
        );

        wf.check_with(
            "Run Health Checks",
            CheckOptions::new()
                .message("application endpoint is not healthy")
                .retry(3, 1000)
                .node(NodeOptions::new().tag("validation")),
            |ctx| async move {
                ctx.sleep(Duration::from_millis(300)).await?;
                Ok(ctx.run.contains("endpoint"))
            },
        );
    })
    .with_input(
        InputParameter::string("environment", "Environment")
            .describe("Target deployment environment")
            .required()
            .with_default("staging"),
    )
    .with_input(InputParameter::string("region", "AWS Region").with_default("us-east-1"))
    .with_input(InputParameter::number("instanceCount", "Instance Count").with_default(2))
    .with_input(InputParameter::boolean("enableMonitoring", "Enable Monitoring").with_default(true))
}

//! # Stepforge Engine
//!
//! Builds workflow declarations into immutable graphs and executes them one
//! run at a time, with per-node retries, soft-fail checks, sequential map
//! loops, cooperative pause/cancel and an ordered event stream.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//!
//! use stepforge_engine::{CollectingSink, MapOptions, RunOptions, StepOptions, WorkflowDefinition, execute};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let definition = WorkflowDefinition::new("Deploy", |wf| {
//!     wf.step("Resolve target", |ctx| async move {
//!         ctx.run.set("cluster", "blue");
//!         Ok(())
//!     });
//!     wf.map("Regions", MapOptions::fixed(vec![json!("us-east-1"), json!("eu-west-1")]), |template| {
//!         template.step_with("Roll out", StepOptions::new().retry(3, 500), |ctx| async move {
//!             let region: String = ctx.require_loop()?.item_as()?;
//!             ctx.log.info(format!("rolling out to {region}"));
//!             ctx.sleep(Duration::from_millis(10)).await?;
//!             Ok(())
//!         });
//!     });
//! });
//!
//! let built = definition.build_graph("deploy", "1")?;
//! let sink = CollectingSink::new();
//! let report = execute(&built, Default::default(), RunOptions::new("run-1").events(sink.clone())).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`builder`** / **`definition`**: declaration API and graph construction
//! - **`executor`**: node lifecycle, retries, map sub-engine, run report
//! - **`control`**: checkpoints, pausable sleep, control sources
//! - **`events`** / **`framing`**: event sinks and the line protocol used over stdio
//! - **`store`** / **`inputs`**: run and iteration stores, input resolution

pub mod builder;
pub mod config;
pub mod context;
pub mod control;
pub mod definition;
pub mod events;
pub mod executor;
pub mod framing;
pub mod inputs;
pub mod store;

pub use builder::{BuildError, CheckOptions, LoopBuilder, MapOptions, NodeBody, NodeOptions, StepOptions, WorkflowBuilder};
pub use config::{DEFAULT_CONTROL_POLL_INTERVAL, EngineConfig};
pub use context::{LoopContext, MapItemsContext, NodeLogger, StepContext};
pub use control::{Cancelled, ControlHandle, ControlSource, NoControl};
pub use definition::{BuiltWorkflow, WorkflowDefinition};
pub use events::{CollectingSink, EventSink, NullSink};
pub use executor::{EngineError, RunOptions, RunReport, execute, execute_definition};
pub use framing::{EVENT_SENTINEL, FramedEventSink, FramedLine, decode_line, encode_event_line, parse_control_line};
pub use inputs::{InputError, resolve_inputs};
pub use store::{MissingKeyError, ScopedStore, StoreScope};

//! Shared data model for Stepforge workflows.
//!
//! Everything in this crate is plain serde data: the immutable workflow graph,
//! node and run statuses, the control protocol, declared inputs, and the run
//! event record streamed to observers. The engine crate produces and consumes
//! these types; front-ends only ever see them in their JSON form, so field names
//! follow the camelCase wire format.

pub mod control;
pub mod events;
pub mod graph;
pub mod inputs;
pub mod status;

pub use control::{ControlSignal, ControlState, FailedStep, InboundMessage};
pub use events::{LogLevel, RunEvent, RunEventPayload};
pub use graph::{
    AwsMeta, CheckMeta, EdgeType, GraphEdge, GraphError, GraphNode, MapErrorPolicy, MapMeta, NodeKind, NodeMeta, RetryPolicy, UiMeta,
    WorkflowGraph,
};
pub use inputs::{InputParameter, InputType};
pub use status::{IterationStatus, MapCounts, MapSpotlight, MapStatus, NodeStatus, RunOutcome, SerializedError};

//! Core abstractions for the suspendable flow engine
//!
//! This crate provides the data model, the node contract with its pause
//! capability, the persistence and transport contracts, and the error
//! taxonomy every other crate builds on. It does not drive runs itself.

mod error;
pub mod events;
mod node;
mod retry;
mod run;
pub mod store;
pub mod transport;
mod value;
mod wait;
mod workflow;

pub use error::{FlowError, NodeError, SchedulingError, StoreError, WorkflowError};
pub use events::*;
pub use node::{Node, NodeContext, NodeMetadata, NodeOutput, PauseSlot};
pub use retry::RetryPolicy;
pub use run::{
    ExecutionType, FlowRun, NodeState, NodeStatus, RunFailure, RunId, RunStatus, DEFAULT_TENANT,
};
pub use value::Value;
pub use wait::{
    delay_until, end_key, timer_key, PauseDescriptor, ResumeSource, Schedule, TimerJob, TimerKind,
    WaitKind, WaitingRegistration,
};
pub use workflow::{
    Edge, FlowDefinition, FlowId, FlowSettings, NodeId, NodeSpec, Position, ERROR_HANDLE,
    MAIN_HANDLE,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

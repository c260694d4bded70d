//! Suspendable flow runtime
//!
//! Executes flow runs node by node, parks nodes that pause on timers,
//! channels or webhooks, and resumes them when the awaited signal arrives.

mod config;
mod correlator;
mod executor;
mod orchestrator;
mod registry;
mod resume;
mod runtime;
pub mod scheduler;
mod sqlite;

pub use config::{ConfigError, JobQueueKind, RuntimeConfig};
pub use correlator::{Delivery, EventCorrelator};
pub use executor::{ExecutionOutcome, Invocation, NodeExecutor};
pub use orchestrator::Orchestrator;
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use resume::{ResumeOutcome, ResumeSink};
pub use runtime::{FlowRuntime, FlowRuntimeBuilder};
pub use scheduler::TimerScheduler;
pub use sqlite::SqliteStore;

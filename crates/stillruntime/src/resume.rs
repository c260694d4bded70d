use async_trait::async_trait;
use serde::Serialize;
use stillcore::{FlowError, NodeId, ResumeSource, RunId, RunStatus, Value};

/// What happened to a resume request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// The suspended node ran again; `status` is the run status afterwards.
    Resumed {
        run_id: RunId,
        node_id: NodeId,
        status: RunStatus,
    },
    /// No live registration: already resumed, cancelled or expired.
    NotFound,
    /// The registration existed but the run no longer accepts it.
    Rejected { run_id: RunId, reason: String },
}

impl ResumeOutcome {
    pub fn is_resumed(&self) -> bool {
        matches!(self, ResumeOutcome::Resumed { .. })
    }
}

/// Entry point the timer scheduler and event correlator call back into.
#[async_trait]
pub trait ResumeSink: Send + Sync {
    async fn resume(
        &self,
        correlation_id: &str,
        payload: Value,
        source: ResumeSource,
    ) -> Result<ResumeOutcome, FlowError>;
}

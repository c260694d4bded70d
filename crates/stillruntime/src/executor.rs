use crate::registry::NodeRegistry;
use chrono::Utc;
use stillcore::{
    EventBus, ExecutionEvent, ExecutionType, NodeContext, NodeError, NodeOutput, NodeSpec,
    PauseDescriptor, ResumeSource, RunId, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Classified result of one node invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(NodeOutput),
    Failed(NodeError),
    Suspended(PauseDescriptor),
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed(_) => "completed",
            ExecutionOutcome::Failed(_) => "failed",
            ExecutionOutcome::Suspended(_) => "suspended",
        }
    }
}

/// Everything needed to invoke one node once
#[derive(Clone)]
pub struct Invocation {
    pub run_id: RunId,
    pub spec: NodeSpec,
    pub execution_type: ExecutionType,
    pub inputs: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub resume_payload: Option<Value>,
    pub resume_metadata: Value,
    pub resume_source: ResumeSource,
    pub timeout: Duration,
    pub cancellation: CancellationToken,
}

impl Invocation {
    pub fn begin(run_id: RunId, spec: NodeSpec, timeout: Duration) -> Self {
        Self {
            run_id,
            spec,
            execution_type: ExecutionType::Begin,
            inputs: HashMap::new(),
            variables: HashMap::new(),
            resume_payload: None,
            resume_metadata: Value::Null,
            resume_source: ResumeSource::Api,
            timeout,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn resume(
        run_id: RunId,
        spec: NodeSpec,
        payload: Value,
        metadata: Value,
        source: ResumeSource,
        timeout: Duration,
    ) -> Self {
        Self {
            execution_type: ExecutionType::Resume,
            resume_payload: Some(payload),
            resume_metadata: metadata,
            resume_source: source,
            ..Self::begin(run_id, spec, timeout)
        }
    }
}

/// Runs node logic and turns whatever it did into an [`ExecutionOutcome`].
///
/// Errors raised by the node, panics and timeouts never escape as errors;
/// they become `Failed` outcomes.
pub struct NodeExecutor {
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<NodeRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            event_bus,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub async fn execute(&self, invocation: Invocation) -> ExecutionOutcome {
        let run_id = invocation.run_id;
        let node_id = invocation.spec.id.clone();
        let start = Instant::now();

        self.event_bus.emit(ExecutionEvent::NodeStarted {
            run_id,
            node_id: node_id.clone(),
            node_type: invocation.spec.node_type.clone(),
            execution_type: invocation.execution_type,
            timestamp: Utc::now(),
        });

        let outcome = self.invoke(invocation).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            ExecutionOutcome::Completed(output) => {
                tracing::info!(%run_id, %node_id, duration_ms, "Node completed");
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    run_id,
                    node_id,
                    handles: output.handles.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            ExecutionOutcome::Failed(e) => {
                tracing::warn!(%run_id, %node_id, duration_ms, error = %e, "Node failed");
                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    run_id,
                    node_id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
            ExecutionOutcome::Suspended(descriptor) => {
                tracing::debug!(%run_id, %node_id, kind = ?descriptor.kind, "Node paused");
            }
        }
        outcome
    }

    async fn invoke(&self, invocation: Invocation) -> ExecutionOutcome {
        let Invocation {
            run_id,
            spec,
            execution_type,
            inputs,
            variables,
            resume_payload,
            resume_metadata,
            resume_source,
            timeout: budget,
            cancellation,
        } = invocation;

        let mut node = match self.registry.create_node(&spec.node_type, &spec.config) {
            Ok(node) => node,
            Err(e) => return ExecutionOutcome::Failed(NodeError::Configuration(e.to_string())),
        };
        if let Err(e) = node.initialize().await {
            tracing::error!("Failed to initialize node {}: {}", spec.id, e);
            return ExecutionOutcome::Failed(e);
        }

        let mut ctx = NodeContext::new(
            run_id,
            spec.id.clone(),
            execution_type,
            self.event_bus.create_emitter(run_id, spec.id.clone()),
        )
        .with_inputs(inputs)
        .with_config(spec.config.clone())
        .with_variables(variables);
        if let Some(payload) = resume_payload {
            ctx = ctx.resumed_with(payload, resume_metadata, resume_source);
        }
        ctx.cancellation = cancellation.clone();
        let slot = ctx.pause_slot();

        // Run on its own task so a panic in node logic is contained.
        let task = tokio::spawn(async move {
            let result = node.execute(ctx).await;
            if let Err(e) = node.shutdown().await {
                tracing::warn!("Node shutdown failed: {}", e);
            }
            result
        });
        let abort = task.abort_handle();

        let result = match timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => Err(NodeError::ExecutionFailed(
                format!("node '{}' panicked", spec.id),
            )),
            Ok(Err(_)) => Err(NodeError::Cancelled),
            Err(_) => {
                cancellation.cancel();
                abort.abort();
                Err(NodeError::Timeout {
                    elapsed_ms: budget.as_millis() as u64,
                })
            }
        };

        classify(run_id, &spec.id, slot.seal(), result)
    }
}

/// The first thing the node reported wins: a recorded pause beats whatever
/// the invocation returned afterwards.
fn classify(
    run_id: RunId,
    node_id: &str,
    paused: Option<PauseDescriptor>,
    result: Result<NodeOutput, NodeError>,
) -> ExecutionOutcome {
    match (paused, result) {
        (Some(descriptor), Ok(_)) => {
            tracing::warn!(%run_id, node_id, "Illegal state: node returned output after pausing, keeping the pause");
            ExecutionOutcome::Suspended(descriptor)
        }
        (Some(descriptor), Err(e)) => {
            tracing::warn!(%run_id, node_id, error = %e, "Illegal state: node failed after pausing, keeping the pause");
            ExecutionOutcome::Suspended(descriptor)
        }
        (None, Ok(output)) => ExecutionOutcome::Completed(output),
        (None, Err(e)) => ExecutionOutcome::Failed(e),
    }
}

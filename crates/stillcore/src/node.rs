use crate::events::EventEmitter;
use crate::{
    ExecutionType, NodeError, NodeId, PauseDescriptor, ResumeSource, RunId, Value, MAIN_HANDLE,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "wait.timer", "transform.json")
    fn node_type(&self) -> &str;

    /// Execute the node with given context.
    ///
    /// A node that needs to wait for an external signal calls
    /// [`NodeContext::pause`] and returns; it is invoked again with
    /// `ExecutionType::Resume` once the signal arrives.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Initialize stateful resources (DB connections, etc.)
    async fn initialize(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: Cleanup resources
    async fn shutdown(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: Validate configuration at flow load time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SlotState {
    descriptor: Option<PauseDescriptor>,
    sealed: bool,
}

/// Records the first `pause` request of one invocation.
///
/// The executor seals the slot once the node returns; later requests are
/// rejected as illegal state.
#[derive(Debug, Clone, Default)]
pub struct PauseSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl PauseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(&self, descriptor: PauseDescriptor) -> Result<(), NodeError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.sealed {
            return Err(NodeError::IllegalState(
                "pause called after the invocation returned".to_string(),
            ));
        }
        if state.descriptor.is_some() {
            return Err(NodeError::IllegalState("pause called twice".to_string()));
        }
        state.descriptor = Some(descriptor);
        Ok(())
    }

    pub fn is_requested(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .descriptor
            .is_some()
    }

    /// Close the slot and take the recorded request, if any.
    pub fn seal(&self) -> Option<PauseDescriptor> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.sealed = true;
        state.descriptor.take()
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,

    pub node_id: NodeId,

    /// BEGIN on first visit, RESUME after a pause
    pub execution_type: ExecutionType,

    /// Merged outputs of the predecessors that fired into this node, or the
    /// run input for entry nodes
    pub inputs: HashMap<String, Value>,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Snapshot of the run's variable bag
    pub variables: HashMap<String, Value>,

    /// Payload that satisfied the wait; present only on RESUME
    pub resume_payload: Option<Value>,

    /// Metadata registered with the pause; present only on RESUME
    pub resume_metadata: Value,

    /// What delivered `resume_payload`
    pub resume_source: Option<ResumeSource>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token for graceful shutdown
    pub cancellation: tokio_util::sync::CancellationToken,

    pause: PauseSlot,
}

impl NodeContext {
    pub fn new(
        run_id: RunId,
        node_id: impl Into<NodeId>,
        execution_type: ExecutionType,
        events: EventEmitter,
    ) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            execution_type,
            inputs: HashMap::new(),
            config: HashMap::new(),
            variables: HashMap::new(),
            resume_payload: None,
            resume_metadata: Value::Null,
            resume_source: None,
            events,
            cancellation: tokio_util::sync::CancellationToken::new(),
            pause: PauseSlot::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn resumed_with(mut self, payload: Value, metadata: Value, source: ResumeSource) -> Self {
        self.resume_payload = Some(payload);
        self.resume_metadata = metadata;
        self.resume_source = Some(source);
        self
    }

    pub fn is_resume(&self) -> bool {
        self.execution_type == ExecutionType::Resume
    }

    /// Suspend this invocation until the described signal arrives.
    ///
    /// Only the first call counts; a second call, or a call made after the
    /// invocation returned, is logged and rejected.
    pub fn pause(&self, descriptor: PauseDescriptor) -> Result<(), NodeError> {
        self.pause.request(descriptor).map_err(|e| {
            tracing::warn!(run_id = %self.run_id, node_id = %self.node_id, error = %e, "Ignoring pause request");
            e
        })
    }

    /// Handle used by the executor to collect the pause request.
    pub fn pause_slot(&self) -> PauseSlot {
        self.pause.clone()
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}

fn default_handles() -> Vec<String> {
    vec![MAIN_HANDLE.to_string()]
}

/// Output from node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,

    /// Output handles that fired; downstream edges on other handles stay idle
    #[serde(default = "default_handles")]
    pub handles: Vec<String>,

    /// Execution metadata
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            handles: default_handles(),
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    /// Replace the fired handles (fan-out when several are given).
    pub fn with_handles<I, S>(mut self, handles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handles = handles.into_iter().map(Into::into).collect();
        self
    }

    /// Fire no handle; the branch below this node does not advance.
    pub fn without_handles(mut self) -> Self {
        self.handles.clear();
        self
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.outputs.clone())
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    pub custom: HashMap<String, Value>,
}

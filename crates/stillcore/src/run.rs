use crate::{FlowDefinition, FlowId, NodeId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type RunId = Uuid;

pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Waiting => "WAITING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
}

impl NodeStatus {
    /// Completed or failed; the node will not run again in this run.
    pub fn is_settled(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }

    /// Claimed for execution or suspended.
    pub fn is_active(self) -> bool {
        matches!(self, NodeStatus::Running | NodeStatus::Waiting)
    }
}

/// Whether a node invocation starts fresh or continues after a pause
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Begin,
    Resume,
}

/// Per-node record inside a run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub last_execution_type: Option<ExecutionType>,
    #[serde(default)]
    pub output: Option<Value>,
    /// Handles fired on completion.
    #[serde(default)]
    pub handles: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Correlation ids the node is blocked on; only set while WAITING.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailure {
    pub node_id: NodeId,
    pub message: String,
}

/// A live execution instance of a flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub run_id: RunId,
    pub tenant_id: String,
    pub flow_id: FlowId,
    pub status: RunStatus,
    #[serde(default)]
    pub input: Value,
    /// Variable bag; every completed node publishes its output under its id.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub node_states: HashMap<NodeId, NodeState>,
    /// Nodes reached through a fired edge but not yet dispatched, in
    /// activation order.
    #[serde(default)]
    pub deferred: Vec<NodeId>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRun {
    pub fn new(tenant_id: impl Into<String>, flow: &FlowDefinition, input: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            flow_id: flow.id,
            status: RunStatus::Running,
            input,
            context: HashMap::new(),
            node_states: flow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeState::default()))
                .collect(),
            deferred: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> &mut NodeState {
        self.node_states.entry(node_id.to_string()).or_default()
    }

    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node(node_id).map(|s| s.status).unwrap_or_default()
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .node_states
            .iter()
            .filter(|(_, state)| state.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Correlation ids of every waiting node.
    pub fn waiting_correlations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Waiting)
            .flat_map(|s| s.correlation_ids.iter().cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Mark `node_id` as reached; repeated activations collapse.
    pub fn defer(&mut self, node_id: &str) {
        if !self.deferred.iter().any(|id| id == node_id) {
            self.deferred.push(node_id.to_string());
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

use crate::{Value, WorkflowError};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type FlowId = Uuid;
pub type NodeId = String;

/// Handle fired by a node that completes without choosing a branch.
pub const MAIN_HANDLE: &str = "main";
/// Handle fired by a failed node when the flow wires an error edge from it.
pub const ERROR_HANDLE: &str = "error";

fn main_handle() -> String {
    MAIN_HANDLE.to_string()
}

/// Immutable flow graph supplied by the editor or API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: FlowSettings,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: FlowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Connect `source` to `target` through the given output handle.
    pub fn connect(
        &mut self,
        source: impl Into<NodeId>,
        source_handle: impl Into<String>,
        target: impl Into<NodeId>,
    ) {
        self.edges.push(Edge {
            source: source.into(),
            source_handle: source_handle.into(),
            target: target.into(),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Entry set: nodes explicitly marked as start nodes, or every node
    /// without incoming edges when none is marked.
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        let marked: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.start)
            .map(|n| n.id.clone())
            .collect();
        if !marked.is_empty() {
            return marked;
        }

        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        self.nodes
            .iter()
            .filter(|n| !targets.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Outgoing edges of `node_id` leaving through `handle`, in declaration order.
    pub fn targets_for<'a>(&'a self, node_id: &'a str, handle: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.source == node_id && e.source_handle == handle)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    pub fn has_error_edge(&self, node_id: &str) -> bool {
        self.targets_for(node_id, ERROR_HANDLE).next().is_some()
    }

    /// Check node-id uniqueness, edge referential integrity and the absence
    /// of raw cycles.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::Invalid("flow has no nodes".to_string()));
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(WorkflowError::Invalid("node id must not be empty".to_string()));
            }
            if index.contains_key(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
            index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }

        for edge in &self.edges {
            let from = index
                .get(edge.source.as_str())
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.source.clone()))?;
            let to = index
                .get(edge.target.as_str())
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.clone()))?;
            if edge.source_handle.is_empty() {
                return Err(WorkflowError::InvalidConnection(format!(
                    "{} -> {} has an empty source handle",
                    edge.source, edge.target
                )));
            }
            graph.add_edge(*from, *to, ());
        }

        if toposort(&graph, None).is_err() {
            return Err(WorkflowError::CyclicDependency);
        }

        if self.entry_nodes().is_empty() {
            return Err(WorkflowError::Invalid("flow has no entry node".to_string()));
        }

        Ok(())
    }
}

/// Node specification in a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Explicit start marker; overrides the "no incoming edges" rule.
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
            start: false,
            position: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn as_start(mut self) -> Self {
        self.start = true;
        self
    }
}

/// Directed edge leaving `source` through `source_handle`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: NodeId,
    #[serde(default = "main_handle")]
    pub source_handle: String,
    pub target: NodeId,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Per-flow execution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Overrides the runtime's per-invocation node timeout.
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
}

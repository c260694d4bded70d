use async_trait::async_trait;
use stillcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use stillruntime::{NodeFactory, NodeMetadata};
use std::collections::HashMap;

/// Logs its inputs and passes them through unchanged
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .config
            .get("message")
            .or_else(|| ctx.inputs.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");

        tracing::info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "DEBUG: {}", message);
        ctx.events.info(format!("DEBUG: {}", message));
        for (key, value) in &ctx.inputs {
            ctx.events.info(format!("  {}: {:?}", key, value));
        }

        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        Ok(output.with_output("message", message.to_string()))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            ..NodeMetadata::default()
        }
    }
}

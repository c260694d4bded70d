use async_trait::async_trait;
use stillcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use stillruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

pub const TRUE_HANDLE: &str = "true";
pub const FALSE_HANDLE: &str = "false";

/// Whether a value counts as "set" for a condition without `equals`.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Bytes(b) => !b.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Json(json) => !matches!(
            json,
            serde_json::Value::Null | serde_json::Value::Bool(false)
        ),
    }
}

/// Fires `true` or `false` depending on an input field. With an `equals`
/// config the field must match it; otherwise it must be truthy.
pub struct BranchNode;

#[async_trait]
impl Node for BranchNode {
    fn node_type(&self) -> &str {
        "branch.if"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let field = ctx
            .require_config("field")?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "field".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;
        let value = ctx
            .inputs
            .get(field)
            .or_else(|| ctx.variables.get(field))
            .cloned()
            .unwrap_or(Value::Null);

        let matched = match ctx.config.get("equals") {
            Some(expected) => expected.to_json() == value.to_json(),
            None => truthy(&value),
        };
        let handle = if matched { TRUE_HANDLE } else { FALSE_HANDLE };
        tracing::debug!(run_id = %ctx.run_id, node_id = %ctx.node_id, field, handle, "Branch evaluated");

        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        Ok(output.with_output("matched", matched).with_handles([handle]))
    }
}

pub struct BranchNodeFactory;

impl NodeFactory for BranchNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        if !config.contains_key("field") {
            return Err(NodeError::Configuration("Missing config: field".to_string()));
        }
        Ok(Box::new(BranchNode))
    }

    fn node_type(&self) -> &str {
        "branch.if"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Route to the true or false handle based on an input field".to_string(),
            category: "control".to_string(),
            outputs: vec![PortDefinition {
                name: "matched".to_string(),
                description: "Result of the condition".to_string(),
                required: true,
            }],
            handles: vec![TRUE_HANDLE.to_string(), FALSE_HANDLE.to_string()],
            ..NodeMetadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stillcore::{EventBus, ExecutionType};
    use uuid::Uuid;

    async fn branch(config: &[(&str, Value)], inputs: &[(&str, Value)]) -> NodeOutput {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(8);
        let ctx = NodeContext::new(run_id, "if", ExecutionType::Begin, bus.create_emitter(run_id, "if".into()))
            .with_config(config.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
            .with_inputs(inputs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
        BranchNode.execute(ctx).await.unwrap()
    }

    #[tokio::test]
    async fn truthy_field_fires_true() {
        let output = branch(&[("field", Value::from("approved"))], &[("approved", Value::Bool(true))]).await;
        assert_eq!(output.handles, vec![TRUE_HANDLE.to_string()]);

        let output = branch(&[("field", Value::from("approved"))], &[]).await;
        assert_eq!(output.handles, vec![FALSE_HANDLE.to_string()]);
    }

    #[tokio::test]
    async fn equals_compares_values() {
        let config = [("field", Value::from("status")), ("equals", Value::from("paid"))];
        let paid = branch(&config, &[("status", Value::from("paid"))]).await;
        assert_eq!(paid.handles, vec![TRUE_HANDLE.to_string()]);
        assert_eq!(paid.outputs.get("matched"), Some(&Value::Bool(true)));

        let open = branch(&config, &[("status", Value::from("open"))]).await;
        assert_eq!(open.handles, vec![FALSE_HANDLE.to_string()]);
    }

    #[test]
    fn factory_requires_field() {
        assert!(BranchNodeFactory.create(&HashMap::new()).is_err());
    }
}

use async_trait::async_trait;
use stillcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use stillruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

fn port(name: &str, description: &str) -> PortDefinition {
    PortDefinition {
        name: name.to_string(),
        description: description.to_string(),
        required: true,
    }
}

/// Input field a transform reads, `config.field` or the given default.
fn source_field<'a>(ctx: &'a NodeContext, default: &'a str) -> &'a str {
    ctx.config
        .get("field")
        .and_then(Value::as_str)
        .unwrap_or(default)
}

/// Parse a JSON string into a structured value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let field = source_field(&ctx, "json");
        let input = ctx.require_input(field)?;
        let text = match input {
            Value::String(s) => s.as_str(),
            Value::Bytes(bytes) => std::str::from_utf8(bytes)
                .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?,
            other => {
                return Err(NodeError::InvalidInputType {
                    field: field.to_string(),
                    expected: "string".to_string(),
                    actual: format!("{:?}", other),
                })
            }
        };

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output("parsed", Value::from_json(parsed)))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse a JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![port("json", "JSON text")],
            outputs: vec![port("parsed", "Structured value")],
            ..NodeMetadata::default()
        }
    }
}

/// Render a value as JSON text
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input(source_field(&ctx, "value"))?.to_json();
        let pretty = ctx.get_config_or("pretty", Value::Bool(false)).as_bool().unwrap_or(false);

        let rendered = if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("json", rendered))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonStringifyNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert a value to JSON text".to_string(),
            category: "transform".to_string(),
            inputs: vec![port("value", "Value to render")],
            outputs: vec![port("json", "JSON text")],
            ..NodeMetadata::default()
        }
    }
}

use async_trait::async_trait;
use stillcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use stillruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// HTTP request node. The URL comes from the `url` input or config; the
/// request is abandoned when the run is stopped.
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

fn with_body(request: reqwest::RequestBuilder, body: Option<&Value>) -> reqwest::RequestBuilder {
    match body {
        Some(Value::String(text)) => request.body(text.clone()),
        Some(Value::Null) | None => request,
        Some(other) => request.json(&other.to_json()),
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = ctx
            .inputs
            .get("url")
            .or_else(|| ctx.config.get("url"))
            .ok_or_else(|| NodeError::MissingInput("url".to_string()))?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "url".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;
        let method_value = ctx.get_config_or("method", Value::String("GET".to_string()));
        let method = method_value.as_str().unwrap_or("GET").to_uppercase();

        ctx.events.info(format!("{} {}", method, url));

        let body = ctx.inputs.get("body").or_else(|| ctx.config.get("body"));
        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => with_body(self.client.post(url), body),
            "PUT" => with_body(self.client.put(url), body),
            "PATCH" => with_body(self.client.patch(url), body),
            "DELETE" => self.client.delete(url),
            _ => return Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
        };

        let request = match ctx.config.get("headers") {
            Some(Value::Object(headers)) => headers.iter().fold(request, |req, (key, value)| {
                match value.as_str() {
                    Some(v) => req.header(key, v),
                    None => req,
                }
            }),
            _ => request,
        };

        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            response = request.send() => response
                .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?,
        };

        let status = response.status().as_u16();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;
        let body = match serde_json::from_str::<serde_json::Value>(&body_text) {
            Ok(json) => Value::from_json(json),
            Err(_) => Value::String(body_text),
        };

        tracing::debug!(run_id = %ctx.run_id, node_id = %ctx.node_id, status, "HTTP response");
        ctx.events.info(format!("Response status: {}", status));

        // Error statuses fail the node unless `fail_on_error` is false.
        let fail_on_error = ctx.get_config_or("fail_on_error", Value::Bool(true)).as_bool() != Some(false);
        if status >= 400 && fail_on_error {
            return Err(NodeError::ExecutionFailed(format!("HTTP {} from {}", status, url)));
        }
        Ok(NodeOutput::new()
            .with_output("status", status as f64)
            .with_output("body", body)
            .with_output("headers", Value::Object(headers_map)))
    }
}

pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(HttpRequestNode::new()))
    }

    fn node_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            inputs: vec![
                PortDefinition {
                    name: "url".to_string(),
                    description: "Request URL; falls back to config".to_string(),
                    required: true,
                },
                PortDefinition {
                    name: "body".to_string(),
                    description: "Request body for POST, PUT and PATCH".to_string(),
                    required: false,
                },
            ],
            outputs: vec![PortDefinition {
                name: "body".to_string(),
                description: "Response body, parsed when it is JSON".to_string(),
                required: true,
            }],
            ..NodeMetadata::default()
        }
    }
}

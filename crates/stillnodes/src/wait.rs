//! Nodes that suspend the run until a timer, channel event or webhook call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stillcore::{
    Node, NodeContext, NodeError, NodeOutput, PauseDescriptor, ResumeSource, Schedule, Value,
};
use stillruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Handle fired when a hybrid wait was resolved by its timeout.
pub const TIMEOUT_HANDLE: &str = "timeout";

fn config_str<'a>(ctx: &'a NodeContext, name: &str) -> Option<&'a str> {
    ctx.config.get(name).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn config_u64(ctx: &NodeContext, name: &str) -> Result<Option<u64>, NodeError> {
    match ctx.config.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|n| *n >= 0.0)
            .map(|n| Some(n as u64))
            .ok_or_else(|| NodeError::InvalidInputType {
                field: name.to_string(),
                expected: "non-negative number".to_string(),
                actual: format!("{:?}", value),
            }),
    }
}

fn end_date(ctx: &NodeContext) -> Result<Option<DateTime<Utc>>, NodeError> {
    config_str(ctx, "end_date")
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| NodeError::Configuration(format!("end_date '{}': {}", raw, e)))
        })
        .transpose()
}

/// The resume came from the timeout fallback rather than an event.
fn fired_by_timer(ctx: &NodeContext) -> bool {
    ctx.resume_source == Some(ResumeSource::Timer)
}

/// Pause on a TIMEOUT, INTERVAL or CRON schedule.
///
/// Repeating schedules resume the node once per fire; the node pauses again
/// until `times` fires were seen, then completes with the last fire time.
pub struct WaitTimerNode;

impl WaitTimerNode {
    fn schedule(ctx: &NodeContext) -> Result<Schedule, NodeError> {
        let kind = config_str(ctx, "type").unwrap_or("timeout");
        let seconds = || {
            config_u64(ctx, "seconds")?
                .ok_or_else(|| NodeError::Configuration("Missing config: seconds".to_string()))
        };
        match kind {
            "timeout" => Ok(Schedule::Timeout { seconds: seconds()? }),
            "interval" => Ok(Schedule::Interval { seconds: seconds()? }),
            "cron" => Ok(Schedule::Cron {
                expression: config_str(ctx, "expression")
                    .ok_or_else(|| NodeError::Configuration("Missing config: expression".to_string()))?
                    .to_string(),
            }),
            other => Err(NodeError::Configuration(format!("Unknown timer type: {}", other))),
        }
    }
}

#[async_trait]
impl Node for WaitTimerNode {
    fn node_type(&self) -> &str {
        "wait.timer"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let schedule = Self::schedule(&ctx)?;
        let fired = ctx.resume_metadata.as_f64().unwrap_or(0.0) as u64 + u64::from(ctx.is_resume());
        let times = if schedule.is_repeating() {
            config_u64(&ctx, "times")?.unwrap_or(1).max(1)
        } else {
            1
        };

        if fired < times {
            if fired == 0 {
                ctx.events.info(format!("Waiting on {:?}", schedule));
            }
            let mut descriptor = PauseDescriptor::timer(schedule).with_metadata(fired as f64);
            descriptor.end_date = end_date(&ctx)?;
            ctx.pause(descriptor)?;
            return Ok(NodeOutput::new());
        }

        let fired_at = ctx
            .resume_payload
            .as_ref()
            .and_then(|p| p.get("firedAt"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(NodeOutput::new()
            .with_output("fired_at", fired_at)
            .with_output("fires", fired as f64))
    }
}

pub struct WaitTimerNodeFactory;

impl NodeFactory for WaitTimerNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(WaitTimerNode))
    }

    fn node_type(&self) -> &str {
        "wait.timer"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Suspend until a timeout, interval or cron schedule fires".to_string(),
            category: "wait".to_string(),
            outputs: vec![PortDefinition {
                name: "fired_at".to_string(),
                description: "Time of the fire that resumed the node".to_string(),
                required: true,
            }],
            suspends: true,
            ..NodeMetadata::default()
        }
    }
}

/// Shared behaviour of channel and webhook waits: pause on BEGIN, optionally
/// with a timeout fallback; on RESUME route to `main` or `timeout`.
async fn wait_for_event(
    ctx: NodeContext,
    descriptor: PauseDescriptor,
    output_port: &str,
) -> Result<NodeOutput, NodeError> {
    if let Some(payload) = ctx.resume_payload.clone() {
        if fired_by_timer(&ctx) {
            ctx.events.warn("Wait timed out before an event arrived");
            return Ok(NodeOutput::new()
                .with_output("timed_out", true)
                .with_handles([TIMEOUT_HANDLE]));
        }
        return Ok(NodeOutput::new()
            .with_output(output_port, payload)
            .with_output("timed_out", false));
    }

    let mut descriptor = descriptor;
    if let Some(seconds) = config_u64(&ctx, "timeout_secs")? {
        descriptor = descriptor.or_timeout(seconds);
    }
    if let Some(ttl) = config_u64(&ctx, "ttl_secs")? {
        descriptor = descriptor.with_ttl(ttl);
    }
    let correlation_id = config_str(&ctx, "correlation_id")
        .or_else(|| ctx.inputs.get("correlation_id").and_then(Value::as_str));
    if let Some(cid) = correlation_id {
        descriptor = descriptor.with_correlation_id(cid);
    }
    if let Some(key) = &descriptor.channel_key {
        ctx.events.info(format!("Waiting on {}", key));
    }
    ctx.pause(descriptor)?;
    Ok(NodeOutput::new())
}

fn event_metadata(description: &str, output: &str) -> NodeMetadata {
    NodeMetadata {
        description: description.to_string(),
        category: "wait".to_string(),
        outputs: vec![PortDefinition {
            name: output.to_string(),
            description: "Payload that resumed the node".to_string(),
            required: false,
        }],
        handles: vec![TIMEOUT_HANDLE.to_string()],
        suspends: true,
        ..NodeMetadata::default()
    }
}

/// Pause until an event is published on a channel.
pub struct WaitChannelNode;

#[async_trait]
impl Node for WaitChannelNode {
    fn node_type(&self) -> &str {
        "wait.channel"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let channel = config_str(&ctx, "channel")
            .ok_or_else(|| NodeError::Configuration("Missing config: channel".to_string()))?
            .to_string();
        wait_for_event(ctx, PauseDescriptor::channel(channel), "event").await
    }
}

pub struct WaitChannelNodeFactory;

impl NodeFactory for WaitChannelNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(WaitChannelNode))
    }

    fn node_type(&self) -> &str {
        "wait.channel"
    }

    fn metadata(&self) -> NodeMetadata {
        event_metadata("Suspend until an event arrives on a channel", "event")
    }
}

/// Pause until a webhook call arrives on a path.
pub struct WaitWebhookNode;

#[async_trait]
impl Node for WaitWebhookNode {
    fn node_type(&self) -> &str {
        "wait.webhook"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let path = config_str(&ctx, "path")
            .ok_or_else(|| NodeError::Configuration("Missing config: path".to_string()))?
            .trim_start_matches('/')
            .to_string();
        wait_for_event(ctx, PauseDescriptor::webhook(path), "request").await
    }
}

pub struct WaitWebhookNodeFactory;

impl NodeFactory for WaitWebhookNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(WaitWebhookNode))
    }

    fn node_type(&self) -> &str {
        "wait.webhook"
    }

    fn metadata(&self) -> NodeMetadata {
        event_metadata("Suspend until a webhook call arrives", "request")
    }
}

//! Standard node library
//!
//! Built-in nodes, including the wait nodes that suspend a run on a timer,
//! a channel event or a webhook call.

mod branch;
mod debug;
mod http;
mod transform;
mod wait;

pub use branch::{BranchNode, FALSE_HANDLE, TRUE_HANDLE};
pub use debug::DebugNode;
pub use http::HttpRequestNode;
pub use transform::{JsonParseNode, JsonStringifyNode};
pub use wait::{WaitChannelNode, WaitTimerNode, WaitWebhookNode, TIMEOUT_HANDLE};
use stillruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(branch::BranchNodeFactory));
    registry.register(Arc::new(http::HttpRequestNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(wait::WaitTimerNodeFactory));
    registry.register(Arc::new(wait::WaitChannelNodeFactory));
    registry.register(Arc::new(wait::WaitWebhookNodeFactory));
}

/// Registry holding every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}

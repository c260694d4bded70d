//! Pub/sub channel transports used by the event correlator.

mod iggy;
mod memory;

pub use self::iggy::{IggyTransport, IggyTransportConfig};
pub use memory::InMemoryTransport;

use crate::{SchedulingError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something the transport tells its listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSignal {
    /// An inbound event on a subscribed channel.
    Event { channel: String, payload: Value },
    /// The connection was re-established; previous subscriptions are gone.
    Reconnected,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Start delivering events published on `channel`. Subscribing twice is a no-op.
    async fn subscribe(&self, channel: &str) -> Result<(), SchedulingError>;

    /// Stop delivering events for `channel`. Unknown channels are ignored.
    async fn unsubscribe(&self, channel: &str) -> Result<(), SchedulingError>;

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), SchedulingError>;

    /// Inbound events and connection notifications.
    fn signals(&self) -> broadcast::Receiver<TransportSignal>;
}

/// Decode a payload received from a broker: tagged `Value` first, then
/// plain JSON, then raw bytes.
pub(crate) fn decode_payload(bytes: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return value;
    }
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(json) => Value::Json(json),
        Err(_) => Value::Bytes(bytes.to_vec()),
    }
}

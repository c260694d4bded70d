use super::{ChannelTransport, TransportSignal};
use crate::{SchedulingError, Value};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::{broadcast, Mutex};

/// In-process broker. Events published on a channel nobody subscribed to
/// are dropped, like a topic without consumers.
pub struct InMemoryTransport {
    subscriptions: Mutex<BTreeSet<String>>,
    sender: broadcast::Sender<TransportSignal>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            subscriptions: Mutex::new(BTreeSet::new()),
            sender,
        }
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.iter().cloned().collect()
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().await.contains(channel)
    }

    /// Drop every subscription and announce a fresh connection.
    pub async fn simulate_reconnect(&self) {
        self.subscriptions.lock().await.clear();
        tracing::info!(transport = "memory", "Transport reconnected");
        let _ = self.sender.send(TransportSignal::Reconnected);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelTransport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self, channel: &str) -> Result<(), SchedulingError> {
        if self.subscriptions.lock().await.insert(channel.to_string()) {
            tracing::debug!(channel, "Subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SchedulingError> {
        if self.subscriptions.lock().await.remove(channel) {
            tracing::debug!(channel, "Unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), SchedulingError> {
        if !self.is_subscribed(channel).await {
            tracing::debug!(channel, "No subscription, dropping event");
            return Ok(());
        }
        let _ = self.sender.send(TransportSignal::Event {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.sender.subscribe()
    }
}

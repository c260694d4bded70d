//! External Event Correlator: maps inbound channel events and webhook calls
//! to the correlation ids waiting on them.

use crate::resume::{ResumeOutcome, ResumeSink};
use futures::future::join_all;
use serde::Serialize;
use stillcore::store::{StateStore, WaitingStore};
use stillcore::transport::{ChannelTransport, TransportSignal};
use stillcore::{FlowError, ResumeSource, RetryPolicy, SchedulingError, Value, WaitKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Channel and webhook keys live in separate namespaces.
type InboxKey = (WaitKind, String);

pub struct EventCorrelator {
    transport: Arc<dyn ChannelTransport>,
    store: Arc<dyn StateStore>,
    sink: Weak<dyn ResumeSink>,
    retry: RetryPolicy,
    inboxes: Mutex<Inboxes>,
}

#[derive(Default)]
struct Inboxes {
    /// Waiting correlation ids per inbox
    waiters: HashMap<InboxKey, BTreeSet<String>>,
    /// Channels the transport accepted a subscription for. A channel with
    /// waiters but no entry here is retried by the next registration or by
    /// [`EventCorrelator::resubscribe_pending`].
    subscribed: HashSet<String>,
}

/// Result of delivering one inbound event
#[derive(Debug, Default, Serialize)]
pub struct Delivery {
    pub resumed: Vec<String>,
    pub ignored: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl Delivery {
    pub fn matched(&self) -> usize {
        self.resumed.len() + self.ignored.len() + self.failed.len()
    }
}

impl EventCorrelator {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        store: Arc<dyn StateStore>,
        sink: Weak<dyn ResumeSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            sink,
            retry,
            inboxes: Mutex::new(Inboxes::default()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    /// Record that `correlation_id` waits on `key` and subscribe the channel
    /// if it is not subscribed yet. Webhook inboxes are fed through
    /// [`EventCorrelator::on_webhook`] and need no subscription.
    ///
    /// A failed subscribe keeps the waiter; the subscription is attempted
    /// again later.
    pub async fn register_wait(
        &self,
        kind: WaitKind,
        key: &str,
        correlation_id: &str,
    ) -> Result<(), SchedulingError> {
        let mut inboxes = self.inboxes.lock().await;
        inboxes
            .waiters
            .entry((kind, key.to_string()))
            .or_default()
            .insert(correlation_id.to_string());
        tracing::debug!(?kind, key, correlation_id, "Wait registered");

        if kind == WaitKind::Channel && !inboxes.subscribed.contains(key) {
            self.retry
                .run("channel subscribe", || self.transport.subscribe(key))
                .await?;
            inboxes.subscribed.insert(key.to_string());
        }
        Ok(())
    }

    /// Drop the mapping; the last waiter leaving a channel unsubscribes it.
    pub async fn unregister_wait(
        &self,
        kind: WaitKind,
        key: &str,
        correlation_id: &str,
    ) -> Result<(), SchedulingError> {
        let mut inboxes = self.inboxes.lock().await;
        let inbox = (kind, key.to_string());
        let Some(waiters) = inboxes.waiters.get_mut(&inbox) else {
            return Ok(());
        };
        waiters.remove(correlation_id);
        if waiters.is_empty() {
            inboxes.waiters.remove(&inbox);
            if kind == WaitKind::Channel && inboxes.subscribed.remove(key) {
                self.transport.unsubscribe(key).await?;
            }
        }
        Ok(())
    }

    pub async fn waiters(&self, kind: WaitKind, key: &str) -> Vec<String> {
        self.inboxes
            .lock()
            .await
            .waiters
            .get(&(kind, key.to_string()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Broadcast an inbound channel event to every waiter on the channel.
    pub async fn on_event(&self, channel: &str, payload: Value) -> Delivery {
        self.deliver(WaitKind::Channel, channel, payload).await
    }

    /// Deliver a webhook call to every waiter on the path.
    pub async fn on_webhook(&self, path: &str, payload: Value) -> Delivery {
        self.deliver(WaitKind::Webhook, path, payload).await
    }

    async fn deliver(&self, kind: WaitKind, key: &str, payload: Value) -> Delivery {
        let waiters = self.waiters(kind, key).await;
        let mut delivery = Delivery::default();
        if waiters.is_empty() {
            tracing::debug!(?kind, key, "No waiters for inbound event");
            return delivery;
        }
        let Some(sink) = self.sink.upgrade() else {
            return delivery;
        };

        // Each resume is independent; one failure does not block the rest.
        let results = join_all(waiters.iter().map(|cid| {
            let sink = Arc::clone(&sink);
            let payload = payload.clone();
            async move { (cid.clone(), sink.resume(cid, payload, ResumeSource::from(kind)).await) }
        }))
        .await;

        for (cid, result) in results {
            match result {
                Ok(ResumeOutcome::Resumed { .. }) => delivery.resumed.push(cid),
                Ok(ResumeOutcome::NotFound) | Ok(ResumeOutcome::Rejected { .. }) => {
                    // Registration is gone; stop listening for it.
                    if let Err(e) = self.unregister_wait(kind, key, &cid).await {
                        tracing::warn!(key, correlation_id = %cid, error = %e, "Failed to unregister wait");
                    }
                    delivery.ignored.push(cid);
                }
                Err(e) => {
                    tracing::error!(key, correlation_id = %cid, error = %e, "Resume from inbound event failed");
                    delivery.failed.push((cid, e.to_string()));
                }
            }
        }
        tracing::info!(
            ?kind,
            key,
            resumed = delivery.resumed.len(),
            ignored = delivery.ignored.len(),
            failed = delivery.failed.len(),
            "Inbound event delivered"
        );
        delivery
    }

    /// Rebuild the inbox map from the Waiting-State Store and subscribe every
    /// channel that still has a live registration. Returns the number of
    /// channels subscribed.
    pub async fn restore_subscriptions(&self) -> Result<usize, FlowError> {
        let active = self.store.list_active().await?;
        let mut guard = self.inboxes.lock().await;
        let inboxes = &mut *guard;
        inboxes.waiters.clear();
        inboxes.subscribed.clear();
        for registration in active.into_iter().filter(|r| r.listens()) {
            if let Some(key) = registration.channel_key {
                inboxes
                    .waiters
                    .entry((registration.kind, key))
                    .or_default()
                    .insert(registration.correlation_id);
            }
        }

        for (kind, key) in inboxes.waiters.keys() {
            if *kind != WaitKind::Channel {
                continue;
            }
            match self
                .retry
                .run("channel resubscribe", || self.transport.subscribe(key))
                .await
            {
                Ok(()) => {
                    inboxes.subscribed.insert(key.clone());
                }
                Err(e) => tracing::error!(channel = %key, error = %e, "Failed to restore subscription"),
            }
        }
        let subscribed = inboxes.subscribed.len();
        tracing::info!(subscribed, transport = self.transport.name(), "Channel subscriptions restored");
        Ok(subscribed)
    }

    /// Subscribe every channel that has waiters but no subscription. Returns
    /// the number of channels subscribed by this call.
    pub async fn resubscribe_pending(&self) -> usize {
        let mut guard = self.inboxes.lock().await;
        let inboxes = &mut *guard;
        let mut subscribed = 0;
        for (kind, key) in inboxes.waiters.keys() {
            if *kind != WaitKind::Channel || inboxes.subscribed.contains(key) {
                continue;
            }
            match self.transport.subscribe(key).await {
                Ok(()) => {
                    inboxes.subscribed.insert(key.clone());
                    subscribed += 1;
                }
                Err(e) => tracing::warn!(channel = %key, error = %e, "Channel still unsubscribed"),
            }
        }
        if subscribed > 0 {
            tracing::info!(subscribed, "Pending channel subscriptions recovered");
        }
        subscribed
    }

    /// Channels with waiters that the transport has not accepted yet.
    pub async fn pending_subscriptions(&self) -> Vec<String> {
        let inboxes = self.inboxes.lock().await;
        inboxes
            .waiters
            .keys()
            .filter(|(kind, key)| *kind == WaitKind::Channel && !inboxes.subscribed.contains(key))
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Listen to the transport until shutdown: deliver events and restore
    /// subscriptions after a reconnect.
    pub fn start(self: &Arc<Self>, tracker: &TaskTracker, shutdown: CancellationToken) {
        let correlator = Arc::clone(self);
        let mut signals = self.transport.signals();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Ok(TransportSignal::Event { channel, payload }) => {
                            correlator.on_event(&channel, payload).await;
                        }
                        Ok(TransportSignal::Reconnected) => {
                            if let Err(e) = correlator.restore_subscriptions().await {
                                tracing::error!(error = %e, "Failed to restore subscriptions after reconnect");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Correlator lagged behind transport");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("Correlator listener stopped");
        });
    }
}

use super::{RunStore, StoreResult, TimerStore, WaitingStore};
use crate::{FlowDefinition, FlowId, FlowRun, NodeId, RunId, TimerJob, WaitingRegistration};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Process-local store; state is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    waits: RwLock<HashMap<String, WaitingRegistration>>,
    flows: RwLock<HashMap<FlowId, FlowDefinition>>,
    runs: RwLock<HashMap<RunId, FlowRun>>,
    timers: RwLock<HashMap<String, TimerJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expires_from(ttl: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(ttl).ok().map(|d| Utc::now() + d)
}

#[async_trait]
impl WaitingStore for MemoryStore {
    async fn put(&self, mut registration: WaitingRegistration, ttl: Option<Duration>) -> StoreResult<()> {
        if let Some(ttl) = ttl {
            registration.expires_at = expires_from(ttl);
        }
        self.waits
            .write()
            .await
            .insert(registration.correlation_id.clone(), registration);
        Ok(())
    }

    async fn get(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        Ok(self
            .waits
            .read()
            .await
            .get(correlation_id)
            .filter(|r| !r.is_expired())
            .cloned())
    }

    async fn delete(&self, correlation_id: &str) -> StoreResult<bool> {
        Ok(self.waits.write().await.remove(correlation_id).is_some())
    }

    async fn take_if_present(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        let mut waits = self.waits.write().await;
        match waits.get(correlation_id) {
            Some(r) if r.is_expired() => Ok(None),
            Some(_) => Ok(waits.remove(correlation_id)),
            None => Ok(None),
        }
    }

    async fn find_by_node(&self, run_id: RunId, node_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        Ok(self
            .waits
            .read()
            .await
            .values()
            .find(|r| r.run_id == run_id && r.node_id == node_id && !r.is_expired())
            .cloned())
    }

    async fn list_by_run(&self, run_id: RunId) -> StoreResult<Vec<WaitingRegistration>> {
        let mut found: Vec<_> = self
            .waits
            .read()
            .await
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn list_active(&self) -> StoreResult<Vec<WaitingRegistration>> {
        let now = Utc::now();
        Ok(self
            .waits
            .read()
            .await
            .values()
            .filter(|r| !r.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn purge_expired(&self) -> StoreResult<Vec<WaitingRegistration>> {
        let now = Utc::now();
        let mut waits = self.waits.write().await;
        let expired: Vec<String> = waits
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.correlation_id.clone())
            .collect();
        Ok(expired.iter().filter_map(|id| waits.remove(id)).collect())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_flow(&self, flow: &FlowDefinition) -> StoreResult<()> {
        self.flows.write().await.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn load_flow(&self, flow_id: FlowId) -> StoreResult<Option<FlowDefinition>> {
        Ok(self.flows.read().await.get(&flow_id).cloned())
    }

    async fn list_flows(&self) -> StoreResult<Vec<FlowDefinition>> {
        let mut flows: Vec<_> = self.flows.read().await.values().cloned().collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flows)
    }

    async fn save_run(&self, run: &FlowRun) -> StoreResult<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> StoreResult<Option<FlowRun>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self) -> StoreResult<Vec<FlowRun>> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

#[async_trait]
impl TimerStore for MemoryStore {
    async fn save_timer(&self, job: &TimerJob) -> StoreResult<()> {
        self.timers.write().await.insert(job.key(), job.clone());
        Ok(())
    }

    async fn delete_timer(&self, run_id: RunId, node_id: &NodeId) -> StoreResult<()> {
        self.timers
            .write()
            .await
            .remove(&crate::timer_key(run_id, node_id));
        Ok(())
    }

    async fn list_timers(&self) -> StoreResult<Vec<TimerJob>> {
        Ok(self.timers.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PauseDescriptor, Schedule};
    use std::sync::Arc;
    use uuid::Uuid;

    fn registration(cid: &str) -> WaitingRegistration {
        WaitingRegistration::from_descriptor(cid, Uuid::new_v4(), "wait", &PauseDescriptor::timeout(5))
    }

    #[tokio::test]
    async fn take_if_present_is_single_winner() {
        let store = Arc::new(MemoryStore::new());
        store.put(registration("c-1"), None).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.take_if_present("c-1").await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.take_if_present("c-1").await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
        assert!(store.get("c-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_registrations_read_as_absent_and_are_purged() {
        let store = MemoryStore::new();
        let mut reg = registration("c-2");
        reg.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.put(reg, None).await.unwrap();

        assert!(store.get("c-2").await.unwrap().is_none());
        assert!(store.take_if_present("c-2").await.unwrap().is_none());
        let purged = store.purge_expired().await.unwrap();
        assert_eq!(purged.len(), 1);
        assert!(store.purge_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timers_are_keyed_by_run_and_node() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let first = TimerJob::new(run_id, "wait", "c-1", Schedule::Interval { seconds: 5 });
        let second = TimerJob::new(run_id, "wait", "c-2", Schedule::Interval { seconds: 5 });
        store.save_timer(&first).await.unwrap();
        store.save_timer(&second).await.unwrap();

        let timers = store.list_timers().await.unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].correlation_id, "c-2");

        store.delete_timer(run_id, &"wait".to_string()).await.unwrap();
        store.delete_timer(run_id, &"wait".to_string()).await.unwrap();
        assert!(store.list_timers().await.unwrap().is_empty());
    }
}

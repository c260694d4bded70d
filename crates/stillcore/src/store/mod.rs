//! Persistence contracts for runs, flow definitions, waiting registrations
//! and timer jobs.
//!
//! The Waiting-State Store is the authority on whether a correlation id is
//! still awaiting resumption; `take_if_present` is the single linearization
//! point for racing resume triggers.

mod memory;

pub use memory::MemoryStore;

use crate::{
    FlowDefinition, FlowId, FlowRun, NodeId, RunId, StoreError, TimerJob, WaitingRegistration,
};
use async_trait::async_trait;
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait WaitingStore: Send + Sync {
    /// Insert or replace the registration for its correlation id.
    /// `ttl` overrides `expires_at` when given.
    async fn put(&self, registration: WaitingRegistration, ttl: Option<Duration>) -> StoreResult<()>;

    /// Live registration for `correlation_id`; expired records read as absent.
    async fn get(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>>;

    /// Remove the registration; returns whether one existed.
    async fn delete(&self, correlation_id: &str) -> StoreResult<bool>;

    /// Atomically remove and return the live registration.
    async fn take_if_present(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>>;

    /// Live registration for a (run, node) pair.
    async fn find_by_node(&self, run_id: RunId, node_id: &str) -> StoreResult<Option<WaitingRegistration>>;

    async fn list_by_run(&self, run_id: RunId) -> StoreResult<Vec<WaitingRegistration>>;

    /// Every live registration, used to restore channel subscriptions.
    async fn list_active(&self) -> StoreResult<Vec<WaitingRegistration>>;

    /// Remove and return every registration that expired.
    async fn purge_expired(&self) -> StoreResult<Vec<WaitingRegistration>>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_flow(&self, flow: &FlowDefinition) -> StoreResult<()>;

    async fn load_flow(&self, flow_id: FlowId) -> StoreResult<Option<FlowDefinition>>;

    async fn list_flows(&self) -> StoreResult<Vec<FlowDefinition>>;

    async fn save_run(&self, run: &FlowRun) -> StoreResult<()>;

    async fn load_run(&self, run_id: RunId) -> StoreResult<Option<FlowRun>>;

    async fn list_runs(&self) -> StoreResult<Vec<FlowRun>>;
}

#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Insert or replace the job stored under its key.
    async fn save_timer(&self, job: &TimerJob) -> StoreResult<()>;

    async fn delete_timer(&self, run_id: RunId, node_id: &NodeId) -> StoreResult<()>;

    async fn list_timers(&self) -> StoreResult<Vec<TimerJob>>;
}

/// A backend that carries every durable record of the engine.
pub trait StateStore: WaitingStore + RunStore + TimerStore {}

impl<T: WaitingStore + RunStore + TimerStore> StateStore for T {}

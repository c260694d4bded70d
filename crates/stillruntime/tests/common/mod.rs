//! Shared fixtures for runtime integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stillcore::store::{MemoryStore, RunStore, StateStore, StoreResult, TimerStore, WaitingStore};
use stillcore::transport::{ChannelTransport, InMemoryTransport, TransportSignal};
use stillcore::{
    ExecutionType, FlowDefinition, FlowId, FlowRun, Node, NodeContext, NodeError, NodeId,
    NodeOutput, PauseDescriptor, ResumeSource, RunId, RunStatus, Schedule, SchedulingError,
    StoreError, TimerJob, Value, WaitingRegistration,
};
use stillruntime::{FlowRuntime, NodeFactory, NodeRegistry, RuntimeConfig};
use tokio::sync::broadcast;

/// One recorded node invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub node_id: String,
    pub execution_type: ExecutionType,
    pub inputs: HashMap<String, Value>,
    pub payload: Option<Value>,
    pub source: Option<ResumeSource>,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Node whose behaviour is picked by its `mode` config entry.
struct Scripted {
    calls: CallLog,
}

fn config_u64(ctx: &NodeContext, name: &str, default: u64) -> u64 {
    ctx.config
        .get(name)
        .and_then(Value::as_f64)
        .map_or(default, |n| n as u64)
}

fn config_str<'a>(ctx: &'a NodeContext, name: &str) -> Option<&'a str> {
    ctx.config.get(name).and_then(Value::as_str)
}

#[async_trait]
impl Node for Scripted {
    fn node_type(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.lock().unwrap().push(Call {
            node_id: ctx.node_id.clone(),
            execution_type: ctx.execution_type,
            inputs: ctx.inputs.clone(),
            payload: ctx.resume_payload.clone(),
            source: ctx.resume_source,
        });

        let mode = config_str(&ctx, "mode").unwrap_or("pass");
        let resumed = ctx.is_resume();
        let mut output = NodeOutput::new().with_output(ctx.node_id.clone(), true);
        if let Some(payload) = &ctx.resume_payload {
            output = output.with_output("payload", payload.clone());
        }

        match mode {
            "fail" => Err(NodeError::ExecutionFailed(format!("{} failed", ctx.node_id))),
            "handles" => {
                let fire = config_str(&ctx, "fire").unwrap_or_default();
                let handles: Vec<&str> = fire.split(',').filter(|h| !h.is_empty()).collect();
                Ok(output.with_handles(handles))
            }
            "timer" if !resumed => {
                ctx.pause(PauseDescriptor::timeout(config_u64(&ctx, "seconds", 5)))?;
                Ok(NodeOutput::new())
            }
            "interval" => {
                let fired = ctx.resume_metadata.as_f64().unwrap_or(0.0) as u64 + u64::from(resumed);
                if fired < config_u64(&ctx, "times", 3) {
                    let schedule = Schedule::Interval {
                        seconds: config_u64(&ctx, "seconds", 2),
                    };
                    ctx.pause(PauseDescriptor::timer(schedule).with_metadata(fired as f64))?;
                    return Ok(NodeOutput::new());
                }
                Ok(output)
            }
            "channel" if !resumed => {
                let mut descriptor = PauseDescriptor::channel(config_str(&ctx, "channel").unwrap_or("orders"));
                if let Some(seconds) = ctx.config.get("timeout").and_then(Value::as_f64) {
                    descriptor = descriptor.or_timeout(seconds as u64);
                }
                if let Some(ttl) = ctx.config.get("ttl").and_then(Value::as_f64) {
                    descriptor = descriptor.with_ttl(ttl as u64);
                }
                ctx.pause(descriptor)?;
                Ok(NodeOutput::new())
            }
            "webhook" if !resumed => {
                ctx.pause(PauseDescriptor::webhook(config_str(&ctx, "path").unwrap_or("approve")))?;
                Ok(NodeOutput::new())
            }
            _ => Ok(output),
        }
    }
}

struct ScriptedFactory {
    calls: CallLog,
}

impl NodeFactory for ScriptedFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(Scripted {
            calls: Arc::clone(&self.calls),
        }))
    }

    fn node_type(&self) -> &str {
        "scripted"
    }
}

pub fn scripted_registry(calls: &CallLog) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ScriptedFactory {
        calls: Arc::clone(calls),
    }));
    registry
}

/// Started in-memory runtime plus the log of every scripted invocation.
pub async fn runtime() -> (FlowRuntime, CallLog) {
    let calls = CallLog::default();
    let runtime = FlowRuntime::builder()
        .registry(scripted_registry(&calls))
        .config(test_config())
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();
    (runtime, calls)
}

/// Started runtime over the given store and transport.
pub async fn runtime_with(
    store: Arc<dyn StateStore>,
    transport: Arc<dyn ChannelTransport>,
    config: RuntimeConfig,
) -> (FlowRuntime, CallLog) {
    let calls = CallLog::default();
    let runtime = FlowRuntime::builder()
        .registry(scripted_registry(&calls))
        .config(config)
        .store(store)
        .transport(transport)
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();
    (runtime, calls)
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        retry: stillcore::RetryPolicy::immediate(2),
        ..RuntimeConfig::default()
    }
}

pub fn invocations(calls: &CallLog, node_id: &str) -> Vec<Call> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.node_id == node_id)
        .cloned()
        .collect()
}

pub fn count(calls: &CallLog, node_id: &str, execution_type: ExecutionType) -> usize {
    invocations(calls, node_id)
        .iter()
        .filter(|c| c.execution_type == execution_type)
        .count()
}

pub fn order(calls: &CallLog) -> Vec<String> {
    calls.lock().unwrap().iter().map(|c| c.node_id.clone()).collect()
}

/// Poll until the run reaches `status`; panics after a generous bound.
pub async fn wait_for(runtime: &FlowRuntime, run_id: RunId, status: RunStatus) -> FlowRun {
    for _ in 0..500 {
        let run = runtime.get_run(run_id).await.unwrap();
        if run.status == status {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let run = runtime.get_run(run_id).await.unwrap();
    panic!("run {} stuck in {} waiting for {}", run_id, run.status, status);
}

/// Consume one scheduled failure, if any are left.
fn trip(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// In-memory store whose selected operations fail a set number of times.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    pub load_run_failures: AtomicUsize,
    pub save_run_failures: AtomicUsize,
    pub save_timer_failures: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn check(&self, failures: &AtomicUsize, op: &str) -> StoreResult<()> {
        if trip(failures) {
            return Err(StoreError::Unavailable(format!("{} refused", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl WaitingStore for FailingStore {
    async fn put(&self, registration: WaitingRegistration, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.put(registration, ttl).await
    }

    async fn get(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        self.inner.get(correlation_id).await
    }

    async fn delete(&self, correlation_id: &str) -> StoreResult<bool> {
        self.inner.delete(correlation_id).await
    }

    async fn take_if_present(&self, correlation_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        self.inner.take_if_present(correlation_id).await
    }

    async fn find_by_node(&self, run_id: RunId, node_id: &str) -> StoreResult<Option<WaitingRegistration>> {
        self.inner.find_by_node(run_id, node_id).await
    }

    async fn list_by_run(&self, run_id: RunId) -> StoreResult<Vec<WaitingRegistration>> {
        self.inner.list_by_run(run_id).await
    }

    async fn list_active(&self) -> StoreResult<Vec<WaitingRegistration>> {
        self.inner.list_active().await
    }

    async fn purge_expired(&self) -> StoreResult<Vec<WaitingRegistration>> {
        self.inner.purge_expired().await
    }
}

#[async_trait]
impl RunStore for FailingStore {
    async fn save_flow(&self, flow: &FlowDefinition) -> StoreResult<()> {
        self.inner.save_flow(flow).await
    }

    async fn load_flow(&self, flow_id: FlowId) -> StoreResult<Option<FlowDefinition>> {
        self.inner.load_flow(flow_id).await
    }

    async fn list_flows(&self) -> StoreResult<Vec<FlowDefinition>> {
        self.inner.list_flows().await
    }

    async fn save_run(&self, run: &FlowRun) -> StoreResult<()> {
        self.check(&self.save_run_failures, "save_run")?;
        self.inner.save_run(run).await
    }

    async fn load_run(&self, run_id: RunId) -> StoreResult<Option<FlowRun>> {
        self.check(&self.load_run_failures, "load_run")?;
        self.inner.load_run(run_id).await
    }

    async fn list_runs(&self) -> StoreResult<Vec<FlowRun>> {
        self.inner.list_runs().await
    }
}

#[async_trait]
impl TimerStore for FailingStore {
    async fn save_timer(&self, job: &TimerJob) -> StoreResult<()> {
        self.check(&self.save_timer_failures, "save_timer")?;
        self.inner.save_timer(job).await
    }

    async fn delete_timer(&self, run_id: RunId, node_id: &NodeId) -> StoreResult<()> {
        self.inner.delete_timer(run_id, node_id).await
    }

    async fn list_timers(&self) -> StoreResult<Vec<TimerJob>> {
        self.inner.list_timers().await
    }
}

/// In-memory transport whose next `subscribe_failures` subscribes fail.
#[derive(Default)]
pub struct FailingTransport {
    pub inner: InMemoryTransport,
    pub subscribe_failures: AtomicUsize,
}

impl FailingTransport {
    pub fn new(subscribe_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryTransport::new(),
            subscribe_failures: AtomicUsize::new(subscribe_failures),
        })
    }
}

#[async_trait]
impl ChannelTransport for FailingTransport {
    fn name(&self) -> &str {
        "failing"
    }

    async fn subscribe(&self, channel: &str) -> Result<(), SchedulingError> {
        if trip(&self.subscribe_failures) {
            return Err(SchedulingError::Transport(format!("cannot subscribe {}", channel)));
        }
        self.inner.subscribe(channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SchedulingError> {
        self.inner.unsubscribe(channel).await
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), SchedulingError> {
        self.inner.publish(channel, payload).await
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.inner.signals()
    }
}

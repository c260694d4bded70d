mod common;

use common::{count, runtime_with, test_config, wait_for, FailingStore, FailingTransport};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use stillcore::store::{TimerStore, WaitingStore};
use stillcore::transport::{ChannelTransport, InMemoryTransport};
use stillcore::{ExecutionType, FlowDefinition, NodeSpec, RunId, RunStatus, Value, WaitKind};
use stillruntime::{FlowRuntime, ResumeOutcome, RuntimeConfig};

fn single(node: NodeSpec) -> FlowDefinition {
    let mut flow = FlowDefinition::new("infrastructure");
    flow.add_node(node);
    flow
}

fn webhook_flow() -> FlowDefinition {
    single(
        NodeSpec::new("approval", "scripted")
            .with_config("mode", "webhook")
            .with_config("path", "approve"),
    )
}

fn channel_flow() -> FlowDefinition {
    single(
        NodeSpec::new("listen", "scripted")
            .with_config("mode", "channel")
            .with_config("channel", "orders"),
    )
}

async fn waiting_on(runtime: &FlowRuntime, run_id: RunId) -> String {
    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    run.waiting_correlations()[0].clone()
}

async fn on_store(store: &Arc<FailingStore>) -> (FlowRuntime, common::CallLog) {
    runtime_with(store.clone(), Arc::new(InMemoryTransport::new()), test_config()).await
}

#[tokio::test]
async fn failed_run_load_puts_the_registration_back() {
    let store = FailingStore::new();
    let (runtime, calls) = on_store(&store).await;
    let run_id = runtime.start_run(&webhook_flow(), Value::Null).await.unwrap();
    let cid = waiting_on(&runtime, run_id).await;

    // Every attempt of the retry policy fails.
    store.load_run_failures.store(2, Ordering::SeqCst);
    let delivery = runtime.deliver_webhook("approve", Value::from("yes")).await;
    assert_eq!(delivery.failed.len(), 1);

    assert!(store.get(&cid).await.unwrap().is_some());
    assert_eq!(
        runtime.correlator().waiters(WaitKind::Webhook, "approve").await,
        vec![cid.clone()]
    );
    assert_eq!(count(&calls, "approval", ExecutionType::Resume), 0);

    let delivery = runtime.deliver_webhook("approve", Value::from("yes")).await;
    assert_eq!(delivery.resumed, vec![cid]);
    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert_eq!(count(&calls, "approval", ExecutionType::Resume), 1);
}

#[tokio::test(start_paused = true)]
async fn timer_fire_outlasts_a_failing_run_load() {
    let store = FailingStore::new();
    let (runtime, calls) = on_store(&store).await;
    let flow = single(
        NodeSpec::new("wait", "scripted")
            .with_config("mode", "timer")
            .with_config("seconds", 5i64),
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    waiting_on(&runtime, run_id).await;

    // The first resume exhausts its retries; the timer's own retry succeeds.
    store.load_run_failures.store(3, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(6)).await;

    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert_eq!(count(&calls, "wait", ExecutionType::Resume), 1);
    assert!(store.list_timers().await.unwrap().is_empty());
}

#[tokio::test]
async fn unsaved_resume_leaves_the_run_waiting() {
    let store = FailingStore::new();
    let (runtime, calls) = on_store(&store).await;
    let run_id = runtime.start_run(&webhook_flow(), Value::Null).await.unwrap();
    let cid = waiting_on(&runtime, run_id).await;

    // Retries and the FAILED marker all fail, so nothing was written.
    store.save_run_failures.store(3, Ordering::SeqCst);
    assert!(runtime.resume(&cid, Value::Null).await.is_err());

    assert_eq!(waiting_on(&runtime, run_id).await, cid);
    assert!(store.get(&cid).await.unwrap().is_some());

    let outcome = runtime.resume(&cid, Value::Null).await.unwrap();
    assert!(outcome.is_resumed());
    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert_eq!(count(&calls, "approval", ExecutionType::Resume), 1);
}

#[tokio::test]
async fn unsaved_run_record_fails_the_run() {
    let store = FailingStore::new();
    let (runtime, calls) = on_store(&store).await;
    let run_id = runtime.start_run(&webhook_flow(), Value::Null).await.unwrap();
    let cid = waiting_on(&runtime, run_id).await;

    store.save_run_failures.store(2, Ordering::SeqCst);
    assert!(runtime.resume(&cid, Value::Null).await.is_err());

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure.unwrap().message.contains("could not be saved"));
    assert!(store.get(&cid).await.unwrap().is_none());
    assert!(runtime.orchestrator().waiting_on(run_id).await.unwrap().is_empty());
    assert!(runtime.correlator().waiters(WaitKind::Webhook, "approve").await.is_empty());

    let outcome = runtime.resume(&cid, Value::Null).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::NotFound);
    assert_eq!(count(&calls, "approval", ExecutionType::Resume), 0);
}

#[tokio::test(start_paused = true)]
async fn unscheduled_timer_leaves_the_run_waiting() {
    let store = FailingStore::new();
    store.save_timer_failures.store(2, Ordering::SeqCst);
    let (runtime, calls) = on_store(&store).await;
    let flow = single(
        NodeSpec::new("wait", "scripted")
            .with_config("mode", "timer")
            .with_config("seconds", 5i64),
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    let cid = waiting_on(&runtime, run_id).await;
    assert!(runtime.scheduler().active_jobs().await.is_empty());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(waiting_on(&runtime, run_id).await, cid);
    assert_eq!(count(&calls, "wait", ExecutionType::Resume), 0);
    assert!(store.list_timers().await.unwrap().is_empty());

    // An operator can still resume it directly.
    assert!(runtime.resume(&cid, Value::Null).await.unwrap().is_resumed());
    wait_for(&runtime, run_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn failed_subscribe_is_retried_by_the_next_waiter() {
    let transport = FailingTransport::new(2);
    let (runtime, calls) = runtime_with(FailingStore::new(), transport.clone(), test_config()).await;

    let first = runtime.start_run(&channel_flow(), Value::Null).await.unwrap();
    waiting_on(&runtime, first).await;
    assert!(!transport.inner.is_subscribed("orders").await);
    assert_eq!(runtime.correlator().pending_subscriptions().await, vec!["orders".to_string()]);

    let second = runtime.start_run(&channel_flow(), Value::Null).await.unwrap();
    waiting_on(&runtime, second).await;
    assert!(transport.inner.is_subscribed("orders").await);

    runtime.publish("orders", Value::from("paid")).await.unwrap();
    wait_for(&runtime, first, RunStatus::Completed).await;
    wait_for(&runtime, second, RunStatus::Completed).await;
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 2);
}

#[tokio::test(start_paused = true)]
async fn sweeper_recovers_a_deaf_channel() {
    let transport = FailingTransport::new(2);
    let config = RuntimeConfig {
        expiry_sweep_interval_secs: 1,
        ..test_config()
    };
    let (runtime, calls) = runtime_with(FailingStore::new(), transport.clone(), config).await;

    let run_id = runtime.start_run(&channel_flow(), Value::Null).await.unwrap();
    waiting_on(&runtime, run_id).await;
    assert!(!transport.inner.is_subscribed("orders").await);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(transport.inner.is_subscribed("orders").await);
    assert!(runtime.correlator().pending_subscriptions().await.is_empty());

    transport.publish("orders", Value::from("paid")).await.unwrap();
    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 1);
}

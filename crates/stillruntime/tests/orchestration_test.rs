mod common;

use common::{count, invocations, order, runtime, wait_for};
use std::time::Duration;
use stillcore::{
    ExecutionType, FlowDefinition, NodeSpec, NodeStatus, ResumeSource, RunStatus, Value, WaitKind,
    ERROR_HANDLE, MAIN_HANDLE,
};
use stillruntime::ResumeOutcome;
use tokio::time::sleep;

fn scripted(id: &str) -> NodeSpec {
    NodeSpec::new(id, "scripted")
}

fn flow(nodes: Vec<NodeSpec>, edges: &[(&str, &str, &str)]) -> FlowDefinition {
    let mut flow = FlowDefinition::new("test");
    for node in nodes {
        flow.add_node(node);
    }
    for (source, handle, target) in edges {
        flow.connect(*source, *handle, *target);
    }
    flow
}

#[tokio::test]
async fn linear_flow_runs_each_node_once() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("a"), scripted("b"), scripted("c")],
        &[("a", MAIN_HANDLE, "b"), ("b", MAIN_HANDLE, "c")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(order(&calls), vec!["a", "b", "c"]);
    for node in ["a", "b", "c"] {
        assert_eq!(count(&calls, node, ExecutionType::Begin), 1);
        assert_eq!(run.node_status(node), NodeStatus::Completed);
        assert!(run.context.contains_key(node));
    }
    // Outputs of a predecessor become the inputs of its successor.
    assert_eq!(invocations(&calls, "b")[0].inputs.get("a"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn entry_nodes_receive_run_input() {
    let (runtime, calls) = runtime().await;
    let flow = flow(vec![scripted("a")], &[]);
    let input = Value::from_json(serde_json::json!({"order": 7}));

    runtime.start_run(&flow, input).await.unwrap();

    let call = &invocations(&calls, "a")[0];
    assert_eq!(call.inputs.get("order"), Some(&Value::Number(7.0)));
}

#[tokio::test(start_paused = true)]
async fn timer_wait_resumes_after_delay() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("a"), scripted("wait").with_config("mode", "timer").with_config("seconds", 5i64), scripted("c")],
        &[("a", MAIN_HANDLE, "wait"), ("wait", MAIN_HANDLE, "c")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.node_status("wait"), NodeStatus::Waiting);
    assert_eq!(run.node_status("c"), NodeStatus::Pending);

    let waits = runtime.orchestrator().waiting_on(run_id).await.unwrap();
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].kind, WaitKind::Timer);
    assert_eq!(run.waiting_correlations(), vec![waits[0].correlation_id.clone()]);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Waiting);
    assert!(invocations(&calls, "c").is_empty());

    sleep(Duration::from_secs(2)).await;
    let run = wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert_eq!(run.node_status("c"), NodeStatus::Completed);
    assert_eq!(count(&calls, "wait", ExecutionType::Begin), 1);
    assert_eq!(count(&calls, "wait", ExecutionType::Resume), 1);
    assert_eq!(count(&calls, "c", ExecutionType::Begin), 1);

    let payload = invocations(&calls, "wait")[1].payload.clone().unwrap();
    assert!(payload.get("firedAt").is_some());
    assert!(runtime.scheduler().active_jobs().await.is_empty());
    assert!(runtime.orchestrator().waiting_on(run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn fan_out_reaches_every_target() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("a"), scripted("d"), scripted("e")],
        &[("a", MAIN_HANDLE, "d"), ("a", MAIN_HANDLE, "e")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Completed);
    assert_eq!(count(&calls, "d", ExecutionType::Begin), 1);
    assert_eq!(count(&calls, "e", ExecutionType::Begin), 1);
}

#[tokio::test]
async fn zero_handles_end_the_branch() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("a").with_config("mode", "handles").with_config("fire", ""), scripted("b")],
        &[("a", MAIN_HANDLE, "b")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.node_status("b"), NodeStatus::Pending);
    assert!(invocations(&calls, "b").is_empty());
}

#[tokio::test]
async fn only_fired_handles_advance() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![
            scripted("check").with_config("mode", "handles").with_config("fire", "true"),
            scripted("yes"),
            scripted("no"),
        ],
        &[("check", "true", "yes"), ("check", "false", "no")],
    );

    runtime.start_run(&flow, Value::Null).await.unwrap();

    assert_eq!(invocations(&calls, "yes").len(), 1);
    assert!(invocations(&calls, "no").is_empty());
}

#[tokio::test(start_paused = true)]
async fn join_waits_for_suspended_branch() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![
            scripted("a"),
            scripted("slow").with_config("mode", "timer").with_config("seconds", 5i64),
            scripted("fast"),
            scripted("join"),
        ],
        &[
            ("a", MAIN_HANDLE, "slow"),
            ("a", MAIN_HANDLE, "fast"),
            ("slow", MAIN_HANDLE, "join"),
            ("fast", MAIN_HANDLE, "join"),
        ],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.node_status("fast"), NodeStatus::Completed);
    assert!(invocations(&calls, "join").is_empty());

    sleep(Duration::from_secs(6)).await;
    wait_for(&runtime, run_id, RunStatus::Completed).await;

    let joined = invocations(&calls, "join");
    assert_eq!(joined.len(), 1);
    assert!(joined[0].inputs.contains_key("slow"));
    assert!(joined[0].inputs.contains_key("fast"));
}

#[tokio::test]
async fn error_edge_routes_failure() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("risky").with_config("mode", "fail"), scripted("next"), scripted("recover")],
        &[("risky", MAIN_HANDLE, "next"), ("risky", ERROR_HANDLE, "recover")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.node_status("risky"), NodeStatus::Failed);
    assert!(invocations(&calls, "next").is_empty());
    let recovered = invocations(&calls, "recover");
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].inputs.contains_key("error"));
}

#[tokio::test]
async fn failure_without_error_edge_fails_run() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("risky").with_config("mode", "fail"), scripted("next")],
        &[("risky", MAIN_HANDLE, "next")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.unwrap();
    assert_eq!(failure.node_id, "risky");
    assert!(failure.message.contains("risky failed"));
    assert!(invocations(&calls, "next").is_empty());
}

#[tokio::test]
async fn failed_run_cancels_other_waits() {
    let (runtime, _calls) = runtime().await;
    let flow = flow(
        vec![
            scripted("a"),
            scripted("listen").with_config("mode", "channel").with_config("channel", "orders"),
            scripted("risky").with_config("mode", "fail"),
        ],
        &[("a", MAIN_HANDLE, "listen"), ("a", MAIN_HANDLE, "risky")],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Failed);
    assert!(runtime.orchestrator().waiting_on(run_id).await.unwrap().is_empty());
    assert!(runtime.correlator().waiters(WaitKind::Channel, "orders").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_waits() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("wait").with_config("mode", "timer").with_config("seconds", 5i64)],
        &[],
    );

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    assert_eq!(runtime.scheduler().active_jobs().await.len(), 1);

    assert_eq!(runtime.stop(run_id).await.unwrap(), RunStatus::Stopped);
    assert!(runtime.orchestrator().waiting_on(run_id).await.unwrap().is_empty());
    assert!(runtime.scheduler().active_jobs().await.is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(count(&calls, "wait", ExecutionType::Resume), 0);
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Stopped);

    // Stopping twice is harmless.
    assert_eq!(runtime.stop(run_id).await.unwrap(), RunStatus::Stopped);
}

#[tokio::test]
async fn stop_leaves_finished_run_alone() {
    let (runtime, _calls) = runtime().await;
    let flow = flow(vec![scripted("a")], &[]);

    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    assert_eq!(runtime.stop(run_id).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn finished_run_keeps_its_lock_until_pruned() {
    let (runtime, _calls) = runtime().await;
    let run_id = runtime.start_run(&flow(vec![scripted("a")], &[]), Value::Null).await.unwrap();
    wait_for(&runtime, run_id, RunStatus::Completed).await;

    assert!(runtime.orchestrator().prune_locks().await >= 1);
    assert_eq!(runtime.orchestrator().prune_locks().await, 0);
    assert_eq!(runtime.stop(run_id).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn stop_racing_resume_settles_once() {
    let (runtime, _calls) = runtime().await;
    let flow = flow(
        vec![scripted("approval").with_config("mode", "webhook").with_config("path", "approve")],
        &[],
    );

    for _ in 0..10 {
        let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
        let cid = runtime.get_run(run_id).await.unwrap().waiting_correlations()[0].clone();

        let (stopped, resumed) = tokio::join!(runtime.stop(run_id), runtime.resume(&cid, Value::Null));
        let (stopped, resumed) = (stopped.unwrap(), resumed.unwrap());

        let run = runtime.get_run(run_id).await.unwrap();
        assert_eq!(run.status, stopped);
        if !resumed.is_resumed() {
            assert_eq!(stopped, RunStatus::Stopped);
        }
        assert!(runtime.orchestrator().waiting_on(run_id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn resume_is_at_most_once() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("listen").with_config("mode", "channel").with_config("channel", "orders")],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    let cid = runtime.get_run(run_id).await.unwrap().waiting_correlations()[0].clone();

    let (first, second) = tokio::join!(
        runtime.resume(&cid, Value::from("first")),
        runtime.resume(&cid, Value::from("second"))
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_resumed()).count(), 1);
    assert!(outcomes.contains(&ResumeOutcome::NotFound));
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 1);
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn unknown_correlation_is_not_found() {
    let (runtime, _calls) = runtime().await;
    let outcome = runtime.resume("nobody-waits-on-this", Value::Null).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::NotFound);
}

#[tokio::test]
async fn resume_after_stop_is_not_found() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("listen").with_config("mode", "channel").with_config("channel", "orders")],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    let cid = runtime.get_run(run_id).await.unwrap().waiting_correlations()[0].clone();

    runtime.stop(run_id).await.unwrap();

    assert_eq!(runtime.resume(&cid, Value::Null).await.unwrap(), ResumeOutcome::NotFound);
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 0);
}

#[tokio::test]
async fn channel_event_resumes_waiting_node() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![
            scripted("listen").with_config("mode", "channel").with_config("channel", "orders"),
            scripted("after"),
        ],
        &[("listen", MAIN_HANDLE, "after")],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Waiting);

    runtime.publish("orders", Value::from("order-42")).await.unwrap();

    wait_for(&runtime, run_id, RunStatus::Completed).await;
    let resumed = invocations(&calls, "listen");
    assert_eq!(resumed.len(), 2);
    assert_eq!(resumed[1].payload, Some(Value::from("order-42")));
    assert_eq!(invocations(&calls, "after").len(), 1);
    assert!(runtime.correlator().waiters(WaitKind::Channel, "orders").await.is_empty());
}

#[tokio::test]
async fn channel_event_is_broadcast_to_every_waiter() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("listen").with_config("mode", "channel").with_config("channel", "orders")],
        &[],
    );
    let first = runtime.start_run(&flow, Value::Null).await.unwrap();
    let second = runtime.start_run(&flow, Value::Null).await.unwrap();
    assert_eq!(runtime.correlator().waiters(WaitKind::Channel, "orders").await.len(), 2);

    runtime.publish("orders", Value::from("shipped")).await.unwrap();

    wait_for(&runtime, first, RunStatus::Completed).await;
    wait_for(&runtime, second, RunStatus::Completed).await;
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 2);
}

#[tokio::test]
async fn webhook_call_resumes_waiting_node() {
    let (runtime, _calls) = runtime().await;
    let flow = flow(
        vec![scripted("approval").with_config("mode", "webhook").with_config("path", "approve")],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    // Channel and webhook keys do not share an inbox.
    runtime.publish("approve", Value::Null).await.unwrap();
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Waiting);

    let delivery = runtime.deliver_webhook("approve", Value::from("yes")).await;
    assert_eq!(delivery.resumed.len(), 1);
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn channel_wins_race_against_timeout() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("listen")
            .with_config("mode", "channel")
            .with_config("channel", "orders")
            .with_config("timeout", 5i64)],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    assert_eq!(runtime.scheduler().active_jobs().await.len(), 1);

    sleep(Duration::from_secs(1)).await;
    runtime.publish("orders", Value::from("early")).await.unwrap();
    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert!(runtime.scheduler().active_jobs().await.is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 1);
    assert_eq!(invocations(&calls, "listen")[1].payload, Some(Value::from("early")));
}

#[tokio::test(start_paused = true)]
async fn timeout_wins_race_against_channel() {
    let (runtime, calls) = runtime().await;
    let transport = runtime.correlator().transport().clone();
    let flow = flow(
        vec![scripted("listen")
            .with_config("mode", "channel")
            .with_config("channel", "orders")
            .with_config("timeout", 5i64)],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    sleep(Duration::from_secs(6)).await;
    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert!(runtime.correlator().waiters(WaitKind::Channel, "orders").await.is_empty());

    transport.publish("orders", Value::from("late")).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(count(&calls, "listen", ExecutionType::Resume), 1);
    let resume = &invocations(&calls, "listen")[1];
    assert_eq!(resume.source, Some(ResumeSource::Timer));
    assert!(resume.payload.as_ref().unwrap().get("firedAt").is_some());
}

#[tokio::test(start_paused = true)]
async fn repeating_timer_keeps_its_cadence() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![scripted("poll")
            .with_config("mode", "interval")
            .with_config("seconds", 2i64)
            .with_config("times", 3i64)],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    let job = runtime.scheduler().active_jobs().await[0].clone();

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(count(&calls, "poll", ExecutionType::Resume), 1);
    let rebound = runtime.scheduler().active_jobs().await[0].clone();
    assert_eq!(rebound.job_id, job.job_id);
    assert_ne!(rebound.correlation_id, job.correlation_id);

    sleep(Duration::from_secs(4)).await;
    wait_for(&runtime, run_id, RunStatus::Completed).await;
    assert_eq!(count(&calls, "poll", ExecutionType::Resume), 3);
    assert!(runtime.scheduler().active_jobs().await.is_empty());
}

#[tokio::test]
async fn expired_wait_follows_error_edge() {
    let (runtime, calls) = runtime().await;
    let flow = flow(
        vec![
            scripted("listen")
                .with_config("mode", "channel")
                .with_config("channel", "orders")
                .with_config("ttl", 0i64),
            scripted("expired"),
        ],
        &[("listen", ERROR_HANDLE, "expired")],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();
    assert_eq!(runtime.get_run(run_id).await.unwrap().status, RunStatus::Waiting);

    assert_eq!(runtime.orchestrator().expire_waits().await.unwrap(), 1);

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.node_status("listen"), NodeStatus::Failed);
    assert_eq!(invocations(&calls, "expired").len(), 1);
    assert!(runtime.correlator().waiters(WaitKind::Channel, "orders").await.is_empty());
}

#[tokio::test]
async fn expired_wait_without_error_edge_fails_run() {
    let (runtime, _calls) = runtime().await;
    let flow = flow(
        vec![scripted("listen")
            .with_config("mode", "channel")
            .with_config("channel", "orders")
            .with_config("ttl", 0i64)],
        &[],
    );
    let run_id = runtime.start_run(&flow, Value::Null).await.unwrap();

    runtime.orchestrator().expire_waits().await.unwrap();

    let run = runtime.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure.unwrap().message.contains("expired"));
}

#[tokio::test]
async fn unknown_node_type_is_rejected() {
    let (runtime, _calls) = runtime().await;
    let flow = flow(vec![NodeSpec::new("x", "does.not.exist")], &[]);

    assert!(runtime.start_run(&flow, Value::Null).await.is_err());
}

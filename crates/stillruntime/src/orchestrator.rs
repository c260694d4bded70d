//! Flow Run Orchestrator: owns the per-run state machine.
//!
//! A node is claimed (marked RUNNING) under the run's lock before it is
//! dispatched; that claim is what keeps a node from executing twice at the
//! same time. Node logic always runs outside the lock.

use crate::config::RuntimeConfig;
use crate::correlator::EventCorrelator;
use crate::executor::{ExecutionOutcome, Invocation, NodeExecutor};
use crate::resume::{ResumeOutcome, ResumeSink};
use crate::scheduler::TimerScheduler;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use stillcore::store::{RunStore, StateStore, WaitingStore};
use stillcore::{
    EventBus, ExecutionEvent, ExecutionType, FlowDefinition, FlowError, FlowId, FlowRun,
    NodeError, NodeId, NodeOutput, NodeStatus, PauseDescriptor, ResumeSource, RunFailure, RunId,
    RunStatus, TimerJob, Value, WaitingRegistration, WorkflowError, DEFAULT_TENANT, ERROR_HANDLE,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A claimed node ready to be handed to the executor
struct Dispatch {
    node_id: NodeId,
    invocation: Invocation,
    resumed: bool,
}

enum ResumeClaim {
    Dispatch(Arc<FlowDefinition>, Box<Dispatch>),
    Rejected(String),
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    executor: Arc<NodeExecutor>,
    scheduler: Arc<TimerScheduler>,
    correlator: Arc<EventCorrelator>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
    flows: RwLock<HashMap<FlowId, Arc<FlowDefinition>>>,
    locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
    cancellations: Mutex<HashMap<RunId, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<NodeExecutor>,
        scheduler: Arc<TimerScheduler>,
        correlator: Arc<EventCorrelator>,
        event_bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            executor,
            scheduler,
            correlator,
            event_bus,
            config,
            flows: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<TimerScheduler> {
        &self.scheduler
    }

    pub fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }

    // ----- flows -----

    /// Validate and persist a flow definition.
    pub async fn register_flow(&self, flow: FlowDefinition) -> Result<Arc<FlowDefinition>, FlowError> {
        self.executor.registry().validate_flow(&flow)?;
        self.config
            .retry
            .run("save flow", || self.store.save_flow(&flow))
            .await?;
        let flow = Arc::new(flow);
        self.flows.write().await.insert(flow.id, Arc::clone(&flow));
        tracing::info!(flow_id = %flow.id, name = %flow.name, "Flow registered");
        Ok(flow)
    }

    pub async fn flow(&self, flow_id: FlowId) -> Result<Arc<FlowDefinition>, FlowError> {
        if let Some(flow) = self.flows.read().await.get(&flow_id) {
            return Ok(Arc::clone(flow));
        }
        let flow = self
            .store
            .load_flow(flow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(flow_id.to_string()))?;
        let flow = Arc::new(flow);
        self.flows.write().await.insert(flow_id, Arc::clone(&flow));
        Ok(flow)
    }

    pub async fn list_flows(&self) -> Result<Vec<FlowDefinition>, FlowError> {
        Ok(self.store.list_flows().await?)
    }

    // ----- runs -----

    /// Start a run of `flow` for the default tenant and drive it until it
    /// completes, fails or waits.
    pub async fn start_run(&self, flow: &FlowDefinition, input: Value) -> Result<RunId, FlowError> {
        self.start_run_for_tenant(DEFAULT_TENANT, flow, input).await
    }

    pub async fn start_run_for_tenant(
        &self,
        tenant_id: &str,
        flow: &FlowDefinition,
        input: Value,
    ) -> Result<RunId, FlowError> {
        let flow = self.register_flow(flow.clone()).await?;
        self.start(tenant_id, flow, input).await
    }

    /// Start a run of a previously registered flow.
    pub async fn start_stored_run(
        &self,
        tenant_id: &str,
        flow_id: FlowId,
        input: Value,
    ) -> Result<RunId, FlowError> {
        let flow = self.flow(flow_id).await?;
        self.start(tenant_id, flow, input).await
    }

    async fn start(
        &self,
        tenant_id: &str,
        flow: Arc<FlowDefinition>,
        input: Value,
    ) -> Result<RunId, FlowError> {
        let mut run = FlowRun::new(tenant_id, &flow, input);
        let run_id = run.run_id;
        let token = self.run_token(run_id).await;

        let dispatches = {
            let lock = self.run_lock(run_id).await;
            let _guard = lock.lock().await;
            let mut dispatches = Vec::new();
            for node_id in flow.entry_nodes() {
                dispatches.push(self.claim(&mut run, &flow, &node_id, ExecutionType::Begin, &token)?);
            }
            self.persist(&mut run).await?;
            dispatches
        };

        tracing::info!(%run_id, flow_id = %flow.id, tenant_id, entries = dispatches.len(), "Run started");
        self.event_bus.emit(ExecutionEvent::RunStarted {
            run_id,
            flow_id: flow.id,
            tenant_id: tenant_id.to_string(),
            timestamp: Utc::now(),
        });

        self.drive(run_id, flow, dispatches).await;
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<FlowRun, FlowError> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or(FlowError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self) -> Result<Vec<FlowRun>, FlowError> {
        Ok(self.store.list_runs().await?)
    }

    /// Registrations a run is blocked on.
    pub async fn waiting_on(&self, run_id: RunId) -> Result<Vec<WaitingRegistration>, FlowError> {
        self.get_run(run_id).await?;
        Ok(self.store.list_by_run(run_id).await?)
    }

    /// Resume the node suspended under `correlation_id` and drive the run
    /// until it is quiescent again.
    pub async fn resume(&self, correlation_id: &str, payload: Value) -> Result<ResumeOutcome, FlowError> {
        self.resume_from(correlation_id, payload, ResumeSource::Api).await
    }

    /// Resume on behalf of `source`. The registration is taken once; when a
    /// later step fails it is put back so the caller can retry the resume.
    pub async fn resume_from(
        &self,
        correlation_id: &str,
        payload: Value,
        source: ResumeSource,
    ) -> Result<ResumeOutcome, FlowError> {
        let Some(registration) = self.store.take_if_present(correlation_id).await? else {
            tracing::warn!(
                "{}, ignoring resume",
                FlowError::CorrelationNotFound(correlation_id.to_string())
            );
            return Ok(ResumeOutcome::NotFound);
        };
        let run_id = registration.run_id;
        let node_id = registration.node_id.clone();
        self.unlisten(&registration).await;

        let (flow, dispatch) = match self.claim_resume(&registration, payload, source).await {
            Ok(ResumeClaim::Dispatch(flow, dispatch)) => (flow, *dispatch),
            Ok(ResumeClaim::Rejected(reason)) => {
                return Ok(ResumeOutcome::Rejected { run_id, reason });
            }
            Err(e) => {
                tracing::error!(%run_id, %node_id, correlation_id, error = %e, "Resume failed");
                self.restore_registration(&registration).await;
                return Err(e);
            }
        };

        tracing::info!(%run_id, %node_id, correlation_id, ?source, "Run resumed");
        self.event_bus.emit(ExecutionEvent::RunResumed {
            run_id,
            node_id: node_id.clone(),
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
        });

        self.drive(run_id, flow, vec![dispatch]).await;
        let status = match self.get_run(run_id).await {
            Ok(run) => run.status,
            Err(e) => {
                tracing::warn!(%run_id, error = %e, "Could not read run status after resume");
                RunStatus::Running
            }
        };
        Ok(ResumeOutcome::Resumed {
            run_id,
            node_id,
            status,
        })
    }

    /// Validate a taken registration against its run and claim the node
    /// under the run lock. Nothing outside the run record changes on error.
    async fn claim_resume(
        &self,
        registration: &WaitingRegistration,
        payload: Value,
        source: ResumeSource,
    ) -> Result<ResumeClaim, FlowError> {
        let run_id = registration.run_id;
        let node_id = &registration.node_id;
        let correlation_id = registration.correlation_id.as_str();

        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let loaded = self
            .config
            .retry
            .run("load run", || self.store.load_run(run_id))
            .await?;
        let Some(mut run) = loaded else {
            tracing::warn!(%run_id, correlation_id, "Rejecting resume: run not found");
            return Ok(ResumeClaim::Rejected("run not found".to_string()));
        };
        if run.status.is_terminal() {
            tracing::warn!(%run_id, %node_id, correlation_id, status = %run.status, "Rejecting resume of finished run");
            self.cancel_timer(run_id, node_id).await;
            return Ok(ResumeClaim::Rejected(format!("run is {}", run.status)));
        }
        let waiting = run.node(node_id).map_or(false, |state| {
            state.status == NodeStatus::Waiting
                && state.correlation_ids.iter().any(|c| c == correlation_id)
        });
        if !waiting {
            tracing::warn!(%run_id, %node_id, correlation_id, "Rejecting stale resume");
            return Ok(ResumeClaim::Rejected(format!(
                "node {} is not waiting on {}",
                node_id, correlation_id
            )));
        }

        let flow = self.flow(run.flow_id).await?;
        let token = self.run_token(run_id).await;
        let mut dispatch = self.claim(&mut run, &flow, node_id, ExecutionType::Resume, &token)?;
        dispatch.invocation.resume_payload = Some(payload);
        dispatch.invocation.resume_metadata = registration.metadata.clone();
        dispatch.invocation.resume_source = source;
        dispatch.resumed = true;
        run.status = RunStatus::Running;
        self.persist(&mut run).await?;

        // A repeating timer keeps its cadence until the node settles.
        let repeating = registration.schedule.as_ref().map_or(false, |s| s.is_repeating());
        if !repeating {
            self.cancel_timer(run_id, node_id).await;
        }
        Ok(ResumeClaim::Dispatch(flow, Box::new(dispatch)))
    }

    /// Put back a registration whose resume failed after it was taken, and
    /// listen for it again. If the run ended meanwhile its waits are cleared
    /// instead.
    async fn restore_registration(&self, registration: &WaitingRegistration) {
        let run_id = registration.run_id;
        let correlation_id = registration.correlation_id.as_str();
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        if let Ok(Some(run)) = self.store.load_run(run_id).await {
            if run.status.is_terminal() {
                tracing::warn!(%run_id, correlation_id, status = %run.status, "Run ended, dropping registration");
                self.cancel_waits(run_id).await;
                self.release_run(run_id).await;
                return;
            }
        }

        let restored = self
            .config
            .retry
            .run("restore waiting registration", || {
                self.store.put(registration.clone(), None)
            })
            .await;
        if let Err(e) = restored {
            tracing::error!(%run_id, correlation_id, error = %e, "Registration lost, run left waiting");
            return;
        }
        if let (true, Some(key)) = (registration.listens(), registration.channel_key.as_deref()) {
            if let Err(e) = self
                .correlator
                .register_wait(registration.kind, key, correlation_id)
                .await
            {
                tracing::warn!(channel = key, error = %e, "Restored registration is not subscribed yet");
            }
        }
        tracing::info!(%run_id, correlation_id, "Waiting registration restored");
    }

    /// Cancel every wait of the run and mark it STOPPED. Stopping a run that
    /// already finished leaves it as it is.
    pub async fn stop(&self, run_id: RunId) -> Result<RunStatus, FlowError> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(%run_id, status = %run.status, "Stop ignored, run already finished");
            return Ok(run.status);
        }

        run.status = RunStatus::Stopped;
        for state in run.node_states.values_mut() {
            state.correlation_ids.clear();
        }
        run.deferred.clear();
        self.persist(&mut run).await?;
        self.cancel_waits(run_id).await;
        self.release_run(run_id).await;

        tracing::info!(%run_id, "Run stopped");
        self.event_bus.emit(ExecutionEvent::RunStopped {
            run_id,
            timestamp: Utc::now(),
        });
        Ok(RunStatus::Stopped)
    }

    /// Purge expired registrations and fail the nodes waiting on them.
    /// Returns the number of nodes failed.
    pub async fn expire_waits(&self) -> Result<usize, FlowError> {
        let expired = self.store.purge_expired().await?;
        let mut failed = 0;
        for registration in expired {
            self.unlisten(&registration).await;
            self.cancel_timer(registration.run_id, &registration.node_id).await;
            match self.expire(&registration).await {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    run_id = %registration.run_id,
                    node_id = %registration.node_id,
                    error = %e,
                    "Failed to expire wait"
                ),
            }
        }
        Ok(failed)
    }

    async fn expire(&self, registration: &WaitingRegistration) -> Result<bool, FlowError> {
        let run_id = registration.run_id;
        let node_id = &registration.node_id;
        let cid = &registration.correlation_id;

        let (flow, next) = {
            let lock = self.run_lock(run_id).await;
            let _guard = lock.lock().await;
            let Some(mut run) = self.store.load_run(run_id).await? else {
                return Ok(false);
            };
            let waiting = run.node(node_id).map_or(false, |state| {
                state.status == NodeStatus::Waiting && state.correlation_ids.contains(cid)
            });
            if run.status.is_terminal() || !waiting {
                return Ok(false);
            }

            tracing::warn!(%run_id, %node_id, correlation_id = %cid, "Wait expired");
            let error = NodeError::WaitExpired(cid.clone());
            self.event_bus.emit(ExecutionEvent::NodeFailed {
                run_id,
                node_id: node_id.clone(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
            let flow = self.flow(run.flow_id).await?;
            let previous = run.status;
            self.fail_node(&mut run, &flow, node_id, &error);
            let next = self.finish(&mut run, &flow, previous).await?;
            (flow, next)
        };

        self.drive(run_id, flow, next).await;
        Ok(true)
    }

    // ----- driving -----

    /// Execute claimed nodes until the run has nothing left to dispatch.
    async fn drive(&self, run_id: RunId, flow: Arc<FlowDefinition>, initial: Vec<Dispatch>) {
        let mut queue: VecDeque<Dispatch> = initial.into();
        let mut running = FuturesUnordered::new();
        let limit = self.config.max_parallel_nodes.max(1);

        loop {
            while running.len() < limit {
                let Some(dispatch) = queue.pop_front() else {
                    break;
                };
                let executor = Arc::clone(&self.executor);
                running.push(async move {
                    let outcome = executor.execute(dispatch.invocation.clone()).await;
                    (dispatch, outcome)
                });
            }

            let Some((dispatch, outcome)) = running.next().await else {
                break;
            };
            match self.apply(run_id, &flow, dispatch, outcome).await {
                Ok(next) => queue.extend(next),
                Err(e) => tracing::error!(%run_id, error = %e, "Failed to record node outcome"),
            }
        }
    }

    /// Record one node outcome and claim whatever became ready.
    async fn apply(
        &self,
        run_id: RunId,
        flow: &FlowDefinition,
        dispatch: Dispatch,
        outcome: ExecutionOutcome,
    ) -> Result<Vec<Dispatch>, FlowError> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut run = self.get_run(run_id).await?;
        let node_id = dispatch.node_id.as_str();
        if run.status.is_terminal() {
            tracing::info!(%run_id, node_id, outcome = outcome.label(), status = %run.status, "Discarding outcome of finished run");
            self.cancel_timer(run_id, node_id).await;
            return Ok(Vec::new());
        }
        if run.node_status(node_id) != NodeStatus::Running {
            tracing::warn!(%run_id, node_id, "Discarding outcome of a node that is no longer claimed");
            return Ok(Vec::new());
        }

        let previous = run.status;
        match outcome {
            ExecutionOutcome::Completed(output) => {
                if dispatch.resumed {
                    self.cancel_timer(run_id, node_id).await;
                }
                self.complete_node(&mut run, flow, node_id, output);
            }
            ExecutionOutcome::Failed(error) => {
                if dispatch.resumed {
                    self.cancel_timer(run_id, node_id).await;
                }
                self.fail_node(&mut run, flow, node_id, &error);
            }
            ExecutionOutcome::Suspended(descriptor) => {
                if let Err(e) = self.suspend_node(&mut run, node_id, descriptor).await {
                    tracing::warn!(%run_id, node_id, error = %e, "Invalid pause request");
                    self.event_bus.emit(ExecutionEvent::NodeFailed {
                        run_id,
                        node_id: node_id.to_string(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    self.cancel_timer(run_id, node_id).await;
                    self.fail_node(&mut run, flow, node_id, &NodeError::Configuration(e.to_string()));
                }
            }
        }

        self.finish(&mut run, flow, previous).await
    }

    /// Claim ready nodes, settle the run status, persist and announce.
    async fn finish(
        &self,
        run: &mut FlowRun,
        flow: &FlowDefinition,
        previous: RunStatus,
    ) -> Result<Vec<Dispatch>, FlowError> {
        let run_id = run.run_id;
        let next = if run.status.is_terminal() {
            Vec::new()
        } else {
            let token = self.run_token(run_id).await;
            self.claim_ready(run, flow, &token)?
        };
        settle(run);
        self.persist(run).await?;

        if run.status != previous {
            self.announce(run).await;
        }
        Ok(next)
    }

    async fn announce(&self, run: &FlowRun) {
        let run_id = run.run_id;
        match run.status {
            RunStatus::Waiting => {
                let correlation_ids = run.waiting_correlations();
                tracing::info!(%run_id, waits = correlation_ids.len(), "Run waiting");
                self.event_bus.emit(ExecutionEvent::RunWaiting {
                    run_id,
                    correlation_ids,
                    timestamp: Utc::now(),
                });
            }
            RunStatus::Completed => {
                let duration_ms = (Utc::now() - run.created_at).num_milliseconds().max(0) as u64;
                tracing::info!(%run_id, duration_ms, "Run completed");
                self.event_bus.emit(ExecutionEvent::RunCompleted {
                    run_id,
                    duration_ms,
                    timestamp: Utc::now(),
                });
                self.release_run(run_id).await;
            }
            RunStatus::Failed => {
                let (node_id, error) = run
                    .failure
                    .as_ref()
                    .map(|f| (f.node_id.clone(), f.message.clone()))
                    .unwrap_or_default();
                tracing::error!(%run_id, %node_id, %error, "Run failed");
                self.cancel_waits(run_id).await;
                self.release_run(run_id).await;
                self.event_bus.emit(ExecutionEvent::RunFailed {
                    run_id,
                    node_id,
                    error,
                    timestamp: Utc::now(),
                });
            }
            RunStatus::Running | RunStatus::Stopped => {}
        }
    }

    // ----- node state transitions -----

    fn claim(
        &self,
        run: &mut FlowRun,
        flow: &FlowDefinition,
        node_id: &str,
        execution_type: ExecutionType,
        token: &CancellationToken,
    ) -> Result<Dispatch, FlowError> {
        let spec = flow
            .find_node(node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?
            .clone();
        let inputs = inputs_for(run, flow, node_id);

        let state = run.node_mut(node_id);
        state.status = NodeStatus::Running;
        state.last_execution_type = Some(execution_type);
        state.attempts += 1;
        state.started_at = Some(Utc::now());
        state.finished_at = None;
        state.error = None;
        state.correlation_ids.clear();

        let mut invocation = Invocation::begin(run.run_id, spec, self.node_timeout(flow));
        invocation.execution_type = execution_type;
        invocation.inputs = inputs;
        invocation.variables = run.context.clone();
        invocation.cancellation = token.child_token();

        Ok(Dispatch {
            node_id: node_id.to_string(),
            invocation,
            resumed: false,
        })
    }

    /// Claim every deferred node whose predecessors can no longer fire.
    fn claim_ready(
        &self,
        run: &mut FlowRun,
        flow: &FlowDefinition,
        token: &CancellationToken,
    ) -> Result<Vec<Dispatch>, FlowError> {
        let ready: Vec<NodeId> = run
            .deferred
            .iter()
            .filter(|node_id| join_ready(run, flow, node_id))
            .cloned()
            .collect();

        let mut dispatches = Vec::with_capacity(ready.len());
        for node_id in ready {
            run.deferred.retain(|id| id != &node_id);
            dispatches.push(self.claim(run, flow, &node_id, ExecutionType::Begin, token)?);
        }
        Ok(dispatches)
    }

    fn complete_node(&self, run: &mut FlowRun, flow: &FlowDefinition, node_id: &str, output: NodeOutput) {
        let value = output.to_value();
        let state = run.node_mut(node_id);
        state.status = NodeStatus::Completed;
        state.output = Some(value.clone());
        state.handles = output.handles.clone();
        state.finished_at = Some(Utc::now());
        run.context.insert(node_id.to_string(), value);

        if output.handles.is_empty() {
            tracing::debug!(run_id = %run.run_id, node_id, "No handle fired, branch ends here");
        }
        for handle in &output.handles {
            activate(run, flow, node_id, handle);
        }
    }

    /// Mark the node failed. With an error edge the failure becomes output
    /// on the `error` handle; without one the run fails.
    fn fail_node(&self, run: &mut FlowRun, flow: &FlowDefinition, node_id: &str, error: &NodeError) {
        let message = error.to_string();
        let state = run.node_mut(node_id);
        state.status = NodeStatus::Failed;
        state.error = Some(message.clone());
        state.finished_at = Some(Utc::now());
        state.correlation_ids.clear();

        if flow.has_error_edge(node_id) {
            let mut body = HashMap::new();
            body.insert("error".to_string(), Value::String(message));
            let output = Value::Object(body);
            let state = run.node_mut(node_id);
            state.output = Some(output.clone());
            state.handles = vec![ERROR_HANDLE.to_string()];
            run.context.insert(node_id.to_string(), output);
            tracing::info!(run_id = %run.run_id, node_id, "Node failed, following error edge");
            activate(run, flow, node_id, ERROR_HANDLE);
        } else {
            run.failure = Some(RunFailure {
                node_id: node_id.to_string(),
                message,
            });
            run.status = RunStatus::Failed;
        }
    }

    /// Register the waits a pause asks for and mark the node WAITING.
    async fn suspend_node(
        &self,
        run: &mut FlowRun,
        node_id: &str,
        descriptor: PauseDescriptor,
    ) -> Result<String, FlowError> {
        descriptor.validate()?;
        let run_id = run.run_id;
        let correlation_id = descriptor
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // At most one live registration per (run, node).
        if let Some(previous) = self.store.find_by_node(run_id, node_id).await? {
            tracing::debug!(%run_id, node_id, superseded = %previous.correlation_id, "Superseding registration");
            self.store.delete(&previous.correlation_id).await?;
            self.unlisten(&previous).await;
        }

        let registration = WaitingRegistration::from_descriptor(&correlation_id, run_id, node_id, &descriptor);
        let ttl = descriptor
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.wait_ttl());
        self.config
            .retry
            .run("save waiting registration", || {
                self.store.put(registration.clone(), Some(ttl))
            })
            .await?;

        let state = run.node_mut(node_id);
        state.status = NodeStatus::Waiting;
        state.output = None;
        state.correlation_ids = vec![correlation_id.clone()];

        if let (true, Some(key)) = (registration.listens(), registration.channel_key.as_deref()) {
            if let Err(e) = self
                .correlator
                .register_wait(registration.kind, key, &correlation_id)
                .await
            {
                tracing::error!(%run_id, node_id, channel = key, error = %e, "Channel subscription failed, run left waiting");
            }
        }

        match &descriptor.schedule {
            Some(schedule) => {
                let same_cadence = schedule.is_repeating()
                    && self
                        .scheduler
                        .find(run_id, node_id)
                        .await
                        .map_or(false, |job| job.same_cadence(schedule, descriptor.end_date));
                let rebound = same_cadence
                    && self
                        .scheduler
                        .rebind(run_id, node_id, &correlation_id)
                        .await
                        .unwrap_or(false);
                if !rebound {
                    let job = TimerJob::new(run_id, node_id, &correlation_id, schedule.clone())
                        .with_end_date(descriptor.end_date);
                    if let Err(e) = self
                        .config
                        .retry
                        .run("schedule timer", || self.scheduler.schedule(job.clone()))
                        .await
                    {
                        tracing::error!(%run_id, node_id, error = %e, "Timer scheduling failed, run left waiting");
                    }
                }
            }
            None => self.cancel_timer(run_id, node_id).await,
        }

        tracing::info!(%run_id, node_id, %correlation_id, kind = ?descriptor.kind, "Node suspended");
        self.event_bus.emit(ExecutionEvent::NodeSuspended {
            run_id,
            node_id: node_id.to_string(),
            correlation_id: correlation_id.clone(),
            kind: descriptor.kind,
            timestamp: Utc::now(),
        });
        Ok(correlation_id)
    }

    // ----- infrastructure -----

    fn node_timeout(&self, flow: &FlowDefinition) -> Duration {
        flow.settings
            .node_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.node_timeout())
    }

    async fn run_lock(&self, run_id: RunId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().await.entry(run_id).or_default())
    }

    async fn run_token(&self, run_id: RunId) -> CancellationToken {
        self.cancellations
            .lock()
            .await
            .entry(run_id)
            .or_default()
            .clone()
    }

    /// Cancel in-flight invocations of a finished run. Callers hold the run
    /// lock, so its entry stays until [`Orchestrator::prune_locks`].
    async fn release_run(&self, run_id: RunId) {
        if let Some(token) = self.cancellations.lock().await.remove(&run_id) {
            token.cancel();
        }
    }

    /// Drop run locks nobody holds or waits on. Returns how many were dropped.
    ///
    /// Every clone of a lock is taken under the map's mutex, so an entry whose
    /// only owner is the map cannot be acquired concurrently.
    pub async fn prune_locks(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    /// Save the run, retrying with backoff. When the record cannot be written
    /// the run is marked FAILED if that at least can be recorded.
    async fn persist(&self, run: &mut FlowRun) -> Result<(), FlowError> {
        run.touch();
        let snapshot: &FlowRun = run;
        let saved = self
            .config
            .retry
            .run("save run", || self.store.save_run(snapshot))
            .await;
        let Err(e) = saved else {
            return Ok(());
        };

        if !run.status.is_terminal() {
            run.status = RunStatus::Failed;
            run.failure = Some(RunFailure {
                node_id: String::new(),
                message: format!("run record could not be saved: {}", e),
            });
            if self.store.save_run(run).await.is_ok() {
                self.event_bus.emit(ExecutionEvent::RunFailed {
                    run_id: run.run_id,
                    node_id: String::new(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        Err(e.into())
    }

    async fn cancel_timer(&self, run_id: RunId, node_id: &str) {
        if let Err(e) = self.scheduler.cancel(run_id, node_id).await {
            tracing::warn!(%run_id, node_id, error = %e, "Failed to cancel timer");
        }
    }

    async fn unlisten(&self, registration: &WaitingRegistration) {
        if let (true, Some(key)) = (registration.listens(), registration.channel_key.as_deref()) {
            if let Err(e) = self
                .correlator
                .unregister_wait(registration.kind, key, &registration.correlation_id)
                .await
            {
                tracing::warn!(channel = key, error = %e, "Failed to unregister wait");
            }
        }
    }

    /// Delete every registration and timer of the run.
    async fn cancel_waits(&self, run_id: RunId) {
        match self.store.list_by_run(run_id).await {
            Ok(registrations) => {
                for registration in registrations {
                    if let Err(e) = self.store.delete(&registration.correlation_id).await {
                        tracing::warn!(%run_id, error = %e, "Failed to delete registration");
                    }
                    self.unlisten(&registration).await;
                }
            }
            Err(e) => tracing::error!(%run_id, error = %e, "Failed to list registrations"),
        }
        match self.scheduler.cancel_run(run_id).await {
            Ok(cancelled) if cancelled > 0 => tracing::debug!(%run_id, cancelled, "Timers cancelled"),
            Ok(_) => {}
            Err(e) => tracing::error!(%run_id, error = %e, "Failed to cancel timers"),
        }
    }
}

#[async_trait]
impl ResumeSink for Orchestrator {
    async fn resume(
        &self,
        correlation_id: &str,
        payload: Value,
        source: ResumeSource,
    ) -> Result<ResumeOutcome, FlowError> {
        self.resume_from(correlation_id, payload, source).await
    }
}

/// Mark the targets of `handle` on `node_id` as reached, in edge order.
fn activate(run: &mut FlowRun, flow: &FlowDefinition, node_id: &str, handle: &str) {
    for edge in flow.targets_for(node_id, handle) {
        if run.node_status(&edge.target) == NodeStatus::Pending {
            run.defer(&edge.target);
        } else {
            tracing::debug!(run_id = %run.run_id, target = %edge.target, "Target already visited");
        }
    }
}

/// A deferred node joins once no predecessor can still fire into it: none is
/// live, and none is reachable from a live node through unsettled nodes.
fn join_ready(run: &FlowRun, flow: &FlowDefinition, node_id: &str) -> bool {
    let mut frontier: Vec<&str> = run
        .node_states
        .iter()
        .filter(|(id, state)| state.status.is_active() && id.as_str() != node_id)
        .map(|(id, _)| id.as_str())
        .chain(
            run.deferred
                .iter()
                .map(String::as_str)
                .filter(|id| *id != node_id),
        )
        .collect();

    let mut reachable: HashSet<&str> = frontier.iter().copied().collect();
    while let Some(current) = frontier.pop() {
        for edge in flow.edges.iter().filter(|e| e.source == current) {
            let target = edge.target.as_str();
            if target != node_id
                && !run.node_status(target).is_settled()
                && reachable.insert(target)
            {
                frontier.push(target);
            }
        }
    }

    !flow
        .incoming(node_id)
        .any(|edge| reachable.contains(edge.source.as_str()))
}

/// Merged outputs of the predecessors that fired into the node; entry nodes
/// get the run input.
fn inputs_for(run: &FlowRun, flow: &FlowDefinition, node_id: &str) -> HashMap<String, Value> {
    let mut inputs = HashMap::new();
    let mut fired = false;
    for edge in flow.incoming(node_id) {
        let Some(state) = run.node(&edge.source) else {
            continue;
        };
        if !state.handles.iter().any(|h| h == &edge.source_handle) {
            continue;
        }
        fired = true;
        match &state.output {
            Some(Value::Object(map)) => inputs.extend(map.clone()),
            Some(other) => {
                inputs.insert(edge.source.clone(), other.clone());
            }
            None => {}
        }
    }

    if !fired {
        match &run.input {
            Value::Object(map) => inputs.extend(map.clone()),
            Value::Null => {}
            other => {
                inputs.insert("input".to_string(), other.clone());
            }
        }
    }
    inputs
}

/// Derive the run status from its node states. A failed or stopped run keeps
/// its status.
fn settle(run: &mut FlowRun) {
    if run.status.is_terminal() {
        return;
    }
    let running = run.node_states.values().any(|s| s.status == NodeStatus::Running);
    let waiting = run.node_states.values().any(|s| s.status == NodeStatus::Waiting);
    run.status = if running {
        RunStatus::Running
    } else if waiting {
        RunStatus::Waiting
    } else {
        if !run.deferred.is_empty() {
            tracing::warn!(run_id = %run.run_id, deferred = ?run.deferred, "Completing with unreachable deferred nodes");
        }
        RunStatus::Completed
    };
}

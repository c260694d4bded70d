use crate::config::{JobQueueKind, RuntimeConfig};
use crate::correlator::{Delivery, EventCorrelator};
use crate::executor::NodeExecutor;
use crate::orchestrator::Orchestrator;
use crate::registry::NodeRegistry;
use crate::resume::{ResumeOutcome, ResumeSink};
use crate::scheduler::{CronJobQueue, FiredJob, JobQueue, LocalJobQueue, TimerScheduler};
use crate::sqlite::SqliteStore;
use stillcore::store::{MemoryStore, StateStore};
use stillcore::transport::{ChannelTransport, InMemoryTransport};
use stillcore::{
    EventBus, ExecutionEvent, FlowDefinition, FlowError, FlowRun, RunId, RunStatus, Value,
};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Main runtime: wires the store, transport, scheduler, correlator and
/// orchestrator together and owns their background tasks.
pub struct FlowRuntime {
    config: RuntimeConfig,
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    orchestrator: Arc<Orchestrator>,
    fires: Mutex<Option<mpsc::UnboundedReceiver<FiredJob>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Builder for [`FlowRuntime`]
#[derive(Default)]
pub struct FlowRuntimeBuilder {
    config: RuntimeConfig,
    registry: Option<NodeRegistry>,
    store: Option<Arc<dyn StateStore>>,
    transport: Option<Arc<dyn ChannelTransport>>,
}

impl FlowRuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<FlowRuntime, FlowError> {
        let config = self.config;
        let registry = Arc::new(self.registry.unwrap_or_default());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        let store: Arc<dyn StateStore> = match (self.store, config.database_url.as_deref()) {
            (Some(store), _) => store,
            (None, Some(url)) => {
                tracing::info!(url, "Using SQLite state store");
                Arc::new(SqliteStore::connect(url).await?)
            }
            (None, None) => {
                tracing::info!("Using in-memory state store");
                Arc::new(MemoryStore::new())
            }
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()));

        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let queue: Arc<dyn JobQueue> = match config.job_queue {
            JobQueueKind::Local => Arc::new(LocalJobQueue::new(fire_tx)),
            JobQueueKind::Cron => Arc::new(CronJobQueue::new(fire_tx).await?),
        };

        let executor = Arc::new(NodeExecutor::new(Arc::clone(&registry), Arc::clone(&event_bus)));
        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            let sink: Weak<dyn ResumeSink> = weak.clone();
            let scheduler = Arc::new(TimerScheduler::new(
                queue,
                Arc::clone(&store),
                sink.clone(),
                config.retry.clone(),
            ));
            let correlator = Arc::new(EventCorrelator::new(
                transport,
                Arc::clone(&store),
                sink,
                config.retry.clone(),
            ));
            Orchestrator::new(
                Arc::clone(&store),
                executor,
                scheduler,
                correlator,
                Arc::clone(&event_bus),
                config.clone(),
            )
        });

        Ok(FlowRuntime {
            config,
            registry,
            event_bus,
            store,
            orchestrator,
            fires: Mutex::new(Some(fire_rx)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }
}

impl FlowRuntime {
    pub fn builder() -> FlowRuntimeBuilder {
        FlowRuntimeBuilder::default()
    }

    /// In-memory runtime with default settings
    pub async fn with_registry(registry: NodeRegistry) -> Result<Self, FlowError> {
        Self::builder().registry(registry).build().await
    }

    /// Restore timers and subscriptions, then start the timer worker, the
    /// transport listener and the sweeper. Besides expiring waits, the sweeper
    /// retries channel subscriptions that failed.
    pub async fn start(&self) -> Result<(), FlowError> {
        let fires = self
            .fires
            .lock()
            .await
            .take()
            .ok_or_else(|| FlowError::IllegalState("runtime already started".to_string()))?;

        self.recover().await?;

        let scheduler = self.orchestrator.scheduler();
        scheduler.start(fires, &self.tracker, self.shutdown.child_token());
        self.orchestrator
            .correlator()
            .start(&self.tracker, self.shutdown.child_token());

        let orchestrator = Arc::clone(&self.orchestrator);
        let shutdown = self.shutdown.child_token();
        let period = self.config.expiry_sweep_interval();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match orchestrator.expire_waits().await {
                            Ok(0) => {}
                            Ok(expired) => tracing::info!(expired, "Expired waits failed"),
                            Err(e) => tracing::error!(error = %e, "Expiry sweep failed"),
                        }
                        orchestrator.correlator().resubscribe_pending().await;
                        orchestrator.prune_locks().await;
                    }
                }
            }
        });

        tracing::info!(
            queue = scheduler.queue().name(),
            transport = self.orchestrator.correlator().transport().name(),
            "Flow runtime started"
        );
        Ok(())
    }

    /// Reinstall persisted timers and channel subscriptions.
    pub async fn recover(&self) -> Result<(), FlowError> {
        let timers = self.orchestrator.scheduler().restore().await?;
        let channels = self.orchestrator.correlator().restore_subscriptions().await?;
        tracing::info!(timers, channels, "Recovered waiting state");
        Ok(())
    }

    /// Stop background tasks and the job queue.
    pub async fn shutdown(&self) -> Result<(), FlowError> {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.orchestrator.scheduler().queue().shutdown().await?;
        tracing::info!("Flow runtime stopped");
        Ok(())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<TimerScheduler> {
        self.orchestrator.scheduler()
    }

    pub fn correlator(&self) -> &Arc<EventCorrelator> {
        self.orchestrator.correlator()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub async fn start_run(&self, flow: &FlowDefinition, input: Value) -> Result<RunId, FlowError> {
        self.orchestrator.start_run(flow, input).await
    }

    pub async fn resume(&self, correlation_id: &str, payload: Value) -> Result<ResumeOutcome, FlowError> {
        self.orchestrator.resume(correlation_id, payload).await
    }

    pub async fn stop(&self, run_id: RunId) -> Result<RunStatus, FlowError> {
        self.orchestrator.stop(run_id).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<FlowRun, FlowError> {
        self.orchestrator.get_run(run_id).await
    }

    /// Publish on the channel transport; delivery to waiters happens through
    /// the listener started by [`FlowRuntime::start`].
    pub async fn publish(&self, channel: &str, payload: Value) -> Result<(), FlowError> {
        self.correlator().transport().publish(channel, payload).await?;
        Ok(())
    }

    /// Resume every wait registered on a webhook path.
    pub async fn deliver_webhook(&self, path: &str, payload: Value) -> Delivery {
        self.correlator().on_webhook(path, payload).await
    }
}

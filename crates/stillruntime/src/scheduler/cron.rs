use super::queue::{FiredJob, JobQueue, Repeat};
use async_trait::async_trait;
use stillcore::SchedulingError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

fn backend(e: impl std::fmt::Display) -> SchedulingError {
    SchedulingError::Backend(e.to_string())
}

/// Job queue backed by tokio-cron-scheduler. Keys map to the scheduler's own
/// job uuids so a replaced or cancelled job is really removed.
pub struct CronJobQueue {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    fires: mpsc::UnboundedSender<FiredJob>,
}

impl CronJobQueue {
    pub async fn new(fires: mpsc::UnboundedSender<FiredJob>) -> Result<Self, SchedulingError> {
        let scheduler = JobScheduler::new().await.map_err(backend)?;
        scheduler.start().await.map_err(backend)?;
        tracing::info!("Cron job queue started");
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            fires,
        })
    }

    async fn replace(&self, key: &str, job: Job) -> Result<(), SchedulingError> {
        self.cancel(key).await?;
        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await.map_err(backend)?
        };
        self.job_uuid_map
            .write()
            .await
            .insert(key.to_string(), job_uuid);
        tracing::debug!("Tracked job UUID for: {}", key);
        Ok(())
    }

    fn sender(&self, key: &str, generation: Uuid) -> impl Fn() -> bool + Send + Sync + 'static {
        let fires = self.fires.clone();
        let key = key.to_string();
        move || fires.send(FiredJob::now(key.clone(), generation)).is_ok()
    }
}

#[async_trait]
impl JobQueue for CronJobQueue {
    fn name(&self) -> &str {
        "cron"
    }

    async fn enqueue_once(&self, key: &str, generation: Uuid, delay: Duration) -> Result<(), SchedulingError> {
        let fire = self.sender(key, generation);
        let job = Job::new_one_shot_async(delay, move |_uuid, _l| {
            fire();
            Box::pin(async {})
        })
        .map_err(backend)?;
        self.replace(key, job).await
    }

    async fn enqueue_repeating(&self, key: &str, generation: Uuid, repeat: Repeat) -> Result<(), SchedulingError> {
        let fire = self.sender(key, generation);
        let job = match repeat {
            Repeat::Every(period) => Job::new_repeated_async(period, move |_uuid, _l| {
                fire();
                Box::pin(async {})
            }),
            Repeat::Cron(expression) => Job::new_async(expression.as_str(), move |_uuid, _l| {
                fire();
                Box::pin(async {})
            }),
        }
        .map_err(|e| SchedulingError::InvalidSchedule(e.to_string()))?;
        self.replace(key, job).await
    }

    async fn cancel(&self, key: &str) -> Result<bool, SchedulingError> {
        let Some(job_uuid) = self.job_uuid_map.write().await.remove(key) else {
            return Ok(false);
        };
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&job_uuid).await {
            tracing::warn!("Failed to remove job {} from scheduler: {}", key, e);
        }
        Ok(true)
    }

    async fn shutdown(&self) -> Result<(), SchedulingError> {
        self.job_uuid_map.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await.map_err(backend)?;
        tracing::info!("Cron job queue stopped");
        Ok(())
    }
}

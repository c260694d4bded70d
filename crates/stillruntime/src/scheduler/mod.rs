//! Timer Scheduler: installs TIMEOUT / INTERVAL / CRON wake-ups for
//! suspended nodes and turns their fires into resume calls.
//!
//! At most one timer exists per (run, node); it lives under the job key
//! `timer:{run}:{node}` and an optional `timer:{run}:{node}:end` job stops a
//! repeating timer at its end date.

mod cron;
mod local;
mod queue;

pub use self::cron::CronJobQueue;
pub use local::LocalJobQueue;
pub use queue::{FiredJob, JobQueue, Repeat};

use crate::resume::{ResumeOutcome, ResumeSink};
use chrono::Utc;
use stillcore::store::{StateStore, TimerStore};
use stillcore::{
    delay_until, end_key, timer_key, NodeId, ResumeSource, RetryPolicy, RunId, Schedule,
    SchedulingError, TimerJob, TimerKind, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const END_SUFFIX: &str = ":end";

pub struct TimerScheduler {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn StateStore>,
    sink: Weak<dyn ResumeSink>,
    retry: RetryPolicy,
    /// Active jobs by job key.
    jobs: Mutex<HashMap<String, TimerJob>>,
}

fn store_error(e: stillcore::StoreError) -> SchedulingError {
    SchedulingError::Backend(e.to_string())
}

impl TimerScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn StateStore>,
        sink: Weak<dyn ResumeSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            store,
            sink,
            retry,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Install `job`, replacing whatever timer its (run, node) pair had.
    /// Returns the job key.
    pub async fn schedule(&self, job: TimerJob) -> Result<String, SchedulingError> {
        job.schedule.validate()?;
        let key = job.key();

        let mut jobs = self.jobs.lock().await;
        if jobs.remove(&key).is_some() {
            tracing::debug!(job_key = %key, "Replacing existing timer");
        }
        self.queue.cancel(&key).await?;
        self.queue.cancel(&end_key(&key)).await?;

        self.install(&job).await?;
        if let Err(e) = self.store.save_timer(&job).await {
            // An unrecorded timer must not fire.
            self.queue.cancel(&key).await?;
            self.queue.cancel(&end_key(&key)).await?;
            return Err(store_error(e));
        }
        tracing::debug!(job_key = %key, kind = ?job.kind, correlation_id = %job.correlation_id, "Timer scheduled");
        jobs.insert(key.clone(), job);
        Ok(key)
    }

    async fn install(&self, job: &TimerJob) -> Result<(), SchedulingError> {
        let key = job.key();
        match &job.schedule {
            Schedule::Timeout { seconds } => {
                let due = job.created_at + chrono::Duration::seconds(*seconds as i64);
                self.queue.enqueue_once(&key, job.job_id, delay_until(due)).await?;
            }
            Schedule::Interval { seconds } => {
                self.queue
                    .enqueue_repeating(&key, job.job_id, Repeat::Every(Duration::from_secs(*seconds)))
                    .await?;
            }
            Schedule::Cron { expression } => {
                self.queue
                    .enqueue_repeating(&key, job.job_id, Repeat::Cron(expression.clone()))
                    .await?;
            }
        }

        if let Some(end) = job.end_date.filter(|_| job.schedule.is_repeating()) {
            if end > Utc::now() {
                self.queue
                    .enqueue_once(&job.end_key(), job.job_id, delay_until(end))
                    .await?;
            } else {
                tracing::debug!(job_key = %key, %end, "End date already passed, no end job");
            }
        }
        Ok(())
    }

    /// Remove the timer of a (run, node) pair and its end job. Calling it
    /// when nothing is scheduled is a no-op.
    pub async fn cancel(&self, run_id: RunId, node_id: &str) -> Result<bool, SchedulingError> {
        let key = timer_key(run_id, node_id);
        let existed = self.jobs.lock().await.remove(&key).is_some();
        self.queue.cancel(&key).await?;
        self.queue.cancel(&end_key(&key)).await?;
        if existed {
            self.store
                .delete_timer(run_id, &node_id.to_string())
                .await
                .map_err(store_error)?;
            tracing::debug!(job_key = %key, "Timer cancelled");
        }
        Ok(existed)
    }

    /// Cancel every timer of a run; returns how many were removed.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<usize, SchedulingError> {
        let nodes: Vec<NodeId> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.run_id == run_id)
            .map(|job| job.node_id.clone())
            .collect();
        let mut cancelled = 0;
        for node_id in nodes {
            if self.cancel(run_id, &node_id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Point the running timer of a (run, node) pair at a new correlation id
    /// without restarting its cadence. Returns false when there is no timer.
    pub async fn rebind(
        &self,
        run_id: RunId,
        node_id: &str,
        correlation_id: &str,
    ) -> Result<bool, SchedulingError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&timer_key(run_id, node_id)) else {
            return Ok(false);
        };
        job.correlation_id = correlation_id.to_string();
        self.store.save_timer(job).await.map_err(store_error)?;
        tracing::debug!(job_key = %job.key(), correlation_id, "Timer re-bound");
        Ok(true)
    }

    pub async fn find(&self, run_id: RunId, node_id: &str) -> Option<TimerJob> {
        self.jobs.lock().await.get(&timer_key(run_id, node_id)).cloned()
    }

    pub async fn active_jobs(&self) -> Vec<TimerJob> {
        let mut jobs: Vec<TimerJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Re-install timers persisted by a previous process. Overdue one-shot
    /// timers fire right away; repeating timers past their end date are dropped.
    pub async fn restore(&self) -> Result<usize, SchedulingError> {
        let persisted = self.store.list_timers().await.map_err(store_error)?;
        let mut restored = 0;
        let mut jobs = self.jobs.lock().await;
        for job in persisted {
            let expired = job.schedule.is_repeating()
                && job.end_date.map_or(false, |end| end <= Utc::now());
            if expired {
                self.store
                    .delete_timer(job.run_id, &job.node_id)
                    .await
                    .map_err(store_error)?;
                continue;
            }
            match self.install(&job).await {
                Ok(()) => {
                    jobs.insert(job.key(), job);
                    restored += 1;
                }
                Err(e) => tracing::error!(job_key = %job.key(), error = %e, "Failed to restore timer"),
            }
        }
        tracing::info!(restored, "Timers restored");
        Ok(restored)
    }

    /// Consume fires until shutdown. Each fire is handled on its own task so a
    /// slow resume does not hold back other timers.
    pub fn start(
        self: &Arc<Self>,
        mut fires: mpsc::UnboundedReceiver<FiredJob>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) {
        let scheduler = Arc::clone(self);
        let workers = tracker.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    fired = fires.recv() => match fired {
                        Some(fired) => {
                            let scheduler = Arc::clone(&scheduler);
                            workers.spawn(async move { scheduler.handle_fire(fired).await });
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("Timer worker stopped");
        });
    }

    /// Resolve a fire to its correlation id and resume through the sink.
    /// Stale generations and unknown keys are dropped.
    ///
    /// A TIMEOUT's stored record outlives the fire until the resume settles,
    /// so a resume that keeps failing is fired again after a restart.
    pub async fn handle_fire(&self, fired: FiredJob) -> Option<ResumeOutcome> {
        let (job, job_key) = {
            let mut jobs = self.jobs.lock().await;

            if let Some(owner) = fired.key.strip_suffix(END_SUFFIX) {
                let current = jobs.get(owner).map(|job| job.job_id);
                if current == Some(fired.generation) {
                    if let Some(job) = jobs.remove(owner) {
                        if let Err(e) = self.queue.cancel(owner).await {
                            tracing::warn!(job_key = owner, error = %e, "Failed to cancel repeating job");
                        }
                        if let Err(e) = self.store.delete_timer(job.run_id, &job.node_id).await {
                            tracing::warn!(job_key = owner, error = %e, "Failed to delete timer record");
                        }
                        tracing::info!(job_key = owner, "End date reached, repeating timer stopped");
                    }
                }
                return None;
            }

            let job = match jobs.get(&fired.key) {
                Some(job) if job.job_id == fired.generation => job.clone(),
                _ => {
                    tracing::debug!(job_key = %fired.key, "Dropping stale timer fire");
                    return None;
                }
            };
            if job.kind == TimerKind::Timeout {
                jobs.remove(&fired.key);
            }
            (job, fired.key)
        };
        let correlation_id = job.correlation_id.clone();

        let sink = self.sink.upgrade()?;
        let mut body = HashMap::new();
        body.insert("firedAt".to_string(), Value::String(fired.fired_at.to_rfc3339()));
        body.insert("jobKey".to_string(), Value::String(job_key.clone()));
        let payload = Value::Object(body);

        let result = self
            .retry
            .run("timer resume", || {
                sink.resume(&correlation_id, payload.clone(), ResumeSource::Timer)
            })
            .await;
        if job.kind == TimerKind::Timeout && result.is_ok() {
            if let Err(e) = self.store.delete_timer(job.run_id, &job.node_id).await {
                tracing::warn!(job_key = %job_key, error = %e, "Failed to delete timer record");
            }
        }
        match result {
            Ok(ResumeOutcome::NotFound) => {
                tracing::debug!(job_key = %job_key, %correlation_id, "Timer fired for a resolved wait");
                Some(ResumeOutcome::NotFound)
            }
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(
                    job_key = %job_key,
                    %correlation_id,
                    error = %e,
                    "Timer resume failed after retries, run left waiting"
                );
                None
            }
        }
    }
}

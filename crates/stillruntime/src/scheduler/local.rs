use super::queue::{FiredJob, JobQueue, Repeat};
use async_trait::async_trait;
use stillcore::{delay_until, SchedulingError};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Job queue on plain tokio timers. One task per key; cancelling aborts it.
pub struct LocalJobQueue {
    fires: mpsc::UnboundedSender<FiredJob>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LocalJobQueue {
    pub fn new(fires: mpsc::UnboundedSender<FiredJob>) -> Self {
        Self {
            fires,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    async fn install(&self, key: &str, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = tasks.insert(key.to_string(), task) {
            previous.abort();
        }
    }

    pub async fn pending(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    fn name(&self) -> &str {
        "local"
    }

    async fn enqueue_once(&self, key: &str, generation: Uuid, delay: Duration) -> Result<(), SchedulingError> {
        let fires = self.fires.clone();
        let job_key = key.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fires.send(FiredJob::now(job_key, generation));
        });
        self.install(key, task).await;
        Ok(())
    }

    async fn enqueue_repeating(&self, key: &str, generation: Uuid, repeat: Repeat) -> Result<(), SchedulingError> {
        let fires = self.fires.clone();
        let job_key = key.to_string();
        let task = match repeat {
            Repeat::Every(period) => {
                if period.is_zero() {
                    return Err(SchedulingError::InvalidSchedule(
                        "interval must be positive".to_string(),
                    ));
                }
                tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if fires.send(FiredJob::now(job_key.clone(), generation)).is_err() {
                            break;
                        }
                    }
                })
            }
            Repeat::Cron(expression) => {
                let schedule = cron::Schedule::from_str(&expression)
                    .map_err(|e| SchedulingError::InvalidSchedule(format!("{}: {}", expression, e)))?;
                tokio::spawn(async move {
                    while let Some(next) = schedule.upcoming(chrono::Utc).next() {
                        tokio::time::sleep(delay_until(next)).await;
                        if fires.send(FiredJob::now(job_key.clone(), generation)).is_err() {
                            break;
                        }
                    }
                })
            }
        };
        self.install(key, task).await;
        Ok(())
    }

    async fn cancel(&self, key: &str) -> Result<bool, SchedulingError> {
        match self.tasks.lock().await.remove(key) {
            Some(handle) => {
                let live = !handle.is_finished();
                handle.abort();
                Ok(live)
            }
            None => Ok(false),
        }
    }

    async fn shutdown(&self) -> Result<(), SchedulingError> {
        for (_, handle) in self.tasks.lock().await.drain() {
            handle.abort();
        }
        Ok(())
    }
}

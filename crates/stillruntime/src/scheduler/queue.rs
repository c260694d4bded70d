use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stillcore::SchedulingError;
use std::time::Duration;
use uuid::Uuid;

/// Repeating cadence of a queued job
#[derive(Debug, Clone, PartialEq)]
pub enum Repeat {
    Every(Duration),
    Cron(String),
}

/// A job the queue decided is due
#[derive(Debug, Clone, PartialEq)]
pub struct FiredJob {
    pub key: String,
    /// Generation the job was enqueued with.
    pub generation: Uuid,
    pub fired_at: DateTime<Utc>,
}

impl FiredJob {
    pub fn now(key: impl Into<String>, generation: Uuid) -> Self {
        Self {
            key: key.into(),
            generation,
            fired_at: Utc::now(),
        }
    }
}

/// Keyed delayed and repeating jobs. Enqueueing under a key that is already
/// in use replaces the previous job. Fires are delivered on the channel the
/// queue was built with; the queue never runs job logic itself.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue_once(&self, key: &str, generation: Uuid, delay: Duration) -> Result<(), SchedulingError>;

    async fn enqueue_repeating(&self, key: &str, generation: Uuid, repeat: Repeat) -> Result<(), SchedulingError>;

    /// Returns whether a job was removed; unknown keys are not an error.
    async fn cancel(&self, key: &str) -> Result<bool, SchedulingError>;

    async fn shutdown(&self) -> Result<(), SchedulingError>;
}

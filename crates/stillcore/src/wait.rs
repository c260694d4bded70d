//! Suspension data: what a node asks for when it pauses, what the
//! Waiting-State Store keeps for it, and the timer jobs that wake it up.

use crate::{NodeId, RunId, SchedulingError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// What kind of external signal a suspended node waits on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitKind {
    Timer,
    Channel,
    Webhook,
}

/// Who delivered a resume payload; set by the runtime, never by the payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResumeSource {
    Timer,
    Channel,
    Webhook,
    /// Operator or API call naming the correlation id directly
    Api,
}

impl From<WaitKind> for ResumeSource {
    fn from(kind: WaitKind) -> Self {
        match kind {
            WaitKind::Timer => ResumeSource::Timer,
            WaitKind::Channel => ResumeSource::Channel,
            WaitKind::Webhook => ResumeSource::Webhook,
        }
    }
}

/// Wake-up schedule for timer waits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    Timeout { seconds: u64 },
    Interval { seconds: u64 },
    Cron { expression: String },
}

impl Schedule {
    pub fn timer_kind(&self) -> TimerKind {
        match self {
            Schedule::Timeout { .. } => TimerKind::Timeout,
            Schedule::Interval { .. } => TimerKind::Interval,
            Schedule::Cron { .. } => TimerKind::Cron,
        }
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self, Schedule::Timeout { .. })
    }

    /// Reject schedules no job queue can install.
    pub fn validate(&self) -> Result<(), SchedulingError> {
        match self {
            Schedule::Timeout { .. } => Ok(()),
            Schedule::Interval { seconds: 0 } => Err(SchedulingError::InvalidSchedule(
                "interval must be at least one second".to_string(),
            )),
            Schedule::Interval { .. } => Ok(()),
            Schedule::Cron { expression } => {
                if expression.trim().is_empty() {
                    return Err(SchedulingError::MissingParameter("expression"));
                }
                cron::Schedule::from_str(expression)
                    .map(|_| ())
                    .map_err(|e| SchedulingError::InvalidSchedule(format!("{}: {}", expression, e)))
            }
        }
    }
}

/// Request a node hands to `NodeContext::pause`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PauseDescriptor {
    pub kind: WaitKind,
    /// Topic name or webhook path; required for channel and webhook waits.
    #[serde(default)]
    pub channel_key: Option<String>,
    /// Timer schedule; required for timer waits, optional fallback otherwise.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Hard stop for repeating schedules.
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Caller-supplied correlation id; generated when absent.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Lifetime of the registration; the runtime default applies when absent.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Handed back to the node on resume.
    #[serde(default)]
    pub metadata: Value,
}

impl PauseDescriptor {
    fn of(kind: WaitKind) -> Self {
        Self {
            kind,
            channel_key: None,
            schedule: None,
            end_date: None,
            correlation_id: None,
            ttl_secs: None,
            metadata: Value::Null,
        }
    }

    pub fn timer(schedule: Schedule) -> Self {
        Self {
            schedule: Some(schedule),
            ..Self::of(WaitKind::Timer)
        }
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::timer(Schedule::Timeout { seconds })
    }

    pub fn channel(channel_key: impl Into<String>) -> Self {
        Self {
            channel_key: Some(channel_key.into()),
            ..Self::of(WaitKind::Channel)
        }
    }

    pub fn webhook(path: impl Into<String>) -> Self {
        Self {
            channel_key: Some(path.into()),
            ..Self::of(WaitKind::Webhook)
        }
    }

    /// Add a timer fallback to a channel or webhook wait; whichever signal
    /// arrives first resumes the node.
    pub fn or_timeout(mut self, seconds: u64) -> Self {
        self.schedule = Some(Schedule::Timeout { seconds });
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn until(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_secs = Some(seconds);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Value>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Structural checks done before anything is registered.
    pub fn validate(&self) -> Result<(), SchedulingError> {
        match self.kind {
            WaitKind::Timer if self.schedule.is_none() => {
                return Err(SchedulingError::MissingParameter("schedule"));
            }
            WaitKind::Channel | WaitKind::Webhook
                if self.channel_key.as_deref().map_or(true, str::is_empty) =>
            {
                return Err(SchedulingError::MissingParameter("channel_key"));
            }
            _ => {}
        }
        match &self.schedule {
            Some(schedule) => schedule.validate(),
            None => Ok(()),
        }
    }
}

/// Durable record of one suspended node invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitingRegistration {
    pub correlation_id: String,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub kind: WaitKind,
    #[serde(default)]
    pub channel_key: Option<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl WaitingRegistration {
    pub fn from_descriptor(
        correlation_id: impl Into<String>,
        run_id: RunId,
        node_id: impl Into<NodeId>,
        descriptor: &PauseDescriptor,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            run_id,
            node_id: node_id.into(),
            kind: descriptor.kind,
            channel_key: descriptor.channel_key.clone(),
            schedule: descriptor.schedule.clone(),
            expires_at: None,
            metadata: descriptor.metadata.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True when the registration listens on a channel or webhook inbox.
    pub fn listens(&self) -> bool {
        self.channel_key.is_some() && self.kind != WaitKind::Timer
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerKind {
    Timeout,
    Interval,
    Cron,
}

/// A scheduled wake-up for one (run, node) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerJob {
    /// Generation id; fires carrying a stale generation are dropped.
    pub job_id: Uuid,
    pub kind: TimerKind,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub correlation_id: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TimerJob {
    pub fn new(
        run_id: RunId,
        node_id: impl Into<NodeId>,
        correlation_id: impl Into<String>,
        schedule: Schedule,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            kind: schedule.timer_kind(),
            run_id,
            node_id: node_id.into(),
            correlation_id: correlation_id.into(),
            schedule,
            end_date: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_end_date(mut self, end_date: Option<DateTime<Utc>>) -> Self {
        self.end_date = end_date;
        self
    }

    pub fn key(&self) -> String {
        timer_key(self.run_id, &self.node_id)
    }

    pub fn end_key(&self) -> String {
        end_key(&self.key())
    }

    /// Same cadence: schedule and end date match.
    pub fn same_cadence(&self, schedule: &Schedule, end_date: Option<DateTime<Utc>>) -> bool {
        &self.schedule == schedule && self.end_date == end_date
    }
}

/// Deterministic job key for a (run, node) pair.
pub fn timer_key(run_id: RunId, node_id: &str) -> String {
    format!("timer:{}:{}", run_id, node_id)
}

pub fn end_key(job_key: &str) -> String {
    format!("{}:end", job_key)
}

/// Delay until `at`, zero when it already passed.
pub fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_schedule_uses_tagged_json() {
        let schedule: Schedule = serde_json::from_str(r#"{"type":"timeout","seconds":5}"#).unwrap();
        assert_eq!(schedule, Schedule::Timeout { seconds: 5 });
        assert!(!schedule.is_repeating());
    }

    #[test]
    fn timer_wait_requires_schedule() {
        let mut descriptor = PauseDescriptor::timeout(5);
        descriptor.schedule = None;
        assert_eq!(
            descriptor.validate(),
            Err(SchedulingError::MissingParameter("schedule"))
        );
    }

    #[test]
    fn channel_wait_requires_key() {
        let descriptor = PauseDescriptor::channel("");
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn cron_expression_is_checked() {
        let bad = Schedule::Cron {
            expression: "not a cron".to_string(),
        };
        assert!(matches!(bad.validate(), Err(SchedulingError::InvalidSchedule(_))));

        let good = Schedule::Cron {
            expression: "0 */5 * * * *".to_string(),
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn job_keys_are_derived_from_run_and_node() {
        let run_id = Uuid::nil();
        let job = TimerJob::new(run_id, "wait", "c-1", Schedule::Timeout { seconds: 1 });
        assert_eq!(job.key(), format!("timer:{}:wait", run_id));
        assert_eq!(job.end_key(), format!("timer:{}:wait:end", run_id));
    }
}

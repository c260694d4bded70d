use serde::{Deserialize, Serialize};
use stillcore::RetryPolicy;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Which job-queue backend drives timer waits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobQueueKind {
    /// Plain tokio timers
    #[default]
    Local,
    /// tokio-cron-scheduler
    Cron,
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Per-invocation execution budget; pausing is the mechanism for long waits.
    pub node_timeout_secs: u64,
    /// Default lifetime of a waiting registration.
    pub wait_ttl_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub retry: RetryPolicy,
    /// SQLite URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub job_queue: JobQueueKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            node_timeout_secs: 5 * 60,
            wait_ttl_secs: 7 * 24 * 60 * 60,
            expiry_sweep_interval_secs: 30,
            retry: RetryPolicy::default(),
            database_url: None,
            job_queue: JobQueueKind::Local,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value: raw })
}

impl RuntimeConfig {
    /// Defaults overridden by `STILLFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("STILLFLOW_MAX_PARALLEL") {
            config.max_parallel_nodes = parse_var("STILLFLOW_MAX_PARALLEL", raw)?;
        }
        if let Some(raw) = lookup("STILLFLOW_NODE_TIMEOUT_SECS") {
            config.node_timeout_secs = parse_var("STILLFLOW_NODE_TIMEOUT_SECS", raw)?;
        }
        if let Some(raw) = lookup("STILLFLOW_WAIT_TTL_SECS") {
            config.wait_ttl_secs = parse_var("STILLFLOW_WAIT_TTL_SECS", raw)?;
        }
        if let Some(raw) = lookup("STILLFLOW_DATABASE_URL") {
            if !raw.trim().is_empty() {
                config.database_url = Some(raw);
            }
        }
        if let Some(raw) = lookup("STILLFLOW_JOB_QUEUE") {
            config.job_queue = match raw.trim() {
                "local" => JobQueueKind::Local,
                "cron" => JobQueueKind::Cron,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "STILLFLOW_JOB_QUEUE",
                        value: raw,
                    })
                }
            };
        }
        if config.max_parallel_nodes == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STILLFLOW_MAX_PARALLEL",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn wait_ttl(&self) -> Duration {
        Duration::from_secs(self.wait_ttl_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs.max(1))
    }
}

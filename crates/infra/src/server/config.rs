//! Background job server configuration.

use std::time::Duration;

use thiserror::Error;

use jobweave_core::ServerId;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Parse { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Background job server configuration.
#[derive(Debug, Clone)]
pub struct BackgroundJobServerConfig {
    /// Name for logging
    pub name: String,
    /// Fixed server id; a fresh one is generated when absent
    pub server_id: Option<ServerId>,
    /// Length of one orchestration cycle
    pub poll_interval: Duration,
    /// Maximum concurrently running jobs
    pub worker_count: usize,
    /// A PROCESSING job without heartbeat for `poll_interval * multiplier` is orphaned
    pub server_timeout_multiplier: u32,
    pub delete_succeeded_after: Duration,
    pub permanently_delete_after: Duration,
    /// Jobs fetched per page by the maintenance tasks
    pub page_size: usize,
    /// Share of the remaining cycle budget each task may use
    pub time_box_ratio: f64,
    pub retry_policy: RetryPolicy,
    /// Task failures within `10 * poll_interval` that mark the server degraded
    pub task_failure_threshold: usize,
    pub stop_on_unresolvable_conflict: bool,
    /// How long `stop` waits for running jobs before cancelling them
    pub shutdown_grace: Duration,
}

impl Default for BackgroundJobServerConfig {
    fn default() -> Self {
        Self {
            name: "jobweave".to_string(),
            server_id: None,
            poll_interval: Duration::from_secs(15),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            server_timeout_multiplier: 4,
            delete_succeeded_after: Duration::from_secs(36 * 3600),
            permanently_delete_after: Duration::from_secs(72 * 3600),
            page_size: 1000,
            time_box_ratio: 0.95,
            retry_policy: RetryPolicy::default(),
            task_failure_threshold: 5,
            stop_on_unresolvable_conflict: true,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl BackgroundJobServerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_server_id(mut self, id: ServerId) -> Self {
        self.server_id = Some(id);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_server_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.server_timeout_multiplier = multiplier;
        self
    }

    pub fn with_delete_succeeded_after(mut self, after: Duration) -> Self {
        self.delete_succeeded_after = after;
        self
    }

    pub fn with_permanently_delete_after(mut self, after: Duration) -> Self {
        self.permanently_delete_after = after;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_task_failure_threshold(mut self, threshold: usize) -> Self {
        self.task_failure_threshold = threshold;
        self
    }

    pub fn with_stop_on_unresolvable_conflict(mut self, stop: bool) -> Self {
        self.stop_on_unresolvable_conflict = stop;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Heartbeat age after which a PROCESSING job counts as orphaned.
    pub fn server_timeout(&self) -> Duration {
        self.poll_interval
            .saturating_mul(self.server_timeout_multiplier)
    }

    /// Window of the rolling task-failure counter.
    pub fn failure_window(&self) -> Duration {
        self.poll_interval.saturating_mul(10)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.server_timeout_multiplier < 2 {
            return Err(ConfigError::Invalid(
                "server_timeout_multiplier must be at least 2".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if !(self.time_box_ratio > 0.0 && self.time_box_ratio <= 1.0) {
            return Err(ConfigError::Invalid("time_box_ratio must be in (0, 1]".into()));
        }
        if self.task_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "task_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load from `JOBWEAVE_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("JOBWEAVE_SERVER_NAME") {
            config.name = name;
        }
        if let Some(id) = lookup("JOBWEAVE_SERVER_ID") {
            config.server_id = Some(parse("JOBWEAVE_SERVER_ID", &id)?);
        }
        if let Some(v) = lookup("JOBWEAVE_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(parse("JOBWEAVE_POLL_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("JOBWEAVE_WORKER_COUNT") {
            config.worker_count = parse("JOBWEAVE_WORKER_COUNT", &v)?;
        }
        if let Some(v) = lookup("JOBWEAVE_SERVER_TIMEOUT_MULTIPLIER") {
            config.server_timeout_multiplier = parse("JOBWEAVE_SERVER_TIMEOUT_MULTIPLIER", &v)?;
        }
        if let Some(v) = lookup("JOBWEAVE_DELETE_SUCCEEDED_AFTER_SECS") {
            config.delete_succeeded_after =
                Duration::from_secs(parse("JOBWEAVE_DELETE_SUCCEEDED_AFTER_SECS", &v)?);
        }
        if let Some(v) = lookup("JOBWEAVE_PERMANENTLY_DELETE_AFTER_SECS") {
            config.permanently_delete_after =
                Duration::from_secs(parse("JOBWEAVE_PERMANENTLY_DELETE_AFTER_SECS", &v)?);
        }
        if let Some(v) = lookup("JOBWEAVE_PAGE_SIZE") {
            config.page_size = parse("JOBWEAVE_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("JOBWEAVE_RETRY_MAX_ATTEMPTS") {
            config.retry_policy.max_attempts = parse("JOBWEAVE_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("JOBWEAVE_STOP_ON_UNRESOLVABLE_CONFLICT") {
            config.stop_on_unresolvable_conflict =
                parse("JOBWEAVE_STOP_ON_UNRESOLVABLE_CONFLICT", &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        key: key.to_string(),
        value: value.to_string(),
    })
}

//! File-based configuration for a [`Runner`](crate::Runner).
//!
//! Every value is read once at process start. Durations are plain seconds so
//! the struct can be embedded in an application's own TOML configuration.

use crate::storage::SubmitDefaults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error returned when a configuration file cannot be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The contents are not valid TOML for [`SchedulerConfig`].
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Global ceiling on concurrently running tasks in this process.
    pub max_workers: usize,
    /// Longest an idle worker waits before re-checking the store.
    pub poll_interval_secs: f64,
    /// Upper bound of the random delay added to each poll.
    pub jitter_ms: u64,
    /// Per-attempt timeout for tasks submitted without one.
    pub default_timeout_secs: u32,
    /// Retry budget for tasks submitted without one.
    pub default_max_retries: u32,
    /// Backoff delay after the first failure.
    pub retry_base_delay_secs: u64,
    /// Backoff ceiling.
    pub retry_max_delay_secs: u64,
    /// Concurrency ceiling per task type.
    pub rate_limits: BTreeMap<String, usize>,
    /// How long terminal tasks are kept. Zero disables purging.
    pub retention_secs: u64,
    /// How often the purge and stale claim recovery run.
    pub cleanup_interval_secs: u64,
    /// Extra time past a task's timeout before its claim counts as abandoned.
    /// Zero disables recovery.
    pub stale_claim_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval_secs: 1.0,
            jitter_ms: 100,
            default_timeout_secs: 300,
            default_max_retries: 3,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 3600,
            rate_limits: BTreeMap::new(),
            retention_secs: 7 * 24 * 3600,
            cleanup_interval_secs: 3600,
            stale_claim_grace_secs: 60,
        }
    }
}

impl SchedulerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        let poll_interval = Duration::try_from_secs_f64(self.poll_interval_secs);
        if self.poll_interval_secs <= 0.0 || poll_interval.is_err() {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if self.default_timeout_secs == 0 || i32::try_from(self.default_timeout_secs).is_err() {
            return Err(ConfigError::Invalid(
                "default_timeout_secs must be between 1 and 2147483647".into(),
            ));
        }
        if i32::try_from(self.default_max_retries).is_err() {
            return Err(ConfigError::Invalid("default_max_retries is too large".into()));
        }
        if self.retry_max_delay_secs < self.retry_base_delay_secs {
            return Err(ConfigError::Invalid(
                "retry_max_delay_secs must not be below retry_base_delay_secs".into(),
            ));
        }
        if let Some((task_type, _)) = self.rate_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::Invalid(format!(
                "rate limit of {task_type} must be at least 1"
            )));
        }
        Ok(())
    }

    /// Submission defaults derived from this configuration.
    pub fn submit_defaults(&self) -> SubmitDefaults {
        SubmitDefaults {
            max_retries: i32::try_from(self.default_max_retries).unwrap_or(i32::MAX),
            timeout_seconds: i32::try_from(self.default_timeout_secs).unwrap_or(i32::MAX),
        }
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs).unwrap_or(Duration::from_secs(1))
    }

    pub(crate) fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub(crate) fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub(crate) fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    pub(crate) fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub(crate) fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub(crate) fn stale_claim_grace(&self) -> Duration {
        Duration::from_secs(self.stale_claim_grace_secs)
    }
}

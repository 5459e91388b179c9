//! Configuration for the job queue and runner.
//!
//! Configuration is assembled from defaults, then `JOBS_*` environment
//! variables, then explicit builder calls (the CLI maps its flags onto the
//! builder).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::runner::RunnerConfig;

/// Default key prefix for the Redis backend.
pub const DEFAULT_KEY_PREFIX: &str = "xtraplatform:jobs";

/// Default number of retries before a job fails permanently.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default capacity of the failed list.
pub const DEFAULT_MAX_FAILED: usize = 1000;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which backend stores the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// In-process queue, single instance only.
    #[default]
    Local,
    /// Shared queue in Redis (requires the RedisJSON module).
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "redis" => Ok(BackendKind::Redis),
            other => Err(ConfigError::InvalidValue {
                key: "backend".to_string(),
                message: format!("unknown backend '{}', expected 'local' or 'redis'", other),
            }),
        }
    }
}

/// Configuration for the job queue.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Backend to enable.
    pub backend: BackendKind,
    /// Redis connection URL, used by the Redis backend.
    pub redis_url: String,
    /// Prefix for every Redis key and channel.
    pub key_prefix: String,
    /// Maximum number of entries kept in the failed list.
    pub max_failed: usize,
    /// Retries before a retryable failure becomes permanent.
    pub max_retries: u32,
    /// Runner settings.
    pub runner: RunnerConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_failed: DEFAULT_MAX_FAILED,
            max_retries: DEFAULT_MAX_RETRIES,
            runner: RunnerConfig::default(),
        }
    }
}

impl JobsConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBS_BACKEND`: `local` or `redis` (default: local)
    /// - `JOBS_REDIS_URL` or `REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `JOBS_KEY_PREFIX`: Redis key prefix (default: xtraplatform:jobs)
    /// - `JOBS_MAX_FAILED`: Failed list capacity (default: 1000)
    /// - `JOBS_MAX_RETRIES`: Retries per job (default: 3)
    /// - `JOBS_MAX_THREADS`: Concurrent jobs per runner (default: available parallelism)
    /// - `JOBS_EXECUTOR`: Executor name of this runner (default: runner-<uuid>)
    /// - `JOBS_POLL_INTERVAL_MS`: Dispatch poll interval (default: 1000)
    /// - `JOBS_ORPHAN_TIMEOUT_SECS`: Idle time before a taken job is orphaned (default: 60)
    /// - `JOBS_ORPHAN_SWEEP_INTERVAL_SECS`: Orphan sweep interval (default: 60)
    /// - `JOBS_DONE_SET_RETENTION_SECS`: How long done sets are kept (default: 3600)
    /// - `JOBS_PROGRESS_LOG_INTERVAL_SECS`: Progress log interval (default: 5)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`JobsConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("JOBS_BACKEND") {
            config.backend = val.parse()?;
        }

        if let Some(val) = lookup("JOBS_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            config.redis_url = val;
        }

        if let Some(val) = lookup("JOBS_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("JOBS_MAX_FAILED") {
            config.max_failed = parse_env_value(&val, "JOBS_MAX_FAILED")?;
        }

        if let Some(val) = lookup("JOBS_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "JOBS_MAX_RETRIES")?;
        }

        // Runner settings
        if let Some(val) = lookup("JOBS_MAX_THREADS") {
            config.runner.max_threads = parse_env_value(&val, "JOBS_MAX_THREADS")?;
        }

        if let Some(val) = lookup("JOBS_EXECUTOR") {
            config.runner.executor = val;
        }

        if let Some(val) = lookup("JOBS_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "JOBS_POLL_INTERVAL_MS")?;
            config.runner.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("JOBS_ORPHAN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBS_ORPHAN_TIMEOUT_SECS")?;
            config.runner.orphan_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("JOBS_ORPHAN_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBS_ORPHAN_SWEEP_INTERVAL_SECS")?;
            config.runner.orphan_sweep_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("JOBS_DONE_SET_RETENTION_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBS_DONE_SET_RETENTION_SECS")?;
            config.runner.done_set_retention = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("JOBS_PROGRESS_LOG_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBS_PROGRESS_LOG_INTERVAL_SECS")?;
            config.runner.progress_log_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendKind::Redis && self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty for the redis backend".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.max_failed == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_failed must be greater than 0".to_string(),
            ));
        }

        self.runner.validate()
    }

    /// Builder method to set the backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the Redis key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the failed list capacity.
    pub fn with_max_failed(mut self, max: usize) -> Self {
        self.max_failed = max;
        self
    }

    /// Builder method to set the retry limit.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Builder method to set the runner configuration.
    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = JobsConfig::default();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.key_prefix, "xtraplatform:jobs");
        assert_eq!(config.max_failed, 1000);
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_threads_defaults_to_available_parallelism() {
        let expected = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let config = JobsConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.runner.max_threads, expected);
    }

    #[test]
    fn test_config_builder() {
        let config = JobsConfig::new()
            .with_backend(BackendKind::Redis)
            .with_redis_url("redis://cache:6379")
            .with_key_prefix("test:jobs")
            .with_max_failed(10)
            .with_max_retries(1);

        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.key_prefix, "test:jobs");
        assert_eq!(config.max_failed, 10);
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(" Redis ".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert!("postgres".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Redis.to_string(), "redis");
    }

    #[test]
    fn test_from_lookup() {
        let config = JobsConfig::from_lookup(lookup_from(&[
            ("JOBS_BACKEND", "redis"),
            ("REDIS_URL", "redis://fallback:6379"),
            ("JOBS_MAX_RETRIES", "5"),
            ("JOBS_MAX_THREADS", "4"),
            ("JOBS_POLL_INTERVAL_MS", "250"),
            ("JOBS_ORPHAN_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.redis_url, "redis://fallback:6379");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.runner.max_threads, 4);
        assert_eq!(config.runner.poll_interval, Duration::from_millis(250));
        assert_eq!(config.runner.orphan_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_lookup_prefers_jobs_redis_url() {
        let config = JobsConfig::from_lookup(lookup_from(&[
            ("JOBS_REDIS_URL", "redis://primary:6379"),
            ("REDIS_URL", "redis://fallback:6379"),
        ]))
        .unwrap();
        assert_eq!(config.redis_url, "redis://primary:6379");
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let result = JobsConfig::from_lookup(lookup_from(&[("JOBS_MAX_FAILED", "many")]));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("JOBS_MAX_FAILED"));
    }

    #[test]
    fn test_validation_invalid_max_failed() {
        let config = JobsConfig::default().with_max_failed(0);
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("max_failed"));
    }

    #[test]
    fn test_validation_empty_prefix() {
        let config = JobsConfig::default().with_key_prefix("");
        assert!(config.validate().is_err());
    }
}

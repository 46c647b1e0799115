//! Configuration management.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DroverError, Result};
use crate::jobs::{builtin_handler, Backoff, JobDefinition, Priority, BUILTIN_HANDLERS};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine (queue) configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Redis connection; absent means the in-memory backing store
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Monitoring store and dashboard configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: LoggingConfig,

    /// Declarative job definitions bound to built-in handlers
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instance (queue) name
    #[serde(default = "default_engine_name")]
    pub name: String,

    /// Maximum handlers running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long a claim waits for work before re-checking shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Claim lock lifetime; renewed while the handler runs
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    /// Period of the stalled-job sweep
    #[serde(default = "default_stall_interval_ms")]
    pub stall_interval_ms: u64,

    /// Stalls tolerated before a job is failed
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Whether the worker binary starts schedule timers
    #[serde(default = "default_run_schedules")]
    pub run_schedules: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_ms: default_lock_duration_ms(),
            stall_interval_ms: default_stall_interval_ms(),
            max_stalled_count: default_max_stalled_count(),
            run_schedules: default_run_schedules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written by the queue and monitoring stores
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Dashboard redraw period
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,

    /// History entries kept per job name
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh_ms(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `json`, `pretty` or `compact`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus listen address; metrics are not exported when unset
    pub metrics_addr: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_addr: None,
        }
    }
}

/// One `[[jobs]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    /// One of the built-in handler names
    pub handler: String,

    #[serde(default)]
    pub priority: Priority,

    pub timeout_ms: Option<u64>,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    pub backoff: Option<Backoff>,

    /// Cron expression or named alias
    pub schedule: Option<String>,
}

impl JobConfig {
    /// Bind this entry to its built-in handler.
    pub fn to_definition(&self) -> Result<JobDefinition> {
        let handler = builtin_handler(&self.handler).ok_or_else(|| {
            DroverError::invalid_job(
                &self.name,
                format!(
                    "unknown handler `{}` (expected one of: {})",
                    self.handler,
                    BUILTIN_HANDLERS.join(", ")
                ),
            )
        })?;

        let mut definition = JobDefinition::new(self.name.clone(), handler)
            .priority(self.priority)
            .attempts(self.attempts);
        if let Some(timeout_ms) = self.timeout_ms {
            definition = definition.timeout_ms(timeout_ms);
        }
        if let Some(backoff) = self.backoff {
            definition = definition.backoff(backoff);
        }
        if let Some(schedule) = &self.schedule {
            definition = definition.schedule(schedule);
        }
        Ok(definition)
    }
}

// Default value functions
fn default_engine_name() -> String { "drover".to_string() }
fn default_concurrency() -> usize { 1 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_lock_duration_ms() -> u64 { 30_000 }
fn default_stall_interval_ms() -> u64 { 30_000 }
fn default_max_stalled_count() -> u32 { 1 }
fn default_run_schedules() -> bool { true }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "drover:".to_string() }
fn default_refresh_ms() -> u64 { 2000 }
fn default_history_limit() -> usize { crate::monitoring::HISTORY_LIMIT }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_attempts() -> u32 { 1 }

impl Config {
    /// Load configuration from the environment (`DROVER__ENGINE__NAME=...`).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("DROVER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("DROVER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Definitions for every `[[jobs]]` entry, bound to built-in handlers.
    /// Schedules and options are checked when the engine registers them.
    pub fn job_definitions(&self) -> Result<Vec<JobDefinition>> {
        self.jobs.iter().map(JobConfig::to_definition).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.name, "drover");
        assert_eq!(config.engine.concurrency, 1);
        assert_eq!(config.engine.lock_duration_ms, 30_000);
        assert!(config.engine.run_schedules);
        assert!(config.redis.is_none());
        assert_eq!(config.monitoring.refresh_ms, 2000);
        assert_eq!(config.monitoring.history_limit, 1000);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn test_from_file() {
        let file = write_config(
            r#"
[engine]
name = "mailer"
concurrency = 4

[redis]
url = "redis://cache:6379"

[[jobs]]
name = "ping"
handler = "echo"
priority = "high"
timeout_ms = 500
schedule = "every 10 seconds"

[[jobs]]
name = "flaky"
handler = "fail"
attempts = 3
backoff = { type = "exponential", delay_ms = 100 }
"#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.name, "mailer");
        assert_eq!(config.engine.concurrency, 4);
        assert_eq!(config.engine.poll_interval_ms, 1000);

        let redis = config.redis.as_ref().unwrap();
        assert_eq!(redis.url, "redis://cache:6379");
        assert_eq!(redis.key_prefix, "drover:");

        let definitions = config.job_definitions().unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].job_options().priority, Priority::High);
        assert_eq!(definitions[0].job_options().timeout_ms, Some(500));
        assert_eq!(definitions[0].schedule_text(), Some("every 10 seconds"));
        assert_eq!(definitions[1].job_options().attempts, 3);
        assert_eq!(definitions[1].job_options().backoff, Some(Backoff::exponential(100)));
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let config = Config {
            jobs: vec![JobConfig {
                name: "mystery".into(),
                handler: "teleport".into(),
                priority: Priority::default(),
                timeout_ms: None,
                attempts: 1,
                backoff: None,
                schedule: None,
            }],
            ..Config::default()
        };

        let error = config.job_definitions().unwrap_err();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("teleport"));
    }
}

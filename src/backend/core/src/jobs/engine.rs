//! The engine instance: owns the registry, dispatcher, processing engine,
//! scheduler and monitoring store for one named queue.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::JobContext;
use super::dispatcher::Dispatcher;
use super::events::{
    EventLogger, JOB_ERRORED, JOB_NOT_FOUND, JOB_PROCESSED, JOB_STARTED, JOB_TIMEOUT, PROCESSING_STARTED,
    PROCESSING_STOPPED, QUEUE_FLUSHED, QUEUE_PAUSED, QUEUE_RESUMED,
};
use super::job::{compose_payload, Job, JobError, JobOutcome, SubmitOptions};
use super::processor::{execute_with_deadline, Attempt, Processor, ProcessorConfig, ProcessorHandle, ProcessorStats};
use super::queue::{InMemoryQueueBackend, QueueBackend, QueueConfig};
use super::redis_queue::RedisQueueBackend;
use super::registry::{JobDefinition, JobRegistry};
use super::schedule::{ScheduleHandle, Scheduler};
use crate::config::{Config, EngineConfig};
use crate::error::{DroverError, ErrorCode, Result};
use crate::monitoring::{InMemoryMonitoringStore, JobSnapshot, MonitoringStore, RedisMonitoringStore};

// ═══════════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the backing queue store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueConnection {
    /// Single-process store; jobs do not outlive the process
    InMemory,
    /// Shared Redis store
    Redis { url: String, key_prefix: String },
}

/// Result of running a handler inline.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub outcome: JobOutcome,
    pub duration_ms: u64,
    pub result: Option<Value>,
    pub error: Option<JobError>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`JobEngine`]. Every missing or invalid input fails `build()`
/// with a configuration error.
#[derive(Default)]
pub struct JobEngineBuilder {
    name: Option<String>,
    connection: Option<QueueConnection>,
    backend: Option<Arc<dyn QueueBackend>>,
    monitoring: Option<Arc<dyn MonitoringStore>>,
    jobs: Vec<JobDefinition>,
    logger: Option<Arc<dyn EventLogger>>,
    config: EngineConfig,
    history_limit: Option<usize>,
}

impl JobEngineBuilder {
    /// Instance (queue) name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn connection(mut self, connection: QueueConnection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Use a custom backing store instead of a connection descriptor.
    pub fn backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the monitoring store derived from the connection.
    pub fn monitoring(mut self, monitoring: Arc<dyn MonitoringStore>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub fn job(mut self, definition: JobDefinition) -> Self {
        self.jobs.push(definition);
        self
    }

    pub fn jobs(mut self, definitions: impl IntoIterator<Item = JobDefinition>) -> Self {
        self.jobs.extend(definitions);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = Some(history_limit);
        self
    }

    pub fn build(self) -> Result<JobEngine> {
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| DroverError::missing_configuration("name"))?;
        let logger = self.logger.ok_or_else(|| DroverError::missing_configuration("logger"))?;
        let registry = Arc::new(JobRegistry::new(self.jobs)?);
        let history_limit = self.history_limit.unwrap_or(crate::monitoring::HISTORY_LIMIT);

        let queue_config = QueueConfig {
            lock_duration_ms: self.config.lock_duration_ms,
            max_stalled_count: self.config.max_stalled_count,
        };

        let (backend, derived_monitoring): (Arc<dyn QueueBackend>, Arc<dyn MonitoringStore>) =
            match (self.backend, self.connection) {
                (Some(backend), _) => (backend, Arc::new(InMemoryMonitoringStore::with_history_limit(history_limit))),
                (None, Some(QueueConnection::InMemory)) => (
                    Arc::new(InMemoryQueueBackend::new(queue_config)),
                    Arc::new(InMemoryMonitoringStore::with_history_limit(history_limit)),
                ),
                (None, Some(QueueConnection::Redis { url, key_prefix })) => {
                    let client = redis::Client::open(url.as_str()).map_err(|e| {
                        DroverError::with_internal(
                            ErrorCode::InvalidConfiguration,
                            "The Redis connection URL is invalid",
                            e.to_string(),
                        )
                    })?;
                    (
                        Arc::new(RedisQueueBackend::new(client.clone(), &key_prefix, &name, queue_config)),
                        Arc::new(RedisMonitoringStore::new(client, key_prefix).with_history_limit(history_limit)),
                    )
                }
                (None, None) => return Err(DroverError::missing_configuration("connection")),
            };
        let monitoring = self.monitoring.unwrap_or(derived_monitoring);

        let dispatcher = Dispatcher::new(registry, backend, monitoring, logger);
        Ok(JobEngine {
            name,
            dispatcher,
            config: self.config,
            token: CancellationToken::new(),
            processing: AtomicBool::new(false),
            processor: Mutex::new(None),
            schedules: Mutex::new(None),
            stats: ProcessorStats::default(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// A configured job engine.
pub struct JobEngine {
    name: String,
    dispatcher: Dispatcher,
    config: EngineConfig,
    token: CancellationToken,
    processing: AtomicBool,
    processor: Mutex<Option<ProcessorHandle>>,
    schedules: Mutex<Option<ScheduleHandle>>,
    stats: ProcessorStats,
}

impl JobEngine {
    pub fn builder() -> JobEngineBuilder {
        JobEngineBuilder::default()
    }

    /// Build an engine from loaded configuration, with definitions from
    /// `[[jobs]]` bound to built-in handlers.
    pub fn from_config(config: &Config, logger: Arc<dyn EventLogger>) -> Result<Self> {
        let connection = match &config.redis {
            Some(redis) => QueueConnection::Redis {
                url: redis.url.clone(),
                key_prefix: redis.key_prefix.clone(),
            },
            None => QueueConnection::InMemory,
        };
        Self::builder()
            .name(config.engine.name.clone())
            .connection(connection)
            .jobs(config.job_definitions()?)
            .logger(logger)
            .config(config.engine.clone())
            .history_limit(config.monitoring.history_limit)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &JobRegistry {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn monitoring(&self) -> Arc<dyn MonitoringStore> {
        Arc::clone(self.dispatcher.monitoring())
    }

    /// Attempt counters for this process.
    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    /// Enqueue a job. An unknown name is rejected (and logged) at call time.
    pub fn add(&self, name: &str, data: Option<Value>) -> BoxFuture<'static, Result<Job>> {
        self.dispatcher.add(name, data)
    }

    /// Start the claim loop. Only the first call has an effect; it returns
    /// `true`.
    pub fn process(&self) -> bool {
        if self.processing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let config = ProcessorConfig {
            concurrency: self.config.concurrency,
            poll_interval_ms: self.config.poll_interval_ms,
            stall_interval_ms: self.config.stall_interval_ms,
            worker_id: format!("{}:{}:{}", self.name, std::process::id(), uuid::Uuid::new_v4()),
        };
        self.dispatcher.logger().info(
            PROCESSING_STARTED,
            json!({ "queue": self.name, "concurrency": config.concurrency, "worker_id": config.worker_id }),
        );
        let processor = Processor::new(self.dispatcher.clone(), config, self.stats.clone());
        *self.processor.lock() = Some(processor.start(&self.token));
        true
    }

    /// Start recurring triggers. Returns the number of timers started, or 0
    /// when schedules are already running.
    pub fn schedule(&self) -> usize {
        let mut schedules = self.schedules.lock();
        if schedules.is_some() {
            return 0;
        }
        let handle = Scheduler::new(self.dispatcher.clone()).start(&self.token);
        let started = handle.len();
        tracing::info!(queue = %self.name, schedules = started, "Scheduling repeatable jobs");
        *schedules = Some(handle);
        started
    }

    /// Stop claiming jobs (applies to every worker sharing the store).
    pub async fn pause(&self) -> Result<()> {
        self.dispatcher.backend().pause().await?;
        self.dispatcher.logger().info(QUEUE_PAUSED, json!({ "queue": self.name }));
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.dispatcher.backend().resume().await?;
        self.dispatcher.logger().info(QUEUE_RESUMED, json!({ "queue": self.name }));
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.dispatcher.backend().is_paused().await
    }

    /// Remove every waiting job. Removed jobs are taken off the `queued`
    /// counters.
    pub async fn flush(&self) -> Result<Vec<Job>> {
        let removed = self.dispatcher.backend().flush().await?;
        for job in &removed {
            if let Some(name) = job.name() {
                self.dispatcher.monitoring().record_removed(name).await?;
            }
        }
        self.dispatcher
            .logger()
            .info(QUEUE_FLUSHED, json!({ "queue": self.name, "removed": removed.len() }));
        Ok(removed)
    }

    /// Active jobs followed by waiting jobs.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.dispatcher.list().await
    }

    /// Monitoring snapshot for every known job name.
    pub async fn get_data(&self) -> Result<Vec<JobSnapshot>> {
        self.dispatcher.monitoring().snapshot().await
    }

    /// Drop all monitoring records.
    pub async fn clear_stats(&self) -> Result<()> {
        self.dispatcher.monitoring().clear().await
    }

    /// Run a handler now, through the same deadline race, without the
    /// backing store or the monitoring store.
    pub async fn run_inline(&self, name: &str, data: Option<Value>) -> Result<Execution> {
        let logger = self.dispatcher.logger();
        let Some(definition) = self.dispatcher.registry().get(name).cloned() else {
            logger.error(JOB_NOT_FOUND, json!({ "name": name }));
            return Err(DroverError::job_not_found(name));
        };

        let options = SubmitOptions::from_job_options(definition.job_options());
        let job = Job::new(compose_payload(name, data), options);
        let ctx = JobContext::new(job, name, self.dispatcher.clone());
        let mut fields = ctx.fields();
        if let Value::Object(map) = &mut fields {
            map.insert("inline".to_string(), Value::Bool(true));
        }
        logger.info(JOB_STARTED, fields.clone());

        let timeout = definition.job_options().timeout();
        let started = Instant::now();
        let attempt = execute_with_deadline(definition.handler().clone(), ctx, timeout).await;
        let duration_ms = match (&attempt, timeout) {
            (Attempt::TimedOut(_), Some(limit)) => limit.as_millis() as u64,
            _ => started.elapsed().as_millis() as u64,
        };

        let outcome = attempt.outcome();
        let (kind, result, error) = match attempt {
            Attempt::Completed(value) => (JOB_PROCESSED, Some(value), None),
            Attempt::Failed(error) => (JOB_ERRORED, None, Some(error)),
            Attempt::TimedOut(error) => (JOB_TIMEOUT, None, Some(error)),
        };
        if let Value::Object(map) = &mut fields {
            map.insert("duration_ms".to_string(), json!(duration_ms));
            map.insert("result".to_string(), json!(result));
            if let Some(error) = &error {
                map.insert("error_message".to_string(), json!(error.message));
                map.insert("error_kind".to_string(), json!(error.kind.as_str()));
            }
        }
        if error.is_some() {
            logger.error(kind, fields);
        } else {
            logger.info(kind, fields);
        }

        Ok(Execution {
            outcome,
            duration_ms,
            result,
            error,
        })
    }

    /// Stop processing and schedules and wait for in-flight attempts.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let schedules = self.schedules.lock().take();
        if let Some(schedules) = schedules {
            schedules.stop().await;
        }
        let processor = self.processor.lock().take();
        if let Some(processor) = processor {
            processor.shutdown().await;
            self.dispatcher.logger().info(PROCESSING_STOPPED, json!({ "queue": self.name }));
        }
    }
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("name", &self.name)
            .field("jobs", &self.dispatcher.registry().names())
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

//! Execution path: claim jobs, run handlers under a deadline, classify and
//! record the outcome. Also hosts the stall sweeper and the queue event
//! listener.
//!
//! The deadline is cooperative. When the timer wins, the handler's task is
//! detached, not aborted: whatever it still does runs unsupervised, and only
//! the reported outcome is `TimedOut`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::JobContext;
use super::dispatcher::Dispatcher;
use super::events::{
    JOB_ERRORED, JOB_NOT_FOUND, JOB_PROCESSED, JOB_STALLED, JOB_STARTED, JOB_TIMEOUT, QUEUE_ERROR,
};
use super::job::{Job, JobError, JobOutcome, JobState};
use super::queue::QueueEvent;
use super::registry::{panic_message, JobHandler};
use crate::observability::metrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration & Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the processing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Concurrent handler executions in this process
    pub concurrency: usize,
    /// Longest single wait for a job to claim (milliseconds)
    pub poll_interval_ms: u64,
    /// How often expired claims are swept (milliseconds)
    pub stall_interval_ms: u64,
    /// Identifier used when claiming jobs
    pub worker_id: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval_ms: 1000,
            stall_interval_ms: 30_000,
            worker_id: format!("drover-worker-{}", std::process::id()),
        }
    }
}

/// Counters for attempts run by this process.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub processed: Arc<AtomicU64>,
    pub completed: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub timed_out: Arc<AtomicU64>,
    pub active: Arc<AtomicU64>,
}

impl ProcessorStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobOutcome::Completed => &self.completed,
            JobOutcome::Failed => &self.failed,
            JobOutcome::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deadline Race
// ═══════════════════════════════════════════════════════════════════════════════

/// How one attempt settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Completed(Value),
    Failed(JobError),
    TimedOut(JobError),
}

impl Attempt {
    pub fn outcome(&self) -> JobOutcome {
        match self {
            Self::Completed(_) => JobOutcome::Completed,
            Self::Failed(_) => JobOutcome::Failed,
            Self::TimedOut(_) => JobOutcome::TimedOut,
        }
    }
}

/// Run the handler in its own task and race it against `timeout`.
///
/// A panic inside the handler is reported as `Failed` with kind `panic`.
pub async fn execute_with_deadline(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    timeout: Option<Duration>,
) -> Attempt {
    let task = tokio::spawn(async move { handler.execute(&ctx).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            // The JoinHandle is dropped here; the handler keeps running.
            Err(_) => return Attempt::TimedOut(JobError::timed_out(limit.as_millis() as u64)),
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(value)) => Attempt::Completed(value),
        Ok(Err(error)) => Attempt::Failed(error),
        Err(e) if e.is_panic() => Attempt::Failed(JobError::panicked(panic_message(e.into_panic()))),
        Err(e) => Attempt::Failed(JobError::new(e.to_string())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle over the processing tasks.
pub struct ProcessorHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Stop claiming and wait for in-flight attempts to settle.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Claims jobs and runs them.
pub struct Processor {
    dispatcher: Dispatcher,
    config: ProcessorConfig,
    stats: ProcessorStats,
}

impl Processor {
    pub fn new(dispatcher: Dispatcher, config: ProcessorConfig, stats: ProcessorStats) -> Self {
        Self {
            dispatcher,
            config,
            stats,
        }
    }

    /// Spawn the claim loop, the stall sweeper and the event listener.
    pub fn start(self, parent: &CancellationToken) -> ProcessorHandle {
        let token = parent.child_token();
        let this = Arc::new(self);
        let events = this.dispatcher.backend().subscribe();

        let tasks = vec![
            tokio::spawn(Arc::clone(&this).claim_loop(token.clone())),
            tokio::spawn(Arc::clone(&this).stall_sweeper(token.clone())),
            tokio::spawn(this.event_listener(events, token.clone())),
        ];
        ProcessorHandle { token, tasks }
    }

    async fn claim_loop(self: Arc<Self>, token: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let wait = Duration::from_millis(self.config.poll_interval_ms.max(1));
        tracing::info!(worker = %self.config.worker_id, concurrency, "Claim loop started");

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = tokio::select! {
                _ = token.cancelled() => break,
                claimed = self.dispatcher.backend().claim(&self.config.worker_id, wait) => claimed,
            };

            match claimed {
                Ok(Some(job)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.run_attempt(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    self.dispatcher
                        .logger()
                        .error(QUEUE_ERROR, json!({ "error_message": e.to_string() }));
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        // Wait for attempts still holding permits.
        let _ = semaphore.acquire_many(concurrency as u32).await;
        tracing::info!(worker = %self.config.worker_id, "Claim loop stopped");
    }

    /// Run one claimed job through the deadline race and record the outcome.
    pub(crate) async fn run_attempt(&self, job: Job) {
        let dispatcher = &self.dispatcher;
        let logger = dispatcher.logger();

        let Some(name) = job.name().map(str::to_string) else {
            logger.error(JOB_NOT_FOUND, json!({ "job_id": job.id, "name": Value::Null }));
            return;
        };
        // Counted before the lookup so the stall sweep can undo the claim.
        if let Err(e) = dispatcher.monitoring().record_claimed(&name, job.attempts_made).await {
            tracing::warn!(job = %name, error = %e, "Failed to record claimed job");
        }
        let Some(definition) = dispatcher.registry().get(&name).cloned() else {
            // Left claimed: the lock lapses and the stall sweep takes over.
            logger.error(JOB_NOT_FOUND, json!({ "job_id": job.id, "name": name }));
            return;
        };
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let ctx = JobContext::new(job.clone(), &name, dispatcher.clone());
        let fields = ctx.fields();
        logger.info(JOB_STARTED, fields.clone());

        let timeout = definition.job_options().timeout();
        let started = Instant::now();
        let attempt = self.race_with_lock_renewal(&job, definition.handler().clone(), ctx, timeout).await;
        let duration_ms = match (&attempt, timeout) {
            (Attempt::TimedOut(_), Some(limit)) => limit.as_millis() as u64,
            _ => started.elapsed().as_millis() as u64,
        };

        let outcome = attempt.outcome();
        let ack = match attempt {
            Attempt::Completed(result) => {
                logger.info(JOB_PROCESSED, with_fields(&fields, json!({ "duration_ms": duration_ms, "result": &result })));
                dispatcher.backend().complete(&job, &result).await.map(|_| ())
            }
            Attempt::Failed(error) => {
                logger.error(
                    JOB_ERRORED,
                    with_fields(
                        &fields,
                        json!({
                            "duration_ms": duration_ms,
                            "error_message": &error.message,
                            "error_kind": error.kind.as_str(),
                        }),
                    ),
                );
                dispatcher.backend().fail(&job, &error).await.map(|_| ())
            }
            Attempt::TimedOut(error) => {
                logger.error(
                    JOB_TIMEOUT,
                    with_fields(
                        &fields,
                        json!({
                            "duration_ms": duration_ms,
                            "error_message": &error.message,
                            "error_kind": error.kind.as_str(),
                        }),
                    ),
                );
                dispatcher.backend().fail(&job, &error).await.map(|_| ())
            }
        };
        if let Err(e) = ack {
            logger.error(QUEUE_ERROR, json!({ "job_id": job.id, "name": name, "error_message": e.to_string() }));
        }

        if let Err(e) = dispatcher.monitoring().record_finished(&name, outcome, duration_ms).await {
            tracing::warn!(job = %name, error = %e, "Failed to record finished job");
        }
        metrics::record_job_finished(&name, outcome, duration_ms);
        self.stats.record(outcome);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Race the handler while renewing the claim every half lock period.
    async fn race_with_lock_renewal(
        &self,
        job: &Job,
        handler: Arc<dyn JobHandler>,
        ctx: JobContext,
        timeout: Option<Duration>,
    ) -> Attempt {
        let backend = self.dispatcher.backend();
        let renew_every = (backend.lock_duration() / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        let attempt = execute_with_deadline(handler, ctx, timeout);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                settled = &mut attempt => return settled,
                _ = renew.tick() => match backend.extend_lock(job.id, &self.config.worker_id).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(job_id = %job.id, "Lost the claim on a running job"),
                    Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to renew job lock"),
                },
            }
        }
    }

    async fn stall_sweeper(self: Arc<Self>, token: CancellationToken) {
        let every = Duration::from_millis(self.config.stall_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.dispatcher.backend().check_stalled().await {
                Ok(stalled) if !stalled.is_empty() => {
                    tracing::debug!(count = stalled.len(), "Recovered stalled jobs");
                }
                Ok(_) => {}
                Err(e) => self
                    .dispatcher
                    .logger()
                    .error(QUEUE_ERROR, json!({ "error_message": e.to_string() })),
            }
        }
    }

    async fn event_listener(self: Arc<Self>, mut events: broadcast::Receiver<QueueEvent>, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(QueueEvent::Stalled(job)) => self.on_stalled(job).await,
                Ok(QueueEvent::Error { message }) => {
                    self.dispatcher.logger().error(QUEUE_ERROR, json!({ "error_message": message }));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Queue event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn on_stalled(&self, job: Job) {
        let (name, data) = job.split_payload();
        self.dispatcher.logger().warn(
            JOB_STALLED,
            json!({ "job_id": job.id, "attempt": job.attempts_made, "name": name, "data": data }),
        );
        metrics::record_job_stalled();

        let Some(name) = name else { return };
        let recorded = if job.state == JobState::Queued {
            self.dispatcher.monitoring().record_requeued(&name, job.attempts_made).await
        } else {
            let duration_ms = job
                .started_at
                .map(|started| (chrono::Utc::now() - started).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.dispatcher
                .monitoring()
                .record_finished(&name, JobOutcome::Failed, duration_ms)
                .await
        };
        if let Err(e) = recorded {
            tracing::warn!(job = %name, error = %e, "Failed to record stalled job");
        }
    }
}

/// Merge attempt fields with event-specific ones.
fn with_fields(base: &Value, extra: Value) -> Value {
    let mut merged = base.clone();
    if let (Value::Object(target), Value::Object(source)) = (&mut merged, extra) {
        target.extend(source);
    }
    merged
}

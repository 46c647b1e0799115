//! Stalled-job recovery across workers sharing one backing store.
//!
//! Tests cover:
//! - Claims left behind by a worker without the job's definition
//! - A retry attempt whose worker dies mid-claim
//! - The `job_stalled` event fields

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_core::config::EngineConfig;
use drover_core::jobs::{
    builtin_handler, events, handler_fn, Backoff, InMemoryQueueBackend, JobDefinition, JobEngine, JobError,
    LogLevel, MemoryEventLogger, QueueBackend, QueueConfig,
};
use drover_core::monitoring::{InMemoryMonitoringStore, JobStats, MonitoringStore};
use serde_json::json;

use common::{eventually, stats_for};

const WAIT: Duration = Duration::from_secs(5);

fn shared_backend(lock_duration_ms: u64) -> Arc<InMemoryQueueBackend> {
    Arc::new(InMemoryQueueBackend::new(QueueConfig {
        lock_duration_ms,
        max_stalled_count: 1,
    }))
}

fn fast_sweep() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 20,
        stall_interval_ms: 30,
        ..EngineConfig::default()
    }
}

fn engine_on(
    backend: &Arc<InMemoryQueueBackend>,
    monitoring: &Arc<InMemoryMonitoringStore>,
    logger: &MemoryEventLogger,
    jobs: Vec<JobDefinition>,
) -> JobEngine {
    JobEngine::builder()
        .name("shared")
        .backend(backend.clone())
        .monitoring(monitoring.clone())
        .logger(Arc::new(logger.clone()))
        .jobs(jobs)
        .config(fast_sweep())
        .build()
        .unwrap()
}

fn assert_non_negative(stats: &JobStats) {
    assert!(stats.queued >= 0, "queued went negative: {:?}", stats);
    assert!(stats.active >= 0, "active went negative: {:?}", stats);
}

#[tokio::test]
async fn test_claim_without_definition_is_swept_and_failed() {
    let backend = shared_backend(60);
    let monitoring = Arc::new(InMemoryMonitoringStore::new());

    let producer_log = MemoryEventLogger::new();
    let producer = engine_on(
        &backend,
        &monitoring,
        &producer_log,
        vec![JobDefinition::new("x", builtin_handler("echo").unwrap())],
    );

    // This worker only knows "y"; it claims "x" and cannot run it.
    let worker_log = MemoryEventLogger::new();
    let worker = engine_on(
        &backend,
        &monitoring,
        &worker_log,
        vec![JobDefinition::new("y", builtin_handler("echo").unwrap())],
    );
    worker.process();

    let job = producer.add("x", Some(json!({ "to": "a" }))).await.unwrap();

    assert!(eventually(WAIT, || async { stats_for(&producer, "x").await.failed == 1 }).await);
    let stats = stats_for(&producer, "x").await;
    assert_non_negative(&stats);
    assert_eq!(stats, JobStats::new(0, 0, 0, 0, 1));
    assert!(producer.list().await.unwrap().is_empty());

    // Requeued once, then failed past the stall limit.
    assert_eq!(worker_log.count(events::JOB_NOT_FOUND), 2);
    let stalled = worker_log.of_kind(events::JOB_STALLED);
    assert_eq!(stalled.len(), 2);
    assert_eq!(stalled[0].level, LogLevel::Warn);
    assert_eq!(stalled[0].fields["job_id"], json!(job.id));
    assert_eq!(stalled[0].fields["attempt"], 0);
    assert_eq!(stalled[0].fields["name"], "x");
    assert_eq!(stalled[0].fields["data"], json!({ "to": "a" }));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_stalled_retry_keeps_counters_balanced() {
    let backend = shared_backend(100);
    let monitoring = Arc::new(InMemoryMonitoringStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let flaky = |calls: Arc<AtomicUsize>| {
        JobDefinition::new(
            "flaky",
            handler_fn(move |_ctx| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(JobError::new("first try"))
                    } else {
                        Ok(json!("done"))
                    }
                }
            }),
        )
        .attempts(3)
        .backoff(Backoff::fixed(400))
    };

    // Attempt 0 fails on the first worker, which then stops.
    let first_log = MemoryEventLogger::new();
    let first = engine_on(&backend, &monitoring, &first_log, vec![flaky(calls.clone())]);
    first.process();
    first.add("flaky", None).await.unwrap();
    assert!(eventually(WAIT, || async { stats_for(&first, "flaky").await.failed == 1 }).await);
    first.shutdown().await;

    // A worker claims the retry and dies holding it.
    let retry = backend.claim("dead-worker", Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(retry.attempts_made, 1);
    monitoring.record_claimed("flaky", retry.attempts_made).await.unwrap();

    let second_log = MemoryEventLogger::new();
    let second = engine_on(&backend, &monitoring, &second_log, vec![flaky(calls.clone())]);
    second.process();

    assert!(eventually(WAIT, || async { stats_for(&second, "flaky").await.completed == 1 }).await);
    let stats = stats_for(&second, "flaky").await;
    assert_non_negative(&stats);
    assert_eq!(stats, JobStats::new(0, 0, 1, 0, 1));
    assert!(second.list().await.unwrap().is_empty());

    let stalled = second_log.of_kind(events::JOB_STALLED);
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].fields["job_id"], json!(retry.id));
    assert_eq!(stalled[0].fields["attempt"], 1);
    assert_eq!(stalled[0].fields["name"], "flaky");

    second.shutdown().await;
}

//! Tests for the handler/timeout race.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_core::jobs::{events, handler_fn, sync_handler_fn, JobDefinition, JobOutcome, LogLevel, MemoryEventLogger};
use drover_core::monitoring::JobStats;
use serde_json::{json, Value};

use common::{engine, eventually, stats_for};

fn sleeper(ms: u64) -> Arc<dyn drover_core::jobs::JobHandler> {
    handler_fn(move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    })
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, vec![JobDefinition::new("echo", sleeper(2000)).timeout_ms(1000)]);

    engine.process();
    engine.add("echo", Some(json!({ "n": 1 }))).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "echo").await.timed_out == 1 }).await);

    let timeouts = logger.of_kind(events::JOB_TIMEOUT);
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].level, LogLevel::Error);
    assert_eq!(timeouts[0].fields["error_message"], "Job processing timed out after 1000 ms");
    assert_eq!(timeouts[0].fields["duration_ms"], 1000);
    assert_eq!(logger.count(events::JOB_PROCESSED), 0);

    let snapshot = engine.get_data().await.unwrap();
    assert_eq!(snapshot[0].stats, JobStats::new(0, 0, 0, 1, 0));
    assert_eq!(snapshot[0].history[0].status, JobOutcome::TimedOut);
    assert_eq!(snapshot[0].history[0].duration_ms, 1000);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_fast_handler_beats_deadline() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, vec![JobDefinition::new("quick", sleeper(20)).timeout_ms(1000)]);

    engine.process();
    engine.add("quick", None).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "quick").await.completed == 1 }).await);
    assert_eq!(logger.count(events::JOB_TIMEOUT), 0);
    assert_eq!(logger.of_kind(events::JOB_PROCESSED)[0].fields["result"], json!({ "slept_ms": 20 }));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_job_is_retried_while_attempts_remain() {
    let logger = MemoryEventLogger::new();
    let engine = engine(
        &logger,
        vec![JobDefinition::new("slow", sleeper(500)).timeout_ms(50).attempts(2)],
    );

    engine.process();
    engine.add("slow", None).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "slow").await.timed_out == 2 }).await);
    assert_eq!(stats_for(&engine, "slow").await, JobStats::new(0, 0, 0, 2, 0));

    let timeouts = logger.of_kind(events::JOB_TIMEOUT);
    assert_eq!(timeouts.len(), 2);
    assert_eq!(timeouts[0].fields["attempt"], 0);
    assert_eq!(timeouts[1].fields["attempt"], 1);
    assert!(engine.list().await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_job_on_last_attempt_is_final() {
    let logger = MemoryEventLogger::new();
    let engine = engine(
        &logger,
        vec![JobDefinition::new("slow", sleeper(500)).timeout_ms(50).attempts(1)],
    );

    engine.process();
    engine.add("slow", None).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "slow").await.timed_out == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(logger.count(events::JOB_STARTED), 1);
    assert!(engine.list().await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_blocking_handler_times_out() {
    let logger = MemoryEventLogger::new();
    let finished = Arc::new(AtomicBool::new(false));
    let handler = {
        let finished = Arc::clone(&finished);
        sync_handler_fn(move |_ctx| {
            std::thread::sleep(Duration::from_millis(300));
            finished.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        })
    };
    let engine = engine(&logger, vec![JobDefinition::new("blocking", handler).timeout_ms(50)]);

    let execution = engine.run_inline("blocking", None).await.unwrap();
    assert_eq!(execution.outcome, JobOutcome::TimedOut);
    assert_eq!(execution.duration_ms, 50);
    assert_eq!(
        execution.error.unwrap().message,
        "Job processing timed out after 50 ms"
    );

    // The abandoned work is not cancelled; it keeps running to the end.
    assert!(eventually(Duration::from_secs(2), || async { finished.load(Ordering::SeqCst) }).await);
}

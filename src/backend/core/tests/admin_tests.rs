//! Administrative controls: pause, resume, flush, list and shutdown.

mod common;

use std::time::Duration;

use drover_core::jobs::{builtin_handler, events, JobDefinition, JobState, MemoryEventLogger};
use drover_core::monitoring::JobStats;
use serde_json::json;

use common::{engine, eventually, stats_for};

fn definitions() -> Vec<JobDefinition> {
    vec![
        JobDefinition::new("echo", builtin_handler("echo").unwrap()),
        JobDefinition::new("sleep", builtin_handler("sleep").unwrap()),
    ]
}

#[tokio::test]
async fn test_pause_holds_jobs_until_resume() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, definitions());

    engine.pause().await.unwrap();
    assert!(engine.is_paused().await.unwrap());
    assert_eq!(logger.count(events::QUEUE_PAUSED), 1);

    engine.process();
    engine.add("echo", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stats_for(&engine, "echo").await, JobStats::new(1, 0, 0, 0, 0));
    assert_eq!(engine.list().await.unwrap().len(), 1);

    engine.resume().await.unwrap();
    assert!(!engine.is_paused().await.unwrap());
    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "echo").await.completed == 1 }).await);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_flush_removes_waiting_jobs() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, definitions());

    engine.add("echo", None).await.unwrap();
    engine.add("echo", None).await.unwrap();
    engine.add("sleep", Some(json!({ "ms": 1 }))).await.unwrap();

    let removed = engine.flush().await.unwrap();
    assert_eq!(removed.len(), 3);
    assert!(engine.list().await.unwrap().is_empty());

    let flushed = logger.of_kind(events::QUEUE_FLUSHED);
    assert_eq!(flushed[0].fields["removed"], 3);

    // Counters stay balanced once the removed jobs are gone.
    assert_eq!(stats_for(&engine, "echo").await, JobStats::new(0, 0, 0, 0, 0));
    assert_eq!(stats_for(&engine, "sleep").await, JobStats::new(0, 0, 0, 0, 0));
}

#[tokio::test]
async fn test_list_shows_active_then_waiting() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, definitions());

    engine.add("sleep", Some(json!({ "ms": 400 }))).await.unwrap();
    engine.add("echo", None).await.unwrap();
    engine.process();

    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "sleep").await.active == 1 }).await);
    let jobs = engine.list().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].state, JobState::Active);
    assert_eq!(jobs[0].name(), Some("sleep"));
    assert_eq!(jobs[1].state, JobState::Queued);
    assert_eq!(jobs[1].name(), Some("echo"));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_process_is_idempotent() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, definitions());

    assert!(engine.process());
    assert!(!engine.process());
    assert_eq!(logger.count(events::PROCESSING_STARTED), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_attempts() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, definitions());

    engine.process();
    engine.add("sleep", Some(json!({ "ms": 300 }))).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || async { logger.count(events::JOB_STARTED) == 1 }).await);

    engine.shutdown().await;
    assert_eq!(stats_for(&engine, "sleep").await.completed, 1);
    assert_eq!(logger.count(events::PROCESSING_STOPPED), 1);
}

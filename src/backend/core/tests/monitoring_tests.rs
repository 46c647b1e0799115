//! Monitoring counters, history and dashboard rendering through the engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use drover_core::jobs::{builtin_handler, JobDefinition, JobEngine, JobOutcome, MemoryEventLogger, QueueConnection};
use drover_core::monitoring::{render_dashboard, totals, JobStats};
use serde_json::json;

use common::{engine, eventually, stats_for};

fn echo(name: &str) -> JobDefinition {
    JobDefinition::new(name, builtin_handler("echo").unwrap())
}

#[tokio::test]
async fn test_queued_counters_sum_across_names() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, vec![echo("A"), echo("B")]);

    engine.add("A", None).await.unwrap();
    engine.add("A", None).await.unwrap();
    engine.add("B", None).await.unwrap();

    let snapshot = engine.get_data().await.unwrap();
    let names: Vec<&str> = snapshot.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(snapshot[0].stats.queued, 2);
    assert_eq!(snapshot[1].stats.queued, 1);
    assert_eq!(totals(&snapshot).queued, 3);
    assert_eq!(totals(&snapshot).total, 3);
}

#[tokio::test]
async fn test_counters_balance_after_processing() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, vec![echo("A"), echo("B")]);

    for _ in 0..3 {
        engine.add("A", None).await.unwrap();
    }
    engine.add("B", None).await.unwrap();
    engine.process();

    assert!(
        eventually(Duration::from_secs(5), || async {
            totals(&engine.get_data().await.unwrap()).completed == 4
        })
        .await
    );

    let snapshot = engine.get_data().await.unwrap();
    assert_eq!(snapshot[0].stats, JobStats::new(0, 0, 3, 0, 0));
    assert_eq!(snapshot[0].history.len(), 3);
    assert!(snapshot[0].history.iter().all(|entry| entry.status == JobOutcome::Completed));
    assert_eq!(snapshot[1].stats, JobStats::new(0, 0, 1, 0, 0));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_history_is_bounded_newest_first() {
    let logger = MemoryEventLogger::new();
    let engine = JobEngine::builder()
        .name("bounded")
        .connection(QueueConnection::InMemory)
        .logger(Arc::new(logger.clone()))
        .job(JobDefinition::new("sleep", builtin_handler("sleep").unwrap()))
        .history_limit(2)
        .build()
        .unwrap();

    engine.add("sleep", Some(json!({ "ms": 5 }))).await.unwrap();
    engine.add("sleep", Some(json!({ "ms": 5 }))).await.unwrap();
    engine.add("sleep", Some(json!({ "ms": 150 }))).await.unwrap();
    engine.process();

    assert!(eventually(Duration::from_secs(5), || async { stats_for(&engine, "sleep").await.completed == 3 }).await);
    let snapshot = engine.get_data().await.unwrap();
    assert_eq!(snapshot[0].history.len(), 2);
    assert!(snapshot[0].history[0].duration_ms >= 150);
    assert!(snapshot[0].history[0].timestamp_ms >= snapshot[0].history[1].timestamp_ms);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_clear_stats_forgets_every_record() {
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, vec![echo("A")]);

    engine.add("A", None).await.unwrap();
    assert_eq!(engine.get_data().await.unwrap().len(), 1);

    engine.clear_stats().await.unwrap();
    assert!(engine.get_data().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dashboard_renders_engine_snapshot() {
    colored::control::set_override(false);
    let logger = MemoryEventLogger::new();
    let engine = engine(&logger, vec![echo("alpha"), echo("beta")]);

    engine.add("alpha", None).await.unwrap();
    engine.add("beta", None).await.unwrap();

    let rendered = render_dashboard(&engine.get_data().await.unwrap());
    assert!(rendered.contains("Processing History"));
    assert!(rendered.contains("alpha"));
    assert!(rendered.contains("beta"));
    assert!(rendered.contains("TOTAL"));
}

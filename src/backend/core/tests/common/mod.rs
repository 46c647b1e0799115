//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use drover_core::jobs::{JobDefinition, JobEngine, MemoryEventLogger, QueueConnection};
use drover_core::monitoring::JobStats;

/// In-memory engine named `test` over `jobs`, logging into `logger`.
pub fn engine(logger: &MemoryEventLogger, jobs: Vec<JobDefinition>) -> JobEngine {
    JobEngine::builder()
        .name("test")
        .connection(QueueConnection::InMemory)
        .logger(Arc::new(logger.clone()))
        .jobs(jobs)
        .build()
        .unwrap()
}

/// Poll `check` every 20ms until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Counters for `name`, zeroed when the name has no record yet.
pub async fn stats_for(engine: &JobEngine, name: &str) -> JobStats {
    engine
        .get_data()
        .await
        .unwrap()
        .into_iter()
        .find(|snapshot| snapshot.name == name)
        .map(|snapshot| snapshot.stats)
        .unwrap_or_default()
}

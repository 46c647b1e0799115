//! In-process monitoring store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::{HistoryEntry, JobSnapshot, JobStats, MonitoringStore, HISTORY_LIMIT};
use crate::error::Result;
use crate::jobs::JobOutcome;

#[derive(Debug, Default)]
struct Record {
    queued: AtomicI64,
    active: AtomicI64,
    completed: AtomicI64,
    timed_out: AtomicI64,
    failed: AtomicI64,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl Record {
    fn outcome_counter(&self, outcome: JobOutcome) -> &AtomicI64 {
        match outcome {
            JobOutcome::Completed => &self.completed,
            JobOutcome::TimedOut => &self.timed_out,
            JobOutcome::Failed => &self.failed,
        }
    }

    fn stats(&self) -> JobStats {
        JobStats::new(
            self.queued.load(Ordering::SeqCst),
            self.active.load(Ordering::SeqCst),
            self.completed.load(Ordering::SeqCst),
            self.timed_out.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
        )
    }
}

/// Monitoring store held in process memory.
#[derive(Debug)]
pub struct InMemoryMonitoringStore {
    records: DashMap<String, Arc<Record>>,
    history_limit: usize,
}

impl InMemoryMonitoringStore {
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            records: DashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    fn record(&self, name: &str) -> Arc<Record> {
        if let Some(record) = self.records.get(name) {
            return Arc::clone(record.value());
        }
        Arc::clone(self.records.entry(name.to_string()).or_default().value())
    }
}

impl Default for InMemoryMonitoringStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitoringStore for InMemoryMonitoringStore {
    async fn record_queued(&self, name: &str) -> Result<()> {
        self.record(name).queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn record_claimed(&self, name: &str, attempts_made: u32) -> Result<()> {
        let record = self.record(name);
        if attempts_made == 0 {
            record.queued.fetch_sub(1, Ordering::SeqCst);
        }
        record.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn record_finished(&self, name: &str, outcome: JobOutcome, duration_ms: u64) -> Result<()> {
        let record = self.record(name);
        record.active.fetch_sub(1, Ordering::SeqCst);
        record.outcome_counter(outcome).fetch_add(1, Ordering::SeqCst);

        let mut history = record.history.lock();
        history.push_front(HistoryEntry::now(outcome, duration_ms));
        history.truncate(self.history_limit);
        Ok(())
    }

    async fn record_removed(&self, name: &str) -> Result<()> {
        self.record(name).queued.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn record_requeued(&self, name: &str, attempts_made: u32) -> Result<()> {
        let record = self.record(name);
        record.active.fetch_sub(1, Ordering::SeqCst);
        if attempts_made == 0 {
            record.queued.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<JobSnapshot>> {
        let mut snapshots: Vec<JobSnapshot> = self
            .records
            .iter()
            .map(|entry| JobSnapshot {
                name: entry.key().clone(),
                stats: entry.value().stats(),
                history: entry.value().history.lock().iter().copied().collect(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    async fn clear(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_snapshot() {
        let store = InMemoryMonitoringStore::new();
        assert!(tokio_test::block_on(store.snapshot()).unwrap().is_empty());
        tokio_test::block_on(store.clear()).unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_counters() {
        let store = InMemoryMonitoringStore::new();
        store.record_queued("a").await.unwrap();
        store.record_claimed("a", 0).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot[0].stats, JobStats::new(0, 1, 0, 0, 0));

        store.record_finished("a", JobOutcome::Completed, 42).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot[0].stats, JobStats::new(0, 0, 1, 0, 0));
        assert_eq!(snapshot[0].history[0].duration_ms, 42);
        assert_eq!(snapshot[0].history[0].status, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_retry_claim_keeps_queued() {
        let store = InMemoryMonitoringStore::new();
        store.record_queued("a").await.unwrap();
        store.record_claimed("a", 0).await.unwrap();
        store.record_finished("a", JobOutcome::Failed, 1).await.unwrap();
        store.record_claimed("a", 1).await.unwrap();

        let stats = store.snapshot().await.unwrap()[0].stats;
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_history_most_recent_first_and_capped() {
        let store = InMemoryMonitoringStore::with_history_limit(3);
        for duration in 1..=5 {
            store.record_queued("a").await.unwrap();
            store.record_claimed("a", 0).await.unwrap();
            store.record_finished("a", JobOutcome::Completed, duration).await.unwrap();
        }

        let history = &store.snapshot().await.unwrap()[0].history;
        let durations: Vec<u64> = history.iter().map(|entry| entry.duration_ms).collect();
        assert_eq!(durations, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_snapshot_sorted_and_clear() {
        let store = InMemoryMonitoringStore::new();
        store.record_queued("zeta").await.unwrap();
        store.record_queued("alpha").await.unwrap();
        store.record_removed("zeta").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let names: Vec<&str> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(snapshot[1].stats.total, 0);

        store.clear().await.unwrap();
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryMonitoringStore::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store.record_queued("shared").await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.snapshot().await.unwrap()[0].stats.queued, 2000);
    }

    #[tokio::test]
    async fn test_stall_requeue_moves_active_back() {
        let store = InMemoryMonitoringStore::new();
        store.record_queued("a").await.unwrap();
        store.record_claimed("a", 0).await.unwrap();
        store.record_requeued("a", 0).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap()[0].stats, JobStats::new(1, 0, 0, 0, 0));

        store.record_claimed("a", 0).await.unwrap();
        store.record_finished("a", JobOutcome::Completed, 5).await.unwrap();
        assert_eq!(store.snapshot().await.unwrap()[0].stats, JobStats::new(0, 0, 1, 0, 0));
    }

    #[tokio::test]
    async fn test_stalled_retry_does_not_leak_queued() {
        let store = InMemoryMonitoringStore::new();
        store.record_queued("a").await.unwrap();
        store.record_claimed("a", 0).await.unwrap();
        store.record_finished("a", JobOutcome::Failed, 1).await.unwrap();

        // The retry is claimed, its worker dies, and another worker finishes it.
        store.record_claimed("a", 1).await.unwrap();
        store.record_requeued("a", 1).await.unwrap();
        store.record_claimed("a", 1).await.unwrap();
        store.record_finished("a", JobOutcome::Completed, 2).await.unwrap();

        assert_eq!(store.snapshot().await.unwrap()[0].stats, JobStats::new(0, 0, 1, 0, 1));
    }
}

//! Per-job-name counters and bounded execution history.
//!
//! Every counter change is a single atomic increment or decrement against
//! the backing storage, so several worker processes can share one store.
//!
//! Counter flow for one job name:
//!
//! ```text
//! add()        queued +1
//! claim        queued -1 (first attempt only), active +1
//! finish       active -1, completed|timedOut|failed +1, history entry
//! stall        active -1, queued +1
//! flush        queued -1 per removed job
//! ```

pub mod dashboard;
pub mod memory;
pub mod redis;

pub use dashboard::{render_dashboard, Dashboard};
pub use memory::InMemoryMonitoringStore;
pub use self::redis::RedisMonitoringStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::Add;

use crate::error::Result;
use crate::jobs::JobOutcome;

/// Most history entries kept per job name.
pub const HISTORY_LIMIT: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Counter values for one job name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub timed_out: i64,
    pub failed: i64,
    /// Sum of the five counters
    pub total: i64,
}

impl JobStats {
    pub fn new(queued: i64, active: i64, completed: i64, timed_out: i64, failed: i64) -> Self {
        Self {
            queued,
            active,
            completed,
            timed_out,
            failed,
            total: queued + active + completed + timed_out + failed,
        }
    }

    /// Counter value for a terminal outcome.
    pub fn outcome(&self, outcome: JobOutcome) -> i64 {
        match outcome {
            JobOutcome::Completed => self.completed,
            JobOutcome::TimedOut => self.timed_out,
            JobOutcome::Failed => self.failed,
        }
    }
}

impl Add for JobStats {
    type Output = JobStats;

    fn add(self, other: JobStats) -> JobStats {
        JobStats::new(
            self.queued + other.queued,
            self.active + other.active,
            self.completed + other.completed,
            self.timed_out + other.timed_out,
            self.failed + other.failed,
        )
    }
}

impl Sum for JobStats {
    fn sum<I: Iterator<Item = JobStats>>(iter: I) -> JobStats {
        iter.fold(JobStats::default(), Add::add)
    }
}

/// One finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub duration_ms: u64,
    pub status: JobOutcome,
    pub timestamp_ms: i64,
}

impl HistoryEntry {
    /// Entry stamped with the current time.
    pub fn now(outcome: JobOutcome, duration_ms: u64) -> Self {
        Self {
            duration_ms,
            status: outcome,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Monitoring view of one job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub name: String,
    pub stats: JobStats,
    /// Most recent first
    pub history: Vec<HistoryEntry>,
}

/// Counters summed across every job name.
pub fn totals(snapshots: &[JobSnapshot]) -> JobStats {
    snapshots.iter().map(|snapshot| snapshot.stats).sum()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage for monitoring records.
#[async_trait]
pub trait MonitoringStore: Send + Sync {
    /// A job was accepted for `name`.
    async fn record_queued(&self, name: &str) -> Result<()>;

    /// A worker claimed a job. Retries (`attempts_made > 0`) were already
    /// taken off `queued` by their first claim.
    async fn record_claimed(&self, name: &str, attempts_made: u32) -> Result<()>;

    /// An attempt ended.
    async fn record_finished(&self, name: &str, outcome: JobOutcome, duration_ms: u64) -> Result<()>;

    /// A waiting job was removed without running.
    async fn record_removed(&self, name: &str) -> Result<()>;

    /// A claimed job went back to the queue after its worker stalled.
    /// Mirrors `record_claimed`: `queued` only moves for first attempts.
    async fn record_requeued(&self, name: &str, attempts_made: u32) -> Result<()>;

    /// Every known job name, sorted, with its counters and history.
    async fn snapshot(&self) -> Result<Vec<JobSnapshot>>;

    /// Forget every record.
    async fn clear(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_total_and_sum() {
        let a = JobStats::new(1, 2, 3, 0, 1);
        let b = JobStats::new(0, 0, 1, 1, 0);
        assert_eq!(a.total, 7);

        let sum: JobStats = vec![a, b].into_iter().sum();
        assert_eq!(sum, JobStats::new(1, 2, 4, 1, 1));
        assert_eq!(sum.total, 9);
        assert_eq!(sum.outcome(JobOutcome::TimedOut), 1);
    }

    #[test]
    fn test_wire_format() {
        let entry = HistoryEntry {
            duration_ms: 12,
            status: JobOutcome::TimedOut,
            timestamp_ms: 1,
        };
        let json = serde_json::to_value(entry).unwrap();
        assert_eq!(json, serde_json::json!({"durationMs": 12, "status": "timedOut", "timestampMs": 1}));

        let stats = serde_json::to_value(JobStats::new(1, 0, 0, 2, 0)).unwrap();
        assert_eq!(stats["timedOut"], 2);
        assert_eq!(stats["total"], 3);
    }
}

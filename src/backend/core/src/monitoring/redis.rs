//! Redis-backed monitoring store shared by every worker process.
//!
//! Key layout (with the configured prefix, e.g. `drover:`):
//!
//! - `{prefix}monit:joblist` - set of known job names
//! - `{prefix}monit:job:{name}` - hash of counters
//! - `{prefix}monit:job:history:{name}` - list of JSON history entries, newest first

use async_trait::async_trait;
use std::collections::HashMap;

use super::{HistoryEntry, JobSnapshot, JobStats, MonitoringStore, HISTORY_LIMIT};
use crate::error::{DroverError, ErrorCode, Result};
use crate::jobs::JobOutcome;

const QUEUED: &str = "queued";
const ACTIVE: &str = "active";

/// Monitoring store kept in Redis.
pub struct RedisMonitoringStore {
    client: redis::Client,
    prefix: String,
    history_limit: usize,
}

impl RedisMonitoringStore {
    /// # Arguments
    /// * `client` - Redis client
    /// * `prefix` - key prefix shared with the queue (e.g. `"drover:"`)
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            history_limit: HISTORY_LIMIT,
        }
    }

    /// Connect by URL without a queue, for read-only consumers such as the
    /// dashboard.
    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            DroverError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid Redis connection URL",
                e.to_string(),
            )
        })?;
        Ok(Self::new(client, prefix))
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    fn job_list_key(&self) -> String {
        format!("{}monit:joblist", self.prefix)
    }

    fn job_key(&self, name: &str) -> String {
        format!("{}monit:job:{}", self.prefix, name)
    }

    fn history_key(&self, name: &str) -> String {
        format!("{}monit:job:history:{}", self.prefix, name)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            DroverError::with_internal(
                ErrorCode::QueueConnectionFailed,
                "Failed to get Redis connection for monitoring",
                e.to_string(),
            )
        })
    }

    /// Apply counter deltas for `name` in one atomic pipeline.
    async fn increment(&self, name: &str, deltas: &[(&str, i64)]) -> Result<()> {
        let key = self.job_key(name);
        let mut pipe = redis::pipe();
        pipe.atomic().sadd(self.job_list_key(), name).ignore();
        for (field, delta) in deltas {
            pipe.hincr(&key, *field, *delta).ignore();
        }

        let mut conn = self.get_conn().await?;
        pipe.query_async::<_, ()>(&mut conn).await.map_err(monitoring_error)
    }
}

fn monitoring_error(error: redis::RedisError) -> DroverError {
    DroverError::with_internal(
        ErrorCode::MonitoringError,
        "Failed to update monitoring data",
        error.to_string(),
    )
}

fn stats_from_hash(fields: &HashMap<String, i64>) -> JobStats {
    let field = |name: &str| fields.get(name).copied().unwrap_or(0);
    JobStats::new(
        field(QUEUED),
        field(ACTIVE),
        field(JobOutcome::Completed.as_str()),
        field(JobOutcome::TimedOut.as_str()),
        field(JobOutcome::Failed.as_str()),
    )
}

#[async_trait]
impl MonitoringStore for RedisMonitoringStore {
    async fn record_queued(&self, name: &str) -> Result<()> {
        self.increment(name, &[(QUEUED, 1)]).await
    }

    async fn record_claimed(&self, name: &str, attempts_made: u32) -> Result<()> {
        if attempts_made == 0 {
            self.increment(name, &[(QUEUED, -1), (ACTIVE, 1)]).await
        } else {
            self.increment(name, &[(ACTIVE, 1)]).await
        }
    }

    async fn record_finished(&self, name: &str, outcome: JobOutcome, duration_ms: u64) -> Result<()> {
        let entry = serde_json::to_string(&HistoryEntry::now(outcome, duration_ms))?;
        let key = self.job_key(name);
        let history_key = self.history_key(name);

        let mut conn = self.get_conn().await?;
        redis::pipe()
            .atomic()
            .sadd(self.job_list_key(), name)
            .ignore()
            .hincr(&key, ACTIVE, -1)
            .ignore()
            .hincr(&key, outcome.as_str(), 1)
            .ignore()
            .lpush(&history_key, entry)
            .ignore()
            .ltrim(&history_key, 0, self.history_limit as isize - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(monitoring_error)
    }

    async fn record_removed(&self, name: &str) -> Result<()> {
        self.increment(name, &[(QUEUED, -1)]).await
    }

    async fn record_requeued(&self, name: &str, attempts_made: u32) -> Result<()> {
        if attempts_made == 0 {
            self.increment(name, &[(ACTIVE, -1), (QUEUED, 1)]).await
        } else {
            self.increment(name, &[(ACTIVE, -1)]).await
        }
    }

    async fn snapshot(&self) -> Result<Vec<JobSnapshot>> {
        let mut conn = self.get_conn().await?;
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.job_list_key())
            .query_async(&mut conn)
            .await
            .map_err(monitoring_error)?;
        names.sort();

        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            let (fields, raw_history): (HashMap<String, i64>, Vec<String>) = redis::pipe()
                .hgetall(self.job_key(&name))
                .lrange(self.history_key(&name), 0, -1)
                .query_async(&mut conn)
                .await
                .map_err(monitoring_error)?;

            let history = raw_history
                .iter()
                .filter_map(|raw| match serde_json::from_str::<HistoryEntry>(raw) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(job = %name, error = %e, "Skipping malformed history entry");
                        None
                    }
                })
                .collect();

            snapshots.push(JobSnapshot {
                stats: stats_from_hash(&fields),
                history,
                name,
            });
        }
        Ok(snapshots)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.job_list_key())
            .query_async(&mut conn)
            .await
            .map_err(monitoring_error)?;

        let mut keys: Vec<String> = names
            .iter()
            .flat_map(|name| [self.job_key(name), self.history_key(name)])
            .collect();
        keys.push(self.job_list_key());

        redis::cmd("DEL")
            .arg(&keys)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(monitoring_error)?;
        tracing::info!(jobs = names.len(), "Monitoring data cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RedisMonitoringStore {
        RedisMonitoringStore::open("redis://127.0.0.1:6379", "drover:").unwrap()
    }

    #[test]
    fn test_open_rejects_bad_url() {
        let error = RedisMonitoringStore::open("nope", "drover:").err().unwrap();
        assert_eq!(error.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_key_layout() {
        let store = store();
        assert_eq!(store.job_list_key(), "drover:monit:joblist");
        assert_eq!(store.job_key("email"), "drover:monit:job:email");
        assert_eq!(store.history_key("email"), "drover:monit:job:history:email");
    }

    #[test]
    fn test_stats_from_hash_defaults_missing_fields() {
        let mut fields = HashMap::new();
        fields.insert("queued".to_string(), 2);
        fields.insert("timedOut".to_string(), 1);

        let stats = stats_from_hash(&fields);
        assert_eq!(stats, JobStats::new(2, 0, 0, 1, 0));
    }
}

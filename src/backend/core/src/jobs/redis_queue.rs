//! Redis-backed queue store for production use.
//!
//! Key layout for queue `q` under prefix `p`:
//!
//! - `{p}{q}:jobs` - hash of job id to JSON record
//! - `{p}{q}:wait` - sorted set, score = priority rank * 10^13 + enqueue sequence
//! - `{p}{q}:delayed` - sorted set of retries, score = ready time (ms)
//! - `{p}{q}:active` - sorted set of claims, score = lock expiry (ms)
//! - `{p}{q}:owners` - hash of job id to claiming worker
//! - `{p}{q}:stalls` - hash of job id to stall count
//! - `{p}{q}:seq` - enqueue sequence counter
//! - `{p}{q}:paused` - present while the queue is paused
//!
//! Every state transition runs as a Lua script so concurrent workers never
//! observe a half-moved job.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

use super::job::{Job, JobError, JobErrorKind, JobId, JobState};
use super::queue::{FailDisposition, QueueBackend, QueueConfig, QueueEvent};
use crate::error::{DroverError, ErrorCode, Result};

/// Claims poll this often while waiting for work.
const CLAIM_POLL: Duration = Duration::from_millis(100);

const SUBMIT_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) * 10000000000000 + seq, ARGV[1])
return seq
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[5]) == 1 then
    return false
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local raw = redis.call('HGET', KEYS[4], id)
    if raw then
        local seq = redis.call('INCR', KEYS[7])
        redis.call('ZADD', KEYS[1], cjson.decode(raw).priority * 10000000000000 + seq, id)
    end
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
    return false
end
local id = head[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
redis.call('HSET', KEYS[6], id, ARGV[3])
return {id, redis.call('HGET', KEYS[4], id)}
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZADD', KEYS[1], tonumber(ARGV[3]), ARGV[1])
return 1
"#;

/// Modes: `remove`, `keep`, `wait` (re-queue now), `delay` (re-queue at ARGV[5]).
const SETTLE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
if ARGV[2] == 'remove' then
    redis.call('HDEL', KEYS[3], ARGV[1])
    redis.call('HDEL', KEYS[7], ARGV[1])
    return 1
end
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
if ARGV[2] == 'wait' then
    local seq = redis.call('INCR', KEYS[6])
    redis.call('ZADD', KEYS[4], tonumber(ARGV[4]) * 10000000000000 + seq, ARGV[1])
elseif ARGV[2] == 'delay' then
    redis.call('ZADD', KEYS[5], tonumber(ARGV[5]), ARGV[1])
end
return 1
"#;

/// Returns `{id, stall_count, requeued}` triples.
const STALLED_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local out = {}
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    local raw = redis.call('HGET', KEYS[3], id)
    if raw then
        local count = redis.call('HINCRBY', KEYS[6], id, 1)
        local requeued = 0
        if count <= tonumber(ARGV[2]) then
            local seq = redis.call('INCR', KEYS[5])
            redis.call('ZADD', KEYS[4], cjson.decode(raw).priority * 10000000000000 + seq, id)
            requeued = 1
        end
        table.insert(out, {id, count, requeued})
    end
end
return out
"#;

const FLUSH_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, id in ipairs(redis.call('ZRANGE', KEYS[2], 0, -1)) do
    table.insert(ids, id)
end
local out = {}
for _, id in ipairs(ids) do
    local raw = redis.call('HGET', KEYS[3], id)
    if raw then
        table.insert(out, raw)
        redis.call('HDEL', KEYS[3], id)
        redis.call('HDEL', KEYS[4], id)
    end
end
redis.call('DEL', KEYS[1], KEYS[2])
return out
"#;

struct Keys {
    jobs: String,
    wait: String,
    delayed: String,
    active: String,
    owners: String,
    stalls: String,
    seq: String,
    paused: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        let key = |suffix: &str| format!("{}{}:{}", prefix, queue, suffix);
        Self {
            jobs: key("jobs"),
            wait: key("wait"),
            delayed: key("delayed"),
            active: key("active"),
            owners: key("owners"),
            stalls: key("stalls"),
            seq: key("seq"),
            paused: key("paused"),
        }
    }
}

/// Redis-backed queue store shared by every worker of a named queue.
pub struct RedisQueueBackend {
    client: redis::Client,
    keys: Keys,
    config: QueueConfig,
    events: broadcast::Sender<QueueEvent>,
    submit_script: redis::Script,
    claim_script: redis::Script,
    extend_script: redis::Script,
    settle_script: redis::Script,
    stalled_script: redis::Script,
    flush_script: redis::Script,
}

impl RedisQueueBackend {
    /// Create a new Redis queue backend.
    ///
    /// # Arguments
    /// * `client` - Redis client
    /// * `prefix` - key prefix (e.g. `"drover:"`)
    /// * `queue` - queue (engine instance) name
    /// * `config` - lock and stall settings
    pub fn new(client: redis::Client, prefix: &str, queue: &str, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            client,
            keys: Keys::new(prefix, queue),
            config,
            events,
            submit_script: redis::Script::new(SUBMIT_SCRIPT),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
            settle_script: redis::Script::new(SETTLE_SCRIPT),
            stalled_script: redis::Script::new(STALLED_SCRIPT),
            flush_script: redis::Script::new(FLUSH_SCRIPT),
        }
    }

    /// Obtain an async multiplexed connection from the Redis client.
    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let _ = self.events.send(QueueEvent::Error {
                    message: e.to_string(),
                });
                Err(DroverError::with_internal(
                    ErrorCode::QueueConnectionFailed,
                    "Failed to get Redis connection for job queue",
                    e.to_string(),
                ))
            }
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn jobs_by_id(&self, ids: &[String], state: JobState) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_conn().await?;
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.jobs)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;

        Ok(raw
            .into_iter()
            .flatten()
            .filter_map(|raw| decode_job(&raw))
            .map(|mut job| {
                job.state = state;
                job
            })
            .collect())
    }

    async fn settle(&self, job: &Job, mode: &str, record: &Job, ready_at_ms: i64) -> Result<bool> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.get_conn().await?;
        let settled: i64 = self
            .settle_script
            .key(&self.keys.active)
            .key(&self.keys.owners)
            .key(&self.keys.jobs)
            .key(&self.keys.wait)
            .key(&self.keys.delayed)
            .key(&self.keys.seq)
            .key(&self.keys.stalls)
            .arg(job.id.to_string())
            .arg(mode)
            .arg(json)
            .arg(record.priority)
            .arg(ready_at_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;
        if settled == 0 {
            tracing::debug!(job_id = %job.id, "Settled job no longer held a claim");
        }
        Ok(settled == 1)
    }
}

fn queue_error(error: redis::RedisError) -> DroverError {
    DroverError::queue(error.to_string())
}

fn decode_job(raw: &str) -> Option<Job> {
    match serde_json::from_str(raw) {
        Ok(job) => Some(job),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed job record");
            None
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn submit(&self, job: Job) -> Result<Job> {
        let json = serde_json::to_string(&job)?;
        let mut conn = self.get_conn().await?;
        let _seq: i64 = self
            .submit_script
            .key(&self.keys.jobs)
            .key(&self.keys.wait)
            .key(&self.keys.seq)
            .arg(job.id.to_string())
            .arg(json)
            .arg(job.priority)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;

        tracing::debug!(queue = %self.keys.wait, job_id = %job.id, "Job submitted");
        Ok(job)
    }

    async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.get_conn().await?;
        loop {
            let claimed: Option<(String, Option<String>)> = self
                .claim_script
                .key(&self.keys.wait)
                .key(&self.keys.delayed)
                .key(&self.keys.active)
                .key(&self.keys.jobs)
                .key(&self.keys.paused)
                .key(&self.keys.owners)
                .key(&self.keys.seq)
                .arg(Self::now_ms())
                .arg(self.config.lock_duration_ms)
                .arg(worker_id)
                .invoke_async(&mut conn)
                .await
                .map_err(queue_error)?;

            match claimed {
                Some((_, Some(raw))) => {
                    let Some(mut job) = decode_job(&raw) else {
                        continue;
                    };
                    job.mark_active();
                    let json = serde_json::to_string(&job)?;
                    redis::cmd("HSET")
                        .arg(&self.keys.jobs)
                        .arg(job.id.to_string())
                        .arg(json)
                        .query_async::<_, i64>(&mut conn)
                        .await
                        .map_err(queue_error)?;
                    return Ok(Some(job));
                }
                Some((id, None)) => {
                    // Record vanished between enqueue and claim.
                    redis::cmd("ZREM")
                        .arg(&self.keys.active)
                        .arg(&id)
                        .query_async::<_, i64>(&mut conn)
                        .await
                        .map_err(queue_error)?;
                    continue;
                }
                None => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL.min(deadline - now)).await;
        }
    }

    async fn extend_lock(&self, job_id: JobId, worker_id: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let extended: i64 = self
            .extend_script
            .key(&self.keys.active)
            .key(&self.keys.owners)
            .arg(job_id.to_string())
            .arg(worker_id)
            .arg(Self::now_ms() + self.config.lock_duration_ms as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(extended == 1)
    }

    async fn complete(&self, job: &Job, result: &Value) -> Result<()> {
        let mut record = job.clone();
        record.mark_finished(JobState::Completed);
        record.result = Some(result.clone());
        let mode = if job.options.remove_on_complete { "remove" } else { "keep" };
        self.settle(job, mode, &record, 0).await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &JobError) -> Result<FailDisposition> {
        let mut record = job.clone();
        record.last_error = Some(error.message.clone());

        if error.retryable && job.can_retry() {
            record.attempts_made += 1;
            record.state = JobState::Queued;
            record.started_at = None;
            let delay = record
                .options
                .backoff
                .map(|backoff| backoff.delay_for_attempt(record.attempts_made))
                .unwrap_or(Duration::ZERO);
            let (mode, ready_at) = if delay.is_zero() {
                ("wait", 0)
            } else {
                ("delay", Self::now_ms() + delay.as_millis() as i64)
            };
            if self.settle(job, mode, &record, ready_at).await? {
                return Ok(FailDisposition::Retrying { delay });
            }
            return Ok(FailDisposition::Discarded);
        }

        record.mark_finished(match error.kind {
            JobErrorKind::TimedOut => JobState::TimedOut,
            _ => JobState::Failed,
        });
        let mode = if job.options.remove_on_fail { "remove" } else { "keep" };
        self.settle(job, mode, &record, 0).await?;
        Ok(FailDisposition::Discarded)
    }

    async fn active(&self) -> Result<Vec<Job>> {
        let mut conn = self.get_conn().await?;
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.keys.active)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        self.jobs_by_id(&ids, JobState::Active).await
    }

    async fn waiting(&self) -> Result<Vec<Job>> {
        let mut conn = self.get_conn().await?;
        let (mut ids, delayed): (Vec<String>, Vec<String>) = redis::pipe()
            .cmd("ZRANGE")
            .arg(&self.keys.wait)
            .arg(0)
            .arg(-1)
            .cmd("ZRANGE")
            .arg(&self.keys.delayed)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        ids.extend(delayed);
        self.jobs_by_id(&ids, JobState::Queued).await
    }

    async fn pause(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("SET")
            .arg(&self.keys.paused)
            .arg(1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_error)
    }

    async fn resume(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("DEL")
            .arg(&self.keys.paused)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(&self.keys.paused)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(exists == 1)
    }

    async fn flush(&self) -> Result<Vec<Job>> {
        let mut conn = self.get_conn().await?;
        let raw: Vec<String> = self
            .flush_script
            .key(&self.keys.wait)
            .key(&self.keys.delayed)
            .key(&self.keys.jobs)
            .key(&self.keys.stalls)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(raw.iter().filter_map(|raw| decode_job(raw)).collect())
    }

    async fn check_stalled(&self) -> Result<Vec<Job>> {
        let mut conn = self.get_conn().await?;
        let expired: Vec<(String, u32, i64)> = self
            .stalled_script
            .key(&self.keys.active)
            .key(&self.keys.owners)
            .key(&self.keys.jobs)
            .key(&self.keys.wait)
            .key(&self.keys.seq)
            .key(&self.keys.stalls)
            .arg(Self::now_ms())
            .arg(self.config.max_stalled_count)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;

        let mut stalled = Vec::with_capacity(expired.len());
        for (id, count, requeued) in expired {
            let raw: Option<String> = redis::cmd("HGET")
                .arg(&self.keys.jobs)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(queue_error)?;
            let Some(mut job) = raw.as_deref().and_then(decode_job) else {
                continue;
            };
            job.stalled_count = count;

            if requeued == 1 {
                job.state = JobState::Queued;
            } else {
                job.last_error = Some("job stalled more than allowable limit".to_string());
                job.mark_finished(JobState::Failed);
                let mut pipe = redis::pipe();
                pipe.atomic();
                if job.options.remove_on_fail {
                    pipe.hdel(&self.keys.jobs, &id).ignore();
                } else {
                    pipe.hset(&self.keys.jobs, &id, serde_json::to_string(&job)?).ignore();
                }
                pipe.hdel(&self.keys.stalls, &id)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(queue_error)?;
            }
            tracing::warn!(job_id = %id, stalled_count = count, "Recovered stalled job");
            let _ = self.events.send(QueueEvent::Stalled(job.clone()));
            stalled.push(job);
        }
        Ok(stalled)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn lock_duration(&self) -> Duration {
        self.config.lock_duration()
    }
}

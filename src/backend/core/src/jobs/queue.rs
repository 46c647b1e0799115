//! Backing queue store: the interface the engine drives and an in-process
//! implementation.
//!
//! The store owns the durable job record. It orders waiting jobs by
//! priority rank (lower first) and then by enqueue order, applies the
//! retry/backoff policy on failure, and recovers jobs whose worker stopped
//! renewing the lock ("stalled").

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::job::{Job, JobError, JobErrorKind, JobId, JobState};
use crate::error::Result;

/// Capacity of the queue event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration & Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration shared by backing store implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claim stays valid without renewal
    pub lock_duration_ms: u64,
    /// Stalls tolerated before a job is failed instead of re-queued
    pub max_stalled_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_duration_ms: 30_000,
            max_stalled_count: 1,
        }
    }
}

impl QueueConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms.max(1))
    }
}

/// Notification published by the backing store.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job's lock lapsed. `state` is `Queued` when it was put back,
    /// `Failed` when it exceeded the stall limit.
    Stalled(Job),
    /// The store hit an error outside a direct call.
    Error { message: String },
}

/// What the store did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Re-queued; claimable again after `delay`
    Retrying { delay: Duration },
    /// Attempts exhausted or the error was fatal
    Discarded,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for backing queue implementations.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a new job as waiting.
    async fn submit(&self, job: Job) -> Result<Job>;

    /// Claim the next waiting job, waiting up to `wait` for one to appear.
    /// Returns `None` while paused or when nothing became ready in time.
    async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Job>>;

    /// Renew the claim. `false` when the claim was lost.
    async fn extend_lock(&self, job_id: JobId, worker_id: &str) -> Result<bool>;

    /// Acknowledge a successful attempt.
    async fn complete(&self, job: &Job, result: &Value) -> Result<()>;

    /// Acknowledge a failed attempt and apply the retry policy.
    async fn fail(&self, job: &Job, error: &JobError) -> Result<FailDisposition>;

    /// Jobs currently claimed.
    async fn active(&self) -> Result<Vec<Job>>;

    /// Jobs waiting to be claimed, in claim order, delayed retries last.
    async fn waiting(&self) -> Result<Vec<Job>>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    /// Remove every waiting and delayed job, returning what was removed.
    async fn flush(&self) -> Result<Vec<Job>>;

    /// Recover claims whose lock expired.
    async fn check_stalled(&self) -> Result<Vec<Job>>;

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    fn lock_duration(&self) -> Duration;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitingEntry {
    priority: u32,
    seq: u64,
    id: JobId,
}

impl Ord for WaitingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for WaitingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Claim {
    worker_id: String,
    lock_expires: Instant,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    waiting: BinaryHeap<Reverse<WaitingEntry>>,
    delayed: Vec<(Instant, WaitingEntry)>,
    active: HashMap<JobId, Claim>,
    next_seq: u64,
}

impl State {
    fn push_waiting(&mut self, job: &Job) {
        let entry = WaitingEntry {
            priority: job.priority,
            seq: self.next_seq,
            id: job.id,
        };
        self.next_seq += 1;
        self.waiting.push(Reverse(entry));
    }

    fn push_delayed(&mut self, job: &Job, ready_at: Instant) {
        let entry = WaitingEntry {
            priority: job.priority,
            seq: self.next_seq,
            id: job.id,
        };
        self.next_seq += 1;
        self.delayed.push((ready_at, entry));
    }

    fn promote_delayed(&mut self, now: Instant) {
        let (ready, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.delayed).into_iter().partition(|(at, _)| *at <= now);
        self.delayed = pending;
        for (_, entry) in ready {
            self.waiting.push(Reverse(entry));
        }
    }

    fn next_delayed_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn try_claim(&mut self, worker_id: &str, lock: Duration) -> Option<Job> {
        let now = Instant::now();
        self.promote_delayed(now);
        while let Some(Reverse(entry)) = self.waiting.pop() {
            let Some(job) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if job.state != JobState::Queued {
                continue;
            }
            job.mark_active();
            self.active.insert(
                entry.id,
                Claim {
                    worker_id: worker_id.to_string(),
                    lock_expires: now + lock,
                },
            );
            return Some(job.clone());
        }
        None
    }

    fn finish(&mut self, job_id: JobId, state: JobState, remove: bool) {
        if remove {
            self.jobs.remove(&job_id);
        } else if let Some(job) = self.jobs.get_mut(&job_id) {
            job.mark_finished(state);
        }
    }
}

/// In-memory backing store for a single process (tests and development).
pub struct InMemoryQueueBackend {
    config: QueueConfig,
    state: Mutex<State>,
    paused: AtomicBool,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl InMemoryQueueBackend {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            state: Mutex::new(State::default()),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            events,
        }
    }

    fn publish(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn submit(&self, job: Job) -> Result<Job> {
        {
            let mut state = self.state.lock();
            state.push_waiting(&job);
            state.jobs.insert(job.id, job.clone());
        }
        self.notify.notify_waiters();
        tracing::debug!(job_id = %job.id, priority = job.priority, "Job submitted");
        Ok(job)
    }

    async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_delayed = {
                let mut state = self.state.lock();
                if !self.paused.load(AtomicOrdering::SeqCst) {
                    if let Some(job) = state.try_claim(worker_id, self.config.lock_duration()) {
                        return Ok(Some(job));
                    }
                }
                state.next_delayed_at()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_delayed.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn extend_lock(&self, job_id: JobId, worker_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.active.get_mut(&job_id) {
            Some(claim) if claim.worker_id == worker_id => {
                claim.lock_expires = Instant::now() + self.config.lock_duration();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job: &Job, result: &Value) -> Result<()> {
        let mut state = self.state.lock();
        if state.active.remove(&job.id).is_none() {
            tracing::debug!(job_id = %job.id, "Completed job no longer held a claim");
            return Ok(());
        }
        if job.options.remove_on_complete {
            state.jobs.remove(&job.id);
        } else if let Some(stored) = state.jobs.get_mut(&job.id) {
            stored.mark_finished(JobState::Completed);
            stored.result = Some(result.clone());
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &JobError) -> Result<FailDisposition> {
        let disposition = {
            let mut state = self.state.lock();
            if state.active.remove(&job.id).is_none() {
                tracing::debug!(job_id = %job.id, "Failed job no longer held a claim");
                return Ok(FailDisposition::Discarded);
            }
            let Some(stored) = state.jobs.get_mut(&job.id) else {
                return Ok(FailDisposition::Discarded);
            };
            stored.last_error = Some(error.message.clone());

            if error.retryable && stored.can_retry() {
                stored.attempts_made += 1;
                stored.state = JobState::Queued;
                let delay = stored
                    .options
                    .backoff
                    .map(|backoff| backoff.delay_for_attempt(stored.attempts_made))
                    .unwrap_or(Duration::ZERO);
                let stored = stored.clone();
                if delay.is_zero() {
                    state.push_waiting(&stored);
                } else {
                    state.push_delayed(&stored, Instant::now() + delay);
                }
                FailDisposition::Retrying { delay }
            } else {
                let terminal = match error.kind {
                    JobErrorKind::TimedOut => JobState::TimedOut,
                    _ => JobState::Failed,
                };
                state.finish(job.id, terminal, job.options.remove_on_fail);
                FailDisposition::Discarded
            }
        };
        if matches!(disposition, FailDisposition::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(disposition)
    }

    async fn active(&self) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .active
            .keys()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        Ok(jobs)
    }

    async fn waiting(&self) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut entries: Vec<WaitingEntry> = state.waiting.iter().map(|Reverse(entry)| *entry).collect();
        entries.sort();
        let mut delayed: Vec<(Instant, WaitingEntry)> = state.delayed.clone();
        delayed.sort_by_key(|(at, entry)| (*at, *entry));

        Ok(entries
            .into_iter()
            .chain(delayed.into_iter().map(|(_, entry)| entry))
            .filter_map(|entry| state.jobs.get(&entry.id))
            .filter(|job| job.state == JobState::Queued)
            .cloned()
            .collect())
    }

    async fn pause(&self) -> Result<()> {
        self.paused.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.paused.load(AtomicOrdering::SeqCst))
    }

    async fn flush(&self) -> Result<Vec<Job>> {
        let mut state = self.state.lock();
        let mut ids: Vec<JobId> = state.waiting.drain().map(|Reverse(entry)| entry.id).collect();
        ids.extend(state.delayed.drain(..).map(|(_, entry)| entry.id));

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if state.active.contains_key(&id) {
                continue;
            }
            if let Some(job) = state.jobs.remove(&id) {
                removed.push(job);
            }
        }
        Ok(removed)
    }

    async fn check_stalled(&self) -> Result<Vec<Job>> {
        let now = Instant::now();
        let stalled = {
            let mut state = self.state.lock();
            let expired: Vec<JobId> = state
                .active
                .iter()
                .filter(|(_, claim)| claim.lock_expires <= now)
                .map(|(id, _)| *id)
                .collect();

            let mut stalled = Vec::with_capacity(expired.len());
            for id in expired {
                state.active.remove(&id);
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                job.stalled_count += 1;
                if job.stalled_count > self.config.max_stalled_count {
                    job.last_error = Some("job stalled more than allowable limit".to_string());
                    let remove = job.options.remove_on_fail;
                    job.mark_finished(JobState::Failed);
                    let snapshot = job.clone();
                    if remove {
                        state.jobs.remove(&id);
                    }
                    stalled.push(snapshot);
                } else {
                    job.state = JobState::Queued;
                    let snapshot = job.clone();
                    state.push_waiting(&snapshot);
                    stalled.push(snapshot);
                }
            }
            stalled
        };

        if !stalled.is_empty() {
            self.notify.notify_waiters();
        }
        for job in &stalled {
            self.publish(QueueEvent::Stalled(job.clone()));
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

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{compose_payload, Backoff, Priority, SubmitOptions};
    use serde_json::json;

    fn job(name: &str, priority: Priority) -> Job {
        Job::new(
            compose_payload(name, None),
            SubmitOptions {
                priority: priority.rank(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = InMemoryQueueBackend::default();
        queue.submit(job("low", Priority::Low)).await.unwrap();
        queue.submit(job("medium-1", Priority::Medium)).await.unwrap();
        queue.submit(job("high", Priority::High)).await.unwrap();
        queue.submit(job("medium-2", Priority::Medium)).await.unwrap();

        let waiting: Vec<_> = queue
            .waiting()
            .await
            .unwrap()
            .iter()
            .map(|j| j.name().unwrap().to_string())
            .collect();
        assert_eq!(waiting, vec!["high", "medium-1", "medium-2", "low"]);

        let claimed = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(claimed.name(), Some("high"));
        assert_eq!(claimed.state, JobState::Active);
        assert!(claimed.started_at.is_some());
        assert_eq!(queue.active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_times_out_when_empty() {
        let queue = InMemoryQueueBackend::default();
        let claimed = queue.claim("w1", Duration::from_millis(20)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_claim_wakes_on_submit() {
        let queue = std::sync::Arc::new(InMemoryQueueBackend::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim("w1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.submit(job("a", Priority::Medium)).await.unwrap();

        let claimed = waiter.await.unwrap().unwrap();
        assert_eq!(claimed.unwrap().name(), Some("a"));
    }

    #[tokio::test]
    async fn test_paused_queue_holds_jobs() {
        let queue = InMemoryQueueBackend::default();
        queue.pause().await.unwrap();
        queue.submit(job("a", Priority::Medium)).await.unwrap();

        assert!(queue.is_paused().await.unwrap());
        assert!(queue.claim("w1", Duration::from_millis(10)).await.unwrap().is_none());

        queue.resume().await.unwrap();
        assert!(queue.claim("w1", Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_removes_job() {
        let queue = InMemoryQueueBackend::default();
        let mut submitted = job("a", Priority::Medium);
        submitted.options.remove_on_complete = true;
        queue.submit(submitted).await.unwrap();

        let claimed = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        queue.complete(&claimed, &json!("ok")).await.unwrap();
        assert!(queue.active().await.unwrap().is_empty());
        assert!(queue.waiting().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_retries_with_backoff() {
        let queue = InMemoryQueueBackend::default();
        let mut submitted = job("a", Priority::Medium);
        submitted.options.attempts = 2;
        submitted.options.backoff = Some(Backoff::fixed(30));
        queue.submit(submitted).await.unwrap();

        let claimed = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        let disposition = queue.fail(&claimed, &JobError::new("boom")).await.unwrap();
        assert_eq!(disposition, FailDisposition::Retrying { delay: Duration::from_millis(30) });

        // Delayed, so not immediately claimable.
        assert!(queue.claim("w1", Duration::ZERO).await.unwrap().is_none());
        let retried = queue.claim("w1", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(retried.attempts_made, 1);
        assert_eq!(retried.last_error.as_deref(), Some("boom"));

        let disposition = queue.fail(&retried, &JobError::new("boom")).await.unwrap();
        assert_eq!(disposition, FailDisposition::Discarded);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let queue = InMemoryQueueBackend::default();
        let mut submitted = job("a", Priority::Medium);
        submitted.options.attempts = 5;
        queue.submit(submitted).await.unwrap();

        let claimed = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        let disposition = queue.fail(&claimed, &JobError::fatal("bad input")).await.unwrap();
        assert_eq!(disposition, FailDisposition::Discarded);
    }

    #[tokio::test]
    async fn test_flush_removes_waiting_jobs() {
        let queue = InMemoryQueueBackend::default();
        queue.submit(job("a", Priority::Medium)).await.unwrap();
        queue.submit(job("b", Priority::Medium)).await.unwrap();

        let removed = queue.flush().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(queue.waiting().await.unwrap().is_empty());
        assert!(queue.claim("w1", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_job_requeued_then_failed() {
        let queue = InMemoryQueueBackend::new(QueueConfig {
            lock_duration_ms: 10,
            max_stalled_count: 1,
        });
        let mut events = queue.subscribe();
        queue.submit(job("a", Priority::Medium)).await.unwrap();

        queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stalled = queue.check_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].state, JobState::Queued);
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Stalled(_)));

        queue.claim("w2", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stalled = queue.check_stalled().await.unwrap();
        assert_eq!(stalled[0].state, JobState::Failed);
        assert!(queue.waiting().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extend_lock_requires_owner() {
        let queue = InMemoryQueueBackend::default();
        queue.submit(job("a", Priority::Medium)).await.unwrap();
        let claimed = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();

        assert!(queue.extend_lock(claimed.id, "w1").await.unwrap());
        assert!(!queue.extend_lock(claimed.id, "w2").await.unwrap());
    }
}

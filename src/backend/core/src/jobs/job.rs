//! Job data model.
//!
//! This module provides the value types shared by every part of the engine:
//!
//! - **JobId / JobState**: identity and lifecycle state of a queued unit of work
//! - **Priority**: ordered rank, lower value is served first
//! - **Backoff / JobOptions**: retry policy attached to a definition
//! - **Job**: the record the backing store keeps for one unit of work
//! - **JobError / JobOutcome**: how an execution attempt ended

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Payload field that carries the job name through the shared queue.
pub const ROUTING_FIELD: &str = "handler";

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance, assigned by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Resting state of a job in the backing store.
///
/// A stalled job is not a state: the store moves it back to `Queued`
/// (or to `Failed` once it stalled too often) and reports the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed, possibly delayed by a retry backoff
    Queued,
    /// Claimed by a worker
    Active,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs. Lower rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Every priority, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Numeric rank used by the backing store for ordering.
    pub const fn rank(&self) -> u32 {
        match self {
            Self::High => 5,
            Self::Medium => 10,
            Self::Low => 20,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority `{}`", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// How the retry delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Delay applied by the backing store before a failed job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type", default)]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    /// Delay before the retry that follows `attempts_made` failed attempts
    /// (1 for the first retry).
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                self.delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy attached to a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub priority: Priority,
    /// Deadline for one execution attempt; `None` runs unbounded
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Total attempts including the first one
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

fn default_attempts() -> u32 {
    1
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            timeout_ms: None,
            attempts: default_attempts(),
            backoff: None,
        }
    }
}

impl JobOptions {
    /// The effective deadline; zero means no deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Options handed to the backing store with a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Priority rank (lower is served first)
    pub priority: u32,
    pub attempts: u32,
    pub backoff: Option<Backoff>,
    pub timeout_ms: Option<u64>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Medium.rank(),
            attempts: default_attempts(),
            backoff: None,
            timeout_ms: None,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

impl SubmitOptions {
    /// Start from the defaults and apply a definition's policy on top.
    pub fn from_job_options(options: &JobOptions) -> Self {
        Self {
            priority: options.priority.rank(),
            attempts: options.attempts.max(1),
            backoff: options.backoff,
            timeout_ms: options.timeout_ms,
            ..Self::default()
        }
    }

    /// Ask the backing store to drop terminal jobs instead of keeping them.
    pub fn removing_terminal_jobs(mut self) -> Self {
        self.remove_on_complete = true;
        self.remove_on_fail = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A queued or executing unit of work, as recorded by the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Caller data merged with the routing field
    pub data: Map<String, Value>,
    /// Priority rank copied from the definition at enqueue time
    pub priority: u32,
    /// Failed attempts so far; incremented by the backing store on retry
    pub attempts_made: u32,
    /// Times the job was recovered after its worker stopped renewing the lock
    #[serde(default)]
    pub stalled_count: u32,
    pub state: JobState,
    pub options: SubmitOptions,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl Job {
    /// Create a queued job for an already composed payload.
    pub fn new(data: Map<String, Value>, options: SubmitOptions) -> Self {
        Self {
            id: JobId::new(),
            data,
            priority: options.priority,
            attempts_made: 0,
            stalled_count: 0,
            state: JobState::Queued,
            options,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }

    /// The job name carried in the routing field, if any.
    pub fn name(&self) -> Option<&str> {
        self.data.get(ROUTING_FIELD).and_then(Value::as_str)
    }

    /// Split the payload back into the job name and the caller's data.
    pub fn split_payload(&self) -> (Option<String>, Map<String, Value>) {
        split_payload(&self.data)
    }

    /// Mark as claimed by a worker.
    pub fn mark_active(&mut self) {
        self.state = JobState::Active;
        self.started_at = Some(Utc::now());
    }

    /// Mark as finished with the given terminal state.
    pub fn mark_finished(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Whether another attempt is allowed after the current one failed.
    pub fn can_retry(&self) -> bool {
        self.attempts_made + 1 < self.options.attempts
    }
}

/// Merge caller data with the routing name.
///
/// Objects are merged key by key, `null` becomes an empty object and any
/// other value is wrapped as `{"value": ...}`. The routing field always
/// wins over a caller-supplied key of the same name.
pub fn compose_payload(name: &str, data: Option<Value>) -> Map<String, Value> {
    let mut payload = match data {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    payload.insert(ROUTING_FIELD.to_string(), Value::String(name.to_string()));
    payload
}

/// Inverse of [`compose_payload`].
pub fn split_payload(payload: &Map<String, Value>) -> (Option<String>, Map<String, Value>) {
    let mut data = payload.clone();
    let name = match data.remove(ROUTING_FIELD) {
        Some(Value::String(name)) => Some(name),
        _ => None,
    };
    (name, data)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The handler returned an error
    #[default]
    Failed,
    /// The deadline fired before the handler settled
    TimedOut,
    /// The handler panicked
    Panicked,
}

impl JobErrorKind {
    /// Label used in lifecycle events.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Failed => "error",
            Self::TimedOut => "timeout",
            Self::Panicked => "panic",
        }
    }
}

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    pub kind: JobErrorKind,
    /// Whether the backing store may retry the job
    pub retryable: bool,
    /// Additional context
    pub context: Option<Value>,
}

impl JobError {
    /// Create a retryable handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: JobErrorKind::Failed,
            retryable: true,
            context: None,
        }
    }

    /// Create an error that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    /// Deadline error reported when the timer wins the race.
    pub fn timed_out(timeout_ms: u64) -> Self {
        Self {
            kind: JobErrorKind::TimedOut,
            ..Self::new(format!("Job processing timed out after {} ms", timeout_ms))
        }
    }

    /// A handler panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Panicked,
            ..Self::new(message)
        }
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobError {}

/// Classify a settled handler error by its kind.
impl From<JobError> for crate::error::DroverError {
    fn from(error: JobError) -> Self {
        let code = match error.kind {
            JobErrorKind::Failed => ErrorCode::HandlerFailed,
            JobErrorKind::TimedOut => ErrorCode::HandlerTimedOut,
            JobErrorKind::Panicked => ErrorCode::HandlerPanicked,
        };
        Self::with_internal(code, "The job handler did not complete", error.message.clone()).with_source(error)
    }
}

impl From<crate::error::DroverError> for JobError {
    fn from(error: crate::error::DroverError) -> Self {
        let retryable = error.is_retryable();
        Self {
            retryable,
            ..Self::new(error.to_string())
        }
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{:#}", error))
    }
}

/// Result type for job handlers.
pub type JobResult = std::result::Result<Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Classified outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobOutcome {
    Completed,
    TimedOut,
    Failed,
}

impl JobOutcome {
    /// Counter/history label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timedOut",
            Self::Failed => "failed",
        }
    }

    /// Terminal state of the attempt.
    pub const fn state(&self) -> JobState {
        match self {
            Self::Completed => JobState::Completed,
            Self::TimedOut => JobState::TimedOut,
            Self::Failed => JobState::Failed,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "timedOut" | "timeout" | "timed_out" => Ok(Self::TimedOut),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outcome `{}`", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

//! Lifecycle event sink.
//!
//! Every observable step of a job (queued, started, processed, errored,
//! timed out, stalled, scheduled) is reported through an [`EventLogger`]
//! as a `kind` string plus a JSON object of fields.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// Event Kinds
// ═══════════════════════════════════════════════════════════════════════════════

pub const JOB_QUEUED: &str = "job_queued";
pub const JOB_STARTED: &str = "job_started";
pub const JOB_PROCESSED: &str = "job_processed";
pub const JOB_ERRORED: &str = "job_errored";
pub const JOB_TIMEOUT: &str = "job_timeout";
pub const JOB_STALLED: &str = "job_stalled";
pub const JOB_SCHEDULED: &str = "job_scheduled";
pub const JOB_NOT_FOUND: &str = "job_not_found";
pub const SCHEDULE_FAILED: &str = "schedule_failed";
pub const QUEUE_ERROR: &str = "queue_error";
pub const PROCESSING_STARTED: &str = "processing_started";
pub const PROCESSING_STOPPED: &str = "processing_stopped";
pub const QUEUE_PAUSED: &str = "queue_paused";
pub const QUEUE_RESUMED: &str = "queue_resumed";
pub const QUEUE_FLUSHED: &str = "queue_flushed";

// ═══════════════════════════════════════════════════════════════════════════════
// Logger Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Structured sink for lifecycle events.
pub trait EventLogger: Send + Sync + 'static {
    fn info(&self, kind: &str, fields: Value);

    fn warn(&self, kind: &str, fields: Value);

    fn error(&self, kind: &str, fields: Value);

    /// Dispatch on a runtime level.
    fn log(&self, level: LogLevel, kind: &str, fields: Value) {
        match level {
            LogLevel::Info => self.info(kind, fields),
            LogLevel::Warn => self.warn(kind, fields),
            LogLevel::Error => self.error(kind, fields),
        }
    }
}

impl<L: EventLogger + ?Sized> EventLogger for Arc<L> {
    fn info(&self, kind: &str, fields: Value) {
        (**self).info(kind, fields)
    }

    fn warn(&self, kind: &str, fields: Value) {
        (**self).warn(kind, fields)
    }

    fn error(&self, kind: &str, fields: Value) {
        (**self).error(kind, fields)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tracing Logger
// ═══════════════════════════════════════════════════════════════════════════════

/// Forwards lifecycle events to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingEventLogger {
    instance: Option<String>,
}

impl TracingEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every event with the engine instance name.
    pub fn with_instance(instance: impl Into<String>) -> Self {
        Self {
            instance: Some(instance.into()),
        }
    }

    fn instance(&self) -> &str {
        self.instance.as_deref().unwrap_or("")
    }
}

impl EventLogger for TracingEventLogger {
    fn info(&self, kind: &str, fields: Value) {
        tracing::info!(event_kind = kind, instance = self.instance(), fields = %fields, "{}", kind);
    }

    fn warn(&self, kind: &str, fields: Value) {
        tracing::warn!(event_kind = kind, instance = self.instance(), fields = %fields, "{}", kind);
    }

    fn error(&self, kind: &str, fields: Value) {
        tracing::error!(event_kind = kind, instance = self.instance(), fields = %fields, "{}", kind);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Logger
// ═══════════════════════════════════════════════════════════════════════════════

/// One recorded lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub kind: String,
    pub fields: Value,
}

/// Keeps every event in memory. Cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records of one kind.
    pub fn of_kind(&self, kind: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.records.lock().iter().filter(|record| record.kind == kind).count()
    }

    /// Number of records at the given level.
    pub fn count_level(&self, level: LogLevel) -> usize {
        self.records.lock().iter().filter(|record| record.level == level).count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn push(&self, level: LogLevel, kind: &str, fields: Value) {
        self.records.lock().push(LogRecord {
            level,
            kind: kind.to_string(),
            fields,
        });
    }
}

impl EventLogger for MemoryEventLogger {
    fn info(&self, kind: &str, fields: Value) {
        self.push(LogLevel::Info, kind, fields);
    }

    fn warn(&self, kind: &str, fields: Value) {
        self.push(LogLevel::Warn, kind, fields);
    }

    fn error(&self, kind: &str, fields: Value) {
        self.push(LogLevel::Error, kind, fields);
    }
}

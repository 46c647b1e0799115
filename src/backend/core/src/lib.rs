#![allow(clippy::result_large_err)]
//! # Drover Core
//!
//! Background job dispatch, execution and monitoring.
//!
//! ## Architecture
//!
//! - **Registry**: Named job definitions with handler, priority, timeout and retry policy
//! - **Dispatcher**: Enqueues jobs by name onto a Redis or in-memory backing store
//! - **Processor**: Claims jobs and races each handler against its timeout
//! - **Scheduler**: Cron expressions and named aliases that enqueue recurring jobs
//! - **Stall Detector**: Recovers claims whose lock expired without an outcome
//! - **Monitoring**: Per-job counters, duration history and a terminal dashboard

pub mod config;
pub mod error;
pub mod jobs;
pub mod monitoring;
pub mod observability;

pub use error::{DroverError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, EngineConfig, JobConfig};
    pub use crate::error::{DroverError, ErrorCode, ErrorContext, Result};
    pub use crate::jobs::{
        handler_fn, sync_handler_fn, Backoff, EventLogger, Job, JobContext, JobDefinition,
        JobEngine, JobError, JobHandler, JobId, JobOutcome, JobResult, JobState, Priority,
        QueueConnection, TracingEventLogger,
    };
    pub use crate::monitoring::{render_dashboard, Dashboard, JobSnapshot, JobStats, MonitoringStore};
}

//! Background job engine.
//!
//! Named job definitions are registered once, enqueued by name, and
//! processed by a pool of workers that race each handler against its
//! timeout.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                             JobEngine                                  │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌──────────┐ │
//! │  │  Registry   │───▶│ Dispatcher  │───▶│   Backend   │───▶│Processor │ │
//! │  │ (handlers)  │    │   (add)     │    │(Redis/memory│    │ (timeout │ │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    │   race)  │ │
//! │         │                  ▲                  │           └──────────┘ │
//! │         ▼                  │                  ▼                 │      │
//! │  ┌─────────────┐           │           ┌─────────────┐          │      │
//! │  │  Scheduler  │───────────┘           │ Stall sweep │          │      │
//! │  │ (cron/alias)│                       └─────────────┘          ▼      │
//! │  └─────────────┘                                  ┌─────────────────┐  │
//! │                                                   │   Monitoring    │  │
//! │                                                   └─────────────────┘  │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use drover_core::jobs::{handler_fn, JobDefinition, JobEngine, QueueConnection, TracingEventLogger};
//!
//! let engine = JobEngine::builder()
//!     .name("mailer")
//!     .connection(QueueConnection::Redis {
//!         url: "redis://127.0.0.1:6379".into(),
//!         key_prefix: "drover:".into(),
//!     })
//!     .logger(Arc::new(TracingEventLogger::new()))
//!     .job(
//!         JobDefinition::new("welcome", handler_fn(|ctx| async move {
//!             ctx.info("sending", None);
//!             Ok(serde_json::json!({ "sent": true }))
//!         }))
//!         .timeout_ms(5_000),
//!     )
//!     .build()?;
//!
//! engine.process();
//! engine.add("welcome", Some(serde_json::json!({ "user": 42 }))).await?;
//! ```

pub mod builtin;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod job;
pub mod processor;
pub mod queue;
pub mod redis_queue;
pub mod registry;
pub mod schedule;

pub use builtin::{builtin_handler, BUILTIN_HANDLERS};
pub use context::JobContext;
pub use dispatcher::Dispatcher;
pub use engine::{Execution, JobEngine, JobEngineBuilder, QueueConnection};
pub use events::{EventLogger, LogLevel, LogRecord, MemoryEventLogger, TracingEventLogger};
pub use job::{
    Backoff, BackoffKind, Job, JobError, JobErrorKind, JobId, JobOptions, JobOutcome, JobResult,
    JobState, Priority, SubmitOptions,
};
pub use processor::{Processor, ProcessorConfig, ProcessorHandle, ProcessorStats};
pub use queue::{FailDisposition, InMemoryQueueBackend, QueueBackend, QueueConfig, QueueEvent};
pub use redis_queue::RedisQueueBackend;
pub use registry::{handler_fn, sync_handler_fn, JobDefinition, JobHandler, JobRegistry};
pub use schedule::{NamedAlias, ScheduleHandle, Scheduler, Trigger};

//! Per-attempt execution context handed to handlers.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::events::{EventLogger, LogLevel};
use super::job::{Job, JobId};
use crate::error::Result;

/// Context for one execution attempt. Dropped once the outcome is recorded.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    name: Arc<str>,
    data: Arc<Map<String, Value>>,
    dispatcher: Dispatcher,
}

impl JobContext {
    pub(crate) fn new(job: Job, name: &str, dispatcher: Dispatcher) -> Self {
        let (_, data) = job.split_payload();
        Self {
            job: Arc::new(job),
            name: Arc::from(name),
            data: Arc::new(data),
            dispatcher,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Failed attempts before this one.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Caller data, without the routing field.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Read one field of the caller data.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Correlation fields attached to every event of this attempt.
    pub(crate) fn fields(&self) -> Value {
        json!({
            "job_id": self.job.id,
            "attempt": self.job.attempts_made,
            "name": &*self.name,
            "data": &*self.data,
        })
    }

    fn log(&self, level: LogLevel, kind: &str, message_data: Option<Value>) {
        let mut fields = self.fields();
        if let Value::Object(map) = &mut fields {
            map.insert("message_data".to_string(), message_data.unwrap_or(Value::Null));
        }
        self.dispatcher.logger().log(level, kind, fields);
    }

    pub fn info(&self, kind: &str, data: Option<Value>) {
        self.log(LogLevel::Info, kind, data);
    }

    pub fn warn(&self, kind: &str, data: Option<Value>) {
        self.log(LogLevel::Warn, kind, data);
    }

    pub fn error(&self, kind: &str, data: Option<Value>) {
        self.log(LogLevel::Error, kind, data);
    }

    /// Enqueue a follow-up job through the engine's dispatcher.
    pub async fn add(&self, name: &str, data: Option<Value>) -> Result<Job> {
        self.dispatcher.add(name, data).await
    }

    /// Active and waiting jobs.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.dispatcher.list().await
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("attempt", &self.job.attempts_made)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

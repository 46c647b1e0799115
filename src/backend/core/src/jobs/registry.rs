//! Job definitions and the registry that maps names to them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::context::JobContext;
use super::job::{Backoff, JobError, JobOptions, JobResult, Priority};
use super::schedule::Trigger;
use crate::error::{DroverError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// The work behind a job name.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run one attempt. The returned value is logged as the job result.
    async fn execute(&self, ctx: &JobContext) -> JobResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        (self.f)(ctx.clone()).await
    }
}

/// Adapt an async closure into a handler.
///
/// ```ignore
/// let handler = handler_fn(|ctx| async move { Ok(ctx.data().clone().into()) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct SyncFnHandler<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> JobHandler for SyncFnHandler<F>
where
    F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
{
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let f = Arc::clone(&self.f);
        let ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || f(&ctx)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::panicked(panic_message(e.into_panic()))),
            Err(e) => Err(JobError::new(e.to_string())),
        }
    }
}

/// Adapt a synchronous closure into a handler. It runs on the blocking pool
/// so the deadline timer can still fire.
pub fn sync_handler_fn<F>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
{
    Arc::new(SyncFnHandler { f: Arc::new(f) })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// Static registration of a job name to its handler and policy.
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    handler: Arc<dyn JobHandler>,
    options: JobOptions,
    schedule: Option<String>,
    trigger: Option<Trigger>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            options: JobOptions::default(),
            schedule: None,
            trigger: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.options.attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.options.backoff = Some(backoff);
        self
    }

    /// Recurring schedule: a cron expression or a named alias.
    pub fn schedule(mut self, schedule: &str) -> Self {
        self.schedule = Some(schedule.to_string());
        self
    }

    /// Replace every option at once.
    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn job_options(&self) -> &JobOptions {
        &self.options
    }

    pub fn schedule_text(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    /// Resolved trigger, present once the definition is registered.
    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    /// Check the definition and resolve its schedule.
    fn validate(mut self) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(DroverError::invalid_job(&self.name, "name must not be empty"));
        }
        if self.options.attempts == 0 {
            return Err(DroverError::invalid_job(&self.name, "attempts must be at least 1"));
        }
        if self.options.timeout_ms == Some(0) {
            return Err(DroverError::invalid_job(&self.name, "timeout_ms must be positive"));
        }
        self.trigger = match self.schedule.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(Trigger::parse(&self.name, text)?),
            _ => None,
        };
        Ok(self)
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable name -> definition map, built once at engine setup.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: HashMap<String, JobDefinition>,
    order: Vec<String>,
}

impl JobRegistry {
    /// Validate every definition; any malformed one rejects the whole set.
    pub fn new(definitions: Vec<JobDefinition>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(DroverError::missing_configuration("jobs"));
        }

        let mut registry = Self::default();
        for definition in definitions {
            let definition = definition.validate()?;
            if registry.definitions.contains_key(definition.name()) {
                return Err(DroverError::duplicate_job(definition.name()));
            }
            registry.order.push(definition.name().to_string());
            registry.definitions.insert(definition.name().to_string(), definition);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&JobDefinition> {
        self.definitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &JobDefinition> {
        self.order.iter().filter_map(|name| self.definitions.get(name))
    }

    /// Definitions that carry a recurring trigger.
    pub fn scheduled(&self) -> impl Iterator<Item = &JobDefinition> {
        self.iter().filter(|definition| definition.trigger.is_some())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::Value;

    fn noop() -> Arc<dyn JobHandler> {
        handler_fn(|_ctx| async { Ok(Value::Null) })
    }

    #[test]
    fn test_registry_keeps_order() {
        let registry = JobRegistry::new(vec![
            JobDefinition::new("b", noop()),
            JobDefinition::new("a", noop()).priority(Priority::High),
        ])
        .unwrap();

        assert_eq!(registry.names(), &["b".to_string(), "a".to_string()]);
        assert_eq!(registry.get("a").unwrap().job_options().priority, Priority::High);
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let error = JobRegistry::new(vec![
            JobDefinition::new("a", noop()),
            JobDefinition::new("a", noop()),
        ])
        .unwrap_err();
        assert_eq!(error.code(), ErrorCode::DuplicateJob);
        assert!(error.is_configuration());
    }

    #[test]
    fn test_malformed_definitions_rejected() {
        assert!(JobRegistry::new(vec![]).unwrap_err().is_configuration());
        assert!(JobRegistry::new(vec![JobDefinition::new("  ", noop())]).is_err());
        assert!(JobRegistry::new(vec![JobDefinition::new("a", noop()).attempts(0)]).is_err());
        assert!(JobRegistry::new(vec![JobDefinition::new("a", noop()).timeout_ms(0)]).is_err());

        let error = JobRegistry::new(vec![JobDefinition::new("a", noop()).schedule("sometimes")]).unwrap_err();
        assert_eq!(error.code(), ErrorCode::InvalidSchedule);
    }

    #[test]
    fn test_schedule_resolved_at_registration() {
        let registry = JobRegistry::new(vec![
            JobDefinition::new("nightly", noop()).schedule("every day"),
            JobDefinition::new("adhoc", noop()),
            JobDefinition::new("blank", noop()).schedule(""),
        ])
        .unwrap();

        let scheduled: Vec<_> = registry.scheduled().map(|d| d.name().to_string()).collect();
        assert_eq!(scheduled, vec!["nightly".to_string()]);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "handler panicked");
    }
}

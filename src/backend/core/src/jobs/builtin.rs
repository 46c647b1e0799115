//! Built-in handlers addressable by name from configuration.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::context::JobContext;
use super::job::{JobError, JobResult};
use super::registry::JobHandler;

/// Handler names accepted in `[[jobs]] handler = "..."`.
pub const BUILTIN_HANDLERS: [&str; 4] = ["echo", "sleep", "fail", "chain"];

/// Look up a built-in handler by name.
pub fn builtin_handler(name: &str) -> Option<Arc<dyn JobHandler>> {
    match name {
        "echo" => Some(Arc::new(EchoHandler)),
        "sleep" => Some(Arc::new(SleepHandler::default())),
        "fail" => Some(Arc::new(FailHandler)),
        "chain" => Some(Arc::new(ChainHandler)),
        _ => None,
    }
}

/// Handler: returns its payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        Ok(Value::Object(ctx.data().clone()))
    }
}

/// Handler: sleeps for `data.ms` milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct SleepHandler {
    /// Used when the payload has no `ms`
    pub default_ms: u64,
}

impl Default for SleepHandler {
    fn default() -> Self {
        Self { default_ms: 1000 }
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let ms = ctx.get("ms").and_then(Value::as_u64).unwrap_or(self.default_ms);
        ctx.info("sleep_started", Some(json!({ "ms": ms })));
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Handler: always fails with `data.message`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let message = ctx
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Job failed on purpose");
        Err(JobError::new(message))
    }
}

/// Handler: enqueues `data.next` with `data.payload`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainHandler;

#[async_trait]
impl JobHandler for ChainHandler {
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let next = ctx
            .get("next")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::fatal("chain needs a `next` job name"))?;
        let job = ctx.add(next, ctx.get("payload").cloned()).await?;
        Ok(json!({ "queued": next, "job_id": job.id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        for name in BUILTIN_HANDLERS {
            assert!(builtin_handler(name).is_some(), "missing builtin {}", name);
        }
        assert!(builtin_handler("unknown").is_none());
    }
}

//! Enqueue path: validate the name, compose payload and options, submit,
//! and count the job as queued.

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;

use super::events::{EventLogger, JOB_NOT_FOUND, JOB_QUEUED, QUEUE_ERROR};
use super::job::{compose_payload, Job, SubmitOptions};
use super::queue::QueueBackend;
use super::registry::JobRegistry;
use crate::error::{DroverError, Result};
use crate::monitoring::MonitoringStore;
use crate::observability::metrics;

/// Shared handle over the registry, backing store, monitoring store and
/// logger. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    backend: Arc<dyn QueueBackend>,
    monitoring: Arc<dyn MonitoringStore>,
    logger: Arc<dyn EventLogger>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        backend: Arc<dyn QueueBackend>,
        monitoring: Arc<dyn MonitoringStore>,
        logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            registry,
            backend,
            monitoring,
            logger,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn monitoring(&self) -> &Arc<dyn MonitoringStore> {
        &self.monitoring
    }

    pub fn logger(&self) -> &Arc<dyn EventLogger> {
        &self.logger
    }

    /// Enqueue `name` with `data`.
    ///
    /// The name is checked when this is called, not when the returned
    /// future is polled: an unknown name is logged at error level and the
    /// future resolves to `JobNotFound` without touching the backing store.
    pub fn add(&self, name: &str, data: Option<Value>) -> BoxFuture<'static, Result<Job>> {
        let Some(definition) = self.registry.get(name) else {
            self.logger.error(JOB_NOT_FOUND, json!({ "name": name }));
            return future::ready(Err(DroverError::job_not_found(name))).boxed();
        };

        let options = SubmitOptions::from_job_options(definition.job_options()).removing_terminal_jobs();
        let job = Job::new(compose_payload(name, data), options);
        let this = self.clone();
        let name = name.to_string();
        async move { this.submit(name, job).await }.boxed()
    }

    async fn submit(&self, name: String, job: Job) -> Result<Job> {
        // Counted once accepted, even if the submission below fails.
        if let Err(e) = self.monitoring.record_queued(&name).await {
            tracing::warn!(job = %name, error = %e, "Failed to record queued job");
        }
        metrics::record_job_queued(&name);

        let (_, data) = job.split_payload();
        match self.backend.submit(job).await {
            Ok(job) => {
                self.logger.info(
                    JOB_QUEUED,
                    json!({ "job_id": job.id, "name": name, "data": data }),
                );
                Ok(job)
            }
            Err(e) => {
                self.logger.error(
                    QUEUE_ERROR,
                    json!({ "name": name, "error_message": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Active jobs followed by waiting jobs.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = self.backend.active().await?;
        jobs.extend(self.backend.waiting().await?);
        Ok(jobs)
    }
}

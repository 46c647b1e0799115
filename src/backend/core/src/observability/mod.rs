//! Observability: structured logging and metrics.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the logging stack.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Calling this twice
/// returns an error instead of replacing the installed subscriber.
pub fn init(service_name: &str, config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format.as_str() {
        "pretty" => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()?,
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).try_init()?,
        _ => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
    }

    self::metrics::describe();
    tracing::debug!(service = %service_name, format = %config.log_format, "Logging initialized");
    Ok(())
}

/// Serve Prometheus metrics on `metrics_addr`, if configured.
///
/// Must be called from within a Tokio runtime.
pub fn install_metrics_exporter(config: &LoggingConfig) -> anyhow::Result<Option<SocketAddr>> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        return Ok(None);
    };
    let addr: SocketAddr = addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(Some(addr))
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_histogram, histogram};

    use crate::jobs::JobOutcome;

    /// Register all metric descriptions.
    pub fn describe() {
        // Counters
        describe_counter!(
            "drover_jobs_queued_total",
            "Total number of jobs accepted for enqueue"
        );
        describe_counter!(
            "drover_jobs_finished_total",
            "Total number of attempts that reached an outcome"
        );
        describe_counter!(
            "drover_jobs_stalled_total",
            "Total number of claims recovered after their lock expired"
        );
        describe_counter!(
            "drover_errors_total",
            "Total number of engine errors by code"
        );

        // Histograms
        describe_histogram!(
            "drover_job_duration_ms",
            "Handler execution duration in milliseconds"
        );
    }

    /// Record an accepted enqueue.
    pub fn record_job_queued(job: &str) {
        counter!("drover_jobs_queued_total", "job" => job.to_string()).increment(1);
    }

    /// Record a finished attempt.
    pub fn record_job_finished(job: &str, outcome: JobOutcome, duration_ms: u64) {
        counter!(
            "drover_jobs_finished_total",
            "job" => job.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!("drover_job_duration_ms", "job" => job.to_string()).record(duration_ms as f64);
    }

    /// Record a stalled claim.
    pub fn record_job_stalled() {
        counter!("drover_jobs_stalled_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exporter_disabled_without_addr() {
        let config = LoggingConfig::default();
        assert_eq!(install_metrics_exporter(&config).unwrap(), None);
    }

    #[test]
    fn test_metrics_exporter_rejects_bad_addr() {
        let config = LoggingConfig {
            metrics_addr: Some("not-an-address".into()),
            ..LoggingConfig::default()
        };
        assert!(install_metrics_exporter(&config).is_err());
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: recording must be a no-op.
        super::metrics::record_job_queued("a");
        super::metrics::record_job_finished("a", crate::jobs::JobOutcome::Completed, 12);
        super::metrics::record_job_stalled();
    }
}

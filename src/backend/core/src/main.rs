//! Drover Worker - Main entry point
//!
//! Processes the jobs declared in configuration and runs their schedules.

use std::sync::Arc;

use drover_core::{
    config::Config,
    jobs::{JobEngine, TracingEventLogger},
    observability,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("DROVER_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    // Initialize observability
    observability::init("drover-worker", &config.observability)?;
    observability::install_metrics_exporter(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.engine.name,
        jobs = config.jobs.len(),
        backend = if config.redis.is_some() { "redis" } else { "memory" },
        "Starting Drover worker"
    );

    let logger = Arc::new(TracingEventLogger::with_instance(config.engine.name.clone()));
    let engine = JobEngine::from_config(&config, logger)?;

    engine.process();
    if config.engine.run_schedules {
        let timers = engine.schedule();
        tracing::info!(timers, "Schedules started");
    }

    shutdown_signal().await;

    engine.shutdown().await;
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

//! Configuration commands.
//!
//! Reads the engine configuration file (`--config`, `DROVER_CONFIG`, or
//! the per-user `drover/drover.toml`).

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use drover_core::jobs::JobRegistry;

use crate::context::{default_config_path, CliContext};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Check every `[[jobs]]` entry and print its next scheduled run
    Validate,

    /// Print which configuration file is in use
    Path,
}

#[derive(Debug, Serialize, Tabled)]
struct JobConfigRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Handler")]
    handler: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Timeout")]
    timeout: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Schedule")]
    schedule: String,
    #[tabled(rename = "Next Run")]
    next_run: String,
}

pub async fn execute(cmd: ConfigCommands, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Table => {
                let config = &ctx.config;
                output::print_header("Engine");
                output::print_detail("Name", &config.engine.name);
                output::print_detail("Concurrency", &config.engine.concurrency.to_string());
                output::print_detail("Lock duration", &format!("{} ms", config.engine.lock_duration_ms));
                output::print_detail("Stall interval", &format!("{} ms", config.engine.stall_interval_ms));
                output::print_detail("Max stalled", &config.engine.max_stalled_count.to_string());
                output::print_detail("Run schedules", &config.engine.run_schedules.to_string());

                output::print_header("Backing store");
                match &config.redis {
                    Some(redis) => {
                        output::print_detail("Redis URL", &redis.url);
                        output::print_detail("Key prefix", &redis.key_prefix);
                    }
                    None => output::print_detail("Store", "in-memory"),
                }
                output::print_detail("Jobs", &config.jobs.len().to_string());
            }
            _ => output::print_item(&ctx.config, format)?,
        },

        ConfigCommands::Validate => {
            let registry = JobRegistry::new(ctx.config.job_definitions()?)?;
            let now = Utc::now();
            let rows: Vec<JobConfigRow> = ctx
                .config
                .jobs
                .iter()
                .filter_map(|job| registry.get(&job.name).map(|definition| (job, definition)))
                .map(|(job, definition)| JobConfigRow {
                    name: job.name.clone(),
                    handler: job.handler.clone(),
                    priority: job.priority.to_string(),
                    timeout: job
                        .timeout_ms
                        .map(|ms| format!("{} ms", ms))
                        .unwrap_or_else(|| "-".to_string()),
                    attempts: job.attempts,
                    schedule: job.schedule.clone().unwrap_or_else(|| "-".to_string()),
                    next_run: definition
                        .trigger()
                        .and_then(|trigger| trigger.next_after(&now))
                        .map(|next| next.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                })
                .collect();

            output::print_list(&rows, format)?;
            if format == OutputFormat::Table {
                output::print_success(&format!("{} job definition(s) are valid", registry.len()));
            }
        }

        ConfigCommands::Path => {
            let path = ctx
                .config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(environment only)".to_string());
            match format {
                OutputFormat::Table => {
                    output::print_detail("In use", &path);
                    if let Some(default) = default_config_path() {
                        output::print_detail("Default", &default.display().to_string());
                    }
                }
                _ => output::print_item(&serde_json::json!({ "path": path }), format)?,
            }
        }
    }

    Ok(())
}

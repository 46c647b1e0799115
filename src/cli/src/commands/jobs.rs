//! Job commands: enqueue, run inline, list.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use serde::Serialize;
use tabled::Tabled;

use drover_core::jobs::Job;
use drover_core::DroverError;

use super::parse_data;
use crate::context::CliContext;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct QueueArgs {
    /// Job name, as registered in `[[jobs]]`
    name: String,

    /// JSON payload handed to the handler
    #[arg(short, long)]
    data: Option<String>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Job name, as registered in `[[jobs]]`
    name: String,

    /// JSON payload handed to the handler
    #[arg(short, long)]
    data: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Priority")]
    priority: u32,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Enqueued")]
    enqueued_at: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name().unwrap_or("?").to_string(),
            state: job.state.to_string(),
            priority: job.priority,
            attempts: job.attempts_made,
            enqueued_at: job.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct EventRow {
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Event")]
    kind: String,
    #[tabled(rename = "Fields")]
    fields: String,
}

pub async fn queue(args: QueueArgs, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let data = parse_data(args.data.as_deref())?;
    let engine = ctx.engine()?;
    let job = engine.add(&args.name, data).await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Queued {} as {}", args.name.bold(), job.id));
        }
        _ => output::print_item(&job, format)?,
    }
    Ok(())
}

pub async fn run(args: RunArgs, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let data = parse_data(args.data.as_deref())?;
    let engine = ctx.engine()?;
    let execution = engine.run_inline(&args.name, data).await?;

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Inline run: {}", args.name));
            output::print_detail("Outcome", execution.outcome.as_str());
            output::print_detail("Duration", &format!("{} ms", execution.duration_ms));
            if let Some(result) = &execution.result {
                output::print_detail("Result", &result.to_string());
            }
            if let Some(error) = &execution.error {
                output::print_detail("Error", &error.message);
            }

            let events: Vec<EventRow> = ctx
                .logger
                .records()
                .into_iter()
                .map(|record| EventRow {
                    level: record.level.to_string(),
                    kind: record.kind,
                    fields: record.fields.to_string(),
                })
                .collect();
            output::print_header("Events");
            output::print_list(&events, format)?;
        }
        _ => output::print_item(&execution, format)?,
    }

    match execution.error {
        Some(error) => Err(DroverError::from(error))
            .with_context(|| format!("Job {} finished as {}", args.name, execution.outcome.as_str())),
        None => Ok(()),
    }
}

pub async fn list(ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let engine = ctx.engine()?;
    let jobs = engine.list().await?;

    match format {
        OutputFormat::Table => {
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format)?;
        }
        _ => output::print_item(&jobs, format)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::jobs::job::compose_payload;
    use drover_core::jobs::SubmitOptions;

    #[test]
    fn test_job_row_from_job() {
        let job = Job::new(compose_payload("email", None), SubmitOptions::default());
        let row = JobRow::from(&job);
        assert_eq!(row.name, "email");
        assert_eq!(row.state, "queued");
        assert_eq!(row.attempts, 0);
    }
}

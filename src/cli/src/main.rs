//! Drover CLI - Command-line interface for Drover job queues.
//!
//! Enqueues and runs jobs, inspects queues and monitoring data, and controls
//! the shared queue.

mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{admin, config, jobs, stats};
use context::CliContext;
use output::OutputFormat;

/// Drover - Background Job Engine CLI
#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Drover - Background Job Engine",
    long_about = "CLI tool for enqueuing, running, inspecting and monitoring Drover jobs.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Engine configuration file
    #[arg(short, long, global = true, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job for the workers
    Queue(jobs::QueueArgs),

    /// Run a job's handler immediately in this process
    Run(jobs::RunArgs),

    /// List active and waiting jobs
    List,

    /// Show monitoring counters
    Stats,

    /// Live monitoring dashboard
    Monitor(stats::MonitorArgs),

    /// Stop workers from claiming jobs
    Pause,

    /// Let workers claim jobs again
    Resume,

    /// Remove every waiting job
    Flush(admin::FlushArgs),

    /// Delete all monitoring data
    ClearStats(stats::ClearStatsArgs),

    /// Configuration inspection
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = match CliContext::load(cli.config.clone()) {
        Ok(ctx) => run(cli.command, &ctx, format).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Queue(args) => jobs::queue(args, ctx, format).await,
        Commands::Run(args) => jobs::run(args, ctx, format).await,
        Commands::List => jobs::list(ctx, format).await,
        Commands::Stats => stats::stats(ctx, format).await,
        Commands::Monitor(args) => stats::monitor(args, ctx).await,
        Commands::Pause => admin::pause(ctx).await,
        Commands::Resume => admin::resume(ctx).await,
        Commands::Flush(args) => admin::flush(args, ctx, format).await,
        Commands::ClearStats(args) => stats::clear_stats(args, ctx).await,
        Commands::Config(cmd) => config::execute(cmd, ctx, format).await,
    }
}

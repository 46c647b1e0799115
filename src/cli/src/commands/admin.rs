//! Queue controls shared by every worker: pause, resume, flush.

use anyhow::Result;
use clap::Args;

use crate::context::CliContext;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct FlushArgs {
    /// Skip confirmation
    #[arg(short, long)]
    force: bool,
}

pub async fn pause(ctx: &CliContext) -> Result<()> {
    let engine = ctx.engine()?;
    engine.pause().await?;
    output::print_success(&format!("Queue {} paused", engine.name()));
    Ok(())
}

pub async fn resume(ctx: &CliContext) -> Result<()> {
    let engine = ctx.engine()?;
    engine.resume().await?;
    output::print_success(&format!("Queue {} resumed", engine.name()));
    Ok(())
}

pub async fn flush(args: FlushArgs, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    if !args.force {
        output::print_info("This will remove every waiting job. Use --force to confirm.");
        return Ok(());
    }

    let engine = ctx.engine()?;
    let removed = engine.flush().await?;
    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Removed {} waiting job(s) from {}", removed.len(), engine.name()));
        }
        _ => output::print_item(&removed, format)?,
    }
    Ok(())
}

//! Monitoring commands: counters, live dashboard, clearing.

use anyhow::Result;
use clap::Args;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use drover_core::monitoring::{render_dashboard, totals, Dashboard};

use crate::context::CliContext;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct MonitorArgs {
    /// Redraw interval; defaults to `monitoring.refresh_ms`
    #[arg(short, long)]
    refresh_ms: Option<u64>,
}

#[derive(Args)]
pub struct ClearStatsArgs {
    /// Skip confirmation
    #[arg(short, long)]
    force: bool,
}

pub async fn stats(ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let snapshots = ctx.monitoring()?.snapshot().await?;

    match format {
        OutputFormat::Table => {
            if snapshots.is_empty() {
                output::print_info("No monitoring data recorded yet.");
                return Ok(());
            }
            println!("{}", render_dashboard(&snapshots));
        }
        _ => output::print_item(
            &serde_json::json!({ "jobs": snapshots, "totals": totals(&snapshots) }),
            format,
        )?,
    }
    Ok(())
}

pub async fn monitor(args: MonitorArgs, ctx: &CliContext) -> Result<()> {
    let refresh = Duration::from_millis(args.refresh_ms.unwrap_or(ctx.config.monitoring.refresh_ms));
    let dashboard = Dashboard::new(ctx.monitoring()?).with_refresh(refresh);

    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    dashboard.run(token).await?;
    Ok(())
}

pub async fn clear_stats(args: ClearStatsArgs, ctx: &CliContext) -> Result<()> {
    if !args.force {
        output::print_info("This will delete every monitoring counter and history entry. Use --force to confirm.");
        return Ok(());
    }
    ctx.monitoring()?.clear().await?;
    output::print_success("Monitoring data cleared");
    Ok(())
}

//! Terminal dashboard over monitoring snapshots. Read-only.

use colored::{ColoredString, Colorize};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tabled::builder::Builder;
use tabled::settings::Style;
use tokio_util::sync::CancellationToken;

use super::{totals, HistoryEntry, JobSnapshot, MonitoringStore};
use crate::error::Result;
use crate::jobs::JobOutcome;

/// Default redraw interval.
pub const DEFAULT_REFRESH: Duration = Duration::from_millis(2000);

const SPARK_TICKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const SPARK_SAMPLES: usize = 25;
const SPARK_WIDTH: usize = 30;
const RECENT_SAMPLES: usize = 10;
const CLEAR_SCREEN: &str = "\x1B[2J\x1B[0f";

const HEADERS: [&str; 7] = [
    "Name",
    "Queued",
    "Active",
    "Completed",
    "Timeout",
    "Failed",
    "Processing History",
];

// ═══════════════════════════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════════════════════════

/// Sparkline of values scaled between 0 and the largest value.
pub fn sparkline(values: &[u64]) -> String {
    let max = values.iter().copied().max().unwrap_or(0);
    values
        .iter()
        .map(|value| {
            if max == 0 {
                return SPARK_TICKS[0];
            }
            let scaled = (*value as f64 / max as f64) * (SPARK_TICKS.len() - 1) as f64;
            SPARK_TICKS[(scaled.round() as usize).min(SPARK_TICKS.len() - 1)]
        })
        .collect()
}

/// Compact duration in the largest whole unit (`ms`, `s`, `m`, `h`).
pub fn format_duration(ms: u64) -> String {
    match ms {
        0..=999 => format!("{}ms", ms),
        1_000..=59_999 => format!("{}s", ms / 1_000),
        60_000..=3_599_999 => format!("{}m", ms / 60_000),
        _ => format!("{}h", ms / 3_600_000),
    }
}

fn status_colored(entry: &HistoryEntry) -> ColoredString {
    let text = format_duration(entry.duration_ms);
    match entry.status {
        JobOutcome::Completed => text.green(),
        JobOutcome::TimedOut => text.yellow(),
        JobOutcome::Failed => text.red(),
    }
}

fn history_cell(history: &[HistoryEntry]) -> String {
    let durations: Vec<u64> = history.iter().take(SPARK_SAMPLES).map(|entry| entry.duration_ms).collect();
    let spark = sparkline(&durations);
    let padding = SPARK_WIDTH.saturating_sub(spark.chars().count());

    let recent: Vec<String> = history
        .iter()
        .take(RECENT_SAMPLES)
        .map(|entry| status_colored(entry).to_string())
        .collect();

    format!("{}{}{}", spark, " ".repeat(padding), recent.join(", "))
}

fn counter(value: i64, color: fn(&str) -> ColoredString, bold: bool) -> String {
    let text = if value == 0 {
        "0".bright_black()
    } else {
        color(&value.to_string())
    };
    if bold {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

fn counter_cells(stats: &super::JobStats, bold: bool) -> [String; 5] {
    [
        counter(stats.queued, |s| s.magenta(), bold),
        counter(stats.active, |s| s.blue(), bold),
        counter(stats.completed, |s| s.green(), bold),
        counter(stats.timed_out, |s| s.yellow(), bold),
        counter(stats.failed, |s| s.red(), bold),
    ]
}

/// Render the monitoring table: one row per job name, sorted, then totals.
pub fn render_dashboard(snapshots: &[JobSnapshot]) -> String {
    let mut sorted: Vec<&JobSnapshot> = snapshots.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut builder = Builder::default();
    builder.push_record(HEADERS.iter().map(|header| header.bold().to_string()));

    for snapshot in &sorted {
        let mut row = vec![snapshot.name.clone()];
        row.extend(counter_cells(&snapshot.stats, false));
        row.push(history_cell(&snapshot.history));
        builder.push_record(row);
    }

    let mut total_row = vec!["TOTAL".bold().to_string()];
    total_row.extend(counter_cells(&totals(snapshots), true));
    total_row.push(String::new());
    builder.push_record(total_row);

    builder.build().with(Style::rounded()).to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Polling Loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Polls a monitoring store and redraws the table.
pub struct Dashboard {
    store: Arc<dyn MonitoringStore>,
    refresh: Duration,
}

impl Dashboard {
    pub fn new(store: Arc<dyn MonitoringStore>) -> Self {
        Self {
            store,
            refresh: DEFAULT_REFRESH,
        }
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh.max(Duration::from_millis(100));
        self
    }

    /// Render the current snapshot.
    pub async fn render_once(&self) -> Result<String> {
        let snapshots = self.store.snapshot().await?;
        Ok(render_dashboard(&snapshots))
    }

    /// Redraw every `refresh` until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.refresh);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.render_once().await {
                Ok(table) => {
                    let mut stdout = std::io::stdout().lock();
                    writeln!(stdout, "{}{}", CLEAR_SCREEN, table)?;
                    stdout.flush()?;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to read monitoring data"),
            }
        }
    }
}

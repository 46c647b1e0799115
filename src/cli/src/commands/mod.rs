//! Subcommand implementations.

pub mod admin;
pub mod config;
pub mod jobs;
pub mod stats;

use anyhow::{Context, Result};
use serde_json::Value;

/// Parse a `--data` argument as JSON.
pub fn parse_data(data: Option<&str>) -> Result<Option<Value>> {
    data.map(|raw| serde_json::from_str(raw).with_context(|| format!("--data is not valid JSON: {}", raw)))
        .transpose()
}

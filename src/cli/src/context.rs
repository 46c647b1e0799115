//! Loads configuration and opens the engine or monitoring store for a command.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drover_core::config::Config;
use drover_core::jobs::{JobEngine, MemoryEventLogger};
use drover_core::monitoring::{InMemoryMonitoringStore, MonitoringStore, RedisMonitoringStore};

use crate::output;

/// Resolved configuration plus the logger every engine built here shares.
pub struct CliContext {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub logger: MemoryEventLogger,
}

/// Per-user config file (`~/.config/drover/drover.toml` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("drover").join("drover.toml"))
}

impl CliContext {
    /// Load from `path`, else the per-user file if present, else the
    /// environment alone.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| default_config_path().filter(|p| p.exists()));
        let config = match &path {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => Config::load().context("Failed to load configuration from the environment")?,
        };
        Ok(Self::new(config, path))
    }

    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            logger: MemoryEventLogger::new(),
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    fn warn_if_in_memory(&self) {
        if self.config.redis.is_none() {
            output::print_warning(
                "No [redis] section configured; using an in-memory store that lives only for this command",
            );
        }
    }

    /// Engine over the configured `[[jobs]]`. Not processing.
    pub fn engine(&self) -> Result<JobEngine> {
        if self.config.jobs.is_empty() {
            anyhow::bail!("No [[jobs]] defined in the configuration");
        }
        self.warn_if_in_memory();
        let engine = JobEngine::from_config(&self.config, Arc::new(self.logger.clone()))?;
        Ok(engine)
    }

    /// Monitoring store alone; does not need any `[[jobs]]`.
    pub fn monitoring(&self) -> Result<Arc<dyn MonitoringStore>> {
        self.warn_if_in_memory();
        let history_limit = self.config.monitoring.history_limit;
        Ok(match &self.config.redis {
            Some(redis) => Arc::new(
                RedisMonitoringStore::open(&redis.url, redis.key_prefix.clone())?
                    .with_history_limit(history_limit),
            ),
            None => Arc::new(InMemoryMonitoringStore::with_history_limit(history_limit)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[engine]\nname = \"reports\"\n\n[[jobs]]\nname = \"ping\"\nhandler = \"echo\"").unwrap();

        let ctx = CliContext::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(ctx.config.engine.name, "reports");
        assert_eq!(ctx.config_path(), Some(file.path()));
        assert_eq!(ctx.engine().unwrap().registry().names(), vec!["ping"]);
    }

    #[test]
    fn test_engine_requires_jobs() {
        let ctx = CliContext::new(Config::default(), None);
        assert!(ctx.engine().is_err());
        assert!(ctx.monitoring().is_ok());
    }
}

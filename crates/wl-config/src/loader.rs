//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "workload.toml",
    "config.toml",
    "./config/workload.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file not found, falling back to search paths");
        }

        if let Ok(path) = env::var("WORKLOAD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Pool
        if let Some(size) = parse_env("WORKLOAD_POOL_SIZE") {
            config.pool.thread_pool_size = size;
        }
        if let Some(size) = parse_env("WORKLOAD_QUEUE_SIZE") {
            config.pool.thread_queue_size = size;
        }
        if let Some(secs) = parse_env("WORKLOAD_SHUTDOWN_TIMEOUT_SECS") {
            config.pool.shutdown_timeout_secs = secs;
        }

        // Retry
        if let Some(attempts) = parse_env("WORKLOAD_RETRY_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_env("WORKLOAD_MAX_BACKOFF_MS") {
            config.retry.max_backoff_ms = ms;
        }

        // Metrics
        if let Some(capacity) = parse_env("WORKLOAD_RING_CAPACITY") {
            config.metrics.ring_capacity = capacity;
        }
        if let Some(secs) = parse_env("WORKLOAD_REPORT_INTERVAL_SECS") {
            config.metrics.report_interval_secs = secs;
        }

        // Workload
        if let Some(secs) = parse_env("WORKLOAD_DURATION_SECS") {
            config.workload.duration_secs = secs;
        }
        if let Some(tasks) = parse_env("WORKLOAD_TASKS") {
            config.workload.tasks = tasks;
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = env::var(name).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = name, value = %val, "Ignoring unparseable environment override");
            None
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[pool]
thread_pool_size = 4
thread_queue_size = 8

[retry]
max_attempts = 3
priority = "low"
"#
        )
        .unwrap();

        env::set_var("WORKLOAD_QUEUE_SIZE", "16");
        let config = ConfigLoader::with_path(file.path()).load();
        env::remove_var("WORKLOAD_QUEUE_SIZE");

        let config = config.unwrap();
        assert_eq!(config.pool.effective_pool_size(), 4);
        assert_eq!(config.pool.effective_queue_size(), 16);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.priority, wl_common::Priority::Low);
    }
}

//! Workload Engine Configuration
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use wl_common::{available_cpus, PolicyError, RetryPolicy};

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid retry policy: {0}")]
    PolicyError(#[from] PolicyError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub metrics: MetricsSettings,
    pub workload: WorkloadSettings,
}

/// Worker pool and admission gate sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker count. Zero or negative derives it from the CPU count.
    pub thread_pool_size: i32,
    /// Admission gate capacity. Zero or negative derives it from the pool size.
    pub thread_queue_size: i32,
    /// How long a graceful shutdown waits before interrupting workers.
    pub shutdown_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: -1,
            thread_queue_size: -1,
            shutdown_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    /// Configured pool size, or 4x the available CPUs.
    pub fn effective_pool_size(&self) -> u32 {
        if self.thread_pool_size > 0 {
            self.thread_pool_size as u32
        } else {
            available_cpus() * 4
        }
    }

    /// Configured queue size, or 4x the effective pool size.
    pub fn effective_queue_size(&self) -> u32 {
        if self.thread_queue_size > 0 {
            self.thread_queue_size as u32
        } else {
            self.effective_pool_size() * 4
        }
    }
}

/// Call metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Latency samples retained per label
    pub ring_capacity: usize,
    /// Seconds between metrics table prints
    pub report_interval_secs: u64,
    pub print_metrics: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            ring_capacity: 500_000,
            report_interval_secs: 3,
            print_metrics: true,
        }
    }
}

/// Defaults for the synthetic bench workload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    pub duration_secs: u64,
    /// Concurrent loops per label
    pub tasks: u32,
    pub label: String,
    /// Probability that a simulated statement aborts with a serialization conflict
    pub transient_rate: f64,
    /// Probability that a simulated statement fails fatally
    pub fatal_rate: f64,
    /// Simulated statement latency
    pub latency_ms: u64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            tasks: 8,
            label: "transfer".to_string(),
            transient_rate: 0.05,
            fatal_rate: 0.0,
            latency_ms: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;

        if self.pool.thread_pool_size > 0
            && self.pool.thread_queue_size > 0
            && self.pool.thread_queue_size < self.pool.thread_pool_size
        {
            return Err(ConfigError::ValidationError(format!(
                "thread_queue_size ({}) must be >= thread_pool_size ({})",
                self.pool.thread_queue_size, self.pool.thread_pool_size
            )));
        }
        if self.metrics.ring_capacity == 0 {
            return Err(ConfigError::ValidationError("metrics.ring_capacity must be > 0".into()));
        }
        if self.metrics.report_interval_secs == 0 {
            return Err(ConfigError::ValidationError("metrics.report_interval_secs must be > 0".into()));
        }
        for (name, rate) in [
            ("transient_rate", self.workload.transient_rate),
            ("fatal_rate", self.workload.fatal_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::ValidationError(format!(
                    "workload.{} must be within [0, 1], got {}", name, rate
                )));
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Workload Engine Configuration
# Environment variables override these settings

[pool]
thread_pool_size = -1      # <= 0: 4x CPUs
thread_queue_size = -1     # <= 0: 4x pool size
shutdown_timeout_secs = 30

[retry]
max_attempts = 10          # <= 0 disables retries
max_backoff_ms = 30000
backoff_base_ms = 1
max_jitter_ms = 1000
read_only = false
follower_read = false
priority = "normal"        # normal, low, high

[metrics]
ring_capacity = 500000
report_interval_secs = 3
print_metrics = true

[workload]
duration_secs = 60
tasks = 8
label = "transfer"
transient_rate = 0.05
fatal_rate = 0.0
latency_ms = 5
"#
        .to_string()
    }
}

//! Engine configuration types.
//!
//! `EngineConfig` represents the `loom.toml` file in the data directory.
//! Every field has a default so an empty or partial file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreakerConfig;
use crate::workflow::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max tasks running at once within a parallel group (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,

    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Run-wide timeout applied when a workflow sets none (0 = none).
    #[serde(default)]
    pub workflow_timeout_secs: u64,

    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Broadcast channel capacity for lifecycle events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry policy for steps that declare none.
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_event_capacity() -> usize {
    256
}

impl EngineConfig {
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        (self.workflow_timeout_secs > 0).then(|| Duration::from_secs(self.workflow_timeout_secs))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            default_task_timeout_secs: default_task_timeout_secs(),
            workflow_timeout_secs: 0,
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            event_capacity: default_event_capacity(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            otel: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL; defaults to `<data_dir>/loom.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::BackoffStrategy;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency_limit(), None);
        assert_eq!(config.default_task_timeout(), Duration::from_secs(30));
        assert_eq!(config.workflow_timeout(), None);
        assert_eq!(config.max_sub_workflow_depth, 5);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrency = 4
workflow_timeout_secs = 120

[retry]
max_retries = 3
backoff = "linear"

[circuit_breaker]
failure_threshold = 3
cooldown_secs = 10

[logging]
level = "loom_core=debug"
format = "json"
otel = true

[storage]
database_url = "sqlite::memory:"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.concurrency_limit(), Some(4));
        assert_eq!(config.workflow_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.half_open_success_threshold, 1);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.otel);
        assert_eq!(config.storage.database_url.as_deref(), Some("sqlite::memory:"));
    }
}

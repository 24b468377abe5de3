//! Circuit breaker state types.
//!
//! A `CircuitState` is keyed by target-service name and persisted by an
//! external store. Transition logic lives in `loom-core::resilience`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a breaker in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// Trial calls check whether the service recovered.
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CircuitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitStatus::Closed),
            "open" => Ok(CircuitStatus::Open),
            "half_open" => Ok(CircuitStatus::HalfOpen),
            other => Err(format!("unknown circuit status '{other}'")),
        }
    }
}

/// Persisted breaker record for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub service: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub half_open_success_count: u32,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    /// Monotonic write counter used for compare-and-swap saves.
    pub version: u64,
}

impl CircuitState {
    /// A fresh closed breaker that has never been saved (version 0).
    pub fn closed(service: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            service: service.into(),
            status: CircuitStatus::Closed,
            failure_count: 0,
            half_open_success_count: 0,
            circuit_opened_at: None,
            last_transition_at: now,
            version: 0,
        }
    }
}

/// Thresholds driving breaker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_half_open_success_threshold() -> u32 {
    1
}

fn default_cooldown_secs() -> u64 {
    30
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            half_open_success_threshold: default_half_open_success_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [CircuitStatus::Closed, CircuitStatus::Open, CircuitStatus::HalfOpen] {
            assert_eq!(status.as_str().parse::<CircuitStatus>().unwrap(), status);
        }
        assert!("ajar".parse::<CircuitStatus>().is_err());
    }

    #[test]
    fn test_config_defaults_from_empty_toml() {
        let config: CircuitBreakerConfig = toml::from_str("").unwrap();
        assert_eq!(config, CircuitBreakerConfig::default());
        assert_eq!(config.cooldown(), Duration::from_secs(30));
    }
}

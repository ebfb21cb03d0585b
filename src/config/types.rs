//! Configuration type definitions.
//!
//! This module contains the engine configuration (dosewatch.yaml) and its
//! conversion into runtime settings. The storage backend is not part of it:
//! callers construct the store they pass to the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::retry::RetryPolicy;
use crate::core::schedule::ScheduleCalculator;
use crate::scheduler::EngineSettings;
use crate::storage::DEFAULT_PAGE_SIZE;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// IANA timezone wall-clock rules are evaluated in.
    pub timezone: String,
    /// How long after its fire-time an occurrence is still delivered.
    pub grace_window_secs: u64,
    /// Upper bound for a single store call.
    pub store_timeout_ms: u64,
    /// Upper bound for a single timer call.
    pub timer_timeout_ms: u64,
    /// Reminders reconciled concurrently.
    pub max_parallel_reconciles: usize,
    /// How long a recovery trigger waits before deferring its pass.
    pub recovery_budget_ms: u64,
    /// Backoff for storage failures.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".into(),
            grace_window_secs: 600,
            store_timeout_ms: 5_000,
            timer_timeout_ms: 2_000,
            max_parallel_reconciles: 4,
            recovery_budget_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the delay between retries in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl EngineConfig {
    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ScheduleCalculator::new(&self.timezone)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.max_parallel_reconciles == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_parallel_reconciles cannot be zero".into(),
            ));
        }
        if self.store_timeout_ms == 0 || self.timer_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "store and timer timeouts must be positive".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "retry initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Calculator for the configured timezone.
    pub fn calculator(&self) -> Result<ScheduleCalculator, ConfigError> {
        ScheduleCalculator::new(&self.timezone).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Runtime settings for the engine.
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            grace_window: Duration::from_secs(self.grace_window_secs),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            timer_timeout: Duration::from_millis(self.timer_timeout_ms),
            max_parallel_reconciles: self.max_parallel_reconciles,
            page_size: DEFAULT_PAGE_SIZE,
            retry: self.retry.to_policy(),
        }
    }

    pub fn recovery_budget(&self) -> Duration {
        Duration::from_millis(self.recovery_budget_ms)
    }
}

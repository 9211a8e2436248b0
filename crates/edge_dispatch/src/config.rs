//! Configuration for the dispatch core.
//!
//! All settings deserialize with defaults so a host can embed
//! [`DispatchConfig`] in its own TOML file and override only what it needs.

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_error_threshold() -> u32 { 10 }
fn default_error_log_interval_ms() -> u64 { 30_000 }
fn default_poll_interval_ms() -> u64 { 1_000 }

fn default_initial_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_factor() -> f64 { 2.0 }

fn default_pre_read_timeout_ms() -> u64 { 5_000 }

/// Settings of the dispatch engine and event mediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Consecutive dispatch failures tolerated before a key is suppressed
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Minimum interval between failure logs for one key
    #[serde(default = "default_error_log_interval_ms")]
    pub error_log_interval_ms: u64,
    /// Poll interval used when a subscription declares `0`
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Event mediator settings
    #[serde(default)]
    pub mediator: MediatorConfig,
}

/// Exponential backoff settings used after a connection fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

/// Event mediator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// Upper bound for a single pre-read
    #[serde(default = "default_pre_read_timeout_ms")]
    pub pre_read_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            error_log_interval_ms: default_error_log_interval_ms(),
            default_poll_interval_ms: default_poll_interval_ms(),
            reconnect: ReconnectConfig::default(),
            mediator: MediatorConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            pre_read_timeout_ms: default_pre_read_timeout_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Converts the settings into a [`BackoffPolicy`].
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            factor: self.factor,
        }
    }
}

impl MediatorConfig {
    pub fn pre_read_timeout(&self) -> Duration {
        Duration::from_millis(self.pre_read_timeout_ms)
    }
}

impl DispatchConfig {
    pub fn error_log_interval(&self) -> Duration {
        Duration::from_millis(self.error_log_interval_ms)
    }

    /// Resolves a declared poll interval, replacing `0` with the default.
    pub fn effective_poll_interval(&self, declared_ms: u64) -> Duration {
        if declared_ms == 0 {
            Duration::from_millis(self.default_poll_interval_ms)
        } else {
            Duration::from_millis(declared_ms)
        }
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold == 0 {
            return Err(ConfigError::Invalid(
                "error_threshold must be greater than 0".to_string(),
            ));
        }

        if self.default_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect delays must satisfy 0 < initial ({}) <= max ({})",
                reconnect.initial_delay_ms, reconnect.max_delay_ms
            )));
        }

        if !reconnect.factor.is_finite() || reconnect.factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect factor must be >= 1.0, got {}",
                reconnect.factor
            )));
        }

        if self.mediator.pre_read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pre_read_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

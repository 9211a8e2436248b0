//! Configuration management for the edge host.
//!
//! This module handles loading and validation of the host configuration
//! from TOML files. The dispatch core's own settings are embedded unchanged
//! under `[dispatch]`.

use edge_dispatch::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

fn default_stats_interval_ms() -> u64 { 10_000 }
fn default_report_interval_ms() -> u64 { 30_000 }
fn default_deadband() -> f64 { 0.5 }
fn default_update_interval_ms() -> u64 { 1_000 }
fn default_kind() -> String { "plc".to_string() }
fn default_step() -> f64 { 1.0 }

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dispatch core settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Host behaviour settings
    #[serde(default)]
    pub host: HostSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
    /// Simulated connections
    #[serde(default)]
    pub connections: Vec<ConnectionSettings>,
}

/// Host behaviour: monitoring cadence and built-in handler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Interval between health log lines
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Interval between on-demand `line_report` events (0 to disable)
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    /// Deadband of the tag monitor subscriptions
    #[serde(default = "default_deadband")]
    pub deadband: f64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
    /// Optional file path for log output (None means stdout only)
    pub file_path: Option<String>,
}

/// One simulated connection and the tags it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Interval between simulated value changes
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default)]
    pub tags: Vec<TagSettings>,
}

/// A simulated tag ramping between `min` and `max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSettings {
    pub key: String,
    pub min: f64,
    pub max: f64,
    /// Change per update
    #[serde(default = "default_step")]
    pub step: f64,
    /// Raises `over_limit` when the value exceeds this threshold
    #[serde(default)]
    pub alarm_above: Option<f64>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            stats_interval_ms: default_stats_interval_ms(),
            report_interval_ms: default_report_interval_ms(),
            deadband: default_deadband(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            host: HostSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
                file_path: None,
            },
            connections: vec![ConnectionSettings {
                name: "plc1".to_string(),
                kind: default_kind(),
                update_interval_ms: default_update_interval_ms(),
                tags: vec![
                    TagSettings {
                        key: "line1/temperature".to_string(),
                        min: 60.0,
                        max: 95.0,
                        step: 2.5,
                        alarm_above: Some(90.0),
                    },
                    TagSettings {
                        key: "line1/pressure".to_string(),
                        min: 1.0,
                        max: 4.0,
                        step: 0.2,
                        alarm_above: None,
                    },
                    TagSettings {
                        key: "line1/count".to_string(),
                        min: 0.0,
                        max: 10_000.0,
                        step: 1.0,
                        alarm_above: None,
                    },
                ],
            }],
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the specified path
    /// and returns the default configuration.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        self.dispatch.validate().map_err(|e| e.to_string())?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        if self.host.stats_interval_ms == 0 {
            return Err("host.stats_interval_ms must be greater than 0".to_string());
        }

        if !self.host.deadband.is_finite() || self.host.deadband < 0.0 {
            return Err(format!("host.deadband must be >= 0, got {}", self.host.deadband));
        }

        let mut names = HashSet::new();
        for connection in &self.connections {
            if connection.name.is_empty() {
                return Err("Connection name cannot be empty".to_string());
            }
            if !names.insert(connection.name.as_str()) {
                return Err(format!("Duplicate connection name: {}", connection.name));
            }
            if connection.update_interval_ms == 0 {
                return Err(format!(
                    "Connection {} update_interval_ms must be greater than 0",
                    connection.name
                ));
            }

            let mut keys = HashSet::new();
            for tag in &connection.tags {
                if tag.key.is_empty() || edge_dispatch::topic::has_wildcards(&tag.key) {
                    return Err(format!(
                        "Tag key {:?} on {} must be a concrete key",
                        tag.key, connection.name
                    ));
                }
                if !keys.insert(tag.key.as_str()) {
                    return Err(format!("Duplicate tag {} on {}", tag.key, connection.name));
                }
                if tag.min >= tag.max {
                    return Err(format!("Tag {} min must be less than max", tag.key));
                }
                if tag.step <= 0.0 {
                    return Err(format!("Tag {} step must be greater than 0", tag.key));
                }
            }
        }

        Ok(())
    }

    /// Every configured tag with an alarm threshold, as `(connection, key, threshold)`.
    pub fn alarm_thresholds(&self) -> Vec<(String, String, f64)> {
        self.connections
            .iter()
            .flat_map(|connection| {
                connection.tags.iter().filter_map(move |tag| {
                    tag.alarm_above
                        .map(|limit| (connection.name.clone(), tag.key.clone(), limit))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};
    use tokio::fs;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert!(config.logging.file_path.is_none());
        assert_eq!(config.host.stats_interval_ms, 10_000);
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].tags.len(), 3);
        assert_eq!(config.dispatch.error_threshold, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_alarm_thresholds() {
        let config = AppConfig::default();
        assert_eq!(
            config.alarm_thresholds(),
            [("plc1".to_string(), "line1/temperature".to_string(), 90.0)]
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));

        let mut config = AppConfig::default();
        config.connections.push(config.connections[0].clone());
        assert!(config.validate().unwrap_err().contains("Duplicate connection"));

        let mut config = AppConfig::default();
        config.connections[0].tags[0].key = "line1/+".to_string();
        assert!(config.validate().unwrap_err().contains("concrete key"));

        let mut config = AppConfig::default();
        config.connections[0].tags[1].min = 10.0;
        assert!(config.validate().unwrap_err().contains("min must be less than max"));

        let mut config = AppConfig::default();
        config.dispatch.error_threshold = 0;
        assert!(config.validate().unwrap_err().contains("error_threshold"));
    }

    #[tokio::test]
    async fn test_load_partial_file_uses_defaults() {
        let file = NamedTempFile::new().unwrap();
        let content = r#"
[logging]
level = "debug"
json_format = true

[dispatch]
error_threshold = 3

[[connections]]
name = "mqtt1"
kind = "mqtt"

[[connections.tags]]
key = "site/boiler/temp"
min = 20.0
max = 80.0
"#;
        fs::write(file.path(), content).await.unwrap();

        let config = AppConfig::load_from_file(&file.path().to_path_buf()).await.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.dispatch.error_threshold, 3);
        assert_eq!(config.dispatch.default_poll_interval_ms, 1_000);
        assert_eq!(config.host.report_interval_ms, 30_000);
        assert_eq!(config.connections[0].kind, "mqtt");
        assert_eq!(config.connections[0].update_interval_ms, 1_000);
        assert_eq!(config.connections[0].tags[0].step, 1.0);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edge_host.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.connections[0].name, "plc1");

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.connections[0].tags[0].key, "line1/temperature");
        assert_eq!(reloaded.connections[0].tags[0].alarm_above, Some(90.0));
    }

    #[tokio::test]
    async fn test_invalid_toml_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "[logging\nlevel = ").await.unwrap();
        assert!(AppConfig::load_from_file(&file.path().to_path_buf()).await.is_err());
    }
}

//! Shared configuration model for the host process, the simulator harness and tests.

use crate::params::ParameterValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_service_threads")]
    pub max_service_threads: usize,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default)]
    pub machine_name: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_service_threads: default_max_service_threads(),
            status_interval_ms: default_status_interval_ms(),
            machine_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            upload_dir: default_upload_dir(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    /// Name of the registered state set driving this instance.
    pub state_set: String,
    /// Overrides for the state set's parameter groups, keyed by group then name.
    #[serde(default)]
    pub parameters: BTreeMap<String, BTreeMap<String, ParameterValue>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DriverConfig {
    pub identifier: String,
    pub kind: String,
    #[serde(default = "default_simulation")]
    pub simulation: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.max_service_threads == 0 {
            return Err(ConfigError::Invalid("runtime.max_service_threads must be >= 1".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if instance.name.is_empty() {
                return Err(ConfigError::Invalid("instance name must not be empty".to_string()));
            }
            if !seen.insert(instance.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate instance '{}'", instance.name)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for driver in &self.drivers {
            if !seen.insert(driver.identifier.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate driver '{}'", driver.identifier)));
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_max_service_threads() -> usize { 4 }
fn default_status_interval_ms() -> u64 { 5000 }
fn default_data_dir() -> String { "data".to_string() }
fn default_upload_dir() -> String { "uploads".to_string() }
fn default_scan_interval_ms() -> u64 { 1000 }
fn default_simulation() -> bool { true }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [[instances]]
            name = "main"
            state_set = "main"
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.max_service_threads, 4);
        assert_eq!(config.storage.upload_dir, "uploads");
        assert_eq!(config.instances.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_instances_are_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[instances]]
            name = "laser"
            state_set = "laser"
            [[instances]]
            name = "laser"
            state_set = "laser"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn instance_parameter_overrides() {
        let config: Config = toml::from_str(
            r#"
            [[instances]]
            name = "laser"
            state_set = "laser"
            [instances.parameters.laser]
            driver = "scanner2"
            power_w = 250.0
            "#,
        )
        .unwrap();
        let laser = &config.instances[0].parameters["laser"];
        assert_eq!(laser["driver"], ParameterValue::String("scanner2".into()));
        assert_eq!(laser["power_w"], ParameterValue::Double(250.0));
    }

    #[test]
    fn zero_service_threads_is_invalid() {
        let mut config = Config::default();
        config.runtime.max_service_threads = 0;
        assert!(config.validate().is_err());
    }
}

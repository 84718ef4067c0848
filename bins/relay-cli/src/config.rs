use librelay::config::{StorageBacking, StorageConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub hub: HubSection,
    #[serde(default)]
    pub storage: StorageSection,
    pub logging: LoggingConfig,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubSection {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    #[serde(default)]
    pub backing: Option<StorageBacking>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
    #[error("validation {0}")]
    Validation(String),
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("hub_base_url".to_string()));
        }
        if !(self.hub.base_url.starts_with("http://") || self.hub.base_url.starts_with("https://"))
        {
            return Err(ConfigError::Validation("hub_base_url".to_string()));
        }
        if self.hub.username.trim().is_empty() {
            return Err(ConfigError::Validation("hub_username".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation("poll_interval_ms".to_string()));
        }
        Ok(())
    }

    /// Environment selection applies first; the config file narrows it.
    pub fn storage_config(&self) -> Result<StorageConfig, ConfigError> {
        let mut config = StorageConfig::from_env()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        if let Some(backing) = self.storage.backing {
            config.backing = backing;
        }
        if let Some(label) = &self.storage.label {
            config.label = label.clone();
        }
        if let Some(root) = &self.storage.root {
            config.root = root.clone();
        }
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let parsed: RelayConfig = toml::from_str(&content).map_err(|_| ConfigError::Parse)?;
    parsed.validate()?;
    Ok(parsed)
}

use crate::errors::RelayError;
use librelay_store::{Backend, FsBackend, KvBackend};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const BACKING_ENV: &str = "RELAY_STORAGE_BACKING";
pub const LABEL_ENV: &str = "RELAY_STORAGE_LABEL";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBacking {
    #[default]
    Fs,
    Redis,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub backing: StorageBacking,
    pub label: String,
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backing: StorageBacking::Fs,
            label: String::new(),
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".librelay/storage"),
        _ => PathBuf::from(".librelay/storage"),
    }
}

fn parse_backing(value: &str) -> Result<StorageBacking, RelayError> {
    match value {
        "fs" => Ok(StorageBacking::Fs),
        "redis" => Ok(StorageBacking::Redis),
        other => Err(RelayError::Config(format!(
            "unknown storage backing {}",
            other
        ))),
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(BACKING_ENV) {
            if !value.is_empty() {
                config.backing = parse_backing(&value)?;
            }
        }
        if let Ok(value) = std::env::var(LABEL_ENV) {
            config.label = value;
        }
        Ok(config)
    }

    pub fn open_backend(&self) -> Arc<dyn Backend> {
        match self.backing {
            StorageBacking::Fs => Arc::new(FsBackend::new(&self.root, &self.label)),
            // The key-value flavor runs against an in-process map; a real
            // redis deployment plugs in through the same Backend trait.
            StorageBacking::Redis => Arc::new(KvBackend::new(&self.label)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_backings() {
        assert_eq!(parse_backing("fs").expect("fs"), StorageBacking::Fs);
        assert_eq!(parse_backing("redis").expect("redis"), StorageBacking::Redis);
        assert!(parse_backing("dynamo").is_err());
    }

    #[test]
    fn default_root_is_under_librelay() {
        let config = StorageConfig::default();
        assert!(config.root.ends_with(".librelay/storage"));
        assert!(config.label.is_empty());
    }
}

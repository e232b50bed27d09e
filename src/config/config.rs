use std::path::{Path, PathBuf};

use dimse::{DimseConfig, Endpoint};
use serde::Deserialize;

use crate::config::logging_config::LoggingConfig;
use crate::storage::StorageConfig;

/// Top-level application configuration, loaded from TOML
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Association parameters shared by every DIMSE operation
    #[serde(default)]
    pub network: DimseConfig,

    /// This node: calling AE for outbound operations, listener for the storage SCP
    pub local: Endpoint,

    /// Default peer for echo, find, move and export
    #[serde(default)]
    pub remote: Option<Endpoint>,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[network]: {0}")]
    InvalidNetwork(String),

    #[error("[local]: {0}")]
    InvalidLocal(String),

    #[error("[remote]: {0}")]
    InvalidRemote(String),

    #[error("no [remote] section configured")]
    MissingRemote,

    #[error("[storage]: {0}")]
    InvalidStorage(String),
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network
            .validate()
            .map_err(|e| ConfigError::InvalidNetwork(e.to_string()))?;

        let mut local = self.local.clone();
        local.is_server = true;
        local
            .validate()
            .map_err(|e| ConfigError::InvalidLocal(e.to_string()))?;

        if let Some(remote) = &self.remote {
            remote
                .validate()
                .map_err(|e| ConfigError::InvalidRemote(e.to_string()))?;
        }

        if self.storage.path.trim().is_empty() {
            return Err(ConfigError::InvalidStorage("path cannot be empty".into()));
        }

        Ok(())
    }

    /// The configured peer, required by every outbound command
    pub fn remote(&self) -> Result<&Endpoint, ConfigError> {
        self.remote.as_ref().ok_or(ConfigError::MissingRemote)
    }

    /// Local endpoint in the listener role
    pub fn listener(&self) -> Endpoint {
        Endpoint {
            is_server: true,
            ..self.local.clone()
        }
    }
}

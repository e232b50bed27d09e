//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::DEFAULT_TRANSFER_SYNTAXES;
use crate::error::{DimseError, Result};
use crate::DEFAULT_DIMSE_PORT;

/// Network parameters shared by every association this crate opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Single timeout, in seconds, applied to association setup, DIMSE reads,
    /// network idle and TCP connect
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Number of concurrent patient associations during an export
    #[serde(default = "default_export_pool_size")]
    pub export_pool_size: usize,

    /// Retries of a single file after a transport timeout
    #[serde(default = "default_max_store_retries")]
    pub max_store_retries: u32,

    /// Transfer syntaxes offered in every presentation context (in order of preference)
    #[serde(default = "default_transfer_syntaxes")]
    pub transfer_syntaxes: Vec<String>,
}

/// Timeout budgets for one association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub acse: Duration,
    pub dimse: Duration,
    pub network: Duration,
    pub connect: Duration,
}

impl Timeouts {
    /// All four budgets set to the same value
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            acse: timeout,
            dimse: timeout,
            network: timeout,
            connect: timeout,
        }
    }
}

/// A DICOM network peer: address, port and Application Entity title
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address or hostname
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application Entity title
    pub ae_title: String,

    /// Whether this endpoint plays the SCP (listener) role
    #[serde(default)]
    pub is_server: bool,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_pdu: default_max_pdu(),
            export_pool_size: default_export_pool_size(),
            max_store_retries: default_max_store_retries(),
            transfer_syntaxes: default_transfer_syntaxes(),
        }
    }
}

impl DimseConfig {
    /// Get the global timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timeout budgets derived from the global timeout
    pub fn timeouts(&self) -> Timeouts {
        Timeouts::uniform(self.timeout())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(DimseError::config("Timeout must be at least one second"));
        }

        if self.max_pdu < 4096 || self.max_pdu > 131072 {
            return Err(DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if self.export_pool_size == 0 {
            return Err(DimseError::config("Export pool size must be greater than 0"));
        }

        if self.transfer_syntaxes.is_empty() {
            return Err(DimseError::config("At least one transfer syntax is required"));
        }

        Ok(())
    }
}

impl Endpoint {
    /// Create a client-role endpoint
    pub fn new(address: impl Into<String>, port: u16, ae_title: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            ae_title: ae_title.into(),
            is_server: false,
        }
    }

    /// Create a server-role endpoint
    pub fn server(address: impl Into<String>, port: u16, ae_title: impl Into<String>) -> Self {
        Self {
            is_server: true,
            ..Self::new(address, port, ae_title)
        }
    }

    /// `host:port` form used to open the TCP connection
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Validate the endpoint description
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.address.trim().is_empty() {
            return Err(DimseError::config("Endpoint address cannot be empty"));
        }

        // port 0 is only meaningful for a listener asking for an ephemeral port
        if self.port == 0 && !self.is_server {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.address, self.port)
    }
}

/// AE titles are 1-16 characters of uppercase letters, digits, `_` or `-`
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    if ae_title.is_empty() || ae_title.len() > 16 {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            ae_title
        )));
    }

    let valid = ae_title
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' must be uppercase alphanumeric",
            ae_title
        )));
    }

    Ok(())
}

fn default_timeout_secs() -> u64 {
    3
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_export_pool_size() -> usize {
    4
}

fn default_max_store_retries() -> u32 {
    2
}

fn default_transfer_syntaxes() -> Vec<String> {
    DEFAULT_TRANSFER_SYNTAXES.iter().map(|uid| uid.to_string()).collect()
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.timeout_secs, 3);
        assert_eq!(config.export_pool_size, 4);
        assert_eq!(config.max_store_retries, 2);
        assert_eq!(config.timeouts(), Timeouts::uniform(Duration::from_secs(3)));
        assert_eq!(config.transfer_syntaxes, DEFAULT_TRANSFER_SYNTAXES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();
        config.export_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = DimseConfig::default();
        config.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::new("10.0.0.5", 104, "PACS").validate().is_ok());
        assert!(Endpoint::new("10.0.0.5", 104, "ARCHIVE_01").validate().is_ok());
        assert!(Endpoint::new("10.0.0.5", 0, "PACS").validate().is_err());
        assert!(Endpoint::server("0.0.0.0", 0, "COURIER").validate().is_ok());
        assert!(Endpoint::new("", 104, "PACS").validate().is_err());
    }

    #[test]
    fn test_ae_title_rules() {
        assert!(validate_ae_title("STORESCP").is_ok());
        assert!(validate_ae_title("").is_err());
        assert!(validate_ae_title(&"A".repeat(17)).is_err());
        assert!(validate_ae_title("lowercase").is_err());
        assert!(validate_ae_title("WITH SPACE").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let node = Endpoint::new("localhost", 11112, "PACS");
        assert_eq!(node.to_string(), "PACS@localhost:11112");
        assert_eq!(node.socket_address(), "localhost:11112");
    }
}

#![cfg(test)]

use crate::config::config::{Config, ConfigError};

/// Parse a TOML string into a `Config` and run the validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(toml_str)?;
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_basic_config() {
    let toml = r#"
        [logging]
        log_level = "debug"

        [network]
        timeout_secs = 5
        export_pool_size = 2

        [local]
        address = "0.0.0.0"
        port = 11112
        ae_title = "COURIER"

        [remote]
        address = "10.1.2.3"
        port = 104
        ae_title = "PACS"

        [storage]
        path = "/var/lib/courier"
    "#;

    let config = load_config_from_str(toml).expect("Configuration should parse and validate");

    assert_eq!(config.logging.log_level, "debug");
    assert!(!config.logging.log_to_file);
    assert_eq!(config.network.timeout_secs, 5);
    assert_eq!(config.network.export_pool_size, 2);
    // unspecified network keys keep their defaults
    assert_eq!(config.network.max_store_retries, 2);
    assert_eq!(config.local.ae_title, "COURIER");
    assert_eq!(config.remote().unwrap().port, 104);
    assert_eq!(config.storage.path, "/var/lib/courier");
    assert!(config.listener().is_server);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml = r#"
        [local]
        address = "127.0.0.1"
        port = 0
        ae_title = "COURIER"
    "#;

    let config = load_config_from_str(toml).expect("minimal config is valid");
    assert_eq!(config.network.timeout_secs, 3);
    assert_eq!(config.network.transfer_syntaxes.len(), 3);
    assert_eq!(config.logging.log_level, "info");
    assert!(matches!(config.remote(), Err(ConfigError::MissingRemote)));
}

#[test]
fn test_invalid_ae_title_is_rejected() {
    let toml = r#"
        [local]
        address = "127.0.0.1"
        port = 11112
        ae_title = "this title is far too long"
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidLocal(_))
    ));
}

#[test]
fn test_remote_requires_port() {
    let toml = r#"
        [local]
        address = "127.0.0.1"
        port = 11112
        ae_title = "COURIER"

        [remote]
        address = "10.1.2.3"
        port = 0
        ae_title = "PACS"
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidRemote(_))
    ));
}

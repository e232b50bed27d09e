pub mod config;
pub mod storage;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;

    if config.log_to_file {
        let stdout_layer = fmt::layer().with_file(true).with_line_number(true);
        let file = std::fs::File::create(&config.log_file_path)
            .with_context(|| format!("cannot create log file {}", config.log_file_path))?;
        let file_layer = fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(Arc::new(file));

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer)
            .try_init()?;
    } else {
        let stdout_layer = fmt::layer().with_file(true).with_line_number(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()?;
    }

    Ok(())
}

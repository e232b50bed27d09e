use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_file_path")]
    pub log_file_path: String,
    /// Filter directive, overridden by `RUST_LOG` when set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file_path: default_log_file_path(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_file_path() -> String {
    "courier.log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

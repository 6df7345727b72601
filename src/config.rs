//! Configuration
//!
//! Broker and logging settings come from a TOML file, then `GEOPHOTO_*`
//! environment variables override individual keys.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Zero waits forever
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Unsubscribe the previous channel before subscribing a new one
    #[serde(default)]
    pub strict_channel_switch: bool,

    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

fn default_host() -> String {
    "broker.hivemq.com".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    // MQTT 3.1.1 brokers must accept ids of up to 23 characters
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("geophoto-{}", &id[..12])
}

fn default_keep_alive() -> u64 {
    60
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_max_payload() -> usize {
    8 * 1024 * 1024 // 8 MiB
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            operation_timeout_secs: default_operation_timeout(),
            strict_channel_switch: false,
            max_payload_bytes: default_max_payload(),
        }
    }
}

impl BrokerConfig {
    /// Configuration pointing at a specific broker
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Deadline for a single broker round trip, if any
    pub fn operation_timeout(&self) -> Option<Duration> {
        if self.operation_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.operation_timeout_secs))
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Read `path`, then apply environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// First readable file on the search path, else defaults
    ///
    /// Searches `<config dir>/geophoto/config.toml`, then `./geophoto.toml`.
    /// A file that fails to parse is skipped with a warning.
    pub fn load_default() -> Self {
        let candidates = [
            dirs::config_dir().map(|dir| dir.join("geophoto").join("config.toml")),
            Some(PathBuf::from("./geophoto.toml")),
        ];

        for path in candidates.iter().flatten().filter(|p| p.exists()) {
            match Self::load_with_env(path) {
                Ok(config) => {
                    tracing::debug!(path = %path.display(), "Loaded config file");
                    return config;
                }
                Err(e) => tracing::warn!(error = %e, "Skipping config file"),
            }
        }

        tracing::debug!("No config file found; using defaults");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("GEOPHOTO_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = var("GEOPHOTO_BROKER_PORT") {
            match port.parse() {
                Ok(port) => self.broker.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid GEOPHOTO_BROKER_PORT"),
            }
        }
        if let Some(client_id) = var("GEOPHOTO_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Some(strict) = var("GEOPHOTO_STRICT_CHANNEL") {
            self.broker.strict_channel_switch = strict == "1" || strict.eq_ignore_ascii_case("true");
        }

        if let Some(level) = var("GEOPHOTO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("GEOPHOTO_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {error}", .path.display())]
    Io { path: PathBuf, error: String },

    #[error("Invalid config in {}: {error}", .path.display())]
    Parse { path: PathBuf, error: String },
}

/// Commented config file with every key at its default
pub fn generate_default_config() -> String {
    r#"# GeoPhoto Configuration
#
# Each key can be overridden from the environment:
# - GEOPHOTO_BROKER_HOST
# - GEOPHOTO_BROKER_PORT
# - GEOPHOTO_CLIENT_ID
# - GEOPHOTO_STRICT_CHANNEL
# - GEOPHOTO_LOG_LEVEL
# - GEOPHOTO_LOG_FORMAT

[broker]
# MQTT broker host and port
host = "broker.hivemq.com"
port = 1883

# Client identifier (generated when omitted)
# client_id = "geophoto-device"

# Keep-alive interval in seconds (0 disables pings)
keep_alive_secs = 60

# Deadline for each broker round trip in seconds (0 waits forever)
operation_timeout_secs = 30

# Unsubscribe the previous channel when subscribing to a new one
strict_channel_switch = false

# Largest encoded message accepted for publishing (bytes)
max_payload_bytes = 8388608

[logging]
# Minimum level for geophoto's own logs (RUST_LOG takes precedence)
level = "info"

# "pretty" for terminals, "json" for log collectors
format = "pretty"
"#
    .to_string()
}

//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags**: applied by `main.rs` after loading
//! 2. **Environment variables**: `QRELAY_HOST`, `QRELAY_PORT`, `QRELAY_MODE`
//! 3. **Config file**: path via `--config <path>`, or `qrelay.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! host = "127.0.0.1"
//! port = 8080
//! max_duration_ms = 20000   # wall-clock ceiling of the forwarding loop
//! accept_timeout_ms = 1000
//! buffer_size = 512
//!
//! [transfer]
//! source = "message_to_send.txt"
//! destination = "message_received.txt"
//! mode = "line"             # or "burst"
//! connect_timeout_ms = 1000
//! io_timeout_ms = 1000
//! verify = true
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::endpoint::SendMode;

const DEFAULT_CONFIG_FILE: &str = "qrelay.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue point settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Host name or IP the relay binds and the clients connect to (default `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port (default 8080). `0` lets the OS pick one.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Forwarding loop ceiling in milliseconds (default 20 000).
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// How long the relay waits for each of its two peers (default 1000).
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Bytes per read, on the relay and on the writer (default 512).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Reader/writer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// File sent by the reader (default `message_to_send.txt`).
    #[serde(default = "default_source")]
    pub source: PathBuf,
    /// File written by the writer; replaced on every run (default `message_received.txt`).
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
    /// `line` (default) or `burst`.
    #[serde(default)]
    pub mode: SendMode,
    /// Client connect timeout in milliseconds (default 1000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per send/receive timeout in milliseconds (default 1000).
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Compare digests after the transfer (default true).
    #[serde(default = "default_verify")]
    pub verify: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_duration_ms() -> u64 {
    20_000
}
fn default_accept_timeout_ms() -> u64 {
    1000
}
fn default_buffer_size() -> usize {
    512
}
fn default_source() -> PathBuf {
    PathBuf::from("message_to_send.txt")
}
fn default_destination() -> PathBuf {
    PathBuf::from("message_received.txt")
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_io_timeout_ms() -> u64 {
    1000
}
fn default_verify() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_duration_ms: default_max_duration_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            destination: default_destination(),
            mode: SendMode::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            verify: default_verify(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `qrelay.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `QRELAY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("QRELAY_HOST") {
            self.relay.host = host;
        }
        if let Some(port) = lookup("QRELAY_PORT") {
            self.relay.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("QRELAY_PORT={port} is not a port")))?;
        }
        if let Some(mode) = lookup("QRELAY_MODE") {
            self.transfer.mode = match mode.to_ascii_lowercase().as_str() {
                "line" => SendMode::Line,
                "burst" => SendMode::Burst,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "QRELAY_MODE={other} (expected line or burst)"
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.buffer_size == 0 {
            return Err(ConfigError::Invalid("relay.buffer_size must be > 0".into()));
        }
        for (name, value) in [
            ("relay.max_duration_ms", self.relay.max_duration_ms),
            ("relay.accept_timeout_ms", self.relay.accept_timeout_ms),
            ("transfer.connect_timeout_ms", self.transfer.connect_timeout_ms),
            ("transfer.io_timeout_ms", self.transfer.io_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.max_duration(), Duration::from_secs(20));
        assert_eq!(config.relay.buffer_size, 512);
        assert_eq!(config.transfer.mode, SendMode::Line);
        assert_eq!(config.transfer.io_timeout(), Duration::from_secs(1));
        assert!(config.transfer.verify);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            "[relay]\nport = 9000\n\n[transfer]\nmode = \"burst\"\nverify = false\n",
        )
        .unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.transfer.mode, SendMode::Burst);
        assert!(!config.transfer.verify);
        assert_eq!(config.transfer.connect_timeout_ms, 1000);
    }

    #[test]
    fn test_parse_unknown_mode_fails() {
        assert!(toml::from_str::<Config>("[transfer]\nmode = \"chunked\"\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("QRELAY_HOST", "localhost"),
            ("QRELAY_PORT", "4242"),
            ("QRELAY_MODE", "BURST"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.relay.host, "localhost");
        assert_eq!(config.relay.port, 4242);
        assert_eq!(config.transfer.mode, SendMode::Burst);
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "QRELAY_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = Config::default();
        config.relay.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.transfer.io_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/qrelay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

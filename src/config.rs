//! Configuration loading and validation.
//!
//! The broker reads a JSON configuration file for connection settings and
//! applies environment-variable overrides for operational toggles. Startup
//! fails loudly on missing or out-of-range values — a broker with a bad
//! config must never come up half-working.
//!
//! # Sources, in priority order
//!
//! 1. Environment variables (`QSYS_HOST`, `EVENT_STORE_PATH`, ...)
//! 2. The JSON config file (`--config` path, or `{config_dir}/config.json`)
//! 3. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::constants;

/// Connection settings for the core link.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Hostname or IP of the Q-SYS core.
    pub host: String,
    /// QRC WebSocket port.
    pub port: u16,
    /// Optional username for cores with access control enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password paired with `username` - NOT serialized back to disk.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Per-command deadline in milliseconds (clamped to 30 000).
    pub timeout_ms: u64,
    /// Long-term reconnect interval in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Whether to reconnect automatically after an unexpected drop.
    pub auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            username: None,
            password: None,
            timeout_ms: constants::DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            reconnect_interval_ms: constants::RECONNECT_LONG_TERM_INTERVAL.as_millis() as u64,
            heartbeat_ms: constants::DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            auto_reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Full `wss://` URL of the QRC endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "wss://{}:{}{}",
            self.host,
            self.port,
            constants::QRC_ENDPOINT_PATH
        )
    }

    /// Command timeout as a [`Duration`], clamped to the hard maximum.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms).min(constants::MAX_COMMAND_TIMEOUT)
    }

    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Long-term reconnect interval as a [`Duration`].
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Event-recorder settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Master switch for change-event recording.
    pub enabled: bool,
    /// Directory for daily event segments (created if missing).
    pub path: PathBuf,
    /// Days of segments kept by the maintenance task (1-30).
    pub retention_days: u32,
    /// Events buffered before a flush is forced (>= 1).
    pub buffer_size: usize,
    /// Flush interval in milliseconds (>= 10).
    pub flush_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("events"),
            retention_days: constants::DEFAULT_RETENTION_DAYS,
            buffer_size: constants::DEFAULT_EVENT_BUFFER_SIZE,
            flush_interval_ms: constants::DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
        }
    }
}

/// Dispatcher settings: rate limiting, authentication, audit.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherConfig {
    /// Token-bucket refill rate, requests per minute per caller.
    pub rate_limit_rpm: u32,
    /// Token-bucket burst capacity per caller.
    pub rate_limit_burst: u32,
    /// SHA-256 hex digests of accepted API tokens.
    ///
    /// Plaintext tokens never appear in the config file; provision with
    /// `echo -n "$TOKEN" | sha256sum`.
    pub auth_tokens_hashed: Vec<String>,
    /// Tool ids callable without credentials.
    pub anonymous_allow: Vec<String>,
    /// Capacity of the in-memory audit ring.
    pub audit_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate_limit_rpm: constants::DEFAULT_RATE_LIMIT_RPM,
            rate_limit_burst: constants::DEFAULT_RATE_LIMIT_BURST,
            auth_tokens_hashed: Vec::new(),
            anonymous_allow: vec!["echo".to_string()],
            audit_capacity: constants::AUDIT_RING_CAPACITY,
        }
    }
}

/// Top-level broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Core link settings.
    pub connection: ConnectionConfig,
    /// Event-recorder settings.
    pub recorder: RecorderConfig,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `QSYS_BROKER_CONFIG_DIR` overrides the platform default
    /// (macOS: `~/Library/Application Support/qsys-broker`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = env::var("QSYS_BROKER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("qsys-broker")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration from an explicit file (or the default location),
    /// apply environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)
                .with_context(|| format!("load config file: {}", p.display()))?,
            None => {
                let default_path = Self::config_dir()?.join("config.json");
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("QSYS_HOST") {
            self.connection.host = host;
        }
        if let Ok(port) = env::var("QSYS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.connection.port = port;
            }
        }
        if let Ok(user) = env::var("QSYS_USERNAME") {
            self.connection.username = Some(user);
        }
        if let Ok(pass) = env::var("QSYS_PASSWORD") {
            self.connection.password = Some(pass);
        }

        if let Ok(enabled) = env::var("EVENT_MONITORING_ENABLED") {
            self.recorder.enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }
        if let Ok(path) = env::var("EVENT_STORE_PATH") {
            self.recorder.path = PathBuf::from(path);
        }
        if let Ok(days) = env::var("EVENT_RETENTION_DAYS") {
            if let Ok(days) = days.parse::<u32>() {
                self.recorder.retention_days = days;
            }
        }
        if let Ok(size) = env::var("EVENT_BUFFER_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                self.recorder.buffer_size = size;
            }
        }
        if let Ok(ms) = env::var("EVENT_FLUSH_INTERVAL_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.recorder.flush_interval_ms = ms;
            }
        }
    }

    /// Validate ranges and required values, failing loudly on the first
    /// problem. Called once at startup; a running broker never sees an
    /// invalid config.
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            anyhow::bail!("connection.host is required (or set QSYS_HOST)");
        }
        if self.connection.port == 0 {
            anyhow::bail!("connection.port must be non-zero");
        }
        if self.connection.username.is_some() != self.connection.password.is_some() {
            anyhow::bail!("connection.username and password must be provided together");
        }
        if !(1..=30).contains(&self.recorder.retention_days) {
            anyhow::bail!(
                "recorder.retentionDays must be within 1-30, got {}",
                self.recorder.retention_days
            );
        }
        if self.recorder.buffer_size < 1 {
            anyhow::bail!("recorder.bufferSize must be >= 1");
        }
        if self.recorder.flush_interval_ms < 10 {
            anyhow::bail!(
                "recorder.flushIntervalMs must be >= 10, got {}",
                self.recorder.flush_interval_ms
            );
        }
        if self.dispatcher.rate_limit_rpm == 0 {
            anyhow::bail!("dispatcher.rateLimitRpm must be non-zero");
        }
        if self.dispatcher.rate_limit_burst == 0 {
            anyhow::bail!("dispatcher.rateLimitBurst must be non-zero");
        }
        for (i, digest) in self.dispatcher.auth_tokens_hashed.iter().enumerate() {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                anyhow::bail!(
                    "dispatcher.authTokensHashed[{i}] is not a sha256 hex digest"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.connection.host = "192.0.2.10".to_string();
        config
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.connection.port, 443);
        assert!(config.connection.auto_reconnect);
        assert_eq!(config.recorder.retention_days, 7);
        assert_eq!(config.recorder.buffer_size, 1000);
        assert_eq!(config.dispatcher.anonymous_allow, vec!["echo"]);
    }

    #[test]
    fn test_missing_host_fails_validation() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_retention_bounds_enforced() {
        let mut config = valid_config();
        config.recorder.retention_days = 0;
        assert!(config.validate().is_err());
        config.recorder.retention_days = 31;
        assert!(config.validate().is_err());
        config.recorder.retention_days = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flush_interval_floor() {
        let mut config = valid_config();
        config.recorder.flush_interval_ms = 9;
        assert!(config.validate().is_err());
        config.recorder.flush_interval_ms = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_username_without_password_rejected() {
        let mut config = valid_config();
        config.connection.username = Some("admin".to_string());
        assert!(config.validate().is_err());
        config.connection.password = Some("hunter2".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_token_digest_rejected() {
        let mut config = valid_config();
        config.dispatcher.auth_tokens_hashed = vec!["not-a-digest".to_string()];
        assert!(config.validate().is_err());
        config.dispatcher.auth_tokens_hashed = vec!["a".repeat(64)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_qrc_url_shape() {
        let config = valid_config();
        assert_eq!(
            config.connection.url(),
            "wss://192.0.2.10:443/qrc-public-api/v0"
        );
    }

    #[test]
    fn test_command_timeout_clamped_to_hard_max() {
        let mut config = valid_config();
        config.connection.timeout_ms = 120_000;
        assert_eq!(
            config.connection.command_timeout(),
            constants::MAX_COMMAND_TIMEOUT
        );
    }

    #[test]
    fn test_password_not_serialized() {
        let mut config = valid_config();
        config.connection.username = Some("admin".to_string());
        config.connection.password = Some("secret_pw".to_string());
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(!json.contains("secret_pw"));
    }
}

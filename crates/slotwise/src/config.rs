//! Configuration management for slotwise.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults. One
//! file configures the update server, the publisher tools and the device
//! agent; each reads its own section.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::validate_name;
use crate::trust::TrustedKeys;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "slotwise";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "registry.db";

/// Environment variable prefix.
const ENV_PREFIX: &str = "SLOTWISE_";

const MIB: u64 = 1024 * 1024;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SLOTWISE_`, `__` between
///    section and key, e.g. `SLOTWISE_AGENT__DEVICE_ID`)
/// 2. TOML config file at `~/.config/slotwise/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Update server configuration.
    pub server: ServerConfig,
    /// Device agent configuration.
    pub agent: AgentConfig,
    /// Signing and verification keys.
    pub trust: TrustConfig,
}

/// Update server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    pub bind: SocketAddr,
    /// Directory holding the package store.
    /// Defaults to `~/.local/share/slotwise/server`
    pub data_dir: Option<PathBuf>,
    /// Path to the registry database.
    /// Defaults to `<data_dir>/registry.db`
    pub database_path: Option<PathBuf>,
    /// Number of per-device lock shards.
    pub lock_shards: usize,
    /// Largest byte range served in one response.
    pub max_range_bytes: u64,
}

/// Device agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the update server.
    pub server_url: String,
    /// This device's identifier. Required to run the agent.
    pub device_id: Option<String>,
    /// Update channel to follow.
    pub channel: String,
    /// Directory for the state file, slots and downloads.
    pub data_dir: PathBuf,
    /// Address of the local control API.
    pub control_bind: SocketAddr,
    /// Seconds between scheduled checks; 0 disables polling.
    pub poll_interval_secs: u64,
    /// Bytes requested per range fetch.
    pub download_chunk_bytes: u64,
    /// Attempts per network operation, including the first.
    pub max_network_attempts: u32,
    /// First retry delay.
    pub backoff_base_ms: u64,
    /// Largest retry delay.
    pub backoff_max_ms: u64,
    /// Verification failures tolerated per session.
    pub max_verify_attempts: u32,
    /// Seconds a new version has to report healthy.
    pub confirmation_window_secs: u64,
    /// Largest package the device will accept.
    pub max_package_bytes: u64,
    /// Continue from staged to applying without an explicit apply.
    pub auto_apply: bool,
    /// Program and arguments run to activate a slot.
    pub activate_command: Option<Vec<String>>,
    /// Timeout for a single HTTP request to the server.
    pub request_timeout_secs: u64,
}

/// Key configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Hex Ed25519 public keys accepted for release manifests.
    pub trusted_keys: Vec<String>,
    /// Hex Ed25519 signing key used by `slotwise publish`.
    pub signing_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8780)),
            data_dir: None, // Will be resolved to default at runtime
            database_path: None,
            lock_shards: 64,
            max_range_bytes: 8 * MIB,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8780".to_string(),
            device_id: None,
            channel: "stable".to_string(),
            data_dir: Config::default_data_dir().join("agent"),
            control_bind: SocketAddr::from(([127, 0, 0, 1], 8781)),
            poll_interval_secs: 3600,
            download_chunk_bytes: MIB,
            max_network_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_verify_attempts: 3,
            confirmation_window_secs: 300,
            max_package_bytes: 2 * 1024 * MIB,
            auto_apply: true,
            activate_command: None,
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        let config = Self::figment(&config_file).extract::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(config_file: &std::path::Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.server.lock_shards == 0 {
            return Err(invalid("server.lock_shards must be greater than 0"));
        }
        if self.server.max_range_bytes == 0 {
            return Err(invalid("server.max_range_bytes must be greater than 0"));
        }

        let agent = &self.agent;
        if agent.download_chunk_bytes == 0 {
            return Err(invalid("agent.download_chunk_bytes must be greater than 0"));
        }
        if agent.confirmation_window_secs == 0 {
            return Err(invalid(
                "agent.confirmation_window_secs must be greater than 0",
            ));
        }
        if agent.max_network_attempts == 0 || agent.max_verify_attempts == 0 {
            return Err(invalid(
                "agent.max_network_attempts and agent.max_verify_attempts must be greater than 0",
            ));
        }
        if agent.backoff_base_ms > agent.backoff_max_ms {
            return Err(invalid(format!(
                "agent.backoff_base_ms ({}) cannot be greater than agent.backoff_max_ms ({})",
                agent.backoff_base_ms, agent.backoff_max_ms
            )));
        }
        if agent.activate_command.as_ref().is_some_and(Vec::is_empty) {
            return Err(invalid("agent.activate_command cannot be empty"));
        }
        validate_name("channel", &agent.channel).map_err(|e| invalid(e.to_string()))?;
        if let Some(device_id) = &agent.device_id {
            validate_name("device id", device_id).map_err(|e| invalid(e.to_string()))?;
        }

        TrustedKeys::from_hex(&self.trust.trusted_keys)
            .map_err(|e| invalid(format!("trust.trusted_keys: {e}")))?;

        Ok(())
    }

    /// Get the server data directory, resolving defaults if not set.
    #[must_use]
    pub fn server_data_dir(&self) -> PathBuf {
        self.server
            .data_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("server"))
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.server
            .database_path
            .clone()
            .unwrap_or_else(|| self.server_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the package store directory.
    #[must_use]
    pub fn package_store_dir(&self) -> PathBuf {
        self.server_data_dir().join("packages")
    }

    /// Get the poll interval; `None` when polling is disabled.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.agent.poll_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get the per-request HTTP timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.request_timeout_secs.max(1))
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

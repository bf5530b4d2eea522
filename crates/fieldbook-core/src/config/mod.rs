//! Configuration management for Fieldbook.
//!
//! This module handles loading, saving, and managing Fieldbook configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/fieldbook/config.toml` |
//! | macOS | `~/Library/Application Support/Fieldbook/config.toml` |
//! | Windows | `%APPDATA%\Fieldbook\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldbook_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Server: {}", config.server.base_url);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Main configuration struct for Fieldbook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server endpoint settings
    pub server: ServerConfig,
    /// Connectivity monitor settings
    pub connectivity: ConnectivityConfig,
    /// Session and token settings
    pub session: SessionConfig,
    /// Sync coordinator settings
    pub sync: SyncConfig,
    /// Secure storage settings
    pub storage: StorageConfig,
}

/// Server endpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the Fieldbook server
    pub base_url: String,
    /// Authentication API path
    pub auth_path: String,
    /// User management API path
    pub user_path: String,
    /// Liveness probe path
    pub health_path: String,
    /// Replication endpoint path (per-user store appended)
    pub replication_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            auth_path: "/api/auth".to_string(),
            user_path: "/api/user".to_string(),
            health_path: "/api/health".to_string(),
            replication_path: "/db".to_string(),
        }
    }
}

impl ServerConfig {
    /// Full URL for an authentication endpoint.
    #[must_use]
    pub fn auth_url(&self, endpoint: &str) -> String {
        format!("{}{}/{endpoint}", self.base_url, self.auth_path)
    }

    /// Full URL for a user-management endpoint.
    #[must_use]
    pub fn user_url(&self, endpoint: &str) -> String {
        format!("{}{}/{endpoint}", self.base_url, self.user_path)
    }

    /// Full URL of the liveness probe.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.health_path)
    }

    /// Full URL of a remote replication store.
    #[must_use]
    pub fn replication_url(&self, store_id: &str) -> String {
        format!("{}{}/{store_id}", self.base_url, self.replication_path)
    }
}

/// Connectivity monitor configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Seed interval for retry backoff while offline
    #[serde(with = "humantime_serde")]
    pub initial_retry: Duration,
    /// Ceiling for retry backoff
    #[serde(with = "humantime_serde")]
    pub max_retry: Duration,
    /// Timeout for a single liveness probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Background re-probe interval while online
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Whether to re-probe in the background while online
    pub poll_enabled: bool,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            initial_retry: Duration::from_secs(crate::DEFAULT_INITIAL_RETRY_SECS),
            max_retry: Duration::from_secs(crate::DEFAULT_MAX_RETRY_SECS),
            probe_timeout: Duration::from_secs(crate::DEFAULT_PROBE_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            poll_enabled: true,
        }
    }
}

/// Session and token configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Margin before token expiry at which a silent refresh fires
    #[serde(with = "humantime_serde")]
    pub refresh_threshold: Duration,
    /// Session lifetime when the user asked to be remembered
    #[serde(with = "humantime_serde")]
    pub remembered_session_ttl: Duration,
    /// Session lifetime for a single sitting
    #[serde(with = "humantime_serde")]
    pub short_session_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(crate::DEFAULT_REFRESH_THRESHOLD_SECS),
            remembered_session_ttl: Duration::from_secs(crate::REMEMBERED_SESSION_TTL_SECS),
            short_session_ttl: Duration::from_secs(crate::SHORT_SESSION_TTL_SECS),
        }
    }
}

/// Sync coordinator configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Debounce window for low-priority sync-state transitions
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,
    /// Name of the local store
    pub local_store_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(crate::DEFAULT_SYNC_DEBOUNCE_MS),
            local_store_name: "fieldbook_local".to_string(),
        }
    }
}

/// Install mode of this Fieldbook instance.
///
/// Storage keys are namespaced by mode so an installed app and a portable
/// run on the same machine never read each other's sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Installed application (durable data directory)
    #[default]
    Installed,
    /// Portable/ad-hoc run
    Portable,
}

impl InstallMode {
    /// Key prefix for this mode.
    #[must_use]
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::Installed => "installed_",
            Self::Portable => "portable_",
        }
    }
}

/// Secure storage configuration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Install mode (namespaces storage keys)
    pub mode: InstallMode,
    /// Override for the data directory (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| crate::error::Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::error::Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::error::Error::ConfigError(format!("Failed to serialize config: {e}"))
        })?;

        std::fs::write(&path, content)
            .map_err(|e| crate::error::Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "fieldbook", "Fieldbook")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "fieldbook", "Fieldbook")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

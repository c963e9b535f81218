//! Configuration for teidmap
//!
//! Loaded from a TOML file (`teidmap.toml` by default). Every section and
//! field has a default, so an empty file is a valid configuration. CLI flags
//! override file values after loading.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::session_table::ExpiryPolicy;
use crate::store::RetentionPolicy;

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "teidmap.toml";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub api: ApiConfig,
    pub control_plane: SessionConfig,
    pub tunnel: SessionConfig,
    pub store: StoreConfig,
}

/// `[general]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

impl GeneralConfig {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

/// `[api]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Permit binding a non-loopback address. The API has no authentication.
    pub allow_public_bind: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allow_public_bind: false,
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Whether `host` names the loopback interface.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost")
            || self
                .host
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback())
    }
}

/// `[control_plane]` and `[tunnel]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle seconds before a transient session is swept; 0 disables
    pub session_ttl_secs: u64,
    /// Live session cap; 0 disables
    pub max_sessions: usize,
    /// Messages between sweeps in the capture loops
    pub sweep_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 600,
            max_sessions: 65_536,
            sweep_interval: 1_024,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            ttl: Duration::from_secs(self.session_ttl_secs),
            max_entries: self.max_sessions,
        }
    }
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub shards: usize,
    /// Persisted-record retention in seconds; 0 keeps records forever
    pub record_ttl_secs: u64,
    /// Seconds between retention sweeps while serving
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: crate::concurrent_map::DEFAULT_SHARDS,
            record_ttl_secs: 0,
            sweep_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            record_ttl_secs: self.record_ttl_secs,
        }
    }
}

impl Config {
    /// Parse TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `teidmap.toml` when present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.port == 0 {
            return Err(ConfigError::ValidationError(
                "api.port must be non-zero".to_string(),
            ));
        }
        if self.api.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "api.host must not be empty".to_string(),
            ));
        }
        if self.store.shards == 0 {
            return Err(ConfigError::ValidationError(
                "store.shards must be at least 1".to_string(),
            ));
        }
        for (name, section) in [("control_plane", &self.control_plane), ("tunnel", &self.tunnel)] {
            if section.sweep_interval == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.sweep_interval must be at least 1"
                )));
            }
        }
        crate::logging::validate_level(&self.general.log_level)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }
}

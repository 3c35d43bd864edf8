//! Configuration schema definitions.
//!
//! This module defines the structure of the mitm-cache-proxy configuration
//! files. Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/mitm-cache-proxy/config.toml`
//! 3. User config: `~/.config/mitm-cache-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listener settings.
    #[serde(default)]
    pub proxy: ListenerConfig,

    /// Diagnostic dump switches.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Certificate authority settings.
    #[serde(default)]
    pub ca: CaConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars are overridden when the other value differs from the
    /// built-in default.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.diagnostics.merge(other.diagnostics);
        self.cache.merge(other.cache);
        self.ca.merge(other.ca);
    }

    /// Check every value and return the listening address.
    pub fn validate(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.proxy.listen_ip()?;

        if self.proxy.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "proxy.max_connections".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.sweep_interval_secs".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.ca.validity_days <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "ca.validity_days".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(SocketAddr::new(ip, self.proxy.listen_port))
    }
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        let defaults = GeneralConfig::default();
        if !other.log_level.is_empty() && other.log_level != defaults.log_level {
            self.log_level = other.log_level;
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind.
    pub listen_address: String,

    /// Port to bind.
    pub listen_port: u16,

    /// Maximum number of client connections served at once.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8081,
            max_connections: 512,
        }
    }
}

impl ListenerConfig {
    fn merge(&mut self, other: ListenerConfig) {
        let defaults = ListenerConfig::default();
        if other.listen_address != defaults.listen_address {
            self.listen_address = other.listen_address;
        }
        if other.listen_port != defaults.listen_port {
            self.listen_port = other.listen_port;
        }
        if other.max_connections != defaults.max_connections {
            self.max_connections = other.max_connections;
        }
    }

    /// Parse the configured listen address.
    pub fn listen_ip(&self) -> Result<IpAddr, ConfigError> {
        self.listen_address
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                field: "proxy.listen_address".into(),
                message: format!("{:?}: {}", self.listen_address, e),
            })
    }
}

/// Diagnostic dump switches.
///
/// Any enabled dump serializes output across connections.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Log request and response heads.
    pub dump_headers: bool,

    /// Log POST bodies.
    pub dump_post_data: bool,

    /// Log response bodies.
    pub dump_response_data: bool,
}

impl DiagnosticsConfig {
    fn merge(&mut self, other: DiagnosticsConfig) {
        self.dump_headers |= other.dump_headers;
        self.dump_post_data |= other.dump_post_data;
        self.dump_response_data |= other.dump_response_data;
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether responses are cached at all.
    pub enabled: bool,

    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 30,
        }
    }
}

impl CacheConfig {
    fn merge(&mut self, other: CacheConfig) {
        let defaults = CacheConfig::default();
        if other.enabled != defaults.enabled {
            self.enabled = other.enabled;
        }
        if other.sweep_interval_secs != defaults.sweep_interval_secs {
            self.sweep_interval_secs = other.sweep_interval_secs;
        }
    }
}

/// Certificate authority configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaConfig {
    /// Directory receiving the installed certificates.
    ///
    /// Unset means a fresh private temporary directory per run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_dir: Option<PathBuf>,

    /// Validity of issued certificates, in days.
    pub validity_days: i64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_dir: None,
            validity_days: 1,
        }
    }
}

impl CaConfig {
    fn merge(&mut self, other: CaConfig) {
        if other.cert_dir.is_some() {
            self.cert_dir = other.cert_dir;
        }
        if other.validity_days != CaConfig::default().validity_days {
            self.validity_days = other.validity_days;
        }
    }
}

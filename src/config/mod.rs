//! Configuration system for mitm-cache-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/mitm-cache-proxy/config.toml`
//! 3. User config: `~/.config/mitm-cache-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! All files are optional except one named with `--config`.
//!
//! # Example
//!
//! ```toml
//! [proxy]
//! listen_address = "0.0.0.0"
//! listen_port = 3128
//!
//! [diagnostics]
//! dump_headers = true
//!
//! [ca]
//! cert_dir = "/var/lib/mitm-cache-proxy/certs"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    CaConfig, CacheConfig, Config, DiagnosticsConfig, GeneralConfig, ListenerConfig,
};

//! Intercepting HTTP/HTTPS proxy.
//!
//! This module provides a forward proxy with:
//! - Plain HTTP forwarding of absolute-form requests
//! - HTTP CONNECT handling with TLS interception using per-domain leaves
//! - Response caching keyed by URI and User-Agent
//! - `Set-Cookie` splitting and an `X-Proxied-By` marker on relayed responses
//!
//! # Architecture
//!
//! ```text
//!  client ──► Listener ──► connection task
//!                              │  CONNECT? ──► CertificateAuthority ──► TLS accept
//!                              │
//!                              ├─► CacheStore (GET lookup) ──► cached reply
//!                              │
//!                              └─► upstream fetch ──► relay ──► CacheStore (insert)
//! ```

pub mod connection;
pub mod error;
pub mod listener;
pub mod relay;
pub mod request;
pub mod server;
pub mod tls;
pub mod upstream;

pub use connection::{ConnectionContext, Diagnostics};
pub use error::ProxyError;
pub use server::{ProxyConfig, ProxyService, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};
pub use tls::{create_tls_acceptor, create_tls_connector};

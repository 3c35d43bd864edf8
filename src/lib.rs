//! mitm-cache-proxy: caching forward proxy with TLS interception
//!
//! This crate provides a forward HTTP/HTTPS proxy for debugging and testing.
//! Plain HTTP requests are relayed; CONNECT tunnels are intercepted by
//! terminating TLS with per-domain certificates signed by a process-lifetime
//! root. Cacheable GET responses are kept in memory.
//!
//! # Security Model
//!
//! Interception is only as trustworthy as the root certificate. The root
//! private key never leaves memory, certificates are short-lived, and every
//! installed certificate is removed when the proxy stops.
//!
//! # Architecture
//!
//! - **CA**: Root and per-domain leaf certificates
//! - **Cache**: TTL cache keyed by URI and User-Agent, with a periodic sweep
//! - **Proxy**: Listener, per-connection handler, upstream fetch and relay
//! - **Config**: Hierarchical TOML configuration

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cache;
pub mod cli;
pub mod config;
pub mod proxy;

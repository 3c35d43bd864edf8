//! Error types for proxy operations.
//!
//! This module defines structured error types for the intercepting proxy:
//! - Lifecycle errors (binding, double start/stop)
//! - Request parsing errors
//! - TLS errors (certificate issuance, handshake)
//! - Upstream errors (no response object obtained)

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error while talking to an upstream server.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed request line, header, or target.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate issuance failed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(#[from] crate::ca::CaError),

    /// Failed to bind the listening socket.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No response object could be obtained from the upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to reach.
        addr: String,
        /// Error message.
        message: String,
    },

    /// A blocking helper task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// `start` called while the proxy is running.
    #[error("Proxy is already running")]
    AlreadyRunning,

    /// `stop` called while the proxy is not running.
    #[error("Proxy is not running")]
    NotRunning,

    /// Server shutdown requested.
    #[error("Server shutdown")]
    Shutdown,
}

impl ProxyError {
    /// Whether the error is an ordinary client disconnect.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

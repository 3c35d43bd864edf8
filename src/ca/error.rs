//! Error types for certificate authority operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to root and leaf certificate issuance.
///
/// These errors occur when generating the process-lifetime root,
/// signing per-domain leaf certificates, or writing certificate files
/// into the trust directory.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to create the trust directory for certificate files.
    #[error("Failed to create certificate directory: {0}")]
    TempDir(#[source] std::io::Error),

    /// Failed to set directory permissions.
    #[error("Failed to set permissions on {path}: {source}")]
    Permissions {
        /// The path whose permissions could not be changed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to generate key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to generate the root certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// The domain cannot be expressed as a subject alternative name.
    #[error("Invalid domain for certificate: {0}")]
    InvalidDomain(String),

    /// Failed to sign a leaf certificate with the root.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),

    /// Failed to turn the issued PEM material into a TLS signing key.
    #[error("Failed to load issued certificate: {0}")]
    Load(String),

    /// Failed to write a certificate file.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_error_display() {
        let err = CaError::KeyGeneration("random number generator failed".to_string());
        assert!(err.to_string().contains("random number generator failed"));
    }

    #[test]
    fn test_write_file_error_names_path() {
        let err = CaError::WriteFile {
            path: PathBuf::from("/tmp/certs/root-ca.crt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/certs/root-ca.crt"));
        assert!(msg.contains("denied"));
    }
}

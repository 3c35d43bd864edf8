//! Certificate authority for TLS interception.
//!
//! Issues a process-lifetime self-signed root and per-domain leaf
//! certificates signed by it. Everything issued is uninstalled when the
//! proxy stops.

mod authority;
mod error;

pub use authority::{
    CaSettings, CertificateAuthority, IssuedCertificate, DEFAULT_VALIDITY_DAYS, ROOT_CERT_FILE,
    ROOT_COMMON_NAME,
};
pub use error::CaError;

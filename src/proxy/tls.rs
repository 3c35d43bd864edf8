//! TLS glue for the intercepting proxy.
//!
//! This module provides:
//! - The TLS acceptor presented to clients after a CONNECT (proxy as server)
//! - The TLS connector for upstream HTTPS fetches (proxy as client)
//!
//! # ALPN
//!
//! The acceptor only offers HTTP/1.1. The connection handler parses
//! HTTP/1.x text framing, so a client must never negotiate HTTP/2 on the
//! decrypted channel.

use super::error::ProxyError;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

/// Resolver that always presents the leaf issued for the CONNECT target.
///
/// The certificate is chosen from the CONNECT authority rather than SNI, so
/// SNI-less clients and clients connecting by IP get the same leaf.
pub struct InterceptCertResolver {
    domain: String,
    key: Arc<CertifiedKey>,
}

impl InterceptCertResolver {
    /// Create a resolver for `domain` presenting `key`.
    pub fn new(domain: impl Into<String>, key: Arc<CertifiedKey>) -> Self {
        Self {
            domain: domain.into(),
            key,
        }
    }
}

impl ResolvesServerCert for InterceptCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        trace!(
            "Presenting certificate for {} (SNI: {:?})",
            self.domain,
            client_hello.server_name()
        );
        Some(self.key.clone())
    }
}

impl std::fmt::Debug for InterceptCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptCertResolver")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Create a TLS acceptor that impersonates `domain` with `key`.
pub fn create_tls_acceptor(domain: &str, key: Arc<CertifiedKey>) -> TlsAcceptor {
    let resolver = Arc::new(InterceptCertResolver::new(domain, key));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Create a TLS connector for upstream connections.
///
/// Upstream certificates are verified against the platform root store. An
/// empty root store is not fatal: plain-HTTP proxying keeps working and
/// each HTTPS upstream fetch fails on its own.
pub fn create_tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        warn!("No system root certificates found; upstream HTTPS fetches will fail");
    } else {
        debug!("Loaded {} root certificates", root_store.len());
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaSettings, CertificateAuthority};

    #[test]
    fn test_tls_acceptor_creation() {
        let ca = CertificateAuthority::new(CaSettings::default());
        let leaf = ca.certificate_for("example.com").unwrap();
        let _acceptor = create_tls_acceptor("example.com", leaf.certified_key.clone());
    }

    #[test]
    fn test_resolver_debug_hides_key() {
        let ca = CertificateAuthority::new(CaSettings::default());
        let leaf = ca.certificate_for("example.com").unwrap();
        let resolver = InterceptCertResolver::new("example.com", leaf.certified_key.clone());
        let debug = format!("{:?}", resolver);
        assert!(debug.contains("example.com"));
    }

    #[test]
    fn test_tls_connector_creation() {
        // Succeeds even on systems without root certificates.
        let _connector = create_tls_connector();
    }

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("127.0.0.1").is_ok());
        assert!(domain_to_server_name("").is_err());
    }
}

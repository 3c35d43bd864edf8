//! Process-lifetime certificate authority for TLS interception.
//!
//! The authority owns:
//! - A self-signed root certificate, created on first use and written into
//!   the trust directory so clients can import it
//! - A `domain -> leaf certificate` map, filled lazily on the first CONNECT
//!   to each new domain
//!
//! # Security Model
//!
//! - The root private key lives only in memory
//! - A trust directory created by the authority has 0700 permissions
//! - Certificates have short validity (24 hours by default)
//! - Every issued certificate (root and leaves) is removed by `uninstall()`,
//!   which also runs when the authority is dropped
//!
//! # Example
//!
//! ```ignore
//! use mitm_cache_proxy::ca::{CaSettings, CertificateAuthority};
//!
//! let ca = CertificateAuthority::new(CaSettings::default());
//! ca.ensure_root()?;
//!
//! // Used by the connection handler after a CONNECT
//! let leaf = ca.certificate_for("api.example.com")?;
//! ```

use super::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyUsagePurpose, SanType,
};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Default validity period for issued certificates (24 hours).
pub const DEFAULT_VALIDITY_DAYS: i64 = 1;

/// Common name of the root certificate.
pub const ROOT_COMMON_NAME: &str = "mitm-cache-proxy Root CA";

/// File name of the installed root certificate inside the trust directory.
pub const ROOT_CERT_FILE: &str = "root-ca.crt";

/// Settings for the certificate authority.
#[derive(Debug, Clone)]
pub struct CaSettings {
    /// Directory that receives the installed certificates.
    ///
    /// `None` creates a fresh private temp directory per root.
    pub cert_dir: Option<PathBuf>,
    /// Validity of the root and every leaf, in days.
    pub validity_days: i64,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            cert_dir: None,
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

/// A leaf certificate issued for one intercepted domain.
pub struct IssuedCertificate {
    /// Domain the certificate was issued for (lowercase).
    pub domain: String,
    /// Subject common name of the certificate.
    pub common_name: String,
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// Certificate chain and signing key, ready for rustls.
    pub certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("domain", &self.domain)
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

/// The installed root and the files written on its behalf.
struct RootCertificate {
    /// The root key pair (for signing leaf certificates).
    key_pair: rcgen::KeyPair,
    /// The root certificate parameters (for creating the Issuer).
    params: CertificateParams,
    /// PEM-encoded root certificate.
    cert_pem: String,
    /// Trust directory holding the installed files.
    dir: PathBuf,
    /// Whether the directory was created by us and is removed wholesale.
    owns_dir: bool,
    /// Every certificate file written into `dir`.
    installed_files: Vec<PathBuf>,
}

#[derive(Default)]
struct TrustState {
    root: Option<RootCertificate>,
    leaves: HashMap<String, Arc<IssuedCertificate>>,
}

/// Certificate authority for TLS interception.
///
/// One mutex guards both the root and the leaf map, so lookup-or-create
/// for a domain is a single critical section: concurrent CONNECTs for the
/// same new domain never issue two certificates.
pub struct CertificateAuthority {
    settings: CaSettings,
    state: Mutex<TrustState>,
}

impl CertificateAuthority {
    /// Create an authority. No key material is generated until first use.
    pub fn new(settings: CaSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(TrustState::default()),
        }
    }

    /// Create the root certificate and install it, or reuse the installed one.
    ///
    /// # Errors
    ///
    /// Returns error if key generation, signing, or writing the root into
    /// the trust directory fails.
    pub fn ensure_root(&self) -> Result<(), CaError> {
        let mut state = self.lock();
        self.ensure_root_locked(&mut state)?;
        Ok(())
    }

    /// Look up the leaf certificate for `domain`, issuing one if absent.
    ///
    /// Domains are case-insensitive. The root is created first if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the certificate cannot be generated; the caller
    /// must abort TLS setup for that connection.
    pub fn certificate_for(&self, domain: &str) -> Result<Arc<IssuedCertificate>, CaError> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return Err(CaError::InvalidDomain(domain));
        }

        let mut state = self.lock();
        if let Some(existing) = state.leaves.get(&domain) {
            return Ok(existing.clone());
        }

        let validity_days = self.settings.validity_days;
        let root = self.ensure_root_locked(&mut state)?;
        let issued = Arc::new(issue_leaf(root, &domain, validity_days)?);

        let path = root.dir.join(leaf_file_name(&domain));
        write_cert_file(&path, &issued.cert_pem)?;
        root.installed_files.push(path);

        info!("Issued certificate for {}", domain);
        state.leaves.insert(domain, issued.clone());
        Ok(issued)
    }

    /// Remove every installed certificate (root and leaves).
    ///
    /// After this call the next `ensure_root()` creates a fresh root.
    pub fn uninstall(&self) {
        let mut state = self.lock();
        let issued = state.leaves.len();
        state.leaves.clear();

        let Some(root) = state.root.take() else {
            return;
        };

        if root.owns_dir {
            if let Err(e) = fs::remove_dir_all(&root.dir) {
                warn!("Failed to remove certificate directory {:?}: {}", root.dir, e);
            }
        } else {
            for file in &root.installed_files {
                if let Err(e) = fs::remove_file(file) {
                    warn!("Failed to remove certificate {:?}: {}", file, e);
                }
            }
        }

        info!("Uninstalled root certificate and {} leaf certificates", issued);
    }

    /// PEM of the installed root, if any.
    pub fn root_cert_pem(&self) -> Option<String> {
        self.lock().root.as_ref().map(|r| r.cert_pem.clone())
    }

    /// Path of the installed root certificate file, if any.
    pub fn root_cert_path(&self) -> Option<PathBuf> {
        self.lock().root.as_ref().map(|r| r.dir.join(ROOT_CERT_FILE))
    }

    /// Number of leaf certificates currently issued.
    pub fn issued_count(&self) -> usize {
        self.lock().leaves.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrustState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_root_locked<'a>(
        &self,
        state: &'a mut TrustState,
    ) -> Result<&'a mut RootCertificate, CaError> {
        if state.root.is_none() {
            state.root = Some(generate_root(&self.settings)?);
        }
        state
            .root
            .as_mut()
            .ok_or_else(|| CaError::CertGeneration("root certificate missing".into()))
    }
}

impl Drop for CertificateAuthority {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// Generate the self-signed root and write it into the trust directory.
fn generate_root(settings: &CaSettings) -> Result<RootCertificate, CaError> {
    info!("Generating root certificate");

    let (dir, owns_dir) = match &settings.cert_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(CaError::TempDir)?;
            (dir.clone(), false)
        }
        None => {
            let temp_dir = tempfile::Builder::new()
                .prefix("mitm-cache-proxy-ca-")
                .tempdir()
                .map_err(CaError::TempDir)?;
            fs::set_permissions(temp_dir.path(), fs::Permissions::from_mode(0o700)).map_err(
                |source| CaError::Permissions {
                    path: temp_dir.path().to_path_buf(),
                    source,
                },
            )?;
            (temp_dir.keep(), true)
        }
    };

    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(ROOT_COMMON_NAME.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("mitm-cache-proxy".to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(settings.validity_days);

    let cert = params
        .clone()
        .self_signed(&key_pair)
        .map_err(|e| CaError::CertGeneration(e.to_string()))?;
    let cert_pem = cert.pem();

    let root_path = dir.join(ROOT_CERT_FILE);
    write_cert_file(&root_path, &cert_pem)?;

    debug!("Root certificate installed at {:?}", root_path);

    Ok(RootCertificate {
        key_pair,
        params,
        cert_pem,
        dir,
        owns_dir,
        installed_files: vec![root_path],
    })
}

/// Sign a leaf certificate for `domain` with the root.
fn issue_leaf(
    root: &RootCertificate,
    domain: &str,
    validity_days: i64,
) -> Result<IssuedCertificate, CaError> {
    debug!("Generating certificate for {}", domain);

    let leaf_key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(domain.to_string()));
    params.distinguished_name = dn;

    let san = match domain.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(
            domain
                .try_into()
                .map_err(|_| CaError::InvalidDomain(domain.to_string()))?,
        ),
    };
    params.subject_alt_names = vec![san];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(validity_days);

    let issuer = Issuer::from_params(&root.params, &root.key_pair);
    let cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|e| CaError::Signing(e.to_string()))?;

    let cert_pem = cert.pem();
    let certified_key = Arc::new(certified_key(&cert_pem, &leaf_key.serialize_pem())?);

    Ok(IssuedCertificate {
        domain: domain.to_string(),
        common_name: domain.to_string(),
        cert_pem,
        certified_key,
    })
}

/// Build a rustls `CertifiedKey` from PEM material.
fn certified_key(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, CaError> {
    let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CaError::Load(format!("Failed to parse certificate PEM: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(CaError::Load("No certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CaError::Load(format!("Failed to parse private key PEM: {}", e)))?
        .ok_or_else(|| CaError::Load("No private key found in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| CaError::Load(format!("Failed to create signing key: {}", e)))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// File name for a leaf certificate, safe for any domain string.
fn leaf_file_name(domain: &str) -> String {
    let safe: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("site-{}.crt", safe)
}

fn write_cert_file(path: &Path, pem: &str) -> Result<(), CaError> {
    fs::write(path, pem).map_err(|source| CaError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

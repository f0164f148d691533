//! Certificate Authority management for TLS interception.
//!
//! Generates and manages the root CA certificate used to sign per-host
//! certificates on the fly.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::RwLock;
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tracing::{debug, info};

pub use crate::error::{CaError, CertificateError};

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "tapwire-ca.crt";
const CA_KEY_FILENAME: &str = "tapwire-ca.key";

/// Common name of the generated root.
const CA_COMMON_NAME: &str = "Tapwire Root CA";

/// Default number of minted host configurations kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Manages the root CA certificate on disk.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Tapwire data directory.
    pub fn with_default_dir() -> Result<Self, CaError> {
        let project_dirs = directories::ProjectDirs::from("com", "tapwire", "tapwire")
            .ok_or_else(|| CaError::Generation("Failed to get project dirs".into()))?;

        let ca_dir = project_dirs.data_dir().join("ca");
        Ok(Self::new(ca_dir))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA certificate exists, generating it if necessary.
    ///
    /// Returns an authority ready to mint host certificates.
    pub fn ensure_ca(&self) -> Result<CertificateAuthority, CaError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaError> {
        fs::create_dir_all(&self.ca_dir).map_err(|e| CaError::Write(e.to_string()))?;

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Tapwire");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let year = chrono::Utc::now().year();
        params.not_before = date_time_ymd(year - 1, 1, 1);
        params.not_after = date_time_ymd(year + 10, 1, 1);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaError::Write(e.to_string()))?;

        info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and key into an authority.
    pub fn load_authority(&self) -> Result<CertificateAuthority, CaError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(CertificateAuthority {
            issuer,
            ca_der: first_cert_der(&cert_pem)?,
            cache: RwLock::new(HashMap::new()),
            untrusted: RwLock::new(HashSet::new()),
            capacity: DEFAULT_CACHE_CAPACITY,
        })
    }

    /// Reads the CA certificate as DER bytes (for installing on devices).
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        Ok(first_cert_der(&cert_pem)?.to_vec())
    }
}

fn first_cert_der(pem: &str) -> Result<CertificateDer<'static>, CaError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| CaError::Parse("no certificate in PEM".into()))?
        .map_err(|e| CaError::Parse(e.to_string()))?;
    Ok(cert)
}

/// Mints and caches per-host TLS server configurations.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    cache: RwLock<HashMap<String, Arc<ServerConfig>>>,
    untrusted: RwLock<HashSet<String>>,
    capacity: usize,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cache.read().len())
            .field("untrusted", &self.untrusted.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CertificateAuthority {
    /// Sets how many host configurations, and how many untrusted hosts, are
    /// remembered.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns a server configuration presenting a certificate for `host`.
    ///
    /// Minted on first contact and cached afterwards.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertificateError> {
        let host = host.to_ascii_lowercase();

        if self.is_untrusted(&host) {
            return Err(CertificateError::Untrusted(host));
        }

        if let Some(config) = self.cache.read().get(&host) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(self.mint(&host)?);

        let mut cache = self.cache.write();
        if cache.len() >= self.capacity && !cache.contains_key(&host) {
            if let Some(evict) = cache.keys().next().cloned() {
                cache.remove(&evict);
            }
        }
        cache.insert(host, Arc::clone(&config));

        Ok(config)
    }

    /// Remembers that a client refused our certificate for `host`.
    pub fn mark_untrusted(&self, host: &str) {
        let host = host.to_ascii_lowercase();
        self.cache.write().remove(&host);

        let mut untrusted = self.untrusted.write();
        if untrusted.contains(&host) {
            return;
        }
        if untrusted.len() >= self.capacity {
            if let Some(evict) = untrusted.iter().next().cloned() {
                untrusted.remove(&evict);
            }
        }
        untrusted.insert(host.clone());
        info!(%host, "Client rejected minted certificate; host will be passed through");
    }

    /// Whether a client has rejected our certificate for `host`.
    pub fn is_untrusted(&self, host: &str) -> bool {
        self.untrusted.read().contains(&host.to_ascii_lowercase())
    }

    /// Number of cached host configurations.
    pub fn cached_hosts(&self) -> usize {
        self.cache.read().len()
    }

    fn mint(&self, host: &str) -> Result<ServerConfig, CertificateError> {
        if !is_supported_host(host) {
            return Err(CertificateError::UnsupportedHost(host.to_string()));
        }

        let mint_err = |e: rcgen::Error| CertificateError::Mint(e.to_string());

        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(mint_err)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let year = chrono::Utc::now().year();
        params.not_before = date_time_ymd(year - 1, 1, 1);
        params.not_after = date_time_ymd(year + 1, 12, 31);

        let key = KeyPair::generate().map_err(mint_err)?;
        let cert = params.signed_by(&key, &self.issuer).map_err(mint_err)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let chain = vec![cert.der().clone(), self.ca_der.clone()];

        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| CertificateError::Mint(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .map_err(|e| CertificateError::Mint(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(%host, "Minted leaf certificate");
        Ok(config)
    }
}

/// Hostnames we are willing to put in a certificate.
fn is_supported_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
}

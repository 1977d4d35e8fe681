//! Root CA management and on-demand leaf certificates for interception.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use rustls::SupportedProtocolVersion;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

use crate::error::{ProxyError, Result};
use crate::tls::HTTP11_ALPN;

const MAX_ISSUED_CACHE: usize = 256;

pub const CA_CERT_FILE: &str = "burrow_proxy_ca.pem";
pub const CA_KEY_FILE: &str = "burrow_proxy_ca.key";

/// Source of the certificates presented to intercepted clients.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Certificate for `name`, which may be a `*.` wildcard.
    async fn server_certificate(&self, name: &str) -> Result<Arc<IssuedCertificate>>;

    /// PEM of the root clients need to trust, when there is one.
    fn root_certificate_pem(&self) -> Option<String> {
        None
    }
}

/// A leaf certificate chain and key. The TLS server config built from it is
/// created once and shared by every handshake for the name.
pub struct IssuedCertificate {
    pub name: String,
    pub chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    server_config: once_cell::sync::OnceCell<Arc<ServerConfig>>,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("name", &self.name)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl IssuedCertificate {
    pub fn new(
        name: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            name: name.into(),
            chain,
            key,
            server_config: once_cell::sync::OnceCell::new(),
        }
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Server-side TLS config offering only `http/1.1`. The versions passed
    /// on the first call are the ones used for the lifetime of the
    /// certificate.
    pub fn server_config(
        &self,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<Arc<ServerConfig>> {
        self.server_config
            .get_or_try_init(|| {
                let mut config = ServerConfig::builder_with_protocol_versions(versions)
                    .with_no_client_auth()
                    .with_single_cert(self.chain.clone(), self.key.clone_key())
                    .map_err(|err| ProxyError::Certificate {
                        host: self.name.clone(),
                        reason: err.to_string(),
                    })?;
                config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
                Ok(Arc::new(config))
            })
            .cloned()
    }
}

/// Name to issue for `host`. With wildcards enabled, `a.example.com`
/// becomes `*.example.com`; IP addresses, hosts with fewer than three labels
/// and hosts whose first label contains `-` keep their exact name.
pub fn certificate_name(host: &str, wildcard: bool) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if !wildcard || IpAddr::from_str(&host).is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 || labels[0].contains('-') || labels[0] == "*" {
        return host;
    }
    format!("*.{}", labels[1..].join("."))
}

pub struct CertManager {
    storage_path: Option<PathBuf>,
    pub ca_cert_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    issued: Mutex<IssuedCache>,
    in_flight: DashMap<String, Arc<OnceCell<Arc<IssuedCertificate>>>>,
    generated: AtomicUsize,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("storage_path", &self.storage_path)
            .field("generated", &self.generated.load(Ordering::Relaxed))
            .finish()
    }
}

impl CertManager {
    /// Load the CA stored under `storage_path`, or generate and store a new
    /// one when none exists or the stored one has expired.
    pub fn new(storage_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = storage_path.as_ref();
        let ca_cert_path = path.join(CA_CERT_FILE);
        let ca_key_path = path.join(CA_KEY_FILE);

        let loaded = if ca_cert_path.exists() && ca_key_path.exists() {
            Self::load_root(&ca_cert_path, &ca_key_path)?
        } else {
            None
        };

        let (ca_cert, ca_key, ca_cert_pem, ca_der) = match loaded {
            Some(root) => root,
            None => {
                let (ca_cert, ca_key) = Self::generate_root()?;
                let ca_cert_pem = ca_cert.pem();
                let ca_key_pem = ca_key.serialize_pem();

                if !path.exists() {
                    fs::create_dir_all(path).context("Failed to create cert storage directory")?;
                }

                fs::write(&ca_cert_path, &ca_cert_pem).context("Failed to write CA certificate")?;
                fs::write(&ca_key_path, &ca_key_pem).context("Failed to write CA key")?;
                tracing::info!("Generated new root CA at {}", ca_cert_path.display());

                let der = ca_cert.der().clone();
                (ca_cert, ca_key, ca_cert_pem, der)
            }
        };

        Ok(Self::from_root(
            Some(path.to_path_buf()),
            ca_cert,
            ca_key,
            ca_cert_pem,
            ca_der,
        ))
    }

    /// A throwaway CA kept only in memory.
    pub fn ephemeral() -> anyhow::Result<Self> {
        let (ca_cert, ca_key) = Self::generate_root()?;
        let ca_cert_pem = ca_cert.pem();
        let der = ca_cert.der().clone();
        Ok(Self::from_root(None, ca_cert, ca_key, ca_cert_pem, der))
    }

    fn from_root(
        storage_path: Option<PathBuf>,
        ca_cert: Certificate,
        ca_key: KeyPair,
        ca_cert_pem: String,
        ca_der: CertificateDer<'static>,
    ) -> Self {
        Self {
            storage_path,
            ca_cert_pem,
            ca_cert,
            ca_key,
            ca_chain: vec![ca_der],
            issued: Mutex::new(IssuedCache::new(MAX_ISSUED_CACHE)),
            in_flight: DashMap::new(),
            generated: AtomicUsize::new(0),
        }
    }

    #[allow(clippy::type_complexity)]
    fn load_root(
        cert_path: &Path,
        key_path: &Path,
    ) -> anyhow::Result<Option<(Certificate, KeyPair, String, CertificateDer<'static>)>> {
        let ca_cert_pem =
            fs::read_to_string(cert_path).context("Failed to read CA certificate file")?;
        let ca_key_pem = fs::read_to_string(key_path).context("Failed to read CA key file")?;

        let ca_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow!("CA file contains no certificate"))?
            .context("Invalid CA PEM")?;
        let (_, parsed) = x509_parser::parse_x509_certificate(ca_der.as_ref())
            .map_err(|err| anyhow!("Failed to parse CA certificate: {err}"))?;
        if !parsed.validity().is_valid() {
            tracing::warn!(
                "Stored root CA at {} has expired; generating a new one",
                cert_path.display()
            );
            return Ok(None);
        }

        let ca_key = KeyPair::from_pem(&ca_key_pem).context("Failed to parse CA key")?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem).context("Invalid CA PEM")?;
        let ca_cert = params
            .self_signed(&ca_key)
            .context("Failed to reconstruct CA certificate")?;

        Ok(Some((ca_cert, ca_key, ca_cert_pem, ca_der)))
    }

    fn generate_root() -> anyhow::Result<(Certificate, KeyPair)> {
        // Get hostname for certificate identification
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let now = OffsetDateTime::now_utc();
        let date_str = format!(
            "{:04}-{:02}-{:02}",
            now.year(),
            now.month() as u8,
            now.day()
        );

        let common_name = format!("Burrow Proxy CA ({}, {})", hostname, date_str);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "Burrow Proxy");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate CA key")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign CA certificate")?;
        Ok((cert, key_pair))
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    pub fn ca_certificate_der(&self) -> CertificateDer<'static> {
        self.ca_chain[0].clone()
    }

    /// Number of leaf certificates generated so far.
    pub fn issued_count(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    fn cached(&self, name: &str) -> Option<Arc<IssuedCertificate>> {
        self.issued.lock().ok()?.get(name)
    }

    fn issue_leaf_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| anyhow!("Invalid hostname for certificate"))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "Burrow Proxy Intercepted");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated an hour for clock skew.
        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 3)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("Failed to sign leaf certificate")?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }
}

#[async_trait]
impl CertificateProvider for CertManager {
    async fn server_certificate(&self, name: &str) -> Result<Arc<IssuedCertificate>> {
        let name = name.to_ascii_lowercase();
        if let Some(hit) = self.cached(&name) {
            return Ok(hit);
        }

        // Concurrent handshakes for one name share a single generation.
        let cell = self
            .in_flight
            .entry(name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let issued = cell
            .get_or_try_init(|| async {
                if let Some(hit) = self.cached(&name) {
                    return Ok(hit);
                }
                let (chain, key) =
                    self.issue_leaf_cert(&name)
                        .map_err(|err| ProxyError::Certificate {
                            host: name.clone(),
                            reason: format!("{err:#}"),
                        })?;
                self.generated.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Issued interception certificate for {}", name);
                let issued = Arc::new(IssuedCertificate::new(name.clone(), chain, key));
                if let Ok(mut cache) = self.issued.lock() {
                    cache.insert(name.clone(), issued.clone());
                }
                Ok(issued)
            })
            .await
            .cloned();
        self.in_flight.remove(&name);
        issued
    }

    fn root_certificate_pem(&self) -> Option<String> {
        Some(self.ca_cert_pem.clone())
    }
}

/// Least-recently-used map of issued certificates.
struct IssuedCache {
    capacity: usize,
    map: HashMap<String, Arc<IssuedCertificate>>,
    order: VecDeque<String>,
}

impl IssuedCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<IssuedCertificate>> {
        let cert = self.map.get(key)?.clone();
        self.promote(key);
        Some(cert)
    }

    fn insert(&mut self, key: String, cert: Arc<IssuedCertificate>) {
        self.map.insert(key.clone(), cert);
        self.promote(&key);
        self.evict();
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }
}

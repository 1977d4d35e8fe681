//! Proxy configuration.
//!
//! Everything is optional on the wire: missing fields take the defaults
//! below, so `{}` is a valid configuration with one explicit endpoint on
//! `127.0.0.1:9090`.

use anyhow::{bail, Context};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::DEFAULT_BUFFER_SIZE;

/// Smallest buffer that still holds a typical ClientHello for sniffing.
const MIN_BUFFER_SIZE: usize = 1024;

/// TLS protocol versions offered on either side of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsProtocol {
    Tls12,
    Tls13,
}

/// How clients reach an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Clients are configured to use the proxy and send CONNECT or absolute URIs.
    #[default]
    Explicit,
    /// Traffic is redirected to the proxy; the destination comes from SNI or Host.
    Transparent,
}

/// One listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub bind_address: String,
    pub port: u16,
    /// Intercept TLS on this endpoint.
    pub decrypt_ssl: bool,
    /// Certificate name for transparent TLS clients that send no SNI.
    pub generic_certificate_name: Option<String>,
    /// Upstream port for transparent TLS connections.
    pub transparent_upstream_port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            kind: EndpointKind::Explicit,
            bind_address: "127.0.0.1".to_string(),
            port: 9090,
            decrypt_ssl: true,
            generic_certificate_name: None,
            transparent_upstream_port: 443,
        }
    }
}

impl EndpointConfig {
    pub fn explicit(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            ..Self::default()
        }
    }

    pub fn transparent(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: EndpointKind::Transparent,
            bind_address: bind_address.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_decrypt(mut self, decrypt_ssl: bool) -> Self {
        self.decrypt_ssl = decrypt_ssl;
        self
    }

    pub fn listen_addr(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }
}

/// A proxy the engine chains through for upstream traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalProxy {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ExternalProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// `Proxy-Authorization` value when credentials are configured.
    pub fn basic_credentials(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or("");
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        Some(format!("Basic {token}"))
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub buffer_size: usize,
    /// Idle timeout for pooled upstream connections.
    pub connection_timeout_secs: u64,
    /// Idle connections kept per destination key.
    pub max_cached_connections: usize,
    pub enable_connection_pool: bool,
    /// Extra attempts after a failed upstream connection.
    pub retries: u32,
    pub supported_tls_protocols: Vec<TlsProtocol>,
    /// Hosts never decrypted. Exact names or `*.suffix` patterns.
    pub exclude_decrypt_hosts: Vec<String>,
    /// Where the root CA lives.
    pub storage_path: Option<PathBuf>,
    pub upstream_http_proxy: Option<ExternalProxy>,
    pub upstream_https_proxy: Option<ExternalProxy>,
    pub tls_sniff_timeout_ms: u64,
    pub keep_alive_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub accept_invalid_upstream_certs: bool,
    pub wildcard_certificates: bool,
    /// Realm in Basic challenges.
    pub auth_realm: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![EndpointConfig::default()],
            buffer_size: DEFAULT_BUFFER_SIZE,
            connection_timeout_secs: 60,
            max_cached_connections: 4,
            enable_connection_pool: true,
            retries: 1,
            supported_tls_protocols: vec![TlsProtocol::Tls12, TlsProtocol::Tls13],
            exclude_decrypt_hosts: Vec::new(),
            storage_path: None,
            upstream_http_proxy: None,
            upstream_https_proxy: None,
            tls_sniff_timeout_ms: 3000,
            keep_alive_timeout_secs: 30,
            connect_timeout_secs: 10,
            accept_invalid_upstream_certs: false,
            wildcard_certificates: true,
            auth_realm: None,
        }
    }
}

impl ProxyConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid proxy configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            bail!("at least one endpoint is required");
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            bail!(
                "buffer_size must be at least {} bytes (got {})",
                MIN_BUFFER_SIZE,
                self.buffer_size
            );
        }
        if self.enable_connection_pool && self.max_cached_connections == 0 {
            bail!("max_cached_connections must be positive when pooling is enabled");
        }
        if self.supported_tls_protocols.is_empty() {
            bail!("supported_tls_protocols must not be empty");
        }
        for endpoint in &self.endpoints {
            if endpoint.bind_address.trim().is_empty() {
                bail!("endpoint on port {} has an empty bind address", endpoint.port);
            }
        }
        for pattern in &self.exclude_decrypt_hosts {
            if pattern.trim().is_empty() || pattern == "*." {
                bail!("invalid exclude_decrypt_hosts entry {:?}", pattern);
            }
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn tls_sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_sniff_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whether TLS to `host` must be tunnelled untouched.
    pub fn is_decrypt_excluded(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.exclude_decrypt_hosts.iter().any(|pattern| {
            let pattern = pattern.trim().to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .map(|rest| rest.ends_with('.'))
                    .unwrap_or(false),
                None => host == pattern,
            }
        })
    }

    /// Upstream proxy for a request, if one is configured.
    pub fn upstream_proxy_for(&self, is_https: bool) -> Option<&ExternalProxy> {
        if is_https {
            self.upstream_https_proxy.as_ref()
        } else {
            self.upstream_http_proxy.as_ref()
        }
    }
}

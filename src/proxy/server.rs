//! Proxy server: listeners, shared state and per-connection dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::SupportedProtocolVersion;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::auth::{Authenticator, DEFAULT_REALM};
use super::cert_manager::{CertManager, CertificateProvider};
use super::compression::{Compression, DefaultCompression};
use super::connect::{handle_connect, handle_transparent, ConnectOutcome};
use super::hooks::Hooks;
use super::pool::{ConnectionPool, PoolSettings};
use super::retry::RetryPolicy;
use super::session::{http_loop, LoopExit};
use super::upstream::{ConnectorSettings, TcpConnector, UpstreamConnector};
use crate::config::{EndpointConfig, EndpointKind, ProxyConfig};
use crate::error::ProxyError;
use crate::io::{AsyncIo, BoxedIo, BufferPool, BufferedStream, StreamObserver};
use crate::models::session::ConnectionInfo;
use crate::platform;
use crate::tls::protocol_versions;

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Receives every session failure.
pub type ExceptionHandler = Arc<dyn Fn(&ProxyError, SocketAddr) + Send + Sync>;

/// Logs routine client disconnects at debug and everything else at error.
pub fn log_exception(err: &ProxyError, client_addr: SocketAddr) {
    if err.is_expected_disconnect() {
        tracing::debug!("Connection from {} closed: {}", client_addr, err);
    } else {
        tracing::error!("Error handling connection from {}: {}", client_addr, err);
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
}

impl ServerStats {
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: self.clone(),
        }
    }
}

struct ConnectionGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// State shared by every session of one server.
pub(crate) struct ServerShared {
    pub config: ProxyConfig,
    pub hooks: Arc<Hooks>,
    pub authenticator: Option<Authenticator>,
    pub certificates: Option<Arc<dyn CertificateProvider>>,
    pub compression: Arc<dyn Compression>,
    pub pool: ConnectionPool,
    pub retry: RetryPolicy,
    pub buffer_pool: BufferPool,
    pub exception_handler: ExceptionHandler,
    pub stats: Arc<ServerStats>,
    /// Attached to every client stream, after TLS for decrypted tunnels.
    pub client_observer: StreamObserver,
    pub tls_versions: Vec<&'static SupportedProtocolVersion>,
    pub realm: String,
}

impl ServerShared {
    pub(crate) fn report(&self, err: &ProxyError, client_addr: SocketAddr) {
        (self.exception_handler)(err, client_addr);
    }

    /// Whether TLS to `host` arriving on `endpoint` should be intercepted.
    pub(crate) fn should_decrypt(&self, endpoint: &EndpointConfig, host: &str) -> bool {
        endpoint.decrypt_ssl
            && self.certificates.is_some()
            && !self.config.is_decrypt_excluded(host)
    }

    async fn handle_client(
        &self,
        io: BoxedIo,
        client_addr: SocketAddr,
        original_dst: Option<SocketAddr>,
        endpoint: Arc<EndpointConfig>,
        cancel: CancellationToken,
    ) {
        let _guard = self.stats.connection_opened();
        let client =
            BufferedStream::new(io, &self.buffer_pool).with_observer(self.client_observer.clone());
        let result = match endpoint.kind {
            EndpointKind::Explicit => {
                self.handle_explicit(client, client_addr, endpoint, &cancel)
                    .await
            }
            EndpointKind::Transparent => {
                handle_transparent(self, client, client_addr, original_dst, endpoint, &cancel)
                    .await
            }
        };
        if let Err(err) = result {
            self.report(&err, client_addr);
        }
    }

    /// Plain requests until a CONNECT turns the connection into a tunnel.
    async fn handle_explicit(
        &self,
        mut client: crate::io::ClientStream,
        client_addr: SocketAddr,
        endpoint: Arc<EndpointConfig>,
        cancel: &CancellationToken,
    ) -> crate::error::Result<()> {
        let info = Arc::new(ConnectionInfo {
            client_addr,
            endpoint: endpoint.clone(),
            is_https: false,
            connect_request: None,
        });
        let mut authorized = false;
        loop {
            match http_loop(self, client, info.clone(), &mut authorized, cancel).await? {
                LoopExit::Closed => return Ok(()),
                LoopExit::Connect {
                    client: returned,
                    request,
                } => {
                    match handle_connect(
                        self,
                        returned,
                        request,
                        client_addr,
                        endpoint.clone(),
                        &mut authorized,
                        cancel,
                    )
                    .await?
                    {
                        ConnectOutcome::Finished => return Ok(()),
                        ConnectOutcome::Continue(next) => client = next,
                    }
                }
            }
        }
    }
}

pub struct ProxyServerBuilder {
    config: ProxyConfig,
    hooks: Hooks,
    authenticator: Option<Authenticator>,
    certificates: Option<Arc<dyn CertificateProvider>>,
    compression: Option<Arc<dyn Compression>>,
    connector: Option<Arc<dyn UpstreamConnector>>,
    exception_handler: Option<ExceptionHandler>,
    client_observer: StreamObserver,
    server_observer: StreamObserver,
}

impl ProxyServerBuilder {
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register hooks in place.
    pub fn with_hooks(mut self, register: impl FnOnce(&mut Hooks)) -> Self {
        register(&mut self.hooks);
        self
    }

    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(provider);
        self
    }

    pub fn compression(mut self, compression: Arc<dyn Compression>) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn upstream_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Watch the bytes exchanged with clients. `on_read` sees what clients
    /// send, `on_write` what the proxy sends back. Decrypted tunnels are
    /// observed as plaintext.
    pub fn client_stream_observer(mut self, observer: StreamObserver) -> Self {
        self.client_observer = observer;
        self
    }

    /// Watch the bytes exchanged with origin servers and upstream proxies.
    /// `on_write` sees what the proxy sends, `on_read` what comes back.
    pub fn server_stream_observer(mut self, observer: StreamObserver) -> Self {
        self.server_observer = observer;
        self
    }

    pub fn exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ProxyError, SocketAddr) + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> anyhow::Result<ProxyServer> {
        self.config.validate()?;
        let config = self.config;
        let hooks = Arc::new(self.hooks);
        let buffer_pool = BufferPool::new(config.buffer_size);

        let certificates = match self.certificates {
            Some(provider) => Some(provider),
            None if config.endpoints.iter().any(|e| e.decrypt_ssl) => {
                let manager = match &config.storage_path {
                    Some(path) => CertManager::new(path)?,
                    None => CertManager::ephemeral()?,
                };
                Some(Arc::new(manager) as Arc<dyn CertificateProvider>)
            }
            None => None,
        };

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(
                TcpConnector::new(
                    ConnectorSettings::from_config(&config),
                    hooks.clone(),
                    buffer_pool.clone(),
                )
                .context("Failed to create upstream connector")?,
            ),
        };

        let pool = ConnectionPool::observed(
            connector,
            buffer_pool.clone(),
            PoolSettings::from_config(&config),
            self.server_observer,
        );
        let retry = RetryPolicy::new(config.retries, pool.clone());
        let realm = config
            .auth_realm
            .clone()
            .unwrap_or_else(|| DEFAULT_REALM.to_string());

        Ok(ProxyServer {
            shared: Arc::new(ServerShared {
                tls_versions: protocol_versions(&config.supported_tls_protocols),
                config,
                hooks,
                authenticator: self.authenticator,
                certificates,
                compression: self
                    .compression
                    .unwrap_or_else(|| Arc::new(DefaultCompression)),
                pool,
                retry,
                buffer_pool,
                exception_handler: self
                    .exception_handler
                    .unwrap_or_else(|| Arc::new(log_exception)),
                stats: Arc::new(ServerStats::default()),
                client_observer: self.client_observer,
                realm,
            }),
        })
    }
}

/// A configured proxy. Cheap to clone.
#[derive(Clone)]
pub struct ProxyServer {
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("endpoints", &self.shared.config.endpoints)
            .field("hooks", &self.shared.hooks)
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl ProxyServer {
    pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            hooks: Hooks::new(),
            authenticator: None,
            certificates: None,
            compression: None,
            connector: None,
            exception_handler: None,
            client_observer: StreamObserver::default(),
            server_observer: StreamObserver::default(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> &ServerShared {
        &self.shared
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    /// PEM of the root clients must trust for intercepted TLS.
    pub fn root_certificate_pem(&self) -> Option<String> {
        self.shared
            .certificates
            .as_ref()
            .and_then(|provider| provider.root_certificate_pem())
    }

    /// Bind every configured endpoint.
    pub async fn bind(&self) -> anyhow::Result<BoundServer> {
        let mut listeners = Vec::with_capacity(self.shared.config.endpoints.len());
        for endpoint in &self.shared.config.endpoints {
            let addr = endpoint.listen_addr();
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind proxy endpoint {}", addr))?;
            let local = listener.local_addr()?;
            tracing::info!("Proxy server listening on {} ({:?})", local, endpoint.kind);
            listeners.push((listener, Arc::new(endpoint.clone())));
        }
        Ok(BoundServer {
            shared: self.shared.clone(),
            listeners,
        })
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.bind().await?.serve(shutdown).await
    }

    /// Run one client connection to completion as if it had been accepted
    /// on `endpoint`. Failures go to the exception handler.
    pub async fn serve_connection<S>(
        &self,
        io: S,
        client_addr: SocketAddr,
        endpoint: EndpointConfig,
        cancel: CancellationToken,
    ) where
        S: AsyncIo + 'static,
    {
        self.shared
            .handle_client(Box::new(io), client_addr, None, Arc::new(endpoint), cancel)
            .await;
    }
}

/// Listeners that are bound but not yet accepting.
pub struct BoundServer {
    shared: Arc<ServerShared>,
    listeners: Vec<(TcpListener, Arc<EndpointConfig>)>,
}

impl BoundServer {
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _)| listener.local_addr().ok())
            .collect()
    }

    /// Accept on every endpoint until `shutdown` fires. Sessions in flight
    /// are cancelled with it.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let eviction = self.shared.pool.spawn_eviction(shutdown.child_token());

        let mut accept_tasks = Vec::with_capacity(self.listeners.len());
        for (listener, endpoint) in self.listeners {
            let shared = self.shared.clone();
            let shutdown = shutdown.clone();
            accept_tasks.push(tokio::spawn(accept_loop(
                shared, listener, endpoint, shutdown,
            )));
        }

        for task in accept_tasks {
            if let Err(err) = task.await {
                tracing::error!("Accept loop panicked: {}", err);
            }
        }
        if let Err(err) = eviction.await {
            tracing::error!("Pool eviction task panicked: {}", err);
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    endpoint: Arc<EndpointConfig>,
    shutdown: CancellationToken,
) {
    let listen_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!("Listener for {} has no local address: {}", endpoint.listen_addr(), err);
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!("Accept error on {}: {}", listen_addr, err);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        tracing::debug!("Connection from {} on {}", peer_addr, listen_addr);
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", peer_addr, err);
        }
        let original_dst = match endpoint.kind {
            EndpointKind::Transparent => socket
                .local_addr()
                .ok()
                .and_then(|local| platform::original_destination(local, listen_addr)),
            EndpointKind::Explicit => None,
        };

        let shared = shared.clone();
        let endpoint = endpoint.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            shared
                .handle_client(Box::new(socket), peer_addr, original_dst, endpoint, cancel)
                .await;
        });
    }

    tracing::debug!("Stopped accepting on {}", listen_addr);
}

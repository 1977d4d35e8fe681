//! Keyed pool of idle upstream connections.
//!
//! A connection is owned by the pool while idle and by exactly one session
//! while in use. The mutex only guards the idle queues; probing, connecting
//! and closing all happen outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::upstream::{UpstreamConnector, UpstreamStream};
use crate::config::{ExternalProxy, ProxyConfig};
use crate::error::Result;
use crate::io::{BufferPool, BufferedStream, StreamObserver};
use crate::models::http::HttpVersion;

/// How often idle connections are swept.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(3);

const DISPOSE_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connections are only shared between requests with equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub is_https: bool,
    pub version: HttpVersion,
    pub alpn: Option<String>,
    pub upstream_proxy: Option<ExternalProxy>,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16, is_https: bool) -> Self {
        Self {
            host: host.into(),
            port,
            is_https,
            version: HttpVersion::Http11,
            alpn: is_https.then(|| "http/1.1".to_string()),
            upstream_proxy: None,
        }
    }

    pub fn via(mut self, proxy: Option<ExternalProxy>) -> Self {
        self.upstream_proxy = proxy;
        self
    }

    /// Plain HTTP through an upstream proxy sends absolute-form targets.
    pub fn uses_absolute_form(&self) -> bool {
        !self.is_https && self.upstream_proxy.is_some()
    }
}

/// An upstream connection checked out of (or headed back to) the pool.
#[derive(Debug)]
pub struct PooledConnection {
    pub id: u64,
    pub key: ConnectionKey,
    pub negotiated_alpn: Option<String>,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
    pub stream: BufferedStream<UpstreamStream>,
    pub created_at: Instant,
    pub last_access: Instant,
    /// Exchanges completed on this connection.
    pub uses: u32,
}

impl PooledConnection {
    /// True when the connection already served an earlier exchange.
    pub fn is_reused(&self) -> bool {
        self.uses > 0
    }

    /// Non-blocking liveness probe: a pending read means the peer is quiet
    /// and the socket is still usable. EOF, stray bytes or an error mean it
    /// is not.
    pub fn is_alive(&mut self) -> bool {
        if self.stream.is_closed() || self.stream.available() > 0 {
            return false;
        }
        self.stream.fill_buffer().now_or_never().is_none()
    }

    fn can_idle(&self) -> bool {
        !self.stream.is_closed() && self.stream.available() == 0
    }
}

/// Pool behaviour derived from the proxy configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub enabled: bool,
    pub max_per_key: usize,
    pub idle_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            enabled: config.enable_connection_pool,
            max_per_key: config.max_cached_connections.max(1),
            idle_timeout: config.connection_timeout(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub created: AtomicU64,
    pub reused: AtomicU64,
    pub disposed: AtomicU64,
}

struct PoolShared {
    idle: Mutex<HashMap<ConnectionKey, VecDeque<PooledConnection>>>,
    connector: Arc<dyn UpstreamConnector>,
    buffer_pool: BufferPool,
    settings: PoolSettings,
    stats: PoolStats,
    observer: StreamObserver,
}

#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.shared.settings)
            .field("idle", &self.total_idle())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        buffer_pool: BufferPool,
        settings: PoolSettings,
    ) -> Self {
        Self::observed(connector, buffer_pool, settings, StreamObserver::default())
    }

    /// Like [`new`](Self::new), with `observer` attached to every upstream
    /// stream the pool opens.
    pub fn observed(
        connector: Arc<dyn UpstreamConnector>,
        buffer_pool: BufferPool,
        settings: PoolSettings,
        observer: StreamObserver,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(HashMap::new()),
                connector,
                buffer_pool,
                settings,
                stats: PoolStats::default(),
                observer,
            }),
        }
    }

    /// Observer for upstream streams opened outside the pool, such as raw
    /// tunnels.
    pub fn stream_observer(&self) -> &StreamObserver {
        &self.shared.observer
    }

    pub fn connector(&self) -> &Arc<dyn UpstreamConnector> {
        &self.shared.connector
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Reuse the newest live idle connection for `key`, or connect.
    pub async fn acquire(&self, key: &ConnectionKey) -> Result<PooledConnection> {
        if self.shared.settings.enabled {
            while let Some(mut conn) = self.pop_idle(key) {
                if conn.is_alive() {
                    conn.last_access = Instant::now();
                    self.shared.stats.reused.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "reusing upstream connection {} to {}:{}",
                        conn.id,
                        key.host,
                        key.port
                    );
                    return Ok(conn);
                }
                tracing::debug!("discarding stale upstream connection {}", conn.id);
                self.dispose(conn).await;
            }
        }
        self.create(key).await
    }

    /// Always open a new connection.
    pub async fn create(&self, key: &ConnectionKey) -> Result<PooledConnection> {
        let established = self.shared.connector.connect(key).await?;
        let now = Instant::now();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "opened upstream connection {} to {}:{}",
            id,
            key.host,
            key.port
        );
        Ok(PooledConnection {
            id,
            key: key.clone(),
            negotiated_alpn: established.negotiated_alpn,
            tls_version: established.tls_version,
            cipher: established.cipher,
            stream: BufferedStream::new(established.stream, &self.shared.buffer_pool)
                .with_observer(self.shared.observer.clone()),
            created_at: now,
            last_access: now,
            uses: 0,
        })
    }

    /// Hand a connection back after an exchange.
    pub async fn release(&self, mut conn: PooledConnection) {
        if !self.shared.settings.enabled || !conn.can_idle() {
            self.dispose(conn).await;
            return;
        }
        conn.last_access = Instant::now();
        conn.uses += 1;

        let evicted = match self.shared.idle.lock() {
            Ok(mut idle) => {
                let queue = idle.entry(conn.key.clone()).or_default();
                queue.push_back(conn);
                if queue.len() > self.shared.settings.max_per_key {
                    queue.pop_front()
                } else {
                    None
                }
            }
            Err(_) => Some(conn),
        };
        if let Some(old) = evicted {
            self.dispose(old).await;
        }
    }

    /// Close a connection for good.
    pub async fn dispose(&self, mut conn: PooledConnection) {
        self.shared.stats.disposed.fetch_add(1, Ordering::Relaxed);
        let shutdown = conn.stream.get_mut().shutdown();
        if let Ok(Err(err)) = tokio::time::timeout(DISPOSE_TIMEOUT, shutdown).await {
            tracing::debug!("closing upstream connection {}: {}", conn.id, err);
        }
    }

    /// Close idle connections older than the idle timeout. Returns how many
    /// were closed.
    pub async fn evict_idle(&self) -> usize {
        let timeout = self.shared.settings.idle_timeout;
        let mut expired = Vec::new();
        if let Ok(mut idle) = self.shared.idle.lock() {
            for queue in idle.values_mut() {
                let (stale, fresh): (VecDeque<_>, VecDeque<_>) = queue
                    .drain(..)
                    .partition(|conn| conn.last_access.elapsed() > timeout);
                *queue = fresh;
                expired.extend(stale);
            }
            idle.retain(|_, queue| !queue.is_empty());
        }

        let count = expired.len();
        for conn in expired {
            self.dispose(conn).await;
        }
        if count > 0 {
            tracing::debug!("evicted {} idle upstream connections", count);
        }
        count
    }

    /// Close every idle connection.
    pub async fn clear(&self) {
        let drained: Vec<PooledConnection> = match self.shared.idle.lock() {
            Ok(mut idle) => idle.drain().flat_map(|(_, queue)| queue).collect(),
            Err(_) => Vec::new(),
        };
        for conn in drained {
            self.dispose(conn).await;
        }
    }

    pub fn idle_count(&self, key: &ConnectionKey) -> usize {
        self.shared
            .idle
            .lock()
            .map(|idle| idle.get(key).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.shared
            .idle
            .lock()
            .map(|idle| idle.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Sweep idle connections every [`EVICTION_INTERVAL`] until `cancel`
    /// fires, then close whatever is left.
    pub fn spawn_eviction(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.evict_idle().await;
                    }
                }
            }
            pool.clear().await;
        })
    }

    fn pop_idle(&self, key: &ConnectionKey) -> Option<PooledConnection> {
        let mut idle = self.shared.idle.lock().ok()?;
        let queue = idle.get_mut(key)?;
        let conn = queue.pop_back();
        if queue.is_empty() {
            idle.remove(key);
        }
        conn
    }
}

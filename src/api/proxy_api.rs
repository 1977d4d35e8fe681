//! Proxy control API
//!
//! Process-wide start/stop of a single proxy instance plus the logging
//! bootstrap and system-proxy helpers an embedding application calls.

use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::{EndpointKind, ProxyConfig};
use crate::platform::{self, CertTrustStatus};
use crate::proxy::{
    Authenticator, CertManager, CertificateProvider, ExceptionHandler, Hooks, ProxyServer,
    ServerStats,
};

/// Ports tried after the requested one is taken.
const PORT_SEARCH_RANGE: u16 = 20;

struct RunningProxy {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<ServerStats>,
    listen_addr: SocketAddr,
}

static RUNNING_PROXY: Lazy<Mutex<Option<RunningProxy>>> = Lazy::new(|| Mutex::new(None));

/// Last configured (port, bind_address), reported while stopped.
static CURRENT_PROXY_CONFIG: Lazy<RwLock<(u16, String)>> =
    Lazy::new(|| RwLock::new((9090, "127.0.0.1".to_string())));

/// Get the version of the proxy library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
/// `log_dir` receives daily log files in release builds.
#[allow(unused_variables)]
pub fn init_core(log_dir: Option<String>) -> anyhow::Result<()> {
    #[cfg(debug_assertions)]
    {
        // Debug mode: log to console (stderr)
        let level = resolve_log_level();
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        use anyhow::Context;

        let level = resolve_log_level();
        let log_dir = log_dir
            .map(|p| PathBuf::from(p).join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"));

        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "burrow_proxy");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Logging lasts until process exit.
        std::mem::forget(guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("Burrow proxy initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => parse_level(&val),
        Err(_) => LevelFilter::INFO,
    }
}

fn parse_level(value: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

pub fn create_default_config() -> ProxyConfig {
    ProxyConfig::default()
}

/// Extension points applied when the proxy starts.
pub struct StartOptions {
    pub hooks: Hooks,
    pub authenticator: Option<Authenticator>,
    pub certificate_provider: Option<Arc<dyn CertificateProvider>>,
    pub exception_handler: Option<ExceptionHandler>,
    /// Move the first explicit endpoint to the next free port when its
    /// port is taken.
    pub find_free_port: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            hooks: Hooks::default(),
            authenticator: None,
            certificate_provider: None,
            exception_handler: None,
            find_free_port: true,
        }
    }
}

/// Proxy status information
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProxyStatus {
    pub is_running: bool,
    pub port: u16,
    pub bind_address: String,
    pub active_connections: u32,
    pub total_requests: u64,
}

/// Get current proxy status
pub fn get_proxy_status() -> ProxyStatus {
    let guard = RUNNING_PROXY.lock().unwrap_or_else(|p| p.into_inner());
    match guard.as_ref() {
        Some(running) if !running.task.is_finished() => ProxyStatus {
            is_running: true,
            port: running.listen_addr.port(),
            bind_address: running.listen_addr.ip().to_string(),
            active_connections: running.stats.active_connections() as u32,
            total_requests: running.stats.total_requests(),
        },
        _ => {
            let (port, bind_address) = CURRENT_PROXY_CONFIG
                .read()
                .map(|current| current.clone())
                .unwrap_or_else(|p| p.into_inner().clone());
            ProxyStatus {
                is_running: false,
                port,
                bind_address,
                active_connections: 0,
                total_requests: guard
                    .as_ref()
                    .map(|running| running.stats.total_requests())
                    .unwrap_or(0),
            }
        }
    }
}

pub fn is_running() -> bool {
    get_proxy_status().is_running
}

/// Start the proxy server in the background.
/// Starting while already running is a no-op.
pub async fn start_proxy(mut config: ProxyConfig, options: StartOptions) -> anyhow::Result<()> {
    if is_running() {
        tracing::info!("Proxy already running");
        return Ok(());
    }

    if options.find_free_port {
        if let Some(endpoint) = config
            .endpoints
            .iter_mut()
            .find(|e| e.kind == EndpointKind::Explicit && e.port != 0)
        {
            let selected =
                find_available_port(&endpoint.bind_address, endpoint.port, PORT_SEARCH_RANGE)
                    .await?;
            if selected != endpoint.port {
                tracing::warn!("Port {} in use, falling back to {}", endpoint.port, selected);
                endpoint.port = selected;
            }
        }
    }

    let mut builder = ProxyServer::builder(config).hooks(options.hooks);
    if let Some(authenticator) = options.authenticator {
        builder = builder.authenticator(authenticator);
    }
    if let Some(provider) = options.certificate_provider {
        builder = builder.certificate_provider(provider);
    }
    if let Some(handler) = options.exception_handler {
        builder = builder.exception_handler(move |err, addr| handler(err, addr));
    }
    let server = builder.build()?;
    let bound = server.bind().await?;
    let listen_addr = bound
        .local_addrs()
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("proxy has no endpoints"))?;

    let shutdown = CancellationToken::new();
    let serve_token = shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = bound.serve(serve_token).await {
            tracing::error!("Proxy server error: {}", e);
        }
    });

    {
        let mut current = CURRENT_PROXY_CONFIG
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *current = (listen_addr.port(), listen_addr.ip().to_string());
    }

    let previous = {
        let mut guard = RUNNING_PROXY.lock().unwrap_or_else(|p| p.into_inner());
        guard.replace(RunningProxy {
            shutdown,
            task,
            stats: server.stats(),
            listen_addr,
        })
    };
    // A concurrent start won the race; only one instance stays up.
    if let Some(previous) = previous {
        previous.shutdown.cancel();
        let _ = previous.task.await;
    }

    tracing::info!("Proxy started on {}", listen_addr);
    Ok(())
}

async fn find_available_port(
    bind_address: &str,
    start_port: u16,
    max_tries: u16,
) -> anyhow::Result<u16> {
    use std::io::ErrorKind;

    for offset in 0..max_tries {
        let candidate = start_port.saturating_add(offset);
        match TcpListener::bind((bind_address, candidate)).await {
            Ok(listener) => {
                drop(listener); // release so the real server can bind
                return Ok(candidate);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => continue,
            Err(err) => {
                anyhow::bail!("Failed to bind to {}:{}: {}", bind_address, candidate, err)
            }
        }
    }

    anyhow::bail!(
        "No available port found in range {}-{}",
        start_port,
        start_port.saturating_add(max_tries.saturating_sub(1))
    )
}

/// Stop the proxy server and wait for its listeners to close.
pub async fn stop_proxy() -> anyhow::Result<()> {
    let running = RUNNING_PROXY
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
    let Some(running) = running else {
        tracing::debug!("Proxy not running");
        return Ok(());
    };
    tracing::info!("Stopping proxy on {}", running.listen_addr);
    running.shutdown.cancel();
    running
        .task
        .await
        .map_err(|e| anyhow::anyhow!("proxy task failed: {}", e))
}

/// Ensure the root CA exists in `storage_path` and return its PEM.
pub fn get_root_ca_pem(storage_path: String) -> anyhow::Result<String> {
    Ok(CertManager::new(PathBuf::from(storage_path))?.ca_cert_pem)
}

/// System proxy + certificate helpers
pub async fn enable_system_proxy(host: String, port: u16) -> anyhow::Result<()> {
    task::spawn_blocking(move || platform::enable_system_proxy(&host, port)).await?
}

pub async fn disable_system_proxy() -> anyhow::Result<()> {
    task::spawn_blocking(platform::disable_system_proxy).await?
}

pub async fn detect_certificate_trust(common_name: String) -> anyhow::Result<CertTrustStatus> {
    task::spawn_blocking(move || platform::detect_certificate_trust(&common_name)).await?
}

//! HTTP/HTTPS proxy engine
//!
//! Accepts client connections, parses requests, runs hooks, forwards to the
//! origin through a connection pool and relays responses back. CONNECT
//! tunnels are either decrypted with generated certificates or relayed raw.

pub mod auth;
pub mod cert_manager;
pub mod compression;
mod connect;
pub mod hooks;
pub mod pool;
pub mod retry;
pub mod server;
mod session;
pub mod upstream;
pub mod websocket;

pub use auth::{
    AuthInfo, AuthResult, Authenticator, BasicAuthenticator, SchemeAuthenticator, DEFAULT_REALM,
};
pub use cert_manager::{certificate_name, CertManager, CertificateProvider, IssuedCertificate};
pub use compression::{Compression, DefaultCompression};
pub use hooks::{
    ClientCertificate, ClientCertificateSelectionArgs, FrameObserver, HookFuture, Hooks,
    ServerCertificateValidationArgs, TunnelConnectArgs,
};
pub use pool::{ConnectionKey, ConnectionPool, PoolStats, PooledConnection};
pub use server::*;
pub use upstream::{ConnectorSettings, TcpConnector, UpstreamConnector, UpstreamStream};
pub use websocket::WebSocketFrameDecoder;

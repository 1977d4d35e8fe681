//! # Burrow Proxy
//!
//! Connection engine for an intercepting HTTP/HTTPS forward proxy.
//!
//! ## Features
//!
//! - Explicit and transparent endpoints
//! - HTTP/1.x forwarding with keep-alive and upstream connection pooling
//! - TLS interception with certificates issued from a local root CA
//! - Hooks around every request, response and tunnel
//! - WebSocket relay with optional frame decoding
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  api (start/stop, logging)               │
//! ├─────────────────────────────────────────────────────────┤
//! │                   proxy::ProxyServer                     │
//! │  ┌─────────┐  ┌──────────┐  ┌────────┐  ┌───────────┐   │
//! │  │ Session │  │ CONNECT  │  │  Pool  │  │   Certs   │   │
//! │  │  loop   │──│  / TLS   │──│ +Retry │──│  (rcgen)  │   │
//! │  └─────────┘  └──────────┘  └────────┘  └───────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │        http (parse/write)  ·  io (buffers, relay)        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod io;
pub mod models;
pub mod platform;
pub mod proxy;
pub mod tls;

pub use config::{EndpointConfig, EndpointKind, ExternalProxy, ProxyConfig};
pub use error::{ProxyError, Result};
pub use proxy::{Hooks, ProxyServer, ProxyServerBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

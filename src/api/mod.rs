//! Burrow Proxy API
//!
//! Entry points for applications that embed the proxy as a single
//! process-wide instance. Use [`crate::proxy::ProxyServer`] directly to run
//! several servers side by side.

pub mod proxy_api;

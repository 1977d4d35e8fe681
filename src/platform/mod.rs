//! Platform-specific adapters for system proxy settings, certificate trust
//! and transparent-proxy destinations.

use std::net::SocketAddr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[cfg(target_os = "macos")]
mod mac;
#[cfg(not(target_os = "macos"))]
mod noop;

#[cfg(target_os = "macos")]
use mac::MacProxyAdapter as PlatformImpl;
#[cfg(not(target_os = "macos"))]
use noop::NoopProxyAdapter as PlatformImpl;

static ADAPTER: PlatformImpl = PlatformImpl::new();

/// Hosts that always bypass the system proxy.
pub const DEFAULT_BYPASS: &[&str] = &["localhost", "127.0.0.1", "::1", "*.local"];

pub trait PlatformProxyAdapter: Sync + Send {
    fn enable_system_proxy(&self, host: &str, port: u16) -> Result<()>;
    fn disable_system_proxy(&self) -> Result<()>;
    fn detect_certificate_trust(&self, common_name: &str) -> Result<CertTrustStatus>;

    /// Destination a redirected connection was originally addressed to.
    ///
    /// With TPROXY-style interception the accepted socket keeps the original
    /// destination as its local address, so anything other than the
    /// listener's own address is taken as the target.
    fn original_destination(&self, local: SocketAddr, listener: SocketAddr) -> Option<SocketAddr> {
        let differs = local.port() != listener.port()
            || (!listener.ip().is_unspecified() && local.ip() != listener.ip());
        differs.then_some(local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertTrustStatus {
    Unknown,
    Trusted,
    NotTrusted,
}

pub fn adapter() -> &'static dyn PlatformProxyAdapter {
    &ADAPTER
}

pub fn enable_system_proxy(host: &str, port: u16) -> Result<()> {
    ADAPTER.enable_system_proxy(host, port)
}

pub fn disable_system_proxy() -> Result<()> {
    ADAPTER.disable_system_proxy()
}

pub fn detect_certificate_trust(common_name: &str) -> Result<CertTrustStatus> {
    ADAPTER.detect_certificate_trust(common_name)
}

pub fn original_destination(local: SocketAddr, listener: SocketAddr) -> Option<SocketAddr> {
    ADAPTER.original_destination(local, listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_address_is_not_an_original_destination() {
        let listener: SocketAddr = "0.0.0.0:8443".parse().unwrap();
        assert_eq!(original_destination("10.1.2.3:8443".parse().unwrap(), listener), None);

        let bound: SocketAddr = "127.0.0.1:8443".parse().unwrap();
        assert_eq!(original_destination(bound, bound), None);

        let redirected: SocketAddr = "93.184.216.34:443".parse().unwrap();
        assert_eq!(original_destination(redirected, listener), Some(redirected));
    }
}

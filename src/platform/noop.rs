use super::{CertTrustStatus, PlatformProxyAdapter};
use anyhow::{bail, Result};

/// Used where the system proxy cannot be changed programmatically.
pub struct NoopProxyAdapter;

impl NoopProxyAdapter {
    pub const fn new() -> Self {
        Self
    }
}

impl PlatformProxyAdapter for NoopProxyAdapter {
    fn enable_system_proxy(&self, host: &str, port: u16) -> Result<()> {
        bail!(
            "System proxy configuration unsupported on this platform; point clients at {}:{} manually",
            host,
            port
        )
    }

    fn disable_system_proxy(&self) -> Result<()> {
        tracing::debug!("No system proxy to disable on this platform");
        Ok(())
    }

    fn detect_certificate_trust(&self, _common_name: &str) -> Result<CertTrustStatus> {
        Ok(CertTrustStatus::Unknown)
    }
}

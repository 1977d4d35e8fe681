use super::{CertTrustStatus, PlatformProxyAdapter, DEFAULT_BYPASS};
use anyhow::{anyhow, Context, Result};
use std::process::Command;

const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Drives `networksetup` for every enabled network service.
pub struct MacProxyAdapter;

impl MacProxyAdapter {
    pub const fn new() -> Self {
        Self
    }

    fn networksetup(args: &[&str]) -> Result<String> {
        let output = Command::new("networksetup")
            .args(args)
            .output()
            .with_context(|| format!("failed to run networksetup {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("networksetup {:?} failed: {}", args, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Enabled services; disabled ones are prefixed with `*` in the listing.
    fn services() -> Vec<String> {
        let listed = Self::networksetup(&["-listallnetworkservices"]).map(|stdout| {
            stdout
                .lines()
                .skip(1)
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('*'))
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        match listed {
            Ok(services) if !services.is_empty() => services,
            Ok(_) => {
                tracing::warn!("No network services reported; using Wi-Fi and Ethernet");
                vec!["Wi-Fi".to_string(), "Ethernet".to_string()]
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to enumerate network services");
                vec!["Wi-Fi".to_string(), "Ethernet".to_string()]
            }
        }
    }

    fn bare_host(host: &str) -> &str {
        let host = host.trim();
        let host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host);
        host.split('/').next().unwrap_or(host)
    }
}

impl PlatformProxyAdapter for MacProxyAdapter {
    fn enable_system_proxy(&self, host: &str, port: u16) -> Result<()> {
        let host = Self::bare_host(host);
        let port = port.to_string();
        for service in Self::services() {
            let service = service.as_str();
            Self::networksetup(&["-setwebproxy", service, host, port.as_str()])?;
            Self::networksetup(&["-setsecurewebproxy", service, host, port.as_str()])?;
            let mut bypass = vec!["-setproxybypassdomains", service];
            bypass.extend_from_slice(DEFAULT_BYPASS);
            Self::networksetup(&bypass)?;
            tracing::info!("System proxy for {} set to {}:{}", service, host, port);
        }
        Ok(())
    }

    fn disable_system_proxy(&self) -> Result<()> {
        for service in Self::services() {
            let service = service.as_str();
            Self::networksetup(&["-setwebproxystate", service, "off"])?;
            Self::networksetup(&["-setsecurewebproxystate", service, "off"])?;
        }
        Ok(())
    }

    fn detect_certificate_trust(&self, common_name: &str) -> Result<CertTrustStatus> {
        let found = Command::new("security")
            .args(["find-certificate", "-c", common_name, "-a", "-Z", SYSTEM_KEYCHAIN])
            .output()
            .context("failed to run security")?;
        if !found.status.success() || found.stdout.is_empty() {
            return Ok(CertTrustStatus::NotTrusted);
        }
        // Present in the keychain; check that trust settings allow it.
        let trust = Command::new("security")
            .args(["dump-trust-settings", "-d"])
            .output()
            .context("failed to run security dump-trust-settings")?;
        let listed = String::from_utf8_lossy(&trust.stdout);
        Ok(if listed.contains(common_name) {
            CertTrustStatus::Trusted
        } else {
            CertTrustStatus::Unknown
        })
    }
}

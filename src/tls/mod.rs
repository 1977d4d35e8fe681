//! TLS handshake inspection and protocol selection.

pub mod sniffer;

pub use sniffer::{peek_client_hello, peek_server_hello};

use rustls::SupportedProtocolVersion;

use crate::config::TlsProtocol;

/// ALPN offered on the decrypted side; only HTTP/1.1 is spoken there.
pub const HTTP11_ALPN: &[u8] = b"http/1.1";

/// Map configured protocol versions onto rustls. Falls back to every version
/// rustls supports when nothing usable is configured.
pub fn protocol_versions(protocols: &[TlsProtocol]) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions = Vec::new();
    for protocol in protocols {
        let version = match protocol {
            TlsProtocol::Tls12 => &rustls::version::TLS12,
            TlsProtocol::Tls13 => &rustls::version::TLS13,
        };
        if !versions.iter().any(|v: &&SupportedProtocolVersion| v.version == version.version) {
            versions.push(version);
        }
    }
    if versions.is_empty() {
        versions.extend_from_slice(rustls::ALL_VERSIONS);
    }
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_configured_versions() {
        let versions = protocol_versions(&[TlsProtocol::Tls13, TlsProtocol::Tls13]);
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
        assert_eq!(protocol_versions(&[]).len(), rustls::ALL_VERSIONS.len());
    }
}

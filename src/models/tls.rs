//! TLS handshake summaries produced by the sniffer.
//!
//! These types are immutable snapshots: the sniffer either fills every field
//! from a complete hello message or produces nothing.

use std::collections::BTreeMap;
use std::fmt;

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_EC_POINT_FORMATS: u16 = 11;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;

/// Record framing the hello arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFraming {
    /// Legacy SSLv2-compatible header (`0x80`).
    Ssl2,
    /// Regular TLS record layer (`0x16`).
    TlsRecord,
}

/// Protocol version as `(major, minor)` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TlsVersion {
    pub major: u8,
    pub minor: u8,
}

impl TlsVersion {
    pub const SSL2: TlsVersion = TlsVersion { major: 2, minor: 0 };
    pub const SSL3: TlsVersion = TlsVersion { major: 3, minor: 0 };
    pub const TLS10: TlsVersion = TlsVersion { major: 3, minor: 1 };
    pub const TLS11: TlsVersion = TlsVersion { major: 3, minor: 2 };
    pub const TLS12: TlsVersion = TlsVersion { major: 3, minor: 3 };
    pub const TLS13: TlsVersion = TlsVersion { major: 3, minor: 4 };

    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn from_u16(value: u16) -> Self {
        let [major, minor] = value.to_be_bytes();
        Self { major, minor }
    }

    /// TLS 1.0 and later carry an extensions block.
    pub fn has_extensions(&self) -> bool {
        self.major > 3 || (self.major == 3 && self.minor >= 1)
    }

    pub fn name(&self) -> &'static str {
        match (self.major, self.minor) {
            (2, 0) => "SSL 2.0",
            (3, 0) => "SSL 3.0",
            (3, 1) => "TLS 1.0",
            (3, 2) => "TLS 1.1",
            (3, 3) => "TLS 1.2",
            (3, 4) => "TLS 1.3",
            _ => "unknown",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded payload of a hello extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionValue {
    ServerName(Vec<String>),
    Alpn(Vec<String>),
    SupportedVersions(Vec<u16>),
    SupportedGroups(Vec<u16>),
    EcPointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<u16>),
    Raw(Vec<u8>),
}

/// One extension as it appeared in the hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsExtension {
    pub id: u16,
    /// Index among the hello's extensions.
    pub position: usize,
    pub value: ExtensionValue,
}

impl TlsExtension {
    pub fn name(&self) -> &'static str {
        extension_name(self.id)
    }
}

pub fn extension_name(id: u16) -> &'static str {
    match id {
        0 => "server_name",
        1 => "max_fragment_length",
        5 => "status_request",
        10 => "supported_groups",
        11 => "ec_point_formats",
        13 => "signature_algorithms",
        14 => "use_srtp",
        15 => "heartbeat",
        16 => "application_layer_protocol_negotiation",
        18 => "signed_certificate_timestamp",
        21 => "padding",
        22 => "encrypt_then_mac",
        23 => "extended_master_secret",
        27 => "compress_certificate",
        28 => "record_size_limit",
        35 => "session_ticket",
        41 => "pre_shared_key",
        42 => "early_data",
        43 => "supported_versions",
        44 => "cookie",
        45 => "psk_key_exchange_modes",
        47 => "certificate_authorities",
        49 => "post_handshake_auth",
        50 => "signature_algorithms_cert",
        51 => "key_share",
        13172 => "next_protocol_negotiation",
        17513 => "application_settings",
        65281 => "renegotiation_info",
        _ => "unknown",
    }
}

pub fn cipher_suite_name(id: u16) -> &'static str {
    match id {
        0x1301 => "TLS_AES_128_GCM_SHA256",
        0x1302 => "TLS_AES_256_GCM_SHA384",
        0x1303 => "TLS_CHACHA20_POLY1305_SHA256",
        0xc02b => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        0xc02c => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        0xc02f => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        0xc030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        0xcca8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        0xcca9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        0xc013 => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
        0xc014 => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
        0x009c => "TLS_RSA_WITH_AES_128_GCM_SHA256",
        0x009d => "TLS_RSA_WITH_AES_256_GCM_SHA384",
        0x002f => "TLS_RSA_WITH_AES_128_CBC_SHA",
        0x0035 => "TLS_RSA_WITH_AES_256_CBC_SHA",
        0x000a => "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
        0x00ff => "TLS_EMPTY_RENEGOTIATION_INFO_SCSV",
        _ => "unknown",
    }
}

fn server_names(extensions: &BTreeMap<u16, TlsExtension>) -> Option<&[String]> {
    match &extensions.get(&EXT_SERVER_NAME)?.value {
        ExtensionValue::ServerName(names) => Some(names),
        _ => None,
    }
}

fn alpn_list(extensions: &BTreeMap<u16, TlsExtension>) -> Option<&[String]> {
    match &extensions.get(&EXT_ALPN)?.value {
        ExtensionValue::Alpn(protocols) => Some(protocols),
        _ => None,
    }
}

fn supported_versions(extensions: &BTreeMap<u16, TlsExtension>) -> Option<&[u16]> {
    match &extensions.get(&EXT_SUPPORTED_VERSIONS)?.value {
        ExtensionValue::SupportedVersions(versions) => Some(versions),
        _ => None,
    }
}

/// GREASE values (RFC 8701) look like versions but never are.
fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a
}

/// A parsed ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub framing: HandshakeFraming,
    /// `client_version` field of the hello.
    pub version: TlsVersion,
    /// Random (TLS) or challenge (SSLv2).
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    /// Cipher suites; SSLv2 specs are three bytes wide.
    pub ciphers: Vec<u32>,
    pub compression_data: Vec<u8>,
    pub extensions: BTreeMap<u16, TlsExtension>,
    /// Bytes the hello occupies on the wire, including record framing.
    pub handshake_length: usize,
}

impl ClientHelloInfo {
    /// First host_name entry, lowercased and without a trailing dot.
    pub fn sni(&self) -> Option<String> {
        let name = server_names(&self.extensions)?.first()?;
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        (!name.is_empty()).then_some(name)
    }

    pub fn alpn(&self) -> Option<&[String]> {
        alpn_list(&self.extensions)
    }

    /// Highest version offered, honoring `supported_versions`.
    pub fn protocol(&self) -> TlsVersion {
        supported_versions(&self.extensions)
            .and_then(|versions| {
                versions
                    .iter()
                    .copied()
                    .filter(|v| !is_grease(*v))
                    .map(TlsVersion::from_u16)
                    .max()
            })
            .unwrap_or(self.version)
    }

    pub fn cipher_names(&self) -> Vec<&'static str> {
        self.ciphers
            .iter()
            .map(|c| u16::try_from(*c).map(cipher_suite_name).unwrap_or("unknown"))
            .collect()
    }
}

/// A parsed ServerHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHelloInfo {
    pub framing: HandshakeFraming,
    pub version: TlsVersion,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher: u32,
    pub compression_method: u8,
    pub extensions: BTreeMap<u16, TlsExtension>,
    pub handshake_length: usize,
}

impl ServerHelloInfo {
    /// Protocol chosen by the server.
    pub fn alpn(&self) -> Option<&str> {
        alpn_list(&self.extensions)?.first().map(String::as_str)
    }

    /// Negotiated version, honoring `supported_versions`.
    pub fn protocol(&self) -> TlsVersion {
        supported_versions(&self.extensions)
            .and_then(|v| v.first())
            .map(|v| TlsVersion::from_u16(*v))
            .unwrap_or(self.version)
    }

    pub fn cipher_name(&self) -> &'static str {
        u16::try_from(self.cipher)
            .map(cipher_suite_name)
            .unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_with(extensions: Vec<(u16, ExtensionValue)>) -> ClientHelloInfo {
        ClientHelloInfo {
            framing: HandshakeFraming::TlsRecord,
            version: TlsVersion::TLS12,
            random: vec![0; 32],
            session_id: Vec::new(),
            ciphers: vec![0x1301, 0xc02f],
            compression_data: vec![0],
            extensions: extensions
                .into_iter()
                .enumerate()
                .map(|(position, (id, value))| {
                    (
                        id,
                        TlsExtension {
                            id,
                            position,
                            value,
                        },
                    )
                })
                .collect(),
            handshake_length: 0,
        }
    }

    #[test]
    fn sni_is_normalized() {
        let hello = hello_with(vec![(
            EXT_SERVER_NAME,
            ExtensionValue::ServerName(vec!["Example.COM.".into()]),
        )]);
        assert_eq!(hello.sni().as_deref(), Some("example.com"));
    }

    #[test]
    fn protocol_prefers_supported_versions() {
        let hello = hello_with(vec![(
            EXT_SUPPORTED_VERSIONS,
            ExtensionValue::SupportedVersions(vec![0x7a7a, 0x0304, 0x0303]),
        )]);
        assert_eq!(hello.protocol(), TlsVersion::TLS13);
        assert_eq!(hello_with(vec![]).protocol(), TlsVersion::TLS12);
    }

    #[test]
    fn names() {
        assert_eq!(extension_name(16), "application_layer_protocol_negotiation");
        assert_eq!(TlsVersion::TLS10.to_string(), "TLS 1.0");
        assert!(!TlsVersion::SSL3.has_extensions());
        assert_eq!(hello_with(vec![]).cipher_names()[0], "TLS_AES_128_GCM_SHA256");
    }
}

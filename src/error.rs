//! Error taxonomy for proxy sessions.

use std::fmt;
use std::io;
use thiserror::Error;

/// Which side of the proxy a TLS handshake failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    /// The MITM handshake with the client using a generated certificate.
    Client,
    /// The upstream handshake with the origin server.
    Server,
}

impl fmt::Display for HandshakeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeSide::Client => f.write_str("client"),
            HandshakeSide::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request line, header block or chunk framing.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Upstream connect, reset or timeout. The only retryable kind.
    #[error("connection to {host}:{port} failed: {source}")]
    ServerConnection {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {side} failed for {host}: {reason}")]
    TlsHandshake {
        side: HandshakeSide,
        host: String,
        reason: String,
    },

    #[error("upstream proxy refused tunnel: {0}")]
    UpstreamProxy(String),

    #[error("certificate generation failed for {host}: {reason}")]
    Certificate { host: String, reason: String },

    #[error("body exceeds configured limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("interception hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    #[error("session cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ProxyError::ProtocolViolation(message.into())
    }

    pub fn server_connection(host: &str, port: u16, source: io::Error) -> Self {
        ProxyError::ServerConnection {
            host: host.to_string(),
            port,
            source,
        }
    }

    pub fn tls_handshake(side: HandshakeSide, host: &str, reason: impl fmt::Display) -> Self {
        ProxyError::TlsHandshake {
            side,
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the retry policy may try again on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::ServerConnection { .. })
    }

    /// Client-initiated disconnects that are routine for a proxy and
    /// should not be logged as failures.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            ProxyError::Cancelled => true,
            ProxyError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            ProxyError::TlsHandshake {
                side: HandshakeSide::Client,
                reason,
                ..
            } => {
                let reason = reason.to_ascii_lowercase();
                reason.contains("eof") || reason.contains("connection reset")
            }
            _ => false,
        }
    }

    /// Status line used when the failure is reported to the client.
    pub fn client_status(&self) -> (u16, &'static str) {
        match self {
            ProxyError::ProtocolViolation(_) => (400, "Bad Request"),
            ProxyError::BodyTooLarge { .. } => (413, "Payload Too Large"),
            ProxyError::ServerConnection { .. }
            | ProxyError::UpstreamProxy(_)
            | ProxyError::TlsHandshake {
                side: HandshakeSide::Server,
                ..
            } => (502, "Bad Gateway"),
            _ => (500, "Internal Server Error"),
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

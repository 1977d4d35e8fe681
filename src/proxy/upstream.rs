//! Establishing connections to origin servers.
//!
//! TCP connect with a timeout, an optional CONNECT through an upstream proxy,
//! then an optional TLS handshake. Certificate validation is deferred until
//! the handshake completes so hooks can see the chain and override the
//! default verdict.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

use super::hooks::{
    ClientCertificate, ClientCertificateSelectionArgs, Hooks, ServerCertificateValidationArgs,
};
use super::pool::ConnectionKey;
use crate::config::{ExternalProxy, ProxyConfig, TlsProtocol};
use crate::error::{HandshakeSide, ProxyError, Result};
use crate::http::{read_response, write_request_head};
use crate::io::{BoxedIo, BufferPool, BufferedStream};
use crate::models::http::Request;
use crate::tls::{protocol_versions, HTTP11_ALPN};

/// Transport to an origin server.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<BoxedIo>>),
    /// Any other transport, e.g. in-memory streams supplied by a custom
    /// connector.
    Io(BoxedIo),
}

impl fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamStream::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            UpstreamStream::Tls(_) => f.write_str("Tls"),
            UpstreamStream::Io(_) => f.write_str("Io"),
        }
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Io(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, data),
            UpstreamStream::Io(stream) => Pin::new(stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Io(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Io(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A freshly established upstream transport and what was negotiated on it.
#[derive(Debug)]
pub struct UpstreamConnection {
    pub stream: UpstreamStream,
    pub negotiated_alpn: Option<String>,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
}

impl UpstreamConnection {
    pub fn new(stream: UpstreamStream) -> Self {
        Self {
            stream,
            negotiated_alpn: None,
            tls_version: None,
            cipher: None,
        }
    }
}

/// Seam for opening upstream transports.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a connection for HTTP exchanges described by `key`.
    async fn connect(&self, key: &ConnectionKey) -> Result<UpstreamConnection>;

    /// Open a raw byte tunnel to `host:port`, through `via` when set.
    async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
        via: Option<&ExternalProxy>,
    ) -> Result<UpstreamStream>;
}

/// Knobs of the default connector.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub connect_timeout: Duration,
    pub tls_protocols: Vec<TlsProtocol>,
    pub accept_invalid_certs: bool,
}

impl ConnectorSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            tls_protocols: config.supported_tls_protocols.clone(),
            accept_invalid_certs: config.accept_invalid_upstream_certs,
        }
    }
}

/// Verifier that accepts any chain during the handshake but still checks
/// handshake signatures. The chain is judged after the handshake.
#[derive(Debug)]
struct DeferredVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Default connector: real sockets, webpki roots, hooks for certificate
/// selection and validation.
pub struct TcpConnector {
    settings: ConnectorSettings,
    hooks: Arc<Hooks>,
    buffer_pool: BufferPool,
    versions: Vec<&'static SupportedProtocolVersion>,
    webpki: Arc<WebPkiServerVerifier>,
    default_tls: Arc<ClientConfig>,
}

impl TcpConnector {
    pub fn new(
        settings: ConnectorSettings,
        hooks: Arc<Hooks>,
        buffer_pool: BufferPool,
    ) -> anyhow::Result<Self> {
        let roots = Arc::new(RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned()));
        let webpki = WebPkiServerVerifier::builder(roots)
            .build()
            .context("building upstream certificate verifier")?;
        let versions = protocol_versions(&settings.tls_protocols);
        let default_tls = client_config(&versions, &webpki, None)
            .context("building upstream TLS client config")?;
        Ok(Self {
            settings,
            hooks,
            buffer_pool,
            versions,
            webpki,
            default_tls,
        })
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ProxyError::server_connection(host, port, err)),
            Err(_) => {
                return Err(ProxyError::server_connection(
                    host,
                    port,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}:{}: {}", host, port, err);
        }
        Ok(stream)
    }

    /// Ask an upstream proxy to open a tunnel to `host:port`.
    async fn establish_tunnel(
        &self,
        stream: &mut TcpStream,
        host: &str,
        port: u16,
        proxy: &ExternalProxy,
    ) -> Result<()> {
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let mut request = Request::new("CONNECT", authority.clone());
        request.headers.add("Host", authority);
        if let Some(credentials) = proxy.basic_credentials() {
            request.headers.add("Proxy-Authorization", credentials);
        }

        let sent = async {
            write_request_head(stream, &request).await?;
            stream.flush().await
        }
        .await;
        sent.map_err(|err| ProxyError::server_connection(&proxy.host, proxy.port, err))?;

        let mut reader = BufferedStream::new(&mut *stream, &self.buffer_pool);
        let response = read_response(&mut reader).await?.ok_or_else(|| {
            ProxyError::UpstreamProxy(format!(
                "{} closed the connection before answering CONNECT",
                proxy.authority()
            ))
        })?;
        if response.status != 200 {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} answered {} {} for {}:{}",
                proxy.authority(),
                response.status,
                response.reason,
                host,
                port
            )));
        }
        if reader.available() > 0 {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} sent data before the tunnel was used",
                proxy.authority()
            )));
        }
        tracing::debug!("tunnel to {}:{} opened via {}", host, port, proxy.authority());
        Ok(())
    }

    async fn handshake(&self, io: BoxedIo, host: &str, port: u16) -> Result<UpstreamConnection> {
        let mut selection = ClientCertificateSelectionArgs {
            host: host.to_string(),
            port,
            certificate: None,
        };
        self.hooks.select_client_certificate(&mut selection).await?;
        let config = match selection.certificate {
            Some(cert) => client_config(&self.versions, &self.webpki, Some(cert))
                .map_err(|err| ProxyError::tls_handshake(HandshakeSide::Server, host, err))?,
            None => self.default_tls.clone(),
        };

        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            ProxyError::tls_handshake(HandshakeSide::Server, host, "invalid server name")
        })?;
        let connector = TlsConnector::from(config);
        let tls = tokio::time::timeout(
            self.settings.connect_timeout,
            connector.connect(server_name.clone(), io),
        )
        .await
        .map_err(|_| ProxyError::tls_handshake(HandshakeSide::Server, host, "handshake timed out"))?
        .map_err(|err| ProxyError::tls_handshake(HandshakeSide::Server, host, err))?;

        let (_, session) = tls.get_ref();
        let chain = session
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();
        let negotiated_alpn = session
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned());
        let tls_version = session.protocol_version().map(|v| format!("{:?}", v));
        let cipher = session
            .negotiated_cipher_suite()
            .map(|cs| format!("{:?}", cs.suite()));

        self.check_server_certificate(host, port, &server_name, chain)
            .await?;

        Ok(UpstreamConnection {
            stream: UpstreamStream::Tls(Box::new(tls)),
            negotiated_alpn,
            tls_version,
            cipher,
        })
    }

    async fn check_server_certificate(
        &self,
        host: &str,
        port: u16,
        server_name: &ServerName<'_>,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<()> {
        let default_error = match chain.split_first() {
            Some((end_entity, intermediates)) => self
                .webpki
                .verify_server_cert(end_entity, intermediates, server_name, &[], UnixTime::now())
                .err()
                .map(|err| err.to_string()),
            None => Some("server presented no certificate".to_string()),
        };
        let is_valid = default_error.is_none() || self.settings.accept_invalid_certs;
        let mut args = ServerCertificateValidationArgs {
            host: host.to_string(),
            port,
            chain,
            default_error,
            is_valid,
        };
        self.hooks.validate_server_certificate(&mut args).await?;
        if args.is_valid {
            return Ok(());
        }
        let reason = args
            .default_error
            .unwrap_or_else(|| "rejected by validation hook".to_string());
        Err(ProxyError::tls_handshake(
            HandshakeSide::Server,
            host,
            format!("certificate rejected: {reason}"),
        ))
    }
}

fn client_config(
    versions: &[&'static SupportedProtocolVersion],
    webpki: &Arc<WebPkiServerVerifier>,
    certificate: Option<ClientCertificate>,
) -> std::result::Result<Arc<ClientConfig>, rustls::Error> {
    let builder = ClientConfig::builder_with_protocol_versions(versions)
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeferredVerifier {
            inner: webpki.clone(),
        }));
    let mut config = match certificate {
        Some(cert) => builder.with_client_auth_cert(cert.chain, cert.key)?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(Arc::new(config))
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self, key: &ConnectionKey) -> Result<UpstreamConnection> {
        let (dial_host, dial_port) = match &key.upstream_proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (key.host.as_str(), key.port),
        };
        let mut stream = self.connect_tcp(dial_host, dial_port).await?;

        if !key.is_https {
            // Plain requests to an upstream proxy go out in absolute form on
            // this socket.
            return Ok(UpstreamConnection::new(UpstreamStream::Plain(stream)));
        }
        if let Some(proxy) = &key.upstream_proxy {
            self.establish_tunnel(&mut stream, &key.host, key.port, proxy)
                .await?;
        }
        self.handshake(Box::new(stream), &key.host, key.port).await
    }

    async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
        via: Option<&ExternalProxy>,
    ) -> Result<UpstreamStream> {
        match via {
            Some(proxy) => {
                let mut stream = self.connect_tcp(&proxy.host, proxy.port).await?;
                self.establish_tunnel(&mut stream, host, port, proxy).await?;
                Ok(UpstreamStream::Plain(stream))
            }
            None => Ok(UpstreamStream::Plain(self.connect_tcp(host, port).await?)),
        }
    }
}

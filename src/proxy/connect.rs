//! CONNECT tunnels and transparent TLS: sniff the first bytes, then either
//! terminate TLS with a generated certificate or relay the bytes untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthOutcome, Authenticator};
use super::cert_manager::certificate_name;
use super::hooks::TunnelConnectArgs;
use super::server::ServerShared;
use super::session::{http_loop, LoopExit};
use crate::config::EndpointConfig;
use crate::error::{HandshakeSide, ProxyError, Result};
use crate::http::{respond_with_status, write_response};
use crate::io::{relay, BoxedIo, BufferedStream, ClientStream, StreamObserver};
use crate::models::http::Request;
use crate::models::session::ConnectionInfo;
use crate::models::tls::ClientHelloInfo;
use crate::tls::{peek_client_hello, peek_server_hello};

const CONNECTION_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nContent-Length: 0\r\n\r\n";

/// What the explicit endpoint does after a CONNECT.
pub(crate) enum ConnectOutcome {
    /// The tunnel ran to completion or was refused.
    Finished,
    /// An authentication round trip is in progress; keep reading requests.
    Continue(ClientStream),
}

/// Handle a CONNECT read from an explicit endpoint.
pub(crate) async fn handle_connect(
    shared: &ServerShared,
    mut client: ClientStream,
    mut request: Request,
    client_addr: SocketAddr,
    endpoint: Arc<EndpointConfig>,
    authorized: &mut bool,
    cancel: &CancellationToken,
) -> Result<ConnectOutcome> {
    let Some(target) = request.target(true) else {
        let _ = respond_with_status(&mut client, 400, "Bad Request", "Invalid CONNECT target").await;
        return Err(ProxyError::protocol(format!(
            "invalid CONNECT target {:?}",
            request.uri
        )));
    };

    shared.stats.record_request();

    let check = match &shared.authenticator {
        Some(Authenticator::Basic(_)) => true,
        Some(Authenticator::Scheme(_)) => !*authorized,
        None => false,
    };
    if check {
        if let Some(auth) = &shared.authenticator {
            match auth.authorize(&mut request, client_addr, &shared.realm).await {
                AuthOutcome::Authorized => *authorized = true,
                AuthOutcome::Challenge { response, close } => {
                    write_response(&mut client, &response).await?;
                    return Ok(if close {
                        ConnectOutcome::Finished
                    } else {
                        ConnectOutcome::Continue(client)
                    });
                }
            }
        }
    }

    let mut tunnel = TunnelConnectArgs::new(
        uuid::Uuid::new_v4().to_string(),
        client_addr,
        request.clone(),
        target.host.clone(),
        target.port,
    );
    tunnel.decrypt_ssl = shared.should_decrypt(&endpoint, &target.host);

    shared.hooks.before_tunnel_connect(&mut tunnel).await?;
    if let Some(denial) = tunnel.take_denial() {
        tracing::debug!(
            "CONNECT to {}:{} from {} denied by hook",
            target.host,
            target.port,
            client_addr
        );
        write_response(&mut client, &denial).await?;
        return Ok(ConnectOutcome::Finished);
    }

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;

    tunnel.client_hello = sniff_client_hello(shared, &mut client, cancel).await?;

    let info = Arc::new(ConnectionInfo {
        client_addr,
        endpoint,
        is_https: true,
        connect_request: Some(Arc::new(request)),
    });

    if tunnel.client_hello.is_some() && tunnel.decrypt_ssl {
        decrypt(shared, client, &tunnel.host, info, cancel).await?;
    } else {
        passthrough(shared, client, tunnel, cancel).await?;
    }
    Ok(ConnectOutcome::Finished)
}

/// Handle a connection accepted on a transparent endpoint.
pub(crate) async fn handle_transparent(
    shared: &ServerShared,
    mut client: ClientStream,
    client_addr: SocketAddr,
    original_dst: Option<SocketAddr>,
    endpoint: Arc<EndpointConfig>,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(hello) = sniff_client_hello(shared, &mut client, cancel).await? else {
        let info = Arc::new(ConnectionInfo {
            client_addr,
            endpoint,
            is_https: false,
            connect_request: None,
        });
        let mut authorized = false;
        return match http_loop(shared, client, info, &mut authorized, cancel).await? {
            LoopExit::Closed => Ok(()),
            LoopExit::Connect { .. } => Err(ProxyError::protocol(
                "CONNECT on a transparent endpoint",
            )),
        };
    };

    let host = hello
        .sni()
        .or_else(|| original_dst.map(|addr| addr.ip().to_string()))
        .or_else(|| endpoint.generic_certificate_name.clone());
    let Some(host) = host else {
        return Err(ProxyError::protocol(
            "transparent TLS connection without SNI or known destination",
        ));
    };
    let port = endpoint.transparent_upstream_port;

    let mut connect = Request::new("CONNECT", format!("{host}:{port}"));
    connect.headers.add("Host", format!("{host}:{port}"));

    let decrypt_ssl = shared.should_decrypt(&endpoint, &host);
    let mut tunnel = TunnelConnectArgs::new(
        uuid::Uuid::new_v4().to_string(),
        client_addr,
        connect.clone(),
        host.clone(),
        port,
    );
    tunnel.decrypt_ssl = decrypt_ssl;
    tunnel.client_hello = Some(hello);

    if decrypt_ssl {
        let info = Arc::new(ConnectionInfo {
            client_addr,
            endpoint,
            is_https: true,
            connect_request: Some(Arc::new(connect)),
        });
        decrypt(shared, client, &host, info, cancel).await
    } else {
        passthrough(shared, client, tunnel, cancel).await
    }
}

/// Peek a ClientHello within the sniff window. A timeout means the client
/// is not speaking TLS first.
async fn sniff_client_hello(
    shared: &ServerShared,
    client: &mut ClientStream,
    cancel: &CancellationToken,
) -> Result<Option<ClientHelloInfo>> {
    let window = shared.config.tls_sniff_timeout();
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        sniffed = tokio::time::timeout(window, peek_client_hello(client)) => match sniffed {
            Ok(hello) => Ok(hello?),
            Err(_) => {
                tracing::debug!("No TLS ClientHello within {:?}; relaying raw bytes", window);
                Ok(None)
            }
        },
    }
}

/// Terminate the client's TLS with a certificate for `host` and serve the
/// decrypted requests.
async fn decrypt(
    shared: &ServerShared,
    mut client: ClientStream,
    host: &str,
    info: Arc<ConnectionInfo>,
    cancel: &CancellationToken,
) -> Result<()> {
    let provider = shared
        .certificates
        .as_ref()
        .ok_or_else(|| ProxyError::Certificate {
            host: host.to_string(),
            reason: "no certificate provider configured".to_string(),
        })?;
    let name = certificate_name(host, shared.config.wildcard_certificates);
    let issued = provider.server_certificate(&name).await?;
    let server_config = issued.server_config(&shared.tls_versions)?;

    // Observers follow the plaintext from here on.
    client.set_observer(StreamObserver::default());
    let acceptor = TlsAcceptor::from(server_config);
    let tls = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        accepted = acceptor.accept(client) => accepted
            .map_err(|err| ProxyError::tls_handshake(HandshakeSide::Client, host, err))?,
    };
    tracing::debug!("Intercepting TLS for {} from {}", host, info.client_addr);

    let io: BoxedIo = Box::new(tls);
    let stream =
        BufferedStream::new(io, &shared.buffer_pool).with_observer(shared.client_observer.clone());
    let mut authorized = true;
    match http_loop(shared, stream, info, &mut authorized, cancel).await? {
        LoopExit::Closed => Ok(()),
        LoopExit::Connect { .. } => Err(ProxyError::protocol("CONNECT inside a tunnel")),
    }
}

/// Relay the tunnel to the origin without looking inside.
async fn passthrough(
    shared: &ServerShared,
    mut client: ClientStream,
    mut tunnel: TunnelConnectArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let via = shared.config.upstream_https_proxy.as_ref();
    let upstream = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        upstream = shared.pool.connector().open_tunnel(&tunnel.host, tunnel.port, via) => upstream?,
    };
    let mut server = BufferedStream::new(upstream, &shared.buffer_pool)
        .with_observer(shared.pool.stream_observer().clone());

    let pending = client.take_buffered();
    if !pending.is_empty() {
        server.write_all(&pending).await?;
        server.flush().await?;
    }

    if tunnel.client_hello.is_some() {
        let window = shared.config.tls_sniff_timeout();
        tunnel.server_hello = match tokio::time::timeout(window, peek_server_hello(&mut server)).await
        {
            Ok(Ok(hello)) => hello,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => None,
        };
        shared.hooks.after_tunnel_connect(&mut tunnel).await?;
    }

    tracing::debug!(
        "Relaying tunnel {} -> {}:{}",
        tunnel.client_addr,
        tunnel.host,
        tunnel.port
    );
    let stats = relay(&mut client, &mut server, &shared.buffer_pool, None, cancel).await?;
    tracing::debug!(
        "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
        tunnel.host,
        tunnel.port,
        stats.client_to_server,
        stats.server_to_client
    );
    Ok(())
}

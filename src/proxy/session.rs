//! The HTTP exchange loop run on every client connection, plain or
//! decrypted.

use std::io;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthOutcome, Authenticator};
use super::pool::{ConnectionKey, PooledConnection};
use super::retry::RetryResult;
use super::server::ServerShared;
use super::websocket::WebSocketFrameDecoder;
use crate::config::EndpointKind;
use crate::error::{ProxyError, Result};
use crate::http::writer::{request_head_bytes, write_loaded_body};
use crate::http::{
    copy_body, detect_method, drain_body, read_request, read_response, respond_with_status,
    write_response, write_response_head, BodyFraming,
};
use crate::io::{relay, ClientStream};
use crate::models::http::{Body, Request, Response, Target};
use crate::models::session::{
    ConnectionInfo, SessionEventArgs, CONNECTION_READY, REQUEST_SENT, RESPONSE_RECEIVED,
    RESPONSE_SENT,
};

/// Stray CRLFs tolerated between pipelined requests.
const MAX_LEADING_BLANK_BYTES: usize = 8;

/// How the exchange loop ended.
pub(crate) enum LoopExit {
    Closed,
    /// A CONNECT arrived on an explicit endpoint; the caller sets up the
    /// tunnel.
    Connect { client: ClientStream, request: Request },
}

/// Serve requests on `client` until keep-alive ends.
///
/// `authorized` tracks connection-bound authentication schemes, which only
/// need to succeed once per connection.
pub(crate) async fn http_loop(
    shared: &ServerShared,
    mut client: ClientStream,
    info: Arc<ConnectionInfo>,
    authorized: &mut bool,
    cancel: &CancellationToken,
) -> Result<LoopExit> {
    let keep_alive_timeout = shared.config.keep_alive_timeout();
    let mut exchanges: u32 = 0;

    loop {
        let first = exchanges == 0;
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(LoopExit::Closed),
            next = tokio::time::timeout(keep_alive_timeout, next_request(&mut client)) => next,
        };

        let mut request = match next {
            Err(_) => {
                tracing::debug!(
                    "Keep-alive timeout for {} after {} requests",
                    info.client_addr,
                    exchanges
                );
                return Ok(LoopExit::Closed);
            }
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return Ok(LoopExit::Closed),
            Ok(Err(err)) if first => {
                let (status, reason) = err.client_status();
                tracing::warn!("Failed to parse request from {}: {}", info.client_addr, err);
                let _ = respond_with_status(&mut client, status, reason, "Unable to parse HTTP request").await;
                return Err(err);
            }
            Ok(Err(err)) => {
                tracing::debug!(
                    "Connection from {} closed after {} requests: {}",
                    info.client_addr,
                    exchanges,
                    err
                );
                return Ok(LoopExit::Closed);
            }
        };
        exchanges += 1;

        if request.is_connect() {
            if info.endpoint.kind == EndpointKind::Explicit && !info.is_https {
                return Ok(LoopExit::Connect { client, request });
            }
            let _ = respond_with_status(&mut client, 400, "Bad Request", "CONNECT is not allowed here").await;
            return Err(ProxyError::protocol("CONNECT inside a tunnel or on a transparent endpoint"));
        }

        shared.stats.record_request();

        if needs_authorization(shared, &info, *authorized) {
            if let Some(auth) = &shared.authenticator {
                match auth.authorize(&mut request, info.client_addr, &shared.realm).await {
                    AuthOutcome::Authorized => {
                        *authorized = true;
                    }
                    AuthOutcome::Challenge { response, close } => {
                        let close = close || !discard_request_body(&mut client, &request).await?;
                        write_response(&mut client, &response).await?;
                        if close {
                            return Ok(LoopExit::Closed);
                        }
                        continue;
                    }
                }
            }
        }

        request.headers.remove("proxy-connection");

        let mut args = SessionEventArgs::new(
            info.clone(),
            client,
            request,
            shared.compression.clone(),
            cancel.clone(),
        );
        // Upstream work (connect, send, response) must not outlive shutdown.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            outcome = run_exchange(shared, &mut args) => outcome,
        };
        let keep_alive = match outcome {
            Ok(keep_alive) => keep_alive,
            Err(err) => {
                if let Some(conn) = args.take_server() {
                    shared.pool.dispose(conn).await;
                }
                return Err(err);
            }
        };
        client = args.into_client();

        if !keep_alive {
            return Ok(LoopExit::Closed);
        }
    }
}

fn needs_authorization(shared: &ServerShared, info: &ConnectionInfo, authorized: bool) -> bool {
    if info.is_https || info.endpoint.kind == EndpointKind::Transparent {
        return false;
    }
    match &shared.authenticator {
        Some(Authenticator::Basic(_)) => true,
        Some(Authenticator::Scheme(_)) => !authorized,
        None => false,
    }
}

/// Skip stray blank lines, classify the method, then read the head.
async fn next_request(client: &mut ClientStream) -> Result<Option<Request>> {
    let mut skipped = 0;
    while skipped < MAX_LEADING_BLANK_BYTES {
        match client.peek_byte(0).await? {
            Some(b'\r') | Some(b'\n') => {
                client.consume(1);
                skipped += 1;
            }
            Some(_) => break,
            None => return Ok(None),
        }
    }

    if detect_method(client).await?.is_none() {
        if client.available() == 0 && client.is_closed() {
            return Ok(None);
        }
        return Err(ProxyError::protocol("not an HTTP request"));
    }
    read_request(client).await
}

/// Read and discard a request body the client is about to send. Returns
/// false when the connection cannot be kept in sync.
async fn discard_request_body(client: &mut ClientStream, request: &Request) -> Result<bool> {
    if !matches!(request.body, Body::Unread) {
        return Ok(true);
    }
    if request.expects_continue() {
        return Ok(false);
    }
    drain_body(client, BodyFraming::of_request(request)).await?;
    Ok(true)
}

/// Where the request goes. Inside a tunnel a request without a usable Host
/// falls back to the CONNECT target.
fn resolve_target(args: &SessionEventArgs) -> Option<Target> {
    let target = args.request.target(args.is_https());
    if target.is_some() {
        return target;
    }
    let connect = args.connect_request()?.target(true)?;
    Some(Target {
        host: connect.host,
        port: connect.port,
        is_https: args.is_https(),
    })
}

/// URI as written on the upstream connection.
fn wire_uri(request: &Request, key: &ConnectionKey) -> String {
    if key.uses_absolute_form() {
        let path = request.origin_form();
        let default_port = if key.is_https { 443 } else { 80 };
        let scheme = if key.is_https { "https" } else { "http" };
        let host = if key.host.contains(':') {
            format!("[{}]", key.host)
        } else {
            key.host.clone()
        };
        if key.port == default_port {
            format!("{scheme}://{host}{path}")
        } else {
            format!("{scheme}://{host}:{}{path}", key.port)
        }
    } else {
        request.origin_form()
    }
}

/// Per-exchange state threaded through retry attempts.
struct ExchangeCtx<'s> {
    shared: &'s ServerShared,
    args: &'s mut SessionEventArgs,
    wire_uri: String,
    /// Set once request body bytes left the client; past that point the
    /// exchange cannot be replayed.
    body_streamed: bool,
    /// 100 Continue was relayed while sending the head.
    interim_relayed: bool,
}

/// One request/response exchange. Returns whether the client connection
/// stays open.
async fn run_exchange(shared: &ServerShared, args: &mut SessionEventArgs) -> Result<bool> {
    let client_keep_alive = args.request.keep_alive();
    let method = args.request.method.clone();

    shared.hooks.before_request(args).await?;

    if args.is_short_circuited() {
        if matches!(args.request.body, Body::Unread) {
            if args.request.expects_continue() && !args.continue_sent() {
                args.set_client_reusable(false);
            } else {
                let framing = BodyFraming::of_request(&args.request);
                drain_body(args.client_mut(), framing).await?;
            }
        }
        let response_keep_alive = send_response(args, &method).await?;
        shared.hooks.after_response(args).await?;
        return Ok(client_keep_alive && response_keep_alive && args.client_reusable());
    }

    let Some(target) = resolve_target(args) else {
        let client = args.client_mut();
        let _ = respond_with_status(client, 400, "Bad Request", "Request has no target host").await;
        return Err(ProxyError::protocol(format!(
            "no target host for {} {}",
            args.request.method, args.request.uri
        )));
    };

    let key = ConnectionKey::new(target.host.clone(), target.port, target.is_https)
        .via(shared.config.upstream_proxy_for(target.is_https).cloned());
    let mut ctx = ExchangeCtx {
        shared,
        wire_uri: wire_uri(&args.request, &key),
        args,
        body_streamed: false,
        interim_relayed: false,
    };

    let RetryResult {
        connection,
        error,
        continue_session,
    } = shared
        .retry
        .execute(
            &mut ctx,
            None,
            || {
                let pool = shared.pool.clone();
                let key = key.clone();
                async move { pool.acquire(&key).await }
            },
            |ctx, conn| forward(ctx, conn).boxed(),
        )
        .await;
    let args = ctx.args;

    if let Some(err) = error {
        if let Some(conn) = connection {
            shared.pool.dispose(conn).await;
        }
        tracing::warn!(
            "Upstream exchange with {}:{} failed: {}",
            target.host,
            target.port,
            err
        );
        let (status, reason) = err.client_status();
        let _ = respond_with_status(args.client_mut(), status, reason, &err.to_string()).await;
        return Err(err);
    }

    let Some(conn) = connection else {
        return Ok(false);
    };
    if !continue_session {
        // The connection was upgraded and relayed to completion.
        shared.pool.dispose(conn).await;
        return Ok(false);
    }
    args.attach_server(conn);

    shared.hooks.before_response(args).await?;
    let response_keep_alive = send_response(args, &method).await?;
    shared.hooks.after_response(args).await?;

    let server_reusable = args.server_reusable() && response_keep_alive;
    if let Some(conn) = args.take_server() {
        if server_reusable {
            shared.pool.release(conn).await;
        } else {
            shared.pool.dispose(conn).await;
        }
    }

    Ok(client_keep_alive && response_keep_alive && args.client_reusable())
}

fn upstream_io(conn: &PooledConnection) -> impl Fn(io::Error) -> ProxyError + '_ {
    move |err| ProxyError::server_connection(&conn.key.host, conn.key.port, err)
}

/// Errors after the request body started flowing cannot be retried.
fn final_error(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::ServerConnection { source, .. } => ProxyError::Io(source),
        other => other,
    }
}

/// One attempt: send the request on `conn` and read the response head.
/// Returns false when the connection was upgraded and already relayed.
async fn forward(ctx: &mut ExchangeCtx<'_>, conn: &mut PooledConnection) -> Result<bool> {
    let shared = ctx.shared;
    ctx.args.timeline.mark(CONNECTION_READY);

    let head = {
        let request = &mut ctx.args.request;
        let original = std::mem::replace(&mut request.uri, ctx.wire_uri.clone());
        let head = request_head_bytes(request);
        request.uri = original;
        head
    };
    conn.stream
        .write_all(&head)
        .await
        .map_err(upstream_io(conn))?;

    let mut early_response = None;
    let unread = matches!(ctx.args.request.body, Body::Unread);
    if let Some(body) = ctx.args.request.body.as_bytes().cloned() {
        let chunked = ctx.args.request.is_chunked();
        write_loaded_body(&mut conn.stream, &body, chunked)
            .await
            .map_err(upstream_io(conn))?;
    } else if unread {
        if ctx.args.request.expects_continue() && !ctx.args.continue_sent() {
            conn.stream.flush().await.map_err(upstream_io(conn))?;
            let interim = read_upstream_response(conn).await?;
            if interim.status == 100 {
                ctx.args.send_continue().await?;
                ctx.interim_relayed = true;
            } else {
                // Refused before the body was sent; the client may still
                // send it, so its connection can't be reused.
                ctx.args.set_client_reusable(false);
                early_response = Some(interim);
            }
        }
        if early_response.is_none() {
            ctx.body_streamed = true;
            let framing = BodyFraming::of_request(&ctx.args.request);
            let (client, _) = ctx.args.streams_mut();
            copy_body(client, &mut conn.stream, framing)
                .await
                .map_err(final_error)?;
        }
    }
    conn.stream.flush().await.map_err(|err| {
        let err = ProxyError::server_connection(&conn.key.host, conn.key.port, err);
        if ctx.body_streamed {
            final_error(err)
        } else {
            err
        }
    })?;
    ctx.args.timeline.mark(REQUEST_SENT);

    let response = loop {
        let response = match early_response.take() {
            Some(response) => response,
            None => match read_upstream_response(conn).await {
                Ok(response) => response,
                Err(err) if ctx.body_streamed => return Err(final_error(err)),
                Err(err) => return Err(err),
            },
        };
        if response.status == 101 || !response.is_informational() {
            break response;
        }
        if response.status == 100 && ctx.interim_relayed {
            continue;
        }
        let client = ctx.args.client_mut();
        write_response_head(client, &response).await?;
        client.flush().await?;
    };
    ctx.args.timeline.mark(RESPONSE_RECEIVED);

    // Whatever protocol was switched to, the connection is no longer HTTP/1.1.
    if response.status == 101 {
        ctx.args.response = Some(response);
        relay_upgrade(shared, ctx.args, conn).await?;
        return Ok(false);
    }

    ctx.args.response = Some(response);
    Ok(true)
}

async fn read_upstream_response(conn: &mut PooledConnection) -> Result<Response> {
    match read_response(&mut conn.stream).await {
        Ok(Some(response)) => Ok(response),
        // A pooled connection the server closed in the meantime.
        Ok(None) => Err(ProxyError::server_connection(
            &conn.key.host,
            conn.key.port,
            io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection"),
        )),
        Err(ProxyError::Io(err)) => Err(ProxyError::server_connection(
            &conn.key.host,
            conn.key.port,
            err,
        )),
        Err(err) => Err(err),
    }
}

/// Hand the 101 to the client and relay both directions until either side
/// closes.
async fn relay_upgrade(
    shared: &ServerShared,
    args: &mut SessionEventArgs,
    conn: &mut PooledConnection,
) -> Result<()> {
    shared.hooks.before_response(args).await?;
    if let Some(response) = args.response.as_ref() {
        let head = crate::http::writer::response_head_bytes(response);
        let client = args.client_mut();
        client.write_all(&head).await?;
        client.flush().await?;
    }
    args.timeline.mark(RESPONSE_SENT);
    args.set_client_reusable(false);
    args.set_server_reusable(false);

    let websocket = args.request.is_websocket_upgrade();
    let observer = (websocket && shared.hooks.has_frame_observers()).then(|| {
        WebSocketFrameDecoder::new(args.id.clone(), shared.hooks.frame_observers().to_vec())
            .into_relay_observer()
    });
    let cancel = args.cancellation_token().clone();
    let (client, _) = args.streams_mut();
    let stats = relay(client, &mut conn.stream, &shared.buffer_pool, observer, &cancel).await?;
    tracing::debug!(
        "{} session {} to {}:{} closed ({} bytes up, {} bytes down)",
        if websocket { "WebSocket" } else { "Upgraded" },
        args.id,
        conn.key.host,
        conn.key.port,
        stats.client_to_server,
        stats.server_to_client
    );
    shared.hooks.after_response(args).await?;
    Ok(())
}

/// Write the session's response to the client, streaming an unread body
/// from the upstream connection. Returns whether the response allows the
/// connection to stay open.
async fn send_response(args: &mut SessionEventArgs, method: &str) -> Result<bool> {
    let Some(mut response) = args.response.take() else {
        return Err(ProxyError::protocol("no response to send"));
    };

    let mut keep_alive = response.keep_alive();
    if matches!(response.body, Body::Unread) {
        if response.is_close_delimited(method) {
            response.headers.set("Connection", "close");
            keep_alive = false;
        }
        let framing = BodyFraming::of_response(&response, method);
        write_response_head(args.client_mut(), &response).await?;
        let (client, server) = args.streams_mut();
        if let Some(conn) = server {
            copy_body(&mut conn.stream, client, framing).await?;
        } else {
            client.flush().await?;
        }
    } else {
        write_response(args.client_mut(), &response).await?;
    }

    args.timeline.mark(RESPONSE_SENT);
    args.response = Some(response);
    Ok(keep_alive)
}

//! Per-exchange state handed to interception hooks.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::http::{Body, Request, Response};
use crate::config::EndpointConfig;
use crate::error::{ProxyError, Result};
use crate::http::{drain_body, read_body, BodyFraming};
use crate::io::ClientStream;
use crate::proxy::compression::Compression;
use crate::proxy::pool::PooledConnection;

pub const SESSION_CREATED: &str = "Session Created";
pub const REQUEST_RECEIVED: &str = "Request Received";
pub const CONNECTION_READY: &str = "Connection Ready";
pub const REQUEST_SENT: &str = "Request Sent";
pub const RESPONSE_RECEIVED: &str = "Response Received";
pub const RESPONSE_SENT: &str = "Response Sent";

/// Named timestamps collected over one exchange.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    marks: Vec<(&'static str, DateTime<Utc>)>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, name: &'static str) {
        self.mark_at(name, Utc::now());
    }

    pub fn mark_at(&mut self, name: &'static str, at: DateTime<Utc>) {
        match self.marks.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = at,
            None => self.marks.push((name, at)),
        }
    }

    pub fn get(&self, name: &str) -> Option<DateTime<Utc>> {
        self.marks
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, at)| *at)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, DateTime<Utc>)> + '_ {
        self.marks.iter().copied()
    }

    /// Milliseconds from `from` to `to`, when both were marked.
    pub fn elapsed_ms(&self, from: &str, to: &str) -> Option<i64> {
        Some((self.get(to)? - self.get(from)?).num_milliseconds())
    }
}

/// Where a client connection came from and how it reached us.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_addr: SocketAddr,
    pub endpoint: Arc<EndpointConfig>,
    pub is_https: bool,
    /// The CONNECT that opened the tunnel this connection runs inside.
    pub connect_request: Option<Arc<Request>>,
}

/// One request/response exchange as seen by hooks.
///
/// The session owns the client stream for the duration of the exchange and
/// borrows the upstream connection from the pool once it is established.
pub struct SessionEventArgs {
    pub id: String,
    pub request: Request,
    pub response: Option<Response>,
    pub timeline: Timeline,
    /// Free slot for hooks to carry state from request to response.
    pub user_data: Option<Box<dyn Any + Send + Sync>>,
    info: Arc<ConnectionInfo>,
    client: ClientStream,
    server: Option<PooledConnection>,
    cancel: CancellationToken,
    compression: Arc<dyn Compression>,
    body_limit: usize,
    continue_sent: bool,
    short_circuited: bool,
    client_reusable: bool,
    server_reusable: bool,
}

impl fmt::Debug for SessionEventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventArgs")
            .field("id", &self.id)
            .field("client_addr", &self.info.client_addr)
            .field("is_https", &self.info.is_https)
            .field("method", &self.request.method)
            .field("uri", &self.request.uri)
            .field("status", &self.response.as_ref().map(|r| r.status))
            .finish()
    }
}

impl SessionEventArgs {
    pub fn new(
        info: Arc<ConnectionInfo>,
        client: ClientStream,
        request: Request,
        compression: Arc<dyn Compression>,
        cancel: CancellationToken,
    ) -> Self {
        let mut timeline = Timeline::new();
        timeline.mark(REQUEST_RECEIVED);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            response: None,
            timeline,
            user_data: None,
            info,
            client,
            server: None,
            cancel,
            compression,
            body_limit: crate::http::MAX_LOADED_BODY,
            continue_sent: false,
            short_circuited: false,
            client_reusable: true,
            server_reusable: true,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.info.client_addr
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.info.endpoint
    }

    pub fn is_https(&self) -> bool {
        self.info.is_https
    }

    pub fn connect_request(&self) -> Option<&Request> {
        self.info.connect_request.as_deref()
    }

    pub fn connection_info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    pub fn client_mut(&mut self) -> &mut ClientStream {
        &mut self.client
    }

    pub fn server(&self) -> Option<&PooledConnection> {
        self.server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut PooledConnection> {
        self.server.as_mut()
    }

    /// Stop the session after the current hook returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Answer the client with `response` instead of (or in place of) the
    /// upstream response.
    pub fn respond(&mut self, mut response: Response) {
        if matches!(
            self.response.as_ref().map(|r| &r.body),
            Some(Body::Unread)
        ) {
            // the upstream body is abandoned mid-stream
            self.server_reusable = false;
        }
        if !response.body.is_loaded() && !response.is_chunked() {
            response.set_body(Bytes::new());
        }
        self.response = Some(response);
        self.short_circuited = true;
    }

    pub fn is_short_circuited(&self) -> bool {
        self.short_circuited
    }

    /// Read the whole request body into memory, answering a pending
    /// `Expect: 100-continue` first.
    pub async fn load_request_body(&mut self) -> Result<Bytes> {
        if matches!(self.request.body, Body::Unread) {
            self.send_continue().await?;
            let framing = BodyFraming::of_request(&self.request);
            let body = read_body(&mut self.client, framing, self.body_limit).await?;
            self.request.body = Body::Loaded(body);
        }
        Ok(self.request.body.as_bytes().cloned().unwrap_or_default())
    }

    /// Request body with its Content-Encoding removed.
    pub async fn decoded_request_body(&mut self) -> Result<Bytes> {
        let body = self.load_request_body().await?;
        match self.request.content_encoding() {
            Some(encoding) => self.compression.decompress(&body, encoding),
            None => Ok(body),
        }
    }

    /// Replace the request body. Any unread original body is discarded.
    pub async fn set_request_body(&mut self, body: impl Into<Bytes>) -> Result<()> {
        if matches!(self.request.body, Body::Unread) {
            if self.request.expects_continue() && !self.continue_sent {
                // The client has not sent its body yet; don't wait for it.
                self.client_reusable = false;
                self.request.headers.remove("expect");
            } else {
                let framing = BodyFraming::of_request(&self.request);
                drain_body(&mut self.client, framing).await?;
            }
        }
        self.request.set_body(body);
        Ok(())
    }

    /// Replace the request body with `plain`, encoded with the request's
    /// Content-Encoding.
    pub async fn set_decoded_request_body(&mut self, plain: impl Into<Bytes>) -> Result<()> {
        let plain = plain.into();
        let body = match self.request.content_encoding() {
            Some(encoding) => self.compression.compress(&plain, encoding)?,
            None => plain,
        };
        self.set_request_body(body).await
    }

    /// Read the whole upstream response body into memory.
    pub async fn load_response_body(&mut self) -> Result<Bytes> {
        let response = self
            .response
            .as_mut()
            .ok_or_else(|| ProxyError::protocol("no response to load a body from"))?;
        if matches!(response.body, Body::Unread) {
            let server = self
                .server
                .as_mut()
                .ok_or_else(|| ProxyError::protocol("upstream connection already released"))?;
            let framing = BodyFraming::of_response(response, &self.request.method);
            let body = read_body(&mut server.stream, framing, self.body_limit).await?;
            response.body = Body::Loaded(body);
        }
        Ok(response.body.as_bytes().cloned().unwrap_or_default())
    }

    pub async fn decoded_response_body(&mut self) -> Result<Bytes> {
        let body = self.load_response_body().await?;
        match self.response.as_ref().and_then(Response::content_encoding) {
            Some(encoding) => self.compression.decompress(&body, encoding),
            None => Ok(body),
        }
    }

    /// Replace the response body, draining any unread upstream body first.
    pub async fn set_response_body(&mut self, body: impl Into<Bytes>) -> Result<()> {
        let response = self
            .response
            .as_mut()
            .ok_or_else(|| ProxyError::protocol("no response to replace the body of"))?;
        if matches!(response.body, Body::Unread) {
            if let Some(server) = self.server.as_mut() {
                let framing = BodyFraming::of_response(response, &self.request.method);
                drain_body(&mut server.stream, framing).await?;
            }
        }
        response.set_body(body);
        Ok(())
    }

    pub async fn set_decoded_response_body(&mut self, plain: impl Into<Bytes>) -> Result<()> {
        let plain = plain.into();
        let encoding = self
            .response
            .as_ref()
            .and_then(Response::content_encoding)
            .map(str::to_string);
        let body = match encoding {
            Some(encoding) => self.compression.compress(&plain, &encoding)?,
            None => plain,
        };
        self.set_response_body(body).await
    }

    /// Tell the client to go ahead with its body, once.
    pub(crate) async fn send_continue(&mut self) -> Result<()> {
        if self.continue_sent || !self.request.expects_continue() {
            return Ok(());
        }
        self.client
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await?;
        self.client.flush().await?;
        self.continue_sent = true;
        self.request.headers.remove("expect");
        Ok(())
    }

    pub(crate) fn continue_sent(&self) -> bool {
        self.continue_sent
    }

    pub(crate) fn attach_server(&mut self, conn: PooledConnection) {
        self.server = Some(conn);
    }

    pub(crate) fn take_server(&mut self) -> Option<PooledConnection> {
        self.server.take()
    }

    /// Split borrow of both streams for body forwarding.
    pub(crate) fn streams_mut(&mut self) -> (&mut ClientStream, Option<&mut PooledConnection>) {
        (&mut self.client, self.server.as_mut())
    }

    pub(crate) fn client_reusable(&self) -> bool {
        self.client_reusable
    }

    pub(crate) fn set_client_reusable(&mut self, reusable: bool) {
        self.client_reusable = reusable;
    }

    pub(crate) fn server_reusable(&self) -> bool {
        self.server_reusable
    }

    pub(crate) fn set_server_reusable(&mut self, reusable: bool) {
        self.server_reusable = reusable;
    }

    pub(crate) fn into_client(self) -> ClientStream {
        self.client
    }
}

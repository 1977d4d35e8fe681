//! Interception hooks.
//!
//! Hooks are async closures awaited in registration order. Session hooks get
//! `&mut SessionEventArgs`; tunnel and certificate hooks get their own
//! argument types. Frame observers are plain synchronous callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{ProxyError, Result};
use crate::models::http::{Request, Response};
use crate::models::session::SessionEventArgs;
use crate::models::tls::{ClientHelloInfo, ServerHelloInfo};
use crate::models::websocket::WebSocketFrame;

pub type HookFuture<'a> = BoxFuture<'a, Result<()>>;

pub type SessionHook =
    Arc<dyn for<'a> Fn(&'a mut SessionEventArgs) -> HookFuture<'a> + Send + Sync>;
pub type TunnelHook =
    Arc<dyn for<'a> Fn(&'a mut TunnelConnectArgs) -> HookFuture<'a> + Send + Sync>;
pub type CertificateValidationHook =
    Arc<dyn for<'a> Fn(&'a mut ServerCertificateValidationArgs) -> HookFuture<'a> + Send + Sync>;
pub type CertificateSelectionHook =
    Arc<dyn for<'a> Fn(&'a mut ClientCertificateSelectionArgs) -> HookFuture<'a> + Send + Sync>;
pub type FrameObserver = Arc<dyn Fn(&WebSocketFrame) + Send + Sync>;

/// State shared with the tunnel hooks for one CONNECT.
#[derive(Debug)]
pub struct TunnelConnectArgs {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub connect_request: Request,
    pub host: String,
    pub port: u16,
    /// Cleared by a hook to relay the tunnel without interception.
    pub decrypt_ssl: bool,
    pub client_hello: Option<ClientHelloInfo>,
    /// Only set for the after-connect hooks of a passthrough tunnel.
    pub server_hello: Option<ServerHelloInfo>,
    denial: Option<Response>,
}

impl TunnelConnectArgs {
    pub fn new(
        session_id: impl Into<String>,
        client_addr: SocketAddr,
        connect_request: Request,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            client_addr,
            connect_request,
            host: host.into(),
            port,
            decrypt_ssl: true,
            client_hello: None,
            server_hello: None,
            denial: None,
        }
    }

    /// Refuse the tunnel. `None` sends a plain 403.
    pub fn deny(&mut self, response: Option<Response>) {
        self.denial =
            Some(response.unwrap_or_else(|| Response::text(403, "Tunnel denied by proxy policy")));
    }

    pub fn is_denied(&self) -> bool {
        self.denial.is_some()
    }

    pub fn take_denial(&mut self) -> Option<Response> {
        self.denial.take()
    }
}

/// Passed to validation hooks after the upstream handshake. `is_valid`
/// starts at the default webpki verdict.
#[derive(Debug)]
pub struct ServerCertificateValidationArgs {
    pub host: String,
    pub port: u16,
    pub chain: Vec<CertificateDer<'static>>,
    /// Why the default verifier rejected the chain, if it did.
    pub default_error: Option<String>,
    pub is_valid: bool,
}

/// A client certificate chain and its private key.
#[derive(Debug)]
pub struct ClientCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ClientCertificate {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Passed to selection hooks before the upstream handshake.
#[derive(Debug)]
pub struct ClientCertificateSelectionArgs {
    pub host: String,
    pub port: u16,
    pub certificate: Option<ClientCertificate>,
}

/// Every registered hook and observer.
#[derive(Clone, Default)]
pub struct Hooks {
    before_tunnel_connect: Vec<TunnelHook>,
    after_tunnel_connect: Vec<TunnelHook>,
    before_request: Vec<SessionHook>,
    before_response: Vec<SessionHook>,
    after_response: Vec<SessionHook>,
    server_certificate_validation: Vec<CertificateValidationHook>,
    client_certificate_selection: Vec<CertificateSelectionHook>,
    websocket_frame: Vec<FrameObserver>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_tunnel_connect", &self.before_tunnel_connect.len())
            .field("after_tunnel_connect", &self.after_tunnel_connect.len())
            .field("before_request", &self.before_request.len())
            .field("before_response", &self.before_response.len())
            .field("after_response", &self.after_response.len())
            .field(
                "server_certificate_validation",
                &self.server_certificate_validation.len(),
            )
            .field(
                "client_certificate_selection",
                &self.client_certificate_selection.len(),
            )
            .field("websocket_frame", &self.websocket_frame.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_tunnel_connect<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut TunnelConnectArgs) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.before_tunnel_connect.push(Arc::new(hook));
        self
    }

    pub fn on_after_tunnel_connect<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut TunnelConnectArgs) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.after_tunnel_connect.push(Arc::new(hook));
        self
    }

    pub fn on_before_request<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut SessionEventArgs) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.before_request.push(Arc::new(hook));
        self
    }

    pub fn on_before_response<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut SessionEventArgs) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.before_response.push(Arc::new(hook));
        self
    }

    pub fn on_after_response<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut SessionEventArgs) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.after_response.push(Arc::new(hook));
        self
    }

    pub fn on_server_certificate_validation<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut ServerCertificateValidationArgs) -> HookFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.server_certificate_validation.push(Arc::new(hook));
        self
    }

    pub fn on_client_certificate_selection<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut ClientCertificateSelectionArgs) -> HookFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.client_certificate_selection.push(Arc::new(hook));
        self
    }

    pub fn on_websocket_frame<F>(&mut self, observer: F) -> &mut Self
    where
        F: Fn(&WebSocketFrame) + Send + Sync + 'static,
    {
        self.websocket_frame.push(Arc::new(observer));
        self
    }

    pub fn frame_observers(&self) -> &[FrameObserver] {
        &self.websocket_frame
    }

    pub fn has_frame_observers(&self) -> bool {
        !self.websocket_frame.is_empty()
    }

    pub async fn before_tunnel_connect(&self, args: &mut TunnelConnectArgs) -> Result<()> {
        for hook in &self.before_tunnel_connect {
            hook(args).await?;
            if args.is_denied() {
                break;
            }
        }
        Ok(())
    }

    pub async fn after_tunnel_connect(&self, args: &mut TunnelConnectArgs) -> Result<()> {
        for hook in &self.after_tunnel_connect {
            hook(args).await?;
        }
        Ok(())
    }

    pub async fn before_request(&self, args: &mut SessionEventArgs) -> Result<()> {
        run_session_hooks(&self.before_request, args).await
    }

    pub async fn before_response(&self, args: &mut SessionEventArgs) -> Result<()> {
        run_session_hooks(&self.before_response, args).await
    }

    pub async fn after_response(&self, args: &mut SessionEventArgs) -> Result<()> {
        run_session_hooks(&self.after_response, args).await
    }

    pub async fn validate_server_certificate(
        &self,
        args: &mut ServerCertificateValidationArgs,
    ) -> Result<()> {
        for hook in &self.server_certificate_validation {
            hook(args).await?;
        }
        Ok(())
    }

    pub async fn select_client_certificate(
        &self,
        args: &mut ClientCertificateSelectionArgs,
    ) -> Result<()> {
        for hook in &self.client_certificate_selection {
            hook(args).await?;
        }
        Ok(())
    }
}

async fn run_session_hooks(hooks: &[SessionHook], args: &mut SessionEventArgs) -> Result<()> {
    for hook in hooks {
        hook(args).await?;
        if args.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }
    }
    Ok(())
}

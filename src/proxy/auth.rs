//! Proxy authentication.
//!
//! The credential checks themselves live behind two traits: one for Basic
//! user/password pairs and one for token schemes such as NTLM or Negotiate,
//! which may need several round trips on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::models::http::{Request, Response};

pub const DEFAULT_REALM: &str = "Burrow Proxy";

/// Result of one scheme authentication step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    /// Send this token back to the client and wait for the next step.
    ContinuationNeeded(String),
    Failure,
}

#[async_trait]
pub trait BasicAuthenticator: Send + Sync {
    async fn validate(&self, username: &str, password: &str) -> bool;
}

#[async_trait]
impl<F> BasicAuthenticator for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    async fn validate(&self, username: &str, password: &str) -> bool {
        self(username, password)
    }
}

/// Who is asking, for scheme authenticators that track per-connection state.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub client_addr: SocketAddr,
    pub method: String,
    pub uri: String,
}

#[async_trait]
pub trait SchemeAuthenticator: Send + Sync {
    /// Scheme names offered in the challenge, e.g. `NTLM`.
    fn schemes(&self) -> Vec<String>;

    async fn authenticate(&self, info: &AuthInfo, scheme: &str, token: &str) -> AuthResult;
}

#[derive(Clone)]
pub enum Authenticator {
    Basic(Arc<dyn BasicAuthenticator>),
    Scheme(Arc<dyn SchemeAuthenticator>),
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authenticator::Basic(_) => f.write_str("Authenticator::Basic"),
            Authenticator::Scheme(auth) => f
                .debug_tuple("Authenticator::Scheme")
                .field(&auth.schemes())
                .finish(),
        }
    }
}

/// What the session should do with a request.
#[derive(Debug)]
pub enum AuthOutcome {
    Authorized,
    /// Answer with `response`; close the client connection afterwards when
    /// `close` is set.
    Challenge { response: Response, close: bool },
}

impl Authenticator {
    /// Check the request's `Proxy-Authorization`. The header is removed on
    /// success so it never reaches the origin.
    pub async fn authorize(
        &self,
        request: &mut Request,
        client_addr: SocketAddr,
        realm: &str,
    ) -> AuthOutcome {
        let header = request
            .headers
            .get("proxy-authorization")
            .map(str::to_string);
        let outcome = match self {
            Authenticator::Basic(auth) => authorize_basic(auth.as_ref(), header, realm).await,
            Authenticator::Scheme(auth) => {
                let info = AuthInfo {
                    client_addr,
                    method: request.method.clone(),
                    uri: request.uri.clone(),
                };
                authorize_scheme(auth.as_ref(), &info, header).await
            }
        };
        if matches!(outcome, AuthOutcome::Authorized) {
            request.headers.remove("proxy-authorization");
        }
        outcome
    }
}

async fn authorize_basic(
    auth: &dyn BasicAuthenticator,
    header: Option<String>,
    realm: &str,
) -> AuthOutcome {
    if let Some((user, pass)) = header.as_deref().and_then(parse_basic) {
        if auth.validate(&user, &pass).await {
            return AuthOutcome::Authorized;
        }
        tracing::debug!("proxy credentials rejected for user {}", user);
    }
    let mut response = challenge_response();
    response
        .headers
        .add("Proxy-Authenticate", format!("Basic realm=\"{realm}\""));
    response.headers.add("Proxy-Connection", "close");
    AuthOutcome::Challenge {
        response,
        close: true,
    }
}

async fn authorize_scheme(
    auth: &dyn SchemeAuthenticator,
    info: &AuthInfo,
    header: Option<String>,
) -> AuthOutcome {
    let schemes = auth.schemes();
    let offered = header.as_deref().and_then(|value| {
        let (scheme, token) = value.trim().split_once(' ')?;
        let scheme = schemes
            .iter()
            .find(|s| s.eq_ignore_ascii_case(scheme))?
            .clone();
        Some((scheme, token.trim().to_string()))
    });

    let Some((scheme, token)) = offered else {
        // No usable header yet: offer every scheme and keep the connection,
        // since connection-bound schemes must continue on it.
        let mut response = challenge_response();
        for scheme in &schemes {
            response.headers.append("Proxy-Authenticate", scheme.clone());
        }
        return AuthOutcome::Challenge {
            response,
            close: header.is_some(),
        };
    };

    match auth.authenticate(info, &scheme, &token).await {
        AuthResult::Success => AuthOutcome::Authorized,
        AuthResult::ContinuationNeeded(next) => {
            let mut response = challenge_response();
            response
                .headers
                .append("Proxy-Authenticate", format!("{scheme} {next}"));
            AuthOutcome::Challenge {
                response,
                close: false,
            }
        }
        AuthResult::Failure => {
            let mut response = challenge_response();
            response.headers.add("Proxy-Connection", "close");
            AuthOutcome::Challenge {
                response,
                close: true,
            }
        }
    }
}

fn challenge_response() -> Response {
    Response::text(407, "Proxy authentication required")
}

/// Decode `Basic <base64(user:pass)>`.
fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.2:50000".parse().unwrap()
    }

    fn request_with(header: Option<&str>) -> Request {
        let mut request = Request::new("GET", "http://example.com/");
        request.headers.add("Host", "example.com");
        if let Some(value) = header {
            request.headers.add("Proxy-Authorization", value);
        }
        request
    }

    fn basic() -> Authenticator {
        Authenticator::Basic(Arc::new(|user: &str, pass: &str| {
            user == "alice" && pass == "s3cret"
        }))
    }

    #[tokio::test]
    async fn valid_basic_credentials_are_stripped() {
        let mut request = request_with(Some("Basic YWxpY2U6czNjcmV0"));
        let outcome = basic().authorize(&mut request, addr(), DEFAULT_REALM).await;
        assert!(matches!(outcome, AuthOutcome::Authorized));
        assert!(!request.headers.contains("proxy-authorization"));
    }

    #[tokio::test]
    async fn missing_basic_credentials_get_challenge_and_close() {
        let mut request = request_with(None);
        match basic().authorize(&mut request, addr(), "corp").await {
            AuthOutcome::Challenge { response, close } => {
                assert!(close);
                assert_eq!(response.status, 407);
                assert_eq!(
                    response.headers.get("proxy-authenticate"),
                    Some("Basic realm=\"corp\"")
                );
                assert_eq!(response.headers.get("proxy-connection"), Some("close"));
            }
            AuthOutcome::Authorized => panic!("request without credentials was authorized"),
        }
    }

    #[tokio::test]
    async fn malformed_or_wrong_basic_is_rejected() {
        for header in ["Basic !!!", "Bearer abc", "Basic YWxpY2U6d3Jvbmc="] {
            let mut request = request_with(Some(header));
            let outcome = basic().authorize(&mut request, addr(), DEFAULT_REALM).await;
            assert!(matches!(outcome, AuthOutcome::Challenge { close: true, .. }), "{header}");
            assert!(request.headers.contains("proxy-authorization"));
        }
    }

    struct TwoStep;

    #[async_trait]
    impl SchemeAuthenticator for TwoStep {
        fn schemes(&self) -> Vec<String> {
            vec!["NTLM".into(), "Negotiate".into()]
        }

        async fn authenticate(&self, _info: &AuthInfo, scheme: &str, token: &str) -> AuthResult {
            match (scheme, token) {
                ("NTLM", "type1") => AuthResult::ContinuationNeeded("type2".into()),
                ("NTLM", "type3") => AuthResult::Success,
                _ => AuthResult::Failure,
            }
        }
    }

    #[tokio::test]
    async fn scheme_challenge_lists_every_scheme() {
        let auth = Authenticator::Scheme(Arc::new(TwoStep));
        let mut request = request_with(None);
        match auth.authorize(&mut request, addr(), DEFAULT_REALM).await {
            AuthOutcome::Challenge { response, close } => {
                assert!(!close);
                let offered: Vec<_> = response.headers.get_all("proxy-authenticate").collect();
                assert_eq!(offered, vec!["NTLM", "Negotiate"]);
            }
            AuthOutcome::Authorized => panic!("authorized without a token"),
        }
    }

    #[tokio::test]
    async fn scheme_handshake_continues_then_succeeds() {
        let auth = Authenticator::Scheme(Arc::new(TwoStep));

        let mut first = request_with(Some("ntlm type1"));
        match auth.authorize(&mut first, addr(), DEFAULT_REALM).await {
            AuthOutcome::Challenge { response, close } => {
                assert!(!close);
                assert_eq!(response.headers.get("proxy-authenticate"), Some("NTLM type2"));
            }
            AuthOutcome::Authorized => panic!("first leg must not authorize"),
        }

        let mut second = request_with(Some("NTLM type3"));
        assert!(matches!(
            auth.authorize(&mut second, addr(), DEFAULT_REALM).await,
            AuthOutcome::Authorized
        ));
        assert!(!second.headers.contains("proxy-authorization"));

        let mut bad = request_with(Some("NTLM forged"));
        assert!(matches!(
            auth.authorize(&mut bad, addr(), DEFAULT_REALM).await,
            AuthOutcome::Challenge { close: true, .. }
        ));
    }
}

//! HTTP/1.x message model
//!
//! Requests and responses as the proxy sees them on the wire: a start line,
//! an ordered header list and a body that is either still on the socket or
//! already materialized.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Headers that may appear at most once per message.
const UNIQUE_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "content-type",
    "content-encoding",
    "connection",
    "proxy-connection",
    "upgrade",
];

/// HTTP protocol version on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HttpVersion {
    Http10,
    #[default]
    Http11,
}

impl HttpVersion {
    pub fn from_minor(minor: u8) -> Self {
        if minor == 0 {
            HttpVersion::Http10
        } else {
            HttpVersion::Http11
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HTTP/1.0" => Some(HttpVersion::Http10),
            "HTTP/1.1" => Some(HttpVersion::Http11),
            _ => None,
        }
    }

    /// Registered method name; empty for [`KnownMethod::Extension`].
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Methods recognized when classifying the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownMethod {
    Connect,
    Other(&'static str),
    /// A syntactically valid method outside the registered list, such as
    /// `PURGE`. Forwarded like any other request.
    Extension,
}

impl KnownMethod {
    /// Longest extension method accepted by the classifier.
    pub const MAX_EXTENSION_LEN: usize = 32;

    pub const ALL: &'static [&'static str] = &[
        "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH", "CONNECT",
        "PROPFIND", "PROPPATCH", "MKCOL", "COPY", "MOVE", "LOCK", "UNLOCK",
    ];

    /// RFC 7230 `tchar`.
    pub fn is_token_byte(byte: u8) -> bool {
        byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
    }

    pub fn from_name(name: &'static str) -> Self {
        if name == "CONNECT" {
            KnownMethod::Connect
        } else {
            KnownMethod::Other(name)
        }
    }

    /// Registered method name; empty for [`KnownMethod::Extension`].
    pub fn as_str(&self) -> &'static str {
        match self {
            KnownMethod::Connect => "CONNECT",
            KnownMethod::Other(name) => name,
            KnownMethod::Extension => "",
        }
    }
}

/// A single header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    /// Text form of the value. Bytes that are not UTF-8 show up as U+FFFD.
    pub value: String,
    /// Wire bytes, kept only when they are not valid UTF-8.
    #[serde(skip)]
    raw_value: Option<Vec<u8>>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            raw_value: None,
        }
    }

    /// Build from wire bytes, trimming surrounding whitespace.
    pub fn from_raw(name: impl Into<String>, value: &[u8]) -> Self {
        let value = value.trim_ascii();
        match std::str::from_utf8(value) {
            Ok(text) => Self::new(name, text),
            Err(_) => Self {
                name: name.into(),
                value: String::from_utf8_lossy(value).into_owned(),
                raw_value: Some(value.to_vec()),
            },
        }
    }

    /// Bytes to put on the wire. The original bytes win as long as `value`
    /// has not been replaced since parsing.
    pub fn value_bytes(&self) -> &[u8] {
        match &self.raw_value {
            Some(raw) if String::from_utf8_lossy(raw) == self.value => raw,
            _ => self.value.as_bytes(),
        }
    }
}

/// Ordered header list with case-insensitive lookups.
///
/// Names listed as unique (Host, Content-Length, ...) are replaced in place by
/// [`HeaderCollection::add`]; everything else accumulates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderCollection {
    entries: Vec<Header>,
}

impl HeaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unique(name: &str) -> bool {
        UNIQUE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append without any uniqueness check. Used by the parser so duplicate
    /// framing headers can be validated afterwards.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header::new(name, value));
    }

    /// [`append`](Self::append) for a value straight off the wire.
    pub fn append_raw(&mut self, name: impl Into<String>, value: &[u8]) {
        self.entries.push(Header::from_raw(name, value));
    }

    /// Add a header, replacing the existing value for unique names.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if Self::is_unique(&name) {
            self.set(name, value);
        } else {
            self.append(name, value);
        }
    }

    /// Replace every value for `name` with a single one, keeping the position
    /// of the first occurrence.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                self.entries[pos] = Header::new(name.clone(), value);
                let mut index = 0;
                self.entries.retain(|h| {
                    let keep = index <= pos || !h.name.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push(Header::new(name, value)),
        }
    }

    /// Remove every value for `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// Whether a comma separated header such as `Connection` carries `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// `Transfer-Encoding` ends with `chunked`.
    pub fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .last()
            .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Declared body length. `None` when chunked or absent.
    pub fn content_length(&self) -> Option<u64> {
        if self.is_chunked() {
            return None;
        }
        self.get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Keep-alive decision from `Connection`/`Proxy-Connection` and the
    /// version default.
    fn keep_alive(&self, version: HttpVersion) -> bool {
        for name in ["connection", "proxy-connection"] {
            if self.has_token(name, "close") {
                return false;
            }
            if self.has_token(name, "keep-alive") {
                return true;
            }
        }
        version == HttpVersion::Http11
    }
}

impl<'a> IntoIterator for &'a HeaderCollection {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Message body state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    /// Still on the socket; streamed through when the message is forwarded.
    Unread,
    /// Materialized in memory.
    Loaded(Bytes),
    /// No body.
    #[default]
    Empty,
}

impl Body {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Body::Loaded(_))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Loaded(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Destination derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub is_https: bool,
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: HttpVersion,
    pub headers: HeaderCollection,
    pub body: Body,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            version: HttpVersion::Http11,
            headers: HeaderCollection::new(),
            body: Body::Empty,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.is_chunked()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.content_length()
    }

    /// A request without Content-Length or chunked framing has no body.
    pub fn has_body(&self) -> bool {
        self.is_chunked() || self.content_length().map(|l| l > 0).unwrap_or(false)
    }

    pub fn keep_alive(&self) -> bool {
        self.headers.keep_alive(self.version)
    }

    pub fn expects_continue(&self) -> bool {
        self.headers.has_token("expect", "100-continue")
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("upgrade", "websocket")
            && self.headers.has_token("connection", "upgrade")
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.headers.get("content-encoding")
    }

    /// Destination of the request. Absolute URIs win over the Host header;
    /// CONNECT uses the authority form.
    pub fn target(&self, is_https: bool) -> Option<Target> {
        if self.is_connect() {
            let (host, port) = split_authority(&self.uri, 443)?;
            return Some(Target {
                host,
                port,
                is_https: true,
            });
        }

        let lower = self.uri.to_ascii_lowercase();
        let (scheme_https, rest) = if lower.starts_with("http://") {
            (Some(false), &self.uri[7..])
        } else if lower.starts_with("https://") {
            (Some(true), &self.uri[8..])
        } else {
            (None, "")
        };

        if let Some(https) = scheme_https {
            let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
            let default_port = if https { 443 } else { 80 };
            let (host, port) = split_authority(authority, default_port)?;
            return Some(Target {
                host,
                port,
                is_https: https,
            });
        }

        let default_port = if is_https { 443 } else { 80 };
        let (host, port) = split_authority(self.host()?, default_port)?;
        Some(Target {
            host,
            port,
            is_https,
        })
    }

    /// Path and query for forwarding straight to an origin server.
    pub fn origin_form(&self) -> String {
        let lower = self.uri.to_ascii_lowercase();
        let skip = if lower.starts_with("http://") {
            7
        } else if lower.starts_with("https://") {
            8
        } else {
            return self.uri.clone();
        };
        let rest = &self.uri[skip..];
        match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'/' => rest[idx..].to_string(),
            Some(idx) => format!("/{}", &rest[idx..]),
            None => "/".to_string(),
        }
    }

    /// Replace the body and fix up the framing headers.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        apply_body_framing(&mut self.headers, body.len());
        self.body = Body::Loaded(body);
    }
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderCollection,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: HttpVersion::Http11,
            status,
            reason: reason.into(),
            headers: HeaderCollection::new(),
            body: Body::Empty,
        }
    }

    /// Response with the standard reason phrase for `status`.
    pub fn with_status(status: u16) -> Self {
        Self::new(status, reason_phrase(status))
    }

    /// Plain-text response with an explicit Content-Length.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let body: String = body.into();
        let mut response = Self::with_status(status);
        response
            .headers
            .add("Content-Type", "text/plain; charset=utf-8");
        response.set_body(body);
        response
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.is_chunked()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.content_length()
    }

    pub fn keep_alive(&self) -> bool {
        self.headers.keep_alive(self.version)
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// HEAD responses, 1xx, 204 and 304 never carry a body.
    pub fn has_body_for(&self, request_method: &str) -> bool {
        !(request_method.eq_ignore_ascii_case("HEAD")
            || self.is_informational()
            || self.status == 204
            || self.status == 304)
    }

    /// Body ends when the server closes the connection.
    pub fn is_close_delimited(&self, request_method: &str) -> bool {
        self.has_body_for(request_method) && !self.is_chunked() && self.content_length().is_none()
    }

    pub fn is_websocket_accept(&self) -> bool {
        self.status == 101 && self.headers.has_token("upgrade", "websocket")
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.headers.get("content-encoding")
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        apply_body_framing(&mut self.headers, body.len());
        self.body = Body::Loaded(body);
    }
}

fn apply_body_framing(headers: &mut HeaderCollection, len: usize) {
    if headers.is_chunked() {
        headers.remove("content-length");
    } else {
        headers.set("Content-Length", len.to_string());
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_headers_are_replaced() {
        let mut headers = HeaderCollection::new();
        headers.add("Host", "a.com");
        headers.add("set-cookie", "a=1");
        headers.add("HOST", "b.com");
        headers.add("Set-Cookie", "b=2");
        assert_eq!(headers.get("host"), Some("b.com"));
        assert_eq!(headers.get_all("set-cookie").count(), 2);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn set_keeps_first_position() {
        let mut headers = HeaderCollection::new();
        headers.append("X-A", "1");
        headers.append("X-B", "2");
        headers.append("x-a", "3");
        headers.set("X-A", "9");
        let names: Vec<_> = headers.iter().map(|h| h.value.as_str()).collect();
        assert_eq!(names, vec!["9", "2"]);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut req = Request::new("POST", "/");
        req.headers.append("Content-Length", "10");
        req.headers.append("Transfer-Encoding", "gzip, chunked");
        assert!(req.is_chunked());
        assert_eq!(req.content_length(), None);
        assert!(req.has_body());
    }

    #[test]
    fn keep_alive_defaults() {
        let mut req = Request::new("GET", "/");
        assert!(req.keep_alive());
        req.headers.add("Connection", "close");
        assert!(!req.keep_alive());

        let mut resp = Response::with_status(200);
        resp.version = HttpVersion::Http10;
        assert!(!resp.keep_alive());
        resp.headers.add("Connection", "Keep-Alive");
        assert!(resp.keep_alive());
    }

    #[test]
    fn target_from_absolute_uri_and_host() {
        let req = Request::new("GET", "http://example.com:8080/path?q=1");
        assert_eq!(
            req.target(false),
            Some(Target {
                host: "example.com".into(),
                port: 8080,
                is_https: false
            })
        );
        assert_eq!(req.origin_form(), "/path?q=1");

        let mut req = Request::new("GET", "/index.html");
        req.headers.add("Host", "example.org");
        let target = req.target(true).unwrap();
        assert_eq!(target.port, 443);
        assert_eq!(req.origin_form(), "/index.html");

        let req = Request::new("CONNECT", "[::1]:8443");
        let target = req.target(false).unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn origin_form_without_path() {
        assert_eq!(Request::new("GET", "http://a.com").origin_form(), "/");
        assert_eq!(Request::new("GET", "http://a.com?x").origin_form(), "/?x");
    }

    #[test]
    fn bodyless_responses() {
        let resp = Response::with_status(304);
        assert!(!resp.has_body_for("GET"));
        let resp = Response::with_status(200);
        assert!(!resp.has_body_for("HEAD"));
        assert!(resp.is_close_delimited("GET"));
    }

    #[test]
    fn set_body_updates_length() {
        let mut resp = Response::text(403, "nope");
        assert_eq!(resp.content_length(), Some(4));
        resp.set_body("longer body");
        assert_eq!(resp.content_length(), Some(11));
    }
}

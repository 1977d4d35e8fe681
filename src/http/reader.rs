//! Reading request and response heads off a [`BufferedStream`].

use tokio::io::AsyncRead;

use crate::error::{ProxyError, Result};
use crate::io::{BufferedStream, LineTooLong};
use crate::models::http::{HeaderCollection, HttpVersion, KnownMethod, Request, Response};

pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_HEADER_COUNT: usize = 128;

/// Blank lines tolerated before a request line.
const MAX_LEADING_EMPTY_LINES: usize = 4;

/// Classify the method at the read cursor without consuming anything.
///
/// Compares the peeked bytes against the known method names one byte at a
/// time and stops at the first space. A token that matches no known name
/// is still a method, as long as it is made of token characters and fits
/// in [`KnownMethod::MAX_EXTENSION_LEN`].
pub async fn detect_method<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
) -> std::io::Result<Option<KnownMethod>> {
    let mut candidates: Vec<&'static str> = KnownMethod::ALL.to_vec();

    for index in 0..=KnownMethod::MAX_EXTENSION_LEN {
        if index >= stream.capacity() {
            return Ok(None);
        }
        let Some(byte) = stream.peek_byte(index).await? else {
            return Ok(None);
        };
        if byte == b' ' {
            if index == 0 {
                return Ok(None);
            }
            let known = candidates.into_iter().find(|m| m.len() == index);
            return Ok(Some(
                known.map_or(KnownMethod::Extension, KnownMethod::from_name),
            ));
        }
        if !KnownMethod::is_token_byte(byte) {
            return Ok(None);
        }
        candidates.retain(|m| m.as_bytes().get(index) == Some(&byte));
    }
    Ok(None)
}

/// Map a failed line read, turning an overlong line into a protocol
/// violation that names `what` and its `limit`.
pub(crate) fn line_error(err: std::io::Error, what: &str, limit: usize) -> ProxyError {
    if LineTooLong::from_io(&err).is_some() {
        ProxyError::protocol(format!("{what} exceeds {limit} bytes"))
    } else {
        ProxyError::Io(err)
    }
}

/// Accumulate header lines up to the blank line, CRLF-normalized.
///
/// `Ok(None)` means the peer closed before sending anything.
async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    skip_leading_blank: bool,
) -> Result<Option<Vec<u8>>> {
    let mut head = Vec::with_capacity(512);
    let mut lines = 0usize;
    let mut skipped = 0usize;

    loop {
        // Two bytes of the budget go to the CRLF appended below.
        let budget = MAX_HEADER_BYTES.saturating_sub(head.len() + 2);
        let line = stream
            .read_line_bytes(budget)
            .await
            .map_err(|err| line_error(err, "header block", MAX_HEADER_BYTES))?;
        let Some(line) = line else {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::protocol("connection closed mid-header"));
        };

        if line.is_empty() {
            if head.is_empty() {
                if skip_leading_blank && skipped < MAX_LEADING_EMPTY_LINES {
                    skipped += 1;
                    continue;
                }
                return Err(ProxyError::protocol("empty start line"));
            }
            head.extend_from_slice(b"\r\n");
            return Ok(Some(head));
        }

        lines += 1;
        if lines > MAX_HEADER_COUNT + 1 {
            return Err(ProxyError::protocol(format!(
                "more than {MAX_HEADER_COUNT} headers"
            )));
        }
        head.extend_from_slice(&line);
        head.extend_from_slice(b"\r\n");
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderCollection> {
    let mut headers = HeaderCollection::new();
    for h in parsed {
        headers.append_raw(h.name, h.value);
    }
    normalize_content_length(&mut headers)?;
    Ok(headers)
}

/// Collapse repeated Content-Length values, rejecting conflicts.
fn normalize_content_length(headers: &mut HeaderCollection) -> Result<()> {
    let mut value: Option<u64> = None;
    let mut count = 0;
    for raw in headers.get_all("content-length") {
        for part in raw.split(',') {
            count += 1;
            let parsed = part
                .trim()
                .parse::<u64>()
                .map_err(|_| ProxyError::protocol(format!("invalid Content-Length {raw:?}")))?;
            match value {
                Some(existing) if existing != parsed => {
                    return Err(ProxyError::protocol(format!(
                        "conflicting Content-Length values {existing} and {parsed}"
                    )));
                }
                _ => value = Some(parsed),
            }
        }
    }
    if let (Some(length), true) = (value, count > 1) {
        headers.set("Content-Length", length.to_string());
    }
    Ok(())
}

fn map_parse_error(kind: &str, err: httparse::Error) -> ProxyError {
    match err {
        httparse::Error::TooManyHeaders => {
            ProxyError::protocol(format!("more than {MAX_HEADER_COUNT} headers"))
        }
        other => ProxyError::protocol(format!("malformed {kind} head: {other}")),
    }
}

/// Read a request head. The body stays on the stream and is marked
/// [`Body::Unread`](crate::models::http::Body::Unread) when framing says one
/// follows.
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
) -> Result<Option<Request>> {
    let Some(head) = read_head(stream, true).await? else {
        return Ok(None);
    };

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut parsed = httparse::Request::new(&mut storage);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::protocol("incomplete request head"));
        }
        Err(err) => return Err(map_parse_error("request", err)),
    }

    let method = parsed
        .method
        .ok_or_else(|| ProxyError::protocol("missing method"))?;
    let uri = parsed
        .path
        .ok_or_else(|| ProxyError::protocol("missing request target"))?;
    let version = HttpVersion::from_minor(parsed.version.unwrap_or(1));

    let mut request = Request::new(method, uri);
    request.version = version;
    request.headers = collect_headers(parsed.headers)?;
    if request.has_body() {
        request.body = crate::models::http::Body::Unread;
    }
    Ok(Some(request))
}

/// Read a response head. Whether a body follows depends on the request
/// method, so the body is always left [`Unread`](crate::models::http::Body::Unread)
/// and the caller decides.
pub async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
) -> Result<Option<Response>> {
    let Some(head) = read_head(stream, false).await? else {
        return Ok(None);
    };

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut parsed = httparse::Response::new(&mut storage);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::protocol("incomplete response head"));
        }
        Err(err) => return Err(map_parse_error("response", err)),
    }

    let status = parsed
        .code
        .ok_or_else(|| ProxyError::protocol("missing status code"))?;
    let mut response = Response::new(status, parsed.reason.unwrap_or(""));
    response.version = HttpVersion::from_minor(parsed.version.unwrap_or(1));
    response.headers = collect_headers(parsed.headers)?;
    response.body = crate::models::http::Body::Unread;
    Ok(Some(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufferPool;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    async fn request_from(bytes: &[u8]) -> Result<Option<Request>> {
        let mock = Builder::new().read(bytes).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(4096));
        read_request(&mut stream).await
    }

    /// For inputs the reader may abandon part way through.
    async fn request_from_closed_stream(bytes: &[u8]) -> Result<Option<Request>> {
        let (mut peer, local) = tokio::io::duplex(bytes.len() + 1);
        peer.write_all(bytes).await.unwrap();
        drop(peer);
        let mut stream = BufferedStream::new(local, &BufferPool::new(4096));
        read_request(&mut stream).await
    }

    #[tokio::test]
    async fn detects_connect_without_consuming() {
        let mock = Builder::new()
            .read(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(256));
        assert_eq!(
            detect_method(&mut stream).await.unwrap(),
            Some(KnownMethod::Connect)
        );
        let req = read_request(&mut stream).await.unwrap().unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.uri, "example.com:443");
    }

    #[tokio::test]
    async fn detects_other_methods() {
        for (input, expected) in [
            (&b"GET / HTTP/1.1\r\n"[..], Some(KnownMethod::Other("GET"))),
            (&b"PUT /x HTTP/1.1\r\n"[..], Some(KnownMethod::Other("PUT"))),
            (&b"PROPFIND / HTTP/1.1\r\n"[..], Some(KnownMethod::Other("PROPFIND"))),
            (&b"GETX / HTTP/1.1\r\n"[..], Some(KnownMethod::Extension)),
            (&b"PURGE /cache HTTP/1.1\r\n"[..], Some(KnownMethod::Extension)),
            (&b"M-SEARCH * HTTP/1.1\r\n"[..], Some(KnownMethod::Extension)),
            (&b"\x16\x03\x01\x02\x00"[..], None),
            (&b" / HTTP/1.1\r\n"[..], None),
            (&b"GE(T / HTTP/1.1\r\n"[..], None),
        ] {
            let mock = Builder::new().read(input).build();
            let mut stream = BufferedStream::new(mock, &BufferPool::new(256));
            assert_eq!(detect_method(&mut stream).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn parses_request_head() {
        let req = request_from(
            b"POST http://example.com/submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\nX-Dup: a\r\nX-Dup: b\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "http://example.com/submit");
        assert_eq!(req.version, HttpVersion::Http11);
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.headers.get_all("x-dup").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(req.body, crate::models::http::Body::Unread);
    }

    #[tokio::test]
    async fn request_without_framing_has_no_body() {
        let req = request_from(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.version, HttpVersion::Http10);
        assert_eq!(req.body, crate::models::http::Body::Empty);
    }

    #[tokio::test]
    async fn skips_leading_blank_lines() {
        let req = request_from(b"\r\nGET / HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.uri, "/");
    }

    #[tokio::test]
    async fn clean_close_is_none() {
        assert!(request_from(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_mid_header_is_violation() {
        let err = request_from(b"GET / HTTP/1.1\r\nHost: a\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn conflicting_content_length_is_violation() {
        let err = request_from(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("conflicting Content-Length"));

        let req = request_from(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.headers.get_all("content-length").count(), 1);
    }

    #[tokio::test]
    async fn malformed_request_line_is_violation() {
        let err = request_from(b"NOT A REQUEST LINE AT ALL\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn too_many_headers_is_violation() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADER_COUNT {
            raw.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let err = request_from(&raw).await.unwrap_err();
        assert!(err.to_string().contains("headers"));
    }

    #[tokio::test]
    async fn oversized_head_is_violation() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = request_from_closed_stream(&raw).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn overlong_method_token_is_not_a_method() {
        let mut raw = vec![b'A'; KnownMethod::MAX_EXTENSION_LEN + 1];
        raw.extend_from_slice(b" / HTTP/1.1\r\n\r\n");
        let mock = Builder::new().read(&raw).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(256));
        assert_eq!(detect_method(&mut stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn extension_method_request_is_parsed() {
        let req = request_from(b"PURGE /cache/item HTTP/1.1\r\nHost: cdn.example\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "PURGE");
        assert_eq!(req.uri, "/cache/item");
    }

    #[tokio::test]
    async fn unterminated_header_line_is_rejected_at_the_cap() {
        // One header line that never ends; without the cap this would read
        // to end of stream and report a mid-header close instead.
        let mut raw = b"GET / HTTP/1.1\r\nX-Flood: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES + 16 * 1024));
        let err = request_from_closed_stream(&raw).await.unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
        assert!(err.to_string().contains("header block exceeds"));
    }

    #[tokio::test]
    async fn non_utf8_header_value_keeps_its_bytes() {
        let req = request_from(b"GET / HTTP/1.1\r\nHost: a\r\nX-Name: caf\xe9\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        let header = req.headers.iter().find(|h| h.name == "X-Name").unwrap();
        assert_eq!(header.value_bytes(), b"caf\xe9");
    }

    #[tokio::test]
    async fn parses_response_head() {
        let mock = Builder::new()
            .read(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(256));
        let resp = read_response(&mut stream).await.unwrap().unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.reason, "Not Found");
        assert_eq!(resp.content_length(), Some(0));
    }
}

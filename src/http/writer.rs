//! Serializing request and response heads and in-memory bodies.

use std::io::Write as _;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::chunked;
use crate::models::http::{Body, HeaderCollection, Request, Response};

/// Header values go out as bytes so values that were not UTF-8 on the way
/// in leave unchanged.
fn push_headers(out: &mut Vec<u8>, headers: &HeaderCollection) {
    for header in headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

pub fn request_head_bytes(request: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let _ = write!(
        out,
        "{} {} {}\r\n",
        request.method, request.uri, request.version
    );
    push_headers(&mut out, &request.headers);
    out
}

pub fn response_head_bytes(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let _ = write!(out, "{} {}", response.version, response.status);
    if !response.reason.is_empty() {
        let _ = write!(out, " {}", response.reason);
    }
    out.extend_from_slice(b"\r\n");
    push_headers(&mut out, &response.headers);
    out
}

pub async fn write_request_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> std::io::Result<()> {
    writer.write_all(&request_head_bytes(request)).await
}

pub async fn write_response_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    writer.write_all(&response_head_bytes(response)).await
}

/// Write a materialized body, chunk-encoding it when the headers say so.
pub async fn write_loaded_body<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    chunked: bool,
) -> std::io::Result<()> {
    if chunked {
        chunked::write_chunk(writer, body).await?;
        chunked::write_last_chunk(writer).await
    } else {
        writer.write_all(body).await
    }
}

/// Write a full response whose body is already in memory (or absent).
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    write_response_head(writer, response).await?;
    if let Body::Loaded(body) = &response.body {
        write_loaded_body(writer, body, response.is_chunked()).await?;
    } else if response.is_chunked() {
        chunked::write_last_chunk(writer).await?;
    }
    writer.flush().await
}

/// Short plain-text response that closes the connection.
pub async fn respond_with_status<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        code,
        message,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::reader::read_request;
    use crate::io::{BufferPool, BufferedStream};
    use crate::models::http::HttpVersion;
    use tokio_test::io::Builder;

    fn multiset(headers: &HeaderCollection) -> Vec<(String, String)> {
        let mut all: Vec<_> = headers
            .iter()
            .map(|h| (h.name.to_ascii_lowercase(), h.value.clone()))
            .collect();
        all.sort();
        all
    }

    #[tokio::test]
    async fn non_utf8_header_values_are_relayed_byte_for_byte() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nX-Legacy: na\xefve \xff\r\nX-Other: b\xe9\r\n\r\n";
        let mock = Builder::new().read(raw).build();
        let mut stream = BufferedStream::new(mock, &BufferPool::new(1024));
        let mut parsed = read_request(&mut stream).await.unwrap().unwrap();
        assert_eq!(request_head_bytes(&parsed), raw.to_vec());

        // An edited value is written from its text form.
        parsed.headers.set("X-Other", "plain");
        let text = String::from_utf8_lossy(&request_head_bytes(&parsed)).into_owned();
        assert!(text.contains("X-Other: plain\r\n"));
    }

    #[tokio::test]
    async fn request_round_trip() {
        let mut cases = Vec::new();

        let mut req = Request::new("GET", "/index.html?x=1");
        req.headers.add("Host", "example.com");
        req.headers.add("Accept", "*/*");
        req.headers.add("Cookie", "a=1");
        req.headers.add("Cookie", "b=2");
        cases.push(req);

        let mut req = Request::new("POST", "http://example.com/upload");
        req.version = HttpVersion::Http10;
        req.headers.add("Content-Length", "0");
        req.headers.add("X-Empty", "");
        cases.push(req);

        cases.push(Request::new("OPTIONS", "*"));

        for original in cases {
            let bytes = request_head_bytes(&original);
            let mock = Builder::new().read(&bytes).build();
            let mut stream = BufferedStream::new(mock, &BufferPool::new(1024));
            let parsed = read_request(&mut stream).await.unwrap().unwrap();
            assert_eq!(parsed.method, original.method);
            assert_eq!(parsed.uri, original.uri);
            assert_eq!(parsed.version, original.version);
            assert_eq!(multiset(&parsed.headers), multiset(&original.headers));
        }
    }

    #[test]
    fn response_head_layout() {
        let mut resp = Response::with_status(200);
        resp.headers.add("Content-Length", "2");
        assert_eq!(
            response_head_bytes(&resp),
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n"
        );
        let resp = Response::new(599, "");
        assert_eq!(response_head_bytes(&resp), b"HTTP/1.1 599\r\n\r\n");
    }

    #[tokio::test]
    async fn loaded_chunked_body_is_encoded() {
        let mut resp = Response::with_status(200);
        resp.headers.add("Transfer-Encoding", "chunked");
        resp.set_body("hi");
        let mut out = Vec::new();
        write_response(&mut out, &resp).await.unwrap();
        assert!(out.ends_with(b"\r\n\r\n2\r\nhi\r\n0\r\n\r\n"));
        assert!(!String::from_utf8_lossy(&out).contains("Content-Length"));
    }

    #[tokio::test]
    async fn status_responses_close() {
        let mut out = Vec::new();
        respond_with_status(&mut out, 502, "Bad Gateway", "upstream down")
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\nupstream down"));
    }
}

//! Streaming and loading message bodies.
//!
//! Streaming copies pass bytes straight from the source buffer to the
//! destination and keep chunked framing intact. Loading decodes the framing
//! into memory, bounded by a size limit.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::chunked::parse_chunk_size;
use super::reader::{line_error, MAX_HEADER_BYTES};
use crate::error::{ProxyError, Result};
use crate::io::{BufferedStream, LineTooLong};
use crate::models::http::{Request, Response};

/// Hard cap on bodies materialized in memory.
pub const MAX_LOADED_BODY: usize = 32 * 1024 * 1024;

/// Longest chunk-size line, extensions included.
pub const MAX_CHUNK_LINE: usize = 4096;

/// How the end of a body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Fixed(u64),
    Chunked,
    /// Read until the peer closes.
    UntilClose,
}

impl BodyFraming {
    pub fn of_request(request: &Request) -> Self {
        if request.is_chunked() {
            BodyFraming::Chunked
        } else {
            match request.content_length() {
                Some(0) | None => BodyFraming::None,
                Some(len) => BodyFraming::Fixed(len),
            }
        }
    }

    pub fn of_response(response: &Response, request_method: &str) -> Self {
        if !response.has_body_for(request_method) {
            BodyFraming::None
        } else if response.is_chunked() {
            BodyFraming::Chunked
        } else {
            match response.content_length() {
                Some(0) => BodyFraming::None,
                Some(len) => BodyFraming::Fixed(len),
                None => BodyFraming::UntilClose,
            }
        }
    }
}

fn premature_eof(expected: u64, got: u64) -> ProxyError {
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("body ended after {got} of {expected} bytes"),
    ))
}

/// Copy exactly `length` bytes.
pub async fn copy_fixed<R, W>(
    reader: &mut BufferedStream<R>,
    writer: &mut W,
    length: u64,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    while remaining > 0 {
        if reader.available() == 0 && !reader.fill_buffer().await? {
            return Err(premature_eof(length, length - remaining));
        }
        let take = (reader.available() as u64).min(remaining) as usize;
        writer.write_all(&reader.buffered()[..take]).await?;
        reader.consume(take);
        remaining -= take as u64;
    }
    Ok(length)
}

/// Read a chunk-size line and parse its size. The raw line is returned too
/// so extensions can be forwarded untouched.
async fn read_chunk_size<R: AsyncRead + Unpin>(
    reader: &mut BufferedStream<R>,
) -> Result<(usize, Vec<u8>)> {
    let line = reader
        .read_line_bytes(MAX_CHUNK_LINE)
        .await
        .map_err(|err| line_error(err, "chunk size line", MAX_CHUNK_LINE))?
        .ok_or_else(|| ProxyError::protocol("connection closed before chunk size"))?;
    let text = std::str::from_utf8(&line)
        .map_err(|_| ProxyError::protocol("non-ASCII chunk size line"))?;
    let size = parse_chunk_size(text)?;
    Ok((size, line))
}

/// Read one trailer line against the remaining trailer budget.
async fn read_trailer_line<R: AsyncRead + Unpin>(
    reader: &mut BufferedStream<R>,
    used: &mut usize,
) -> Result<Vec<u8>> {
    let budget = MAX_HEADER_BYTES.saturating_sub(*used + 2);
    let line = reader
        .read_line_bytes(budget)
        .await
        .map_err(|err| line_error(err, "chunk trailer", MAX_HEADER_BYTES))?
        .ok_or_else(|| ProxyError::protocol("connection closed in chunk trailer"))?;
    *used += line.len() + 2;
    Ok(line)
}

/// Copy a chunked body verbatim, including extensions and trailers.
/// Returns the decoded payload size.
pub async fn copy_chunked<R, W>(reader: &mut BufferedStream<R>, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let (size, line) = read_chunk_size(reader).await?;
        writer.write_all(&line).await?;
        writer.write_all(b"\r\n").await?;

        if size == 0 {
            let mut used = 0;
            loop {
                let trailer = read_trailer_line(reader, &mut used).await?;
                writer.write_all(&trailer).await?;
                writer.write_all(b"\r\n").await?;
                if trailer.is_empty() {
                    return Ok(total);
                }
            }
        }

        copy_fixed(reader, writer, size as u64).await?;
        expect_chunk_terminator(reader).await?;
        writer.write_all(b"\r\n").await?;
        total += size as u64;
    }
}

async fn expect_chunk_terminator<R: AsyncRead + Unpin>(reader: &mut BufferedStream<R>) -> Result<()> {
    // Anything but an empty line is an error.
    let line = match reader.read_line_bytes(0).await {
        Ok(line) => line,
        Err(err) if LineTooLong::from_io(&err).is_some() => {
            return Err(ProxyError::protocol("missing CRLF after chunk data"));
        }
        Err(err) => return Err(err.into()),
    };
    match line {
        Some(line) if line.is_empty() => Ok(()),
        Some(_) => Err(ProxyError::protocol("missing CRLF after chunk data")),
        None => Err(ProxyError::protocol("connection closed after chunk data")),
    }
}

/// Copy until the reader reaches end of stream.
pub async fn copy_until_close<R, W>(reader: &mut BufferedStream<R>, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        if reader.available() == 0 && !reader.fill_buffer().await? {
            return Ok(total);
        }
        let take = reader.available();
        writer.write_all(reader.buffered()).await?;
        reader.consume(take);
        total += take as u64;
    }
}

/// Stream a body according to `framing`, then flush.
pub async fn copy_body<R, W>(
    reader: &mut BufferedStream<R>,
    writer: &mut W,
    framing: BodyFraming,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match framing {
        BodyFraming::None => 0,
        BodyFraming::Fixed(len) => copy_fixed(reader, writer, len).await?,
        BodyFraming::Chunked => copy_chunked(reader, writer).await?,
        BodyFraming::UntilClose => copy_until_close(reader, writer).await?,
    };
    writer.flush().await?;
    Ok(copied)
}

/// Read and discard a body so the connection stays in sync.
pub async fn drain_body<R: AsyncRead + Unpin>(
    reader: &mut BufferedStream<R>,
    framing: BodyFraming,
) -> Result<u64> {
    copy_body(reader, &mut tokio::io::sink(), framing).await
}

/// Load a body into memory, decoding chunked framing.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut BufferedStream<R>,
    framing: BodyFraming,
    limit: usize,
) -> Result<Bytes> {
    match framing {
        BodyFraming::None => Ok(Bytes::new()),
        BodyFraming::Fixed(len) => {
            if len > limit as u64 {
                return Err(ProxyError::BodyTooLarge { limit });
            }
            Ok(Bytes::from(reader.read_exact_bytes(len as usize).await?))
        }
        BodyFraming::Chunked => read_chunked(reader, limit).await,
        BodyFraming::UntilClose => {
            let mut sink = LimitedBuffer::new(limit);
            let copied = copy_until_close(reader, &mut sink).await;
            if sink.overflowed {
                return Err(ProxyError::BodyTooLarge { limit });
            }
            copied?;
            sink.into_bytes()
        }
    }
}

async fn read_chunked<R: AsyncRead + Unpin>(
    reader: &mut BufferedStream<R>,
    limit: usize,
) -> Result<Bytes> {
    let mut out = Vec::new();
    loop {
        let (size, _) = read_chunk_size(reader).await?;
        if size == 0 {
            let mut used = 0;
            while !read_trailer_line(reader, &mut used).await?.is_empty() {}
            return Ok(Bytes::from(out));
        }
        if out.len().saturating_add(size) > limit {
            return Err(ProxyError::BodyTooLarge { limit });
        }
        out.extend_from_slice(&reader.read_exact_bytes(size).await?);
        expect_chunk_terminator(reader).await?;
    }
}

/// In-memory writer that refuses to grow past a limit.
struct LimitedBuffer {
    data: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl LimitedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    fn into_bytes(self) -> Result<Bytes> {
        if self.overflowed {
            return Err(ProxyError::BodyTooLarge { limit: self.limit });
        }
        Ok(Bytes::from(self.data))
    }
}

impl AsyncWrite for LimitedBuffer {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.data.len() + buf.len() > this.limit {
            this.overflowed = true;
            return std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "body limit exceeded",
            )));
        }
        this.data.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufferPool;
    use tokio_test::io::Builder;

    fn stream(data: &[u8]) -> BufferedStream<tokio_test::io::Mock> {
        BufferedStream::new(Builder::new().read(data).build(), &BufferPool::new(16))
    }

    #[tokio::test]
    async fn fixed_copy_leaves_following_bytes() {
        let mut reader = stream(b"helloNEXT");
        let mut out = Vec::new();
        assert_eq!(
            copy_body(&mut reader, &mut out, BodyFraming::Fixed(5))
                .await
                .unwrap(),
            5
        );
        assert_eq!(out, b"hello");
        assert_eq!(reader.buffered(), b"NEXT");
    }

    #[tokio::test]
    async fn fixed_copy_reports_truncation() {
        let mut reader = stream(b"abc");
        let mut out = Vec::new();
        let err = copy_fixed(&mut reader, &mut out, 10).await.unwrap_err();
        assert!(err.is_expected_disconnect());
    }

    #[tokio::test]
    async fn chunked_copy_is_verbatim() {
        let raw = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut reader = stream(raw);
        let mut out = Vec::new();
        let size = copy_body(&mut reader, &mut out, BodyFraming::Chunked)
            .await
            .unwrap();
        assert_eq!(size, 9);
        assert_eq!(out, raw.to_vec());
    }

    #[tokio::test]
    async fn chunked_read_decodes() {
        let mut reader = stream(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nGET");
        let body = read_body(&mut reader, BodyFraming::Chunked, 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Wikipedia");
        assert_eq!(reader.buffered(), b"GET");
    }

    #[tokio::test]
    async fn bad_chunk_framing_is_violation() {
        let mut reader = stream(b"4\r\nWikiXX0\r\n\r\n");
        let err = read_body(&mut reader, BodyFraming::Chunked, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn limits_are_enforced() {
        let mut reader = BufferedStream::new(&b"0123456789"[..], &BufferPool::new(16));
        let err = read_body(&mut reader, BodyFraming::Fixed(10), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BodyTooLarge { limit: 4 }));

        let mut reader = BufferedStream::new(&b"0123456789"[..], &BufferPool::new(16));
        let err = read_body(&mut reader, BodyFraming::UntilClose, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BodyTooLarge { limit: 4 }));

        let mut reader = BufferedStream::new(
            &b"a\r\n0123456789\r\n0\r\n\r\n"[..],
            &BufferPool::new(64),
        );
        let err = read_body(&mut reader, BodyFraming::Chunked, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BodyTooLarge { .. }));
    }

    #[tokio::test]
    async fn chunk_lines_are_forwarded_as_raw_bytes() {
        let raw = b"3;name=caf\xe9\r\nabc\r\n0\r\nX-Sig: \xff\xfe\r\n\r\n";
        let mut reader = stream(raw);
        let mut out = Vec::new();
        copy_body(&mut reader, &mut out, BodyFraming::Chunked)
            .await
            .unwrap();
        assert_eq!(out, raw.to_vec());
    }

    #[tokio::test]
    async fn endless_chunk_size_line_is_cut_off() {
        let (mut peer, local) = tokio::io::duplex(64 * 1024);
        peer.write_all(&vec![b'f'; MAX_CHUNK_LINE * 4]).await.unwrap();
        let mut reader = BufferedStream::new(local, &BufferPool::new(1024));
        let err = copy_body(&mut reader, &mut tokio::io::sink(), BodyFraming::Chunked)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chunk size line exceeds"));
    }

    #[tokio::test]
    async fn endless_trailer_is_cut_off() {
        let (mut peer, local) = tokio::io::duplex(128 * 1024);
        peer.write_all(b"0\r\nX-Trailer: ").await.unwrap();
        peer.write_all(&vec![b'a'; MAX_HEADER_BYTES + 1024]).await.unwrap();
        let mut reader = BufferedStream::new(local, &BufferPool::new(4096));
        let err = read_body(&mut reader, BodyFraming::Chunked, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
        assert!(err.to_string().contains("chunk trailer exceeds"));
    }

    #[tokio::test]
    async fn until_close_reads_everything() {
        let mut reader = stream(b"the rest of the stream, longer than one buffer");
        let body = read_body(&mut reader, BodyFraming::UntilClose, 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"the rest of the stream, longer than one buffer");
    }

    #[test]
    fn framing_selection() {
        let mut resp = Response::with_status(200);
        assert_eq!(BodyFraming::of_response(&resp, "GET"), BodyFraming::UntilClose);
        assert_eq!(BodyFraming::of_response(&resp, "HEAD"), BodyFraming::None);
        resp.headers.add("Content-Length", "12");
        assert_eq!(BodyFraming::of_response(&resp, "GET"), BodyFraming::Fixed(12));

        let req = Request::new("GET", "/");
        assert_eq!(BodyFraming::of_request(&req), BodyFraming::None);
    }
}

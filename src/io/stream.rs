//! Buffered, peekable wrapper around a single network transport.
//!
//! The proxy needs to look at the first bytes of a connection (HTTP method,
//! TLS ClientHello) before deciding what to do with it, so every socket is
//! wrapped in a [`BufferedStream`]. Peeking fills the internal buffer but
//! never advances the read cursor; only the `read_*`/`consume` family and the
//! [`AsyncRead`] implementation consume bytes.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use super::buffer_pool::{BufferPool, PooledBuffer};

const INITIAL_LINE_CAPACITY: usize = 64;

/// Callback receiving bytes as they cross a stream.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Side-channel observers for traffic capture. Observers see bytes but can
/// never alter them.
#[derive(Clone, Default)]
pub struct StreamObserver {
    pub on_read: Option<DataCallback>,
    pub on_write: Option<DataCallback>,
}

impl StreamObserver {
    pub fn is_empty(&self) -> bool {
        self.on_read.is_none() && self.on_write.is_none()
    }

    fn read(&self, data: &[u8]) {
        if let Some(cb) = &self.on_read {
            cb(data);
        }
    }

    fn write(&self, data: &[u8]) {
        if let Some(cb) = &self.on_write {
            cb(data);
        }
    }
}

impl fmt::Debug for StreamObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamObserver")
            .field("on_read", &self.on_read.is_some())
            .field("on_write", &self.on_write.is_some())
            .finish()
    }
}

/// A transport plus a fixed-size read buffer.
pub struct BufferedStream<S> {
    inner: S,
    buffer: PooledBuffer,
    offset: usize,
    length: usize,
    closed: bool,
    observer: StreamObserver,
}

impl<S> BufferedStream<S> {
    pub fn new(inner: S, pool: &BufferPool) -> Self {
        Self {
            inner,
            buffer: pool.get(),
            offset: 0,
            length: 0,
            closed: false,
            observer: StreamObserver::default(),
        }
    }

    pub fn with_observer(mut self, observer: StreamObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn set_observer(&mut self, observer: StreamObserver) {
        self.observer = observer;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the transport together with any bytes buffered but not yet read.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let pending = self.buffer[self.offset..self.offset + self.length].to_vec();
        (self.inner, pending)
    }

    /// Number of buffered, unconsumed bytes.
    pub fn available(&self) -> usize {
        self.length
    }

    /// Maximum number of bytes that can be peeked ahead.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// True once the transport has reported end of stream.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// View of the buffered, unconsumed bytes.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    /// Drop `count` buffered bytes. Panics if fewer are buffered.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.length, "consume past buffered data");
        self.offset += count;
        self.length -= count;
        if self.length == 0 {
            self.offset = 0;
        }
    }

    /// Drain everything currently buffered.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        let data = self.buffered().to_vec();
        self.offset = 0;
        self.length = 0;
        data
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Read more bytes from the transport, first moving any unconsumed bytes to
    /// the front of the buffer. Returns `false` (and marks the stream closed)
    /// on a zero-byte read.
    pub async fn fill_buffer(&mut self) -> io::Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if self.offset > 0 {
            if self.length > 0 {
                self.buffer
                    .copy_within(self.offset..self.offset + self.length, 0);
            }
            self.offset = 0;
        }
        if self.length == self.buffer.capacity() {
            return Ok(true);
        }

        let read = self.inner.read(&mut self.buffer[self.length..]).await?;
        if read == 0 {
            self.closed = true;
            return Ok(false);
        }
        self.observer
            .read(&self.buffer[self.length..self.length + read]);
        self.length += read;
        Ok(true)
    }

    /// Make sure at least `count` bytes are buffered. Returns `false` when the
    /// stream ends first.
    pub async fn ensure_available(&mut self, count: usize) -> io::Result<bool> {
        if count > self.buffer.capacity() {
            return Err(capacity_error(count));
        }
        while self.length < count {
            if !self.fill_buffer().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Byte `index` positions past the read cursor, without consuming it.
    pub async fn peek_byte(&mut self, index: usize) -> io::Result<Option<u8>> {
        if index >= self.buffer.capacity() {
            return Err(capacity_error(index));
        }
        if !self.ensure_available(index + 1).await? {
            return Ok(None);
        }
        Ok(Some(self.buffer[self.offset + index]))
    }

    /// `count` bytes starting `index` positions past the read cursor.
    pub async fn peek_bytes(&mut self, index: usize, count: usize) -> io::Result<Option<Vec<u8>>> {
        let end = index + count;
        if end > self.buffer.capacity() {
            return Err(capacity_error(end));
        }
        if !self.ensure_available(end).await? {
            return Ok(None);
        }
        let start = self.offset + index;
        Ok(Some(self.buffer[start..start + count].to_vec()))
    }

    pub async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.length == 0 && !self.fill_buffer().await? {
            return Ok(None);
        }
        let b = self.buffer[self.offset];
        self.consume(1);
        Ok(Some(b))
    }

    /// Read a line terminated by `\r\n` or a bare `\n`, without the terminator.
    ///
    /// Returns `None` only when the stream ended before any byte was read; a
    /// trailing unterminated line is returned once. Invalid UTF-8 is replaced.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .read_line_bytes(usize::MAX)
            .await?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }

    /// Raw form of [`read_line`](Self::read_line). Fails with a
    /// [`LineTooLong`] payload once the line, terminator excluded, exceeds
    /// `max_len` bytes.
    pub async fn read_line_bytes(&mut self, max_len: usize) -> io::Result<Option<Vec<u8>>> {
        let mut line: Vec<u8> = Vec::with_capacity(INITIAL_LINE_CAPACITY.min(max_len));
        let mut read_any = false;

        loop {
            if self.length == 0 && !self.fill_buffer().await? {
                return Ok(read_any.then_some(line));
            }

            while self.length > 0 {
                let b = self.buffer[self.offset];
                self.offset += 1;
                self.length -= 1;
                read_any = true;

                if b == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if self.length == 0 {
                        self.offset = 0;
                    }
                    return Ok(Some(line));
                }

                // One byte of slack for the `\r` of a CRLF terminator.
                if line.len() > max_len || (line.len() == max_len && b != b'\r') {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        LineTooLong { limit: max_len },
                    ));
                }
                line.push(b);
            }
        }
    }

    /// Read exactly `count` bytes, failing with `UnexpectedEof` if the stream
    /// ends first.
    pub async fn read_exact_bytes(&mut self, count: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            if self.length == 0 && !self.fill_buffer().await? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed after {} of {} bytes", out.len(), count),
                ));
            }
            let take = self.length.min(count - out.len());
            out.extend_from_slice(&self.buffer[self.offset..self.offset + take]);
            self.consume(take);
        }
        Ok(out)
    }
}

fn capacity_error(index: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("index {index} exceeds buffer capacity"),
    )
}

/// A line grew past the limit given to [`BufferedStream::read_line_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong {
    pub limit: usize,
}

impl LineTooLong {
    /// Recover the payload from an error returned by a line read.
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()?.downcast_ref::<LineTooLong>().copied()
    }
}

impl fmt::Display for LineTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line exceeds {} bytes", self.limit)
    }
}

impl std::error::Error for LineTooLong {}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.length > 0 {
            let n = this.length.min(buf.remaining());
            buf.put_slice(&this.buffer[this.offset..this.offset + n]);
            this.consume(n);
            return Poll::Ready(Ok(()));
        }

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if fresh.is_empty() {
            this.closed = true;
        } else {
            this.observer.read(fresh);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, data))?;
        this.observer.write(&data[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> fmt::Debug for BufferedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedStream")
            .field("available", &self.length)
            .field("capacity", &self.buffer.capacity())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    fn pool(size: usize) -> BufferPool {
        BufferPool::new(size)
    }

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\n").build();
        let mut stream = BufferedStream::new(mock, &pool(64));
        assert_eq!(
            stream.read_line().await.unwrap().as_deref(),
            Some("GET / HTTP/1.1")
        );
        assert_eq!(stream.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_line_accepts_bare_lf_and_partial_tail() {
        let mock = Builder::new().read(b"first\nsecond\r\ntail").build();
        let mut stream = BufferedStream::new(mock, &pool(64));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(stream.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_line_spans_many_fills() {
        let long = "x".repeat(300);
        let payload = format!("{long}\r\nend\r\n");
        let mock = Builder::new()
            .read(&payload.as_bytes()[..50])
            .read(&payload.as_bytes()[50..])
            .build();
        let mut stream = BufferedStream::new(mock, &pool(16));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some(long.as_str()));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("end"));
    }

    #[tokio::test]
    async fn unterminated_line_past_limit_fails_early() {
        // Far more data than the limit, never a newline.
        let (mut peer, local) = duplex(8192);
        peer.write_all(&[b'a'; 4096]).await.unwrap();
        let mut stream = BufferedStream::new(local, &pool(256));
        let err = stream.read_line_bytes(100).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(LineTooLong::from_io(&err), Some(LineTooLong { limit: 100 }));
    }

    #[tokio::test]
    async fn line_at_limit_with_crlf_is_accepted() {
        let mock = Builder::new().read(b"abcd\r\nabcde\r\n").build();
        let mut stream = BufferedStream::new(mock, &pool(64));
        assert_eq!(stream.read_line_bytes(4).await.unwrap(), Some(b"abcd".to_vec()));
        assert!(stream.read_line_bytes(4).await.is_err());
    }

    #[tokio::test]
    async fn raw_lines_keep_non_utf8_bytes() {
        let mock = Builder::new().read(b"caf\xe9\r\n").build();
        let mut stream = BufferedStream::new(mock, &pool(64));
        assert_eq!(
            stream.read_line_bytes(usize::MAX).await.unwrap(),
            Some(b"caf\xe9".to_vec())
        );
    }

    #[tokio::test]
    async fn empty_line_is_not_end_of_stream() {
        let mock = Builder::new().read(b"\r\n").build();
        let mut stream = BufferedStream::new(mock, &pool(16));
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(stream.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let mock = Builder::new().read(b"CON").read(b"NECT x").build();
        let mut stream = BufferedStream::new(mock, &pool(32));
        assert_eq!(stream.peek_byte(0).await.unwrap(), Some(b'C'));
        assert_eq!(stream.peek_byte(4).await.unwrap(), Some(b'E'));
        assert_eq!(
            stream.peek_bytes(0, 7).await.unwrap().as_deref(),
            Some(&b"CONNECT"[..])
        );
        assert_eq!(stream.available(), 9);
        assert_eq!(
            stream.read_line().await.unwrap().as_deref(),
            Some("CONNECT x")
        );
    }

    #[tokio::test]
    async fn peek_past_capacity_is_rejected() {
        let mock = Builder::new().build();
        let mut stream = BufferedStream::new(mock, &pool(8));
        let err = stream.peek_byte(8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("exceeds buffer capacity"));
    }

    #[tokio::test]
    async fn peek_at_end_of_stream_yields_none() {
        let mock = Builder::new().read(b"ab").build();
        let mut stream = BufferedStream::new(mock, &pool(8));
        assert_eq!(stream.peek_byte(5).await.unwrap(), None);
        assert!(stream.is_closed());
        assert_eq!(stream.available(), 2);
    }

    #[tokio::test]
    async fn fill_preserves_unconsumed_bytes() {
        let mock = Builder::new().read(b"abcdef").read(b"gh").build();
        let mut stream = BufferedStream::new(mock, &pool(8));
        assert!(stream.fill_buffer().await.unwrap());
        stream.consume(4);
        assert!(stream.fill_buffer().await.unwrap());
        assert_eq!(stream.buffered(), b"efgh");
        assert!(!stream.fill_buffer().await.unwrap());
    }

    #[tokio::test]
    async fn async_read_serves_buffer_first() {
        let (mut client, server) = duplex(64);
        client.write_all(b"hello world").await.unwrap();
        drop(client);

        let mut stream = BufferedStream::new(server, &pool(64));
        assert_eq!(stream.peek_byte(0).await.unwrap(), Some(b'h'));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn read_exact_bytes_reports_eof() {
        let mock = Builder::new().read(b"abc").build();
        let mut stream = BufferedStream::new(mock, &pool(8));
        let err = stream.read_exact_bytes(5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn observers_see_reads_and_writes() {
        let seen_read = Arc::new(Mutex::new(Vec::new()));
        let seen_write = Arc::new(Mutex::new(Vec::new()));
        let observer = StreamObserver {
            on_read: Some({
                let seen = seen_read.clone();
                Arc::new(move |d: &[u8]| seen.lock().unwrap().extend_from_slice(d))
            }),
            on_write: Some({
                let seen = seen_write.clone();
                Arc::new(move |d: &[u8]| seen.lock().unwrap().extend_from_slice(d))
            }),
        };

        let (mut peer, local) = duplex(64);
        let mut stream = BufferedStream::new(local, &pool(32)).with_observer(observer);
        peer.write_all(b"ping\n").await.unwrap();
        assert_eq!(stream.read_line().await.unwrap().as_deref(), Some("ping"));
        stream.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(seen_read.lock().unwrap().as_slice(), b"ping\n");
        assert_eq!(seen_write.lock().unwrap().as_slice(), b"pong");
    }

    #[tokio::test]
    async fn into_parts_returns_pending_bytes() {
        let mock = Builder::new().read(b"line\r\nrest").build();
        let mut stream = BufferedStream::new(mock, &pool(32));
        stream.read_line().await.unwrap();
        let (_inner, pending) = stream.into_parts();
        assert_eq!(pending, b"rest");
    }
}

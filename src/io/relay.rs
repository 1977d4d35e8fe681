//! Bidirectional byte relay used for tunnels and upgraded connections.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use super::buffer_pool::BufferPool;
use crate::models::MessageDirection;

/// Callback invoked for every relayed chunk.
pub type RelayObserver = Arc<dyn Fn(MessageDirection, &[u8]) + Send + Sync>;

/// Byte counts per direction after a relay finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

/// Copy bytes both ways until either side closes or `cancel` fires.
///
/// Whichever direction stops first cancels the other. Each direction shuts
/// down its write half on the way out.
pub async fn relay<C, S>(
    client: C,
    server: S,
    pool: &BufferPool,
    observer: Option<RelayObserver>,
    cancel: &CancellationToken,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Send,
    S: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let done = cancel.child_token();

    let (upstream, downstream) = tokio::join!(
        copy_half(
            client_read,
            server_write,
            pool,
            observer.clone(),
            MessageDirection::ClientToServer,
            &done,
        ),
        copy_half(
            server_read,
            client_write,
            pool,
            observer,
            MessageDirection::ServerToClient,
            &done,
        ),
    );

    let stats = RelayStats {
        client_to_server: upstream.bytes,
        server_to_client: downstream.bytes,
    };

    for err in [upstream.error, downstream.error].into_iter().flatten() {
        if !is_disconnect(&err) {
            return Err(err);
        }
        tracing::debug!("relay closed by peer: {}", err);
    }
    Ok(stats)
}

struct HalfOutcome {
    bytes: u64,
    error: Option<io::Error>,
}

async fn copy_half<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    pool: &BufferPool,
    observer: Option<RelayObserver>,
    direction: MessageDirection,
    done: &CancellationToken,
) -> HalfOutcome
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = pool.get();
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        let read = tokio::select! {
            _ = done.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                error = Some(err);
                break;
            }
        };
        if let Some(observer) = &observer {
            observer(direction, &buf[..n]);
        }
        let written = tokio::select! {
            _ = done.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(err) = written {
            error = Some(err);
            break;
        }
        bytes += n as u64;
    }

    done.cancel();
    let _ = writer.shutdown().await;
    HalfOutcome { bytes, error }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

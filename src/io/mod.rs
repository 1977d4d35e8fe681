//! Byte-level plumbing: pooled buffers, the peekable stream wrapper and the
//! tunnel relay.

pub mod buffer_pool;
pub mod relay;
pub mod stream;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE};
pub use relay::{relay, RelayObserver, RelayStats};
pub use stream::{BufferedStream, DataCallback, LineTooLong, StreamObserver};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional transport the proxy can drive.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Type-erased transport, so plain TCP and TLS-wrapped client connections
/// share one session type.
pub type BoxedIo = Box<dyn AsyncIo>;

/// The client side of a session.
pub type ClientStream = BufferedStream<BoxedIo>;

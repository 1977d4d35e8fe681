//! Reusable fixed-size byte buffers shared by every I/O path.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default buffer size when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Upper bound on idle buffers kept around for reuse.
const DEFAULT_MAX_RETAINED: usize = 1024;

/// Mutex-guarded free list of byte buffers.
///
/// Reuse is best effort: an empty pool allocates instead of blocking and a
/// full pool drops returned buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffer_size: usize,
    max_retained: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_capacity(buffer_size, DEFAULT_MAX_RETAINED)
    }

    pub fn with_capacity(buffer_size: usize, max_retained: usize) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_retained,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take a buffer from the pool, allocating if none is idle.
    pub fn get(&self) -> PooledBuffer {
        let reused = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop());
        let buf = reused.unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Hand a buffer back. Buffers of the wrong size are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.inner.buffer_size {
            return;
        }
        if let Ok(mut free) = self.inner.free.lock() {
            if free.len() < self.inner.max_retained {
                free.push(buf);
            }
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A buffer on loan from a [`BufferPool`]; returned when dropped.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.buf.len())
            .finish()
    }
}

//! Reusable byte buffer pool for the filtering hot path
//!
//! Filtering inflates, reframes and annotates document bodies on every
//! mutation; allocating fresh buffers per document would dominate the path.
//! Buffers are acquired scoped: the returned [`PooledBuf`] gives the buffer
//! back on drop, on every exit path. The pool counts outstanding buffers so
//! callers can assert leak-freedom.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Buffers above this capacity are not retained on release
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// Number of released buffers kept for reuse
const MAX_FREE_BUFFERS: usize = 64;

/// A pool of reusable byte buffers
pub struct BytePool {
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePool {
    /// Create an empty pool
    pub fn new() -> Self {
        BytePool {
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Acquire a cleared buffer with at least the given capacity
    pub fn acquire(self: &Arc<Self>, capacity: usize) -> PooledBuf {
        let mut buf = {
            let mut free = self.free.lock();
            let found = free.iter().position(|b| b.capacity() >= capacity);
            match found {
                Some(index) => free.swap_remove(index),
                None => Vec::with_capacity(capacity),
            }
        };
        buf.clear();
        if buf.capacity() < capacity {
            buf.reserve(capacity - buf.capacity());
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently acquired and not yet released
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn release(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if buf.capacity() == 0 || buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_FREE_BUFFERS {
            free.push(buf);
        }
    }
}

/// A pooled buffer, returned to its pool on drop
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BytePool>,
}

impl PooledBuf {
    /// The underlying bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

//! Send buffer descriptor pool.
//!
//! Response payload is arbitrary filler, so every chunk is a zero-copy slice
//! of one shared buffer allocated at startup. The pool bounds how many chunks
//! may be in flight at once: a [`SendBuffer`] is taken before a chunk is
//! submitted and returns to the pool when it drops, which the send path does
//! once the transport reports the chunk complete.

use crate::runtime::pool::lock;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Fixed-count pool of send buffer descriptors.
pub struct SendBufferPool {
    /// Shared filler every descriptor slices from.
    filler: Bytes,
    /// Stack of available descriptor indices (LIFO for cache locality).
    free_list: Mutex<Vec<usize>>,
    count: usize,
    released: Notify,
}

impl SendBufferPool {
    /// Create a pool.
    ///
    /// # Arguments
    /// * `count` - Number of descriptors
    /// * `size` - Largest chunk a descriptor can carry
    #[cfg(test)]
    pub fn new(count: usize, size: usize) -> Arc<Self> {
        Self::with_filler(count, Bytes::from(vec![0u8; size]))
    }

    /// Create a pool slicing chunks from an existing filler buffer.
    ///
    /// Pools sharing one filler share its allocation.
    pub fn with_filler(count: usize, filler: Bytes) -> Arc<Self> {
        Arc::new(Self {
            filler,
            free_list: Mutex::new((0..count).rev().collect()),
            count,
            released: Notify::new(),
        })
    }

    /// Take a descriptor for a chunk of `len` bytes.
    ///
    /// `len` is clamped to the buffer size. Returns `None` if no
    /// descriptors are available.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Option<SendBuffer> {
        let index = lock(&self.free_list).pop()?;
        let len = len.min(self.filler.len());
        Some(SendBuffer {
            index,
            data: self.filler.slice(..len),
            pool: Arc::clone(self),
        })
    }

    fn free(&self, index: usize) {
        debug_assert!(index < self.count, "descriptor index out of bounds");
        lock(&self.free_list).push(index);
        self.released.notify_waiters();
    }

    /// Future that resolves on the next descriptor release.
    ///
    /// Create it before retrying [`acquire`](Self::acquire) so a release in
    /// between is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Largest chunk a descriptor can carry.
    #[cfg(test)]
    pub fn buffer_size(&self) -> usize {
        self.filler.len()
    }

    /// Total number of descriptors.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Number of descriptors available.
    pub fn available(&self) -> usize {
        lock(&self.free_list).len()
    }
}

/// One outbound chunk on loan from a [`SendBufferPool`].
pub struct SendBuffer {
    index: usize,
    data: Bytes,
    pool: Arc<SendBufferPool>,
}

impl SendBuffer {
    /// Chunk payload.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        self.pool.free(self.index);
    }
}

impl fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendBuffer")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_send_buffer_pool_basic() {
        let pool = SendBufferPool::new(4, 1024);

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buffer_size(), 1024);

        let b0 = pool.acquire(100).unwrap();
        let b1 = pool.acquire(4096).unwrap();
        let b2 = pool.acquire(0).unwrap();
        let b3 = pool.acquire(1024).unwrap();

        assert_eq!(b0.len(), 100);
        assert_eq!(b1.len(), 1024); // clamped
        assert!(b2.is_empty());
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire(1).is_none());

        let idx = b1.index;
        drop(b1);
        assert_eq!(pool.available(), 1);
        let b4 = pool.acquire(1).unwrap();
        assert_eq!(b4.index, idx); // LIFO reuse

        drop((b0, b2, b3, b4));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_chunks_share_filler() {
        let pool = SendBufferPool::new(2, 64);
        let a = pool.acquire(64).unwrap();
        let b = pool.acquire(32).unwrap();
        assert_eq!(a.bytes().as_ptr(), b.bytes().as_ptr());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let pool = SendBufferPool::new(1, 16);
        let held = pool.acquire(16).unwrap();
        assert!(pool.acquire(16).is_none());

        let mut released = task::spawn(pool.released());
        assert_pending!(released.poll());

        drop(held);
        assert!(released.is_woken());
        assert_ready!(released.poll());
        assert!(pool.acquire(16).is_some());
    }
}

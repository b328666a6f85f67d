//! Shared buffer pool.
//!
//! Provides fixed-size buffer reuse without per-operation malloc overhead.
//! The pool is shared by every connection of a listener and handed to them
//! by `Arc`, so its capacity and accounting can be inspected in isolation.
//!
//! A [`PooledBuffer`] is returned by value through [`BufferPool::release`],
//! which makes a double return impossible. The outstanding counter makes a
//! leak visible.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// A buffer leased from a [`BufferPool`].
///
/// Dereferences to the first `len()` bytes; the backing storage may be larger.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
}

impl PooledBuffer {
    /// Bytes requested at lease time.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Extend the visible window to the full backing storage.
    pub fn reset_to_capacity(&mut self) {
        self.len = self.data.len();
    }

    /// Pointer to the start of the buffer for submission to the kernel.
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

struct PoolInner {
    /// Stack of idle standard-size buffers (LIFO for cache locality).
    free_list: Vec<Vec<u8>>,
    outstanding: usize,
    leases: u64,
    returns: u64,
}

/// Thread-safe pool of standard-size buffers.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate and retain
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let mut free_list = Vec::with_capacity(count);
        for _ in 0..count {
            free_list.push(vec![0u8; size]);
        }

        Self {
            inner: Mutex::new(PoolInner {
                free_list,
                outstanding: 0,
                leases: 0,
                returns: 0,
            }),
            buffer_size: size,
            capacity: count,
        }
    }

    /// Lease a buffer of at least `len` bytes.
    ///
    /// Never fails: when the free list is empty a new standard buffer is
    /// allocated, and requests larger than the standard size get an
    /// exact-size buffer that is not retained on release.
    pub fn lease(&self, len: usize) -> PooledBuffer {
        let mut inner = self.inner.lock();
        inner.outstanding += 1;
        inner.leases += 1;

        let data = if len <= self.buffer_size {
            let reused = inner.free_list.pop();
            drop(inner);
            reused.unwrap_or_else(|| vec![0u8; self.buffer_size])
        } else {
            drop(inner);
            vec![0u8; len]
        };

        PooledBuffer { data, len }
    }

    /// Lease a standard-size buffer with its full capacity visible.
    pub fn lease_full(&self) -> PooledBuffer {
        self.lease(self.buffer_size)
    }

    /// Return a buffer to the pool.
    pub fn release(&self, buf: PooledBuffer) {
        let mut inner = self.inner.lock();
        inner.outstanding -= 1;
        inner.returns += 1;

        if buf.data.len() == self.buffer_size && inner.free_list.len() < self.capacity {
            inner.free_list.push(buf.data);
        }
    }

    /// Size of each standard buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of standard buffers the pool retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Buffers leased and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Lifetime lease count.
    pub fn leases(&self) -> u64 {
        self.inner.lock().leases
    }

    /// Lifetime return count.
    pub fn returns(&self) -> u64 {
        self.inner.lock().returns
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity)
            .field("available", &inner.free_list.len())
            .field("outstanding", &inner.outstanding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(4, 1024);

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buffer_size(), 1024);

        let b0 = pool.lease(10);
        let b1 = pool.lease_full();

        assert_eq!(b0.len(), 10);
        assert_eq!(b0.capacity(), 1024);
        assert_eq!(b1.len(), 1024);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 2);

        pool.release(b0);
        pool.release(b1);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.leases(), 2);
        assert_eq!(pool.returns(), 2);
    }

    #[test]
    fn test_lease_beyond_capacity_allocates() {
        let pool = BufferPool::new(1, 64);

        let a = pool.lease(8);
        let b = pool.lease(8);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        pool.release(b);

        // Only `capacity` buffers are retained.
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_oversized_lease_not_retained() {
        let pool = BufferPool::new(2, 16);

        let mut big = pool.lease(100);
        assert_eq!(big.len(), 100);
        big[99] = 7;
        assert_eq!(big[99], 7);

        pool.release(big);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_reset_to_capacity() {
        let pool = BufferPool::new(1, 32);
        let mut buf = pool.lease(4);
        buf.copy_from_slice(b"abcd");
        assert_eq!(&buf[..], b"abcd");

        buf.reset_to_capacity();
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[..4], b"abcd");

        pool.release(buf);
    }
}

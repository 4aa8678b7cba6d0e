//! Bounded pool of reusable encode/decode buffers.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use bytes::BytesMut;

/// A bounded arena of `BytesMut` buffers.
///
/// The pool holds at most `total_bytes / buffer_size` idle buffers. Buffers
/// taken from an empty pool are freshly allocated; buffers returned to a full
/// pool, or whose capacity no longer matches, are dropped.
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Create a pool bounded by `total_bytes` of idle buffers of `buffer_size` each.
    pub fn new(total_bytes: usize, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            idle: Mutex::new(Vec::new()),
            buffer_size,
            max_buffers: total_bytes / buffer_size,
        }
    }

    /// Size of each pooled buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a cleared buffer from the pool, allocating when none is idle.
    pub fn take(&self) -> PooledBuffer<'_> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let buf = reused.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() > self.buffer_size * 2 {
            return;
        }
        // A split/freeze leaves a sliver of the allocation behind.
        if buf.capacity() < self.buffer_size {
            buf.reserve(self.buffer_size);
        }
        if buf.capacity() > self.buffer_size * 2 {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_buffers {
                idle.push(buf);
            }
        }
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    buf: Option<BytesMut>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Only `Drop` empties the slot.
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(4096, 1024);
        assert_eq!(pool.available(), 0);

        {
            let mut buf = pool.take();
            buf.extend_from_slice(b"hello");
        }
        assert_eq!(pool.available(), 1);

        let buf = pool.take();
        assert!(buf.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(2048, 1024);
        let a = pool.take();
        let b = pool.take();
        let c = pool.take();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_frozen_split_is_reclaimed() {
        let pool = BufferPool::new(1024, 1024);
        let frozen = {
            let mut buf = pool.take();
            buf.extend_from_slice(b"payload");
            buf.split().freeze()
        };
        drop(frozen);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_oversized_buffers_are_dropped() {
        let pool = BufferPool::new(4096, 16);
        {
            let mut buf = pool.take();
            buf.extend_from_slice(&[0u8; 1024]);
        }
        assert_eq!(pool.available(), 0);
    }
}

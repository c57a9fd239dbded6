//! Outbound Buffer Pool
//!
//! Each channel owns a fixed-size pool of reusable write buffers. Acquire
//! fails with a resource-exhausted error once every buffer is queued for
//! send; callers flush and retry. Buffers are recycled on release, so a
//! steady-state channel allocates nothing per message.
//!
//! Pools are strictly per-channel: a buffer acquired from one channel must
//! never be submitted to another, and migration therefore never contends
//! with the old channel's in-flight buffers.

use crate::{Result, TransportError};
use bytes::BytesMut;

/// Fixed-capacity pool of reusable outbound buffers
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<BytesMut>,
    outstanding: usize,
    max_buffers: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Create a pool of `max_buffers` buffers of `buffer_capacity` bytes each
    pub fn new(max_buffers: usize, buffer_capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_buffers),
            outstanding: 0,
            max_buffers,
            buffer_capacity,
        }
    }

    /// Take a cleared buffer from the pool
    pub fn acquire(&mut self) -> Result<BytesMut> {
        if self.outstanding >= self.max_buffers {
            return Err(TransportError::resource_exhausted(
                "buffer_pool",
                format!("all {} buffers queued for send", self.max_buffers),
            ));
        }

        self.outstanding += 1;
        Ok(self
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity)))
    }

    /// Return a buffer to the pool for reuse
    pub fn release(&mut self, mut buf: BytesMut) {
        debug_assert!(self.outstanding > 0, "release without matching acquire");
        self.outstanding = self.outstanding.saturating_sub(1);

        buf.clear();
        if self.free.len() < self.max_buffers {
            self.free.push(buf);
        }
    }

    /// Buffers currently held by the caller
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Buffers still available for acquire
    pub fn available(&self) -> usize {
        self.max_buffers - self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let mut pool = BufferPool::new(2, 256);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.outstanding(), 2);
        assert!(pool.acquire().is_err());

        pool.release(a);
        assert_eq!(pool.available(), 1);
        let _c = pool.acquire().unwrap();
        pool.release(b);
    }

    #[test]
    fn test_exhaustion_is_resource_error() {
        let mut pool = BufferPool::new(1, 64);
        let _held = pool.acquire().unwrap();

        match pool.acquire() {
            Err(TransportError::ResourceExhausted { resource, .. }) => {
                assert_eq!(resource, "buffer_pool");
            }
            other => panic!("Expected ResourceExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_released_buffers_are_recycled_cleared() {
        let mut pool = BufferPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(b"stale bytes");
        pool.release(buf);

        let buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
    }
}

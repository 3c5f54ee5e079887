//! # Write Descriptor Pool
//!
//! Pool of per-write I/O descriptors. A descriptor carries the buffer one
//! frame is encoded into plus the sequence id of the logical send it is
//! currently serving.
//!
//! Descriptors are borrowed by a channel's writer for each frame and go back
//! to the pool once the write completes, so steady-state writes do not
//! allocate.
//!
//! ## Usage
//! ```rust,no_run
//! use packet_channel::utils::buffer_pool::DescriptorPool;
//!
//! # async fn demo() -> packet_channel::error::Result<()> {
//! let pool = DescriptorPool::new(0); // unbounded
//! let mut descriptor = pool.acquire().await?;
//! descriptor.bind(7);
//! descriptor.buffer.extend_from_slice(b"frame bytes");
//! // Descriptor automatically returned to pool on drop
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Result;
use crate::utils::pool::ObjectPool;

/// Descriptors whose buffer grew past this are shrunk when returned (64KB)
const MAX_POOLED_BUFFER_SIZE: usize = 64 * 1024;

/// Default buffer capacity
const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;

/// One reusable write operation
#[derive(Debug)]
pub struct IoDescriptor {
    /// Encoded frame bytes
    pub buffer: BytesMut,
    sequence_id: Option<u64>,
}

impl IoDescriptor {
    fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            sequence_id: None,
        }
    }

    /// Bind the descriptor to the logical send it is writing for
    pub fn bind(&mut self, sequence_id: u64) {
        self.sequence_id = Some(sequence_id);
    }

    /// Sequence id of the current tenant, if bound
    pub fn sequence_id(&self) -> Option<u64> {
        self.sequence_id
    }

    fn reset(&mut self) {
        self.sequence_id = None;
        if self.buffer.capacity() > MAX_POOLED_BUFFER_SIZE {
            self.buffer = BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY);
        } else {
            self.buffer.clear();
        }
    }
}

/// A borrowed descriptor that returns itself to the pool when dropped
pub struct PooledDescriptor {
    descriptor: Option<IoDescriptor>,
    pool: Arc<ObjectPool<IoDescriptor>>,
}

impl std::ops::Deref for PooledDescriptor {
    type Target = IoDescriptor;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        self.descriptor.as_ref().expect("descriptor present until drop")
    }
}

impl std::ops::DerefMut for PooledDescriptor {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.descriptor.as_mut().expect("descriptor present until drop")
    }
}

impl Drop for PooledDescriptor {
    fn drop(&mut self) {
        if let Some(descriptor) = self.descriptor.take() {
            // a disposed pool discards the descriptor, nothing else to do
            let _ = self.pool.release(descriptor);
        }
    }
}

/// Thread-safe pool of write descriptors
#[derive(Clone)]
pub struct DescriptorPool {
    pool: Arc<ObjectPool<IoDescriptor>>,
}

impl DescriptorPool {
    /// Create a pool bounding concurrently borrowed descriptors; 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        let pool = ObjectPool::new(capacity, IoDescriptor::new)
            .with_take_out(|d: &mut IoDescriptor| d.sequence_id = None)
            .with_take_in(IoDescriptor::reset);

        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow a descriptor, waiting if the pool is bounded and exhausted
    pub async fn acquire(&self) -> Result<PooledDescriptor> {
        let descriptor = self.pool.get().await?;
        Ok(PooledDescriptor {
            descriptor: Some(descriptor),
            pool: self.pool.clone(),
        })
    }

    /// Get the current number of idle descriptors in the pool
    pub fn available(&self) -> usize {
        self.pool.idle_count()
    }

    /// Descriptors currently borrowed
    pub fn in_use(&self) -> usize {
        self.pool.borrowed_count()
    }

    /// Tear the pool down; outstanding descriptors are dropped on return
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_descriptor_returns_on_drop() {
        let pool = DescriptorPool::new(4);
        assert_eq!(pool.available(), 0);

        let mut d = pool.acquire().await.unwrap();
        d.bind(9);
        d.buffer.extend_from_slice(&[1, 2, 3]);
        assert_eq!(pool.in_use(), 1);

        drop(d);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_descriptor_reuse_is_clean() {
        let pool = DescriptorPool::new(1);
        {
            let mut d = pool.acquire().await.unwrap();
            d.bind(42);
            d.buffer.extend_from_slice(b"test");
        }

        let d = pool.acquire().await.unwrap();
        assert!(d.buffer.is_empty());
        assert_eq!(d.sequence_id(), None);
        assert!(d.buffer.capacity() >= 4);
    }

    #[tokio::test]
    async fn test_oversized_buffer_shrinks_on_return() {
        let pool = DescriptorPool::new(1);
        {
            let mut d = pool.acquire().await.unwrap();
            d.buffer.extend_from_slice(&vec![0u8; MAX_POOLED_BUFFER_SIZE + 1]);
        }

        let d = pool.acquire().await.unwrap();
        assert!(d.buffer.capacity() <= MAX_POOLED_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_disposed_pool_drops_returned_descriptor() {
        let pool = DescriptorPool::new(2);
        let d = pool.acquire().await.unwrap();
        pool.dispose();
        drop(d);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().await.is_err());
    }
}

//! A byte-budgeted allocator for send buffers.
//!
//! Every socket of a stack draws its outstanding send buffer from one pool.
//! Buffers hand their bytes back to the pool when dropped, so releasing the
//! retransmission buffer of a control block is just dropping it.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error as ThisError;

/// Hands out [`PoolBuffer`]s while the byte budget lasts.
#[derive(Debug, Clone)]
pub struct BufferPool {
    available: Arc<AtomicUsize>,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool that can have `capacity` bytes allocated at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Arc::new(AtomicUsize::new(capacity)),
            capacity,
        }
    }

    /// Allocates a zeroed buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<PoolBuffer, AllocError> {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                available.checked_sub(len)
            })
            .map_err(|available| AllocError::OutOfMemory {
                requested: len,
                available,
            })?;
        Ok(PoolBuffer {
            bytes: vec![0; len],
            pool: self.available.clone(),
        })
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn alloc_from(&self, data: &[u8]) -> Result<PoolBuffer, AllocError> {
        let mut buffer = self.alloc(data.len())?;
        buffer.copy_from_slice(data);
        Ok(buffer)
    }

    /// Bytes that can currently be allocated
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// The total size of the pool
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A buffer owned by a [`BufferPool`].
#[derive(Debug)]
pub struct PoolBuffer {
    bytes: Vec<u8>,
    pool: Arc<AtomicUsize>,
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.fetch_add(self.bytes.len(), Ordering::AcqRel);
    }
}

/// An allocation the pool could not satisfy
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum AllocError {
    #[error("Requested {requested} bytes but only {available} are free")]
    OutOfMemory { requested: usize, available: usize },
}

//! Fixed pool of reusable chunk buffers.
//!
//! # Design
//! - The pool owns exactly `capacity` buffers for its whole life; a lease removes one and
//!   dropping the lease puts it back, so early returns and panics cannot leak a buffer.
//! - Leasing waits when every buffer is out, which bounds upload memory to
//!   `capacity * buffer_size`.
//! - Backing storage is allocated on first use and kept across leases.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{FsOpsError, FsOpsResult};
use crate::worker::RejectReason;

/// Bounded set of equally sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Shared>,
}

struct Shared {
    idle: Mutex<Vec<Vec<u8>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::InvalidInput`] when either size is zero.
    pub fn new(capacity: usize, buffer_size: usize) -> FsOpsResult<Self> {
        if capacity == 0 {
            return Err(FsOpsError::invalid("buffer_count", "zero", "0"));
        }
        if buffer_size == 0 {
            return Err(FsOpsError::invalid("chunk_size_bytes", "zero", "0"));
        }
        let idle = (0..capacity).map(|_| Vec::new()).collect();
        Ok(Self {
            inner: Arc::new(Shared {
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                buffer_size,
            }),
        })
    }

    /// Take a buffer, waiting until one is returned if all are leased.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::PoolRejected`] if the pool has been closed.
    pub async fn lease(&self) -> FsOpsResult<PooledBuffer> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| FsOpsError::PoolRejected {
                pool: "buffers",
                reason: RejectReason::Closed,
            })?;
        Ok(self.checkout(permit))
    }

    /// Take a buffer only if one is idle right now.
    #[must_use]
    pub fn try_lease(&self) -> Option<PooledBuffer> {
        let permit = Arc::clone(&self.inner.permits).try_acquire_owned().ok()?;
        Some(self.checkout(permit))
    }

    /// Return a buffer explicitly; equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        debug_assert!(Arc::ptr_eq(&self.inner, &buffer.shared));
        drop(buffer);
    }

    /// Buffers currently held by the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Total number of buffers owned by the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Size of each buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> PooledBuffer {
        let mut data = lock(&self.inner.idle).pop().unwrap_or_default();
        data.clear();
        data.reserve_exact(self.inner.buffer_size);
        PooledBuffer {
            data,
            shared: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

/// A leased buffer; returns itself to the pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// Append bytes, refusing to grow past the pool's buffer size.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::ChunkTooLarge`] without modifying the buffer when `bytes` does
    /// not fit.
    pub fn extend_from(&mut self, bytes: &[u8]) -> FsOpsResult<()> {
        let limit = self.shared.buffer_size;
        if self.data.len() + bytes.len() > limit {
            return Err(FsOpsError::ChunkTooLarge { limit });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Filled portion of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // The permit field drops after this body, so the buffer is idle before a waiter wakes.
        let data = std::mem::take(&mut self.data);
        lock(&self.shared.idle).push(data);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Bucketed, size-classed buffer reuse.
//!
//! Backs every outbound write and inbound read that exceeds a scratch
//! threshold. Grounded on `original_source/unilink/memory/memory_pool.*`'s
//! size-class/free-list shape; locking is per-bucket (`parking_lot::Mutex`)
//! so contention stays local to the size class in use, matching
//! `flux_network`'s per-resource locking style.

use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Four fixed size classes, smallest to largest.
const SIZE_CLASSES: [usize; 4] = [1024, 4 * 1024, 16 * 1024, 64 * 1024];
const MAX_REQUEST: usize = 64 * 1024 * 1024;
/// Free-list length cap per bucket; buffers released beyond this are dropped.
const FREE_LIST_CAP: usize = 256;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("requested size {0} must be greater than zero")]
    ZeroSize(usize),
    #[error("requested size {0} exceeds the {1} byte maximum")]
    TooLarge(usize, usize),
    #[error("index {index} out of range for buffer of length {len}")]
    OutOfRange { index: usize, len: usize },
}

struct Bucket {
    free: Mutex<Vec<Box<[u8]>>>,
    class_size: usize,
}

impl Bucket {
    fn new(class_size: usize) -> Self {
        Self { free: Mutex::new(Vec::new()), class_size }
    }

    fn pop(&self) -> Option<Box<[u8]>> {
        self.free.lock().pop()
    }

    fn push(&self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.class_size);
        let mut free = self.free.lock();
        if free.len() < FREE_LIST_CAP {
            free.push(buf);
        }
        // Beyond capacity, the buffer is simply dropped.
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct PoolStats {
    pub total_allocations: u64,
    pub pool_hits: u64,
}

impl PoolStats {
    /// `pool_hits / total_allocations`, or zero when no allocations happened.
    pub fn hit_rate(self) -> f64 {
        if self.total_allocations == 0 {
            0.0
        } else {
            self.pool_hits as f64 / self.total_allocations as f64
        }
    }
}

/// A bucketed buffer pool with four size classes (1/4/16/64 KiB).
pub struct BufferPool {
    buckets: [Bucket; 4],
    total_allocations: AtomicU64,
    pool_hits: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buckets: SIZE_CLASSES.map(Bucket::new),
            total_allocations: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
        }
    }

    fn class_index_for(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&class| size <= class)
    }

    /// Rounds `size` up to the nearest bucket class and returns a handle
    /// whose `size()` equals the requested size but whose backing storage is
    /// bucket-sized.
    pub fn acquire(self: &Arc<Self>, size: usize) -> Result<PooledBuffer, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroSize(size));
        }
        if size > MAX_REQUEST {
            return Err(PoolError::TooLarge(size, MAX_REQUEST));
        }
        let idx = Self::class_index_for(size).expect("size already bounds-checked above");
        let bucket = &self.buckets[idx];

        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let storage = match bucket.pop() {
            Some(buf) => {
                self.pool_hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => vec![0_u8; bucket.class_size].into_boxed_slice(),
        };

        Ok(PooledBuffer { pool: Arc::clone(self), bucket_index: idx, storage: Some(storage), requested_size: size })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
        }
    }

    fn release(&self, bucket_index: usize, storage: Box<[u8]>) {
        self.buckets[bucket_index].push(storage);
    }
}

/// A handle to a pool-owned buffer.
///
/// Non-copyable, movable. Indexed access bounds-checks against the
/// *requested* size, not the (larger) bucket size — `at` panics with a
/// bounds error rather than silently clamping. A destructed handle returns
/// its storage to the pool exactly once; a moved-from handle is inert
/// (Rust's move semantics make "use after move" a compile error, so there is
/// no runtime moved-from state to track).
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    bucket_index: usize,
    storage: Option<Box<[u8]>>,
    requested_size: usize,
}

impl PooledBuffer {
    /// The requested size, not the (possibly larger) bucket capacity.
    pub fn size(&self) -> usize {
        self.requested_size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage.as_ref().expect("storage present until drop")[..self.requested_size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let size = self.requested_size;
        &mut self.storage.as_mut().expect("storage present until drop")[..size]
    }

    /// Bounds-checked single-byte access; returns an error rather than
    /// clamping or panicking, per the "never silently clamped" contract.
    pub fn at(&self, index: usize) -> Result<u8, PoolError> {
        if index >= self.requested_size {
            return Err(PoolError::OutOfRange { index, len: self.requested_size });
        }
        Ok(self.as_slice()[index])
    }
}

impl Index<usize> for PooledBuffer {
    type Output = u8;
    fn index(&self, index: usize) -> &u8 {
        assert!(index < self.requested_size, "index {index} out of range for len {}", self.requested_size);
        &self.as_slice()[index]
    }
}

impl IndexMut<usize> for PooledBuffer {
    fn index_mut(&mut self, index: usize) -> &mut u8 {
        let size = self.requested_size;
        assert!(index < size, "index {index} out of range for len {size}");
        &mut self.as_mut_slice()[index]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.release(self.bucket_index, storage);
        }
    }
}

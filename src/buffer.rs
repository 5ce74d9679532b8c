//! Reusable byte buffers for the bidirectional copy loops
//!
//! Every proxied session borrows two buffers (one per direction). Buffers are
//! handed out as [`PooledBuffer`] guards that return themselves to the pool on
//! drop, so a buffer goes back exactly once on every exit path, including
//! errors and task cancellation.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Buffers freshly allocated because the pool was empty
    pub allocated: AtomicU64,
    /// Buffers served from the free list
    pub reused: AtomicU64,
    /// Buffers currently borrowed
    pub outstanding: AtomicUsize,
}

impl BufferPoolStats {
    pub fn get_allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn get_reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn get_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

/// A pool of fixed-size byte buffers
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    /// Upper bound on idle buffers kept around; extras are freed on return
    max_idle: usize,
    stats: BufferPoolStats,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(1024))),
            buffer_size,
            max_idle,
            stats: BufferPoolStats::default(),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    /// Number of idle buffers waiting in the pool
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Borrow a buffer. The returned guard gives it back when dropped.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.free.lock().pop();
        let buf = match reused {
            Some(buf) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };
        self.stats.outstanding.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

/// Exclusive handle to a pooled buffer
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

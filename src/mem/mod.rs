//! Process-wide page-buffer pool.
//!
//! Page-sized scratch buffers (file-read transfer buffers, cache slots,
//! shadow arena spill, overflow reassembly) are leased from one shared pool
//! and returned on drop, so steady-state reads allocate nothing. The pool is
//! size-classed on exact byte length; buffers of unknown or one-off sizes
//! pass straight through to the allocator.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use lazy_static::lazy_static;

/// Most buffers retained per size class; excess returns are dropped.
const MAX_RETAINED_PER_CLASS: usize = 64;

lazy_static! {
    static ref PAGE_POOL: BufferPool = BufferPool::new();
}

/// Lease a zeroed buffer of `len` bytes from the process-wide pool.
pub fn lease(len: usize) -> PooledBuf {
    PAGE_POOL.lease(len)
}

/// Snapshot of pool counters, for diagnostics.
pub fn stats() -> PoolStats {
    PAGE_POOL.stats()
}

/// Size-classed buffer pool.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    classes: HashMap<usize, Vec<Vec<u8>>>,
    leases: u64,
    reuses: u64,
    returns: u64,
    discards: u64,
}

impl BufferPool {
    fn new() -> Self {
        BufferPool {
            inner: Mutex::new(PoolInner {
                classes: HashMap::new(),
                leases: 0,
                reuses: 0,
                returns: 0,
                discards: 0,
            }),
        }
    }

    fn lease(&'static self, len: usize) -> PooledBuf {
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        inner.leases += 1;
        let buf = match inner.classes.get_mut(&len).and_then(Vec::pop) {
            Some(mut buf) => {
                inner.reuses += 1;
                buf.iter_mut().for_each(|b| *b = 0);
                buf
            }
            None => vec![0u8; len],
        };
        PooledBuf {
            buf,
            pool: Some(self),
        }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        inner.returns += 1;
        let class = inner.classes.entry(buf.len()).or_default();
        if class.len() < MAX_RETAINED_PER_CLASS {
            buf.iter_mut().for_each(|b| *b = 0);
            class.push(buf);
        } else {
            inner.discards += 1;
        }
    }

    fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("buffer pool poisoned");
        PoolStats {
            leases: inner.leases,
            reuses: inner.reuses,
            returns: inner.returns,
            discards: inner.discards,
        }
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out
    pub leases: u64,
    /// Leases served from a retained buffer
    pub reuses: u64,
    /// Buffers returned on drop
    pub returns: u64,
    /// Returns dropped because the class was full
    pub discards: u64,
}

/// RAII lease of a pooled buffer. Returns to the pool on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Option<&'static BufferPool>,
}

impl PooledBuf {
    /// A detached buffer that never returns to any pool. Used by tests and
    /// by callers that intend to keep the bytes.
    pub fn detached(len: usize) -> Self {
        PooledBuf {
            buf: vec![0u8; len],
            pool: None,
        }
    }

    /// Resize the leased buffer in place. The buffer re-enters the pool
    /// under its new length class when dropped.
    pub fn resize(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the lease and keep the bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.pool = None;
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            if !self.buf.is_empty() {
                pool.give_back(std::mem::take(&mut self.buf));
            }
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf({} bytes)", self.buf.len())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! CLOCK second-chance page cache.
//!
//! Wraps another source with up to `capacity` page slots in a circular
//! buffer. Hits run under the shared read lock and set the slot's reference
//! bit atomically; miss-load, invalidate, write-through, and dispose hold
//! the exclusive write lock, which cannot be acquired while any reader holds
//! a slot borrow. Eviction sweeps the clock hand, clearing set reference
//! bits and evicting the first clear one. Newly loaded and prefetched pages
//! start with the bit clear: a page earns protection only on re-access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use log::trace;

use crate::error::{Error, Result};
use crate::mem::{self, PooledBuf};
use crate::types::Pgno;

use super::{check_pgno, PageRef, PageSource, WritablePageSource};

/// Cache tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum cached pages
    pub capacity: usize,
    /// Length of a strictly increasing access run that triggers prefetch;
    /// 0 disables prefetch
    pub sequential_threshold: usize,
    /// Pages to speculatively load after a sequential run
    pub prefetch_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 256,
            sequential_threshold: 4,
            prefetch_depth: 8,
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a cached slot
    pub hits: u64,
    /// Reads that had to load from the inner source
    pub misses: u64,
    /// Pages loaded speculatively
    pub prefetched: u64,
}

struct Slot {
    pgno: Pgno,
    buf: PooledBuf,
    referenced: AtomicBool,
}

struct CacheState {
    slots: Vec<Slot>,
    map: HashMap<Pgno, usize>,
    hand: usize,
    disposed: bool,
}

/// Tracks the recent access sequence for sequential-run detection.
struct RunDetector {
    window: VecDeque<Pgno>,
    threshold: usize,
}

impl RunDetector {
    fn new(threshold: usize) -> Self {
        RunDetector {
            window: VecDeque::with_capacity(threshold.max(1)),
            threshold,
        }
    }

    /// Record an access; true when the last `threshold` accesses form a
    /// strictly increasing run ending at `pgno`.
    fn note(&mut self, pgno: Pgno) -> bool {
        if self.threshold == 0 {
            return false;
        }
        if self.window.len() == self.threshold {
            self.window.pop_front();
        }
        self.window.push_back(pgno);
        self.window.len() == self.threshold
            && self.window.iter().zip(self.window.iter().skip(1)).all(|(a, b)| a < b)
    }
}

/// CLOCK second-chance cache over any page source.
pub struct CachedPageSource<S> {
    source: S,
    page_size: u32,
    config: CacheConfig,
    state: RwLock<CacheState>,
    run: Mutex<RunDetector>,
    hits: AtomicU64,
    misses: AtomicU64,
    prefetched: AtomicU64,
}

/// Read-lock pin on one cache slot. The slot's bytes stay valid (and the
/// slot cannot be evicted or freed) for the guard's lifetime, because every
/// mutating cache path requires the exclusive lock.
pub struct CacheGuard<'a> {
    guard: RwLockReadGuard<'a, CacheState>,
    idx: usize,
}

impl CacheGuard<'_> {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.guard.slots[self.idx].buf
    }
}

impl<S: PageSource> CachedPageSource<S> {
    /// Wrap `source` with the default configuration.
    pub fn new(source: S) -> Self {
        Self::with_config(source, CacheConfig::default())
    }

    /// Wrap `source` with explicit tuning.
    pub fn with_config(source: S, config: CacheConfig) -> Self {
        let page_size = source.page_size();
        CachedPageSource {
            source,
            page_size,
            config,
            state: RwLock::new(CacheState {
                slots: Vec::new(),
                map: HashMap::new(),
                hand: 0,
                disposed: false,
            }),
            run: Mutex::new(RunDetector::new(config.sequential_threshold)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            prefetched: AtomicU64::new(0),
        }
    }

    /// Counters snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
        }
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.source
    }

    fn note_access(&self, pgno: Pgno) -> bool {
        self.run
            .lock()
            .expect("cache run detector poisoned")
            .note(pgno)
    }

    /// Pick the victim slot: grow up to capacity first, then sweep the
    /// clock hand, clearing set reference bits until a clear one is found.
    fn acquire_slot(&self, state: &mut CacheState) -> usize {
        if state.slots.len() < self.config.capacity {
            state.slots.push(Slot {
                pgno: 0,
                buf: mem::lease(self.page_size as usize),
                referenced: AtomicBool::new(false),
            });
            return state.slots.len() - 1;
        }
        loop {
            let idx = state.hand;
            state.hand = (state.hand + 1) % state.slots.len();
            let slot = &state.slots[idx];
            if slot.referenced.swap(false, Ordering::Relaxed) {
                continue; // second chance
            }
            if slot.pgno != 0 {
                trace!("cache evict page {}", slot.pgno);
                state.map.remove(&slot.pgno);
            }
            return idx;
        }
    }

    /// Load `pgno` into a slot under the exclusive lock. Reference bit
    /// starts clear.
    fn load_slot(&self, state: &mut CacheState, pgno: Pgno) -> Result<usize> {
        let idx = self.acquire_slot(state);
        let slot = &mut state.slots[idx];
        self.source.read_page(pgno, &mut slot.buf)?;
        slot.pgno = pgno;
        slot.referenced.store(false, Ordering::Relaxed);
        state.map.insert(pgno, idx);
        Ok(idx)
    }

    /// Speculatively load up to `prefetch_depth` pages after `pgno`.
    fn prefetch_after(&self, state: &mut CacheState, pgno: Pgno) {
        let last = self.source.page_count();
        let depth = self.config.prefetch_depth as u32;
        for next in pgno + 1..=pgno.saturating_add(depth).min(last) {
            if state.map.contains_key(&next) {
                continue;
            }
            if self.load_slot(state, next).is_ok() {
                self.prefetched.fetch_add(1, Ordering::Relaxed);
                trace!("cache prefetch page {}", next);
            }
        }
    }
}

impl<S: PageSource> PageSource for CachedPageSource<S> {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.source.page_count()
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        check_pgno(pgno, self.source.page_count())?;
        // After a miss-load the slot is served without touching its
        // reference bit; only a genuine re-access sets it.
        let mut just_loaded = false;
        loop {
            {
                let guard = self.state.read().expect("cache lock poisoned");
                if guard.disposed {
                    return Err(Error::disposed("cached page source"));
                }
                if let Some(&idx) = guard.map.get(&pgno) {
                    if !just_loaded {
                        guard.slots[idx].referenced.store(true, Ordering::Relaxed);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        self.note_access(pgno);
                    }
                    return Ok(PageRef::Cache(CacheGuard { guard, idx }));
                }
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            let sequential = self.note_access(pgno);
            let mut state = self.state.write().expect("cache lock poisoned");
            if state.disposed {
                return Err(Error::disposed("cached page source"));
            }
            if !state.map.contains_key(&pgno) {
                self.load_slot(&mut state, pgno)?;
                just_loaded = true;
            }
            if sequential && self.config.prefetch_depth > 0 {
                self.prefetch_after(&mut state, pgno);
            }
        }
    }

    fn invalidate(&mut self, pgno: Pgno) -> Result<()> {
        let mut state = self.state.write().expect("cache lock poisoned");
        if state.disposed {
            return Err(Error::disposed("cached page source"));
        }
        if let Some(idx) = state.map.remove(&pgno) {
            let slot = &mut state.slots[idx];
            slot.pgno = 0;
            slot.referenced.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    fn data_version(&self) -> u64 {
        self.source.data_version()
    }

    fn dispose(&mut self) {
        {
            let mut state = self.state.write().expect("cache lock poisoned");
            state.slots.clear(); // leases return to the pool here
            state.map.clear();
            state.disposed = true;
        }
        self.source.dispose();
    }
}

impl<S: WritablePageSource> WritablePageSource for CachedPageSource<S> {
    fn write_page(&mut self, pgno: Pgno, src: &[u8]) -> Result<()> {
        let mut state = self.state.write().expect("cache lock poisoned");
        if state.disposed {
            return Err(Error::disposed("cached page source"));
        }
        self.source.write_page(pgno, src)?;
        // Write-through: refresh the cached copy so readers after the
        // exclusive section see the new bytes.
        if let Some(&idx) = state.map.get(&pgno) {
            state.slots[idx].buf.copy_from_slice(src);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.source.flush()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Page sources: the byte-addressed backing stores b-trees are read from.
//!
//! A page source exposes fixed-size pages numbered from 1. The read surface
//! distinguishes three lifetimes, encoded in `PageRef`:
//!
//! - a slice borrowed for the source's lifetime (memory, mmap, shadow hit),
//! - a pool-leased owned buffer (file reads, proxy forwarding),
//! - a cache-guarded slice valid while the cache's shared read lock is held.
//!
//! Callers that need bytes beyond those windows copy, or ask for
//! `get_page_memory`, which always returns reference-counted bytes.

use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;
use std::cell::RefCell;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::{self, PooledBuf};
use crate::types::Pgno;

mod cache;
mod file;
mod mmap;
mod shadow;

pub use cache::{CacheConfig, CacheGuard, CachedPageSource};
pub use file::FilePageSource;
pub use mmap::MmapPageSource;
pub use shadow::ShadowPageSource;

// ============================================================================
// Page References
// ============================================================================

/// Borrowed page bytes, tagged with how long they stay valid.
pub enum PageRef<'a> {
    /// Zero-copy slice valid for the source's lifetime
    Slice(&'a [u8]),
    /// Pool-leased copy owned by the caller; valid until dropped
    Pooled(PooledBuf),
    /// Cache slot pinned by a shared read lock; valid until dropped
    Cache(CacheGuard<'a>),
}

impl Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageRef::Slice(s) => s,
            PageRef::Pooled(buf) => buf,
            PageRef::Cache(guard) => guard.bytes(),
        }
    }
}

impl std::fmt::Debug for PageRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PageRef::Slice(_) => "slice",
            PageRef::Pooled(_) => "pooled",
            PageRef::Cache(_) => "cache",
        };
        write!(f, "PageRef::{}({} bytes)", kind, self.len())
    }
}

/// Cheaply clonable reference-counted byte range. The return type of
/// `get_page_memory`; survives across calls and across source teardown.
#[derive(Clone)]
pub struct SharedBytes {
    buf: Arc<[u8]>,
    start: usize,
    len: usize,
}

impl SharedBytes {
    /// Wrap an owned buffer.
    pub fn from_vec(v: Vec<u8>) -> Self {
        let len = v.len();
        SharedBytes {
            buf: v.into(),
            start: 0,
            len,
        }
    }

    /// Zero-copy sub-range of an existing shared buffer.
    pub fn slice_of(buf: Arc<[u8]>, start: usize, len: usize) -> Self {
        debug_assert!(start + len <= buf.len());
        SharedBytes { buf, start, len }
    }
}

impl Deref for SharedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }
}

impl std::fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBytes({} bytes)", self.len)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Read contract shared by every page source variant.
pub trait PageSource {
    /// Page size in bytes.
    fn page_size(&self) -> u32;

    /// Current page count.
    fn page_count(&self) -> Pgno;

    /// Borrow page `pgno`. Validity window depends on the variant; see the
    /// module docs. Page numbers start at 1; out-of-range is a range error.
    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>>;

    /// Copy page `pgno` into `dst`, which must be exactly one page long.
    fn read_page(&self, pgno: Pgno, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.page_size() as usize {
            return Err(Error::range("destination is not one page long"));
        }
        let page = self.get_page(pgno)?;
        dst.copy_from_slice(&page);
        Ok(())
    }

    /// Reference-counted copy of page `pgno` that survives across calls.
    /// Sources that cannot share their backing store zero-copy allocate.
    fn get_page_memory(&self, pgno: Pgno) -> Result<SharedBytes> {
        let mut buf = vec![0u8; self.page_size() as usize];
        self.read_page(pgno, &mut buf)?;
        Ok(SharedBytes::from_vec(buf))
    }

    /// Drop any cached copy of page `pgno`. Sources without caching or
    /// write support report not-supported.
    fn invalidate(&mut self, _pgno: Pgno) -> Result<()> {
        Err(Error::new(ErrorCode::NotSupported))
    }

    /// Monotonically non-decreasing counter that changes iff a write has
    /// occurred through this source. Read-only sources return 0.
    fn data_version(&self) -> u64 {
        0
    }

    /// Release all resources. Further use fails with a misuse error.
    fn dispose(&mut self);
}

/// Write extension for sources that accept page writes.
pub trait WritablePageSource: PageSource {
    /// Replace page `pgno` with `src`, which must be exactly one page long.
    /// Writing one page past the end grows the source.
    fn write_page(&mut self, pgno: Pgno, src: &[u8]) -> Result<()>;

    /// Flush buffered writes to the backing store.
    fn flush(&mut self) -> Result<()>;
}

impl PageSource for Box<dyn PageSource> {
    fn page_size(&self) -> u32 {
        (**self).page_size()
    }

    fn page_count(&self) -> Pgno {
        (**self).page_count()
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        (**self).get_page(pgno)
    }

    fn read_page(&self, pgno: Pgno, dst: &mut [u8]) -> Result<()> {
        (**self).read_page(pgno, dst)
    }

    fn get_page_memory(&self, pgno: Pgno) -> Result<SharedBytes> {
        (**self).get_page_memory(pgno)
    }

    fn invalidate(&mut self, pgno: Pgno) -> Result<()> {
        (**self).invalidate(pgno)
    }

    fn data_version(&self) -> u64 {
        (**self).data_version()
    }

    fn dispose(&mut self) {
        (**self).dispose()
    }
}

/// Shared page-number validation: pages are 1-indexed and bounded by count.
pub(crate) fn check_pgno(pgno: Pgno, page_count: Pgno) -> Result<()> {
    if pgno == 0 || pgno > page_count {
        return Err(Error::range(format!(
            "page {} out of range 1..={}",
            pgno, page_count
        )));
    }
    Ok(())
}

// ============================================================================
// MemoryPageSource
// ============================================================================

/// Immutable byte-buffer source. `get_page` is a zero-copy subslice valid
/// for the source's lifetime; `get_page_memory` shares the buffer zero-copy.
pub struct MemoryPageSource {
    data: Arc<[u8]>,
    page_size: u32,
    page_count: Pgno,
    disposed: bool,
}

impl MemoryPageSource {
    /// Wrap a whole database image. The buffer length must cover
    /// `page_count * page_size` bytes.
    pub fn new(data: Vec<u8>, page_size: u32) -> Result<Self> {
        Self::from_shared(data.into(), page_size)
    }

    /// Wrap an already-shared database image.
    pub fn from_shared(data: Arc<[u8]>, page_size: u32) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page size must be a power of two",
            ));
        }
        let page_count = (data.len() / page_size as usize) as Pgno;
        Ok(MemoryPageSource {
            data,
            page_size,
            page_count,
            disposed: false,
        })
    }

    fn check(&self, pgno: Pgno) -> Result<usize> {
        if self.disposed {
            return Err(Error::disposed("memory page source"));
        }
        check_pgno(pgno, self.page_count)?;
        Ok((pgno as usize - 1) * self.page_size as usize)
    }
}

impl PageSource for MemoryPageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.page_count
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        let start = self.check(pgno)?;
        Ok(PageRef::Slice(
            &self.data[start..start + self.page_size as usize],
        ))
    }

    fn get_page_memory(&self, pgno: Pgno) -> Result<SharedBytes> {
        let start = self.check(pgno)?;
        Ok(SharedBytes::slice_of(
            self.data.clone(),
            start,
            self.page_size as usize,
        ))
    }

    fn dispose(&mut self) {
        self.data = Arc::from(Vec::new());
        self.disposed = true;
    }
}

// ============================================================================
// HeapPageSource
// ============================================================================

/// Growable in-heap writable source: the base store of memory-mode
/// databases and the commit sink in tests.
pub struct HeapPageSource {
    data: Vec<u8>,
    page_size: u32,
    version: u64,
    disposed: bool,
}

impl HeapPageSource {
    /// Empty source with the given page size.
    pub fn new(page_size: u32) -> Self {
        HeapPageSource {
            data: Vec::new(),
            page_size,
            version: 0,
            disposed: false,
        }
    }

    /// Start from an existing image.
    pub fn from_vec(data: Vec<u8>, page_size: u32) -> Self {
        HeapPageSource {
            data,
            page_size,
            version: 0,
            disposed: false,
        }
    }

    /// The full image (tests, snapshotting).
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Truncate to `page_count` pages.
    pub fn truncate(&mut self, page_count: Pgno) {
        self.data
            .truncate(page_count as usize * self.page_size as usize);
    }

    fn check(&self, pgno: Pgno) -> Result<usize> {
        if self.disposed {
            return Err(Error::disposed("heap page source"));
        }
        check_pgno(pgno, self.page_count())?;
        Ok((pgno as usize - 1) * self.page_size as usize)
    }
}

impl PageSource for HeapPageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        (self.data.len() / self.page_size as usize) as Pgno
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        let start = self.check(pgno)?;
        Ok(PageRef::Slice(
            &self.data[start..start + self.page_size as usize],
        ))
    }

    fn data_version(&self) -> u64 {
        self.version
    }

    fn dispose(&mut self) {
        self.data = Vec::new();
        self.disposed = true;
    }
}

impl WritablePageSource for HeapPageSource {
    fn write_page(&mut self, pgno: Pgno, src: &[u8]) -> Result<()> {
        if self.disposed {
            return Err(Error::disposed("heap page source"));
        }
        if src.len() != self.page_size as usize {
            return Err(Error::range("source is not one page long"));
        }
        if pgno == 0 {
            return Err(Error::range("page 0 is not a valid page"));
        }
        let end = pgno as usize * self.page_size as usize;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = end - self.page_size as usize;
        self.data[start..end].copy_from_slice(src);
        self.version += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// ProxyPageSource
// ============================================================================

/// Forwards every call to a swappable target. Used to atomically re-base
/// readers onto a fresh source chain after a commit. The proxy never owns
/// the target: `dispose` detaches without disposing it.
///
/// Because the target sits behind shared interior mutability, the proxy
/// cannot lend out the target's borrows; `get_page` serves pool-leased
/// copies instead.
#[derive(Clone)]
pub struct ProxyPageSource {
    target: Rc<RefCell<Box<dyn PageSource>>>,
    detached: bool,
}

impl ProxyPageSource {
    /// Proxy over an initial target.
    pub fn new(target: Box<dyn PageSource>) -> Self {
        ProxyPageSource {
            target: Rc::new(RefCell::new(target)),
            detached: false,
        }
    }

    /// Swap the target, returning the previous one. Existing proxies (and
    /// clones of this proxy) all observe the new target on their next call.
    pub fn swap_target(&self, new_target: Box<dyn PageSource>) -> Box<dyn PageSource> {
        std::mem::replace(&mut *self.target.borrow_mut(), new_target)
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.detached {
            return Err(Error::disposed("proxy page source"));
        }
        Ok(())
    }
}

impl PageSource for ProxyPageSource {
    fn page_size(&self) -> u32 {
        self.target.borrow().page_size()
    }

    fn page_count(&self) -> Pgno {
        self.target.borrow().page_count()
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        self.ensure_attached()?;
        let target = self.target.borrow();
        let mut buf = mem::lease(target.page_size() as usize);
        target.read_page(pgno, &mut buf)?;
        Ok(PageRef::Pooled(buf))
    }

    fn read_page(&self, pgno: Pgno, dst: &mut [u8]) -> Result<()> {
        self.ensure_attached()?;
        self.target.borrow().read_page(pgno, dst)
    }

    fn get_page_memory(&self, pgno: Pgno) -> Result<SharedBytes> {
        self.ensure_attached()?;
        self.target.borrow().get_page_memory(pgno)
    }

    fn invalidate(&mut self, pgno: Pgno) -> Result<()> {
        self.ensure_attached()?;
        self.target.borrow_mut().invalidate(pgno)
    }

    fn data_version(&self) -> u64 {
        self.target.borrow().data_version()
    }

    fn dispose(&mut self) {
        // Detach only; the target outlives the proxy by contract.
        self.detached = true;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn image(pages: u32, page_size: u32) -> Vec<u8> {
        let mut data = vec![0u8; (pages * page_size) as usize];
        for p in 0..pages {
            data[(p * page_size) as usize] = p as u8 + 1;
        }
        data
    }

    #[test]
    fn test_memory_source_zero_copy_read() {
        let src = MemoryPageSource::new(image(3, 512), 512).unwrap();
        assert_eq!(src.page_count(), 3);
        let page = src.get_page(2).unwrap();
        assert_eq!(page.len(), 512);
        assert_eq!(page[0], 2);
        assert!(matches!(page, PageRef::Slice(_)));
    }

    #[test]
    fn test_page_zero_and_out_of_range() {
        let src = MemoryPageSource::new(image(2, 512), 512).unwrap();
        assert_eq!(
            src.get_page(0).unwrap_err().code(),
            crate::error::ErrorCode::Range
        );
        assert_eq!(
            src.get_page(3).unwrap_err().code(),
            crate::error::ErrorCode::Range
        );
    }

    #[test]
    fn test_memory_source_shared_bytes_survive_dispose() {
        let mut src = MemoryPageSource::new(image(2, 512), 512).unwrap();
        let shared = src.get_page_memory(1).unwrap();
        src.dispose();
        assert_eq!(shared[0], 1);
        assert!(src.get_page(1).is_err());
    }

    #[test]
    fn test_heap_source_roundtrip_and_growth() {
        let mut src = HeapPageSource::new(256);
        assert_eq!(src.page_count(), 0);

        let page = vec![7u8; 256];
        src.write_page(1, &page).unwrap();
        src.write_page(2, &page).unwrap();
        assert_eq!(src.page_count(), 2);

        let mut readback = vec![0u8; 256];
        src.read_page(2, &mut readback).unwrap();
        assert_eq!(readback, page);
        assert!(src.data_version() > 0);
    }

    #[test]
    fn test_heap_write_wrong_size_rejected() {
        let mut src = HeapPageSource::new(256);
        assert!(src.write_page(1, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_invalidate_not_supported_on_memory() {
        let mut src = MemoryPageSource::new(image(1, 512), 512).unwrap();
        assert_eq!(
            src.invalidate(1).unwrap_err().code(),
            crate::error::ErrorCode::NotSupported
        );
    }

    #[test]
    fn test_proxy_swaps_target() {
        let a = MemoryPageSource::new(image(1, 512), 512).unwrap();
        let mut b_img = image(1, 512);
        b_img[0] = 0xAA;
        let b = MemoryPageSource::new(b_img, 512).unwrap();

        let proxy = ProxyPageSource::new(Box::new(a));
        assert_eq!(proxy.get_page(1).unwrap()[0], 1);

        let old = proxy.swap_target(Box::new(b));
        assert_eq!(old.page_count(), 1);
        assert_eq!(proxy.get_page(1).unwrap()[0], 0xAA);
    }

    #[test]
    fn test_proxy_dispose_leaves_target_alive() {
        let a = MemoryPageSource::new(image(1, 512), 512).unwrap();
        let proxy = ProxyPageSource::new(Box::new(a));
        let mut clone = proxy.clone();
        clone.dispose();
        assert!(clone.get_page(1).is_err());
        // The original proxy still reaches the target.
        assert_eq!(proxy.get_page(1).unwrap()[0], 1);
    }
}

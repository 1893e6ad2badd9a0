//! Copy-on-write shadow overlay holding a transaction's dirty pages.
//!
//! Dirty pages live in a contiguous bump-allocated arena of page-sized
//! slots, keyed by page number in a side map. Reads consult the shadow
//! first and fall through to the base; writes always land in the shadow.
//! `reset` clears dirty state but keeps the arena for the next transaction;
//! `clear_shadow` is the rollback path. Nothing reaches the base until the
//! page manager walks `dirty_pages` at commit and copies into a writable
//! sink.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::Pgno;

use super::{PageRef, PageSource, WritablePageSource};

/// Shadow overlay over a base source.
pub struct ShadowPageSource<S> {
    base: S,
    page_size: usize,
    arena: Vec<u8>,
    slots: HashMap<Pgno, usize>,
    base_page_count: Pgno,
    page_count: Pgno,
    // Internal write counter; feeds data_version and resets with the shadow.
    shadow_version: u64,
    disposed: bool,
}

impl<S: PageSource> ShadowPageSource<S> {
    /// Overlay `base`.
    pub fn new(base: S) -> Self {
        let page_size = base.page_size() as usize;
        let base_page_count = base.page_count();
        ShadowPageSource {
            base,
            page_size,
            arena: Vec::new(),
            slots: HashMap::new(),
            base_page_count,
            page_count: base_page_count,
            shadow_version: 0,
            disposed: false,
        }
    }

    /// The wrapped base source.
    pub fn base(&self) -> &S {
        &self.base
    }

    /// Page count of the base at overlay creation.
    pub fn base_page_count(&self) -> Pgno {
        self.base_page_count
    }

    /// True when no dirty pages are held.
    pub fn is_clean(&self) -> bool {
        self.slots.is_empty() && self.page_count == self.base_page_count
    }

    /// Number of dirty pages.
    pub fn dirty_count(&self) -> usize {
        self.slots.len()
    }

    /// Dirty page numbers in ascending order.
    pub fn dirty_pages(&self) -> Vec<Pgno> {
        let mut pages: Vec<Pgno> = self.slots.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Borrow a dirty page's bytes, if the page is dirty.
    pub fn dirty_page_bytes(&self, pgno: Pgno) -> Option<&[u8]> {
        self.slots
            .get(&pgno)
            .map(|&off| &self.arena[off..off + self.page_size])
    }

    /// Mutable slot for `pgno`, materializing it on first touch by copying
    /// the base page when one exists (copy-on-write) or zero-filling when
    /// the page is new.
    pub fn page_for_write(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        if self.disposed {
            return Err(Error::disposed("shadow page source"));
        }
        if pgno == 0 || pgno > self.page_count {
            return Err(Error::range(format!(
                "page {} out of range 1..={}",
                pgno, self.page_count
            )));
        }
        if !self.slots.contains_key(&pgno) {
            let off = self.arena.len();
            self.arena.resize(off + self.page_size, 0);
            if pgno <= self.base_page_count {
                self.base
                    .read_page(pgno, &mut self.arena[off..off + self.page_size])?;
            }
            self.slots.insert(pgno, off);
        }
        self.shadow_version += 1;
        let off = self.slots[&pgno];
        Ok(&mut self.arena[off..off + self.page_size])
    }

    /// Allocate a fresh page past the current end; returns its number.
    /// The slot starts zeroed.
    pub fn allocate_page(&mut self) -> Result<Pgno> {
        if self.disposed {
            return Err(Error::disposed("shadow page source"));
        }
        let pgno = self.page_count + 1;
        self.page_count = pgno;
        let off = self.arena.len();
        self.arena.resize(off + self.page_size, 0);
        self.slots.insert(pgno, off);
        self.shadow_version += 1;
        Ok(pgno)
    }

    /// Drop all dirty state but keep the arena allocation for reuse.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.arena.clear();
        self.page_count = self.base_page_count;
        self.shadow_version = 0;
    }

    /// Rollback: discard every dirty page.
    pub fn clear_shadow(&mut self) {
        self.reset();
    }

    /// Re-sample the base page count (after the base advanced under a
    /// committed transaction) and drop dirty state.
    pub fn rebase(&mut self) {
        self.base_page_count = self.base.page_count();
        self.reset();
    }

    /// Copy every dirty page into `sink` in ascending page order.
    pub fn commit_into(&self, sink: &mut dyn WritablePageSource) -> Result<()> {
        for pgno in self.dirty_pages() {
            let bytes = self
                .dirty_page_bytes(pgno)
                .expect("dirty page listed but missing");
            sink.write_page(pgno, bytes)?;
        }
        Ok(())
    }

    /// Tear down the overlay and recover the base source.
    pub fn into_base(self) -> S {
        self.base
    }
}

impl<S: PageSource> PageSource for ShadowPageSource<S> {
    fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    fn page_count(&self) -> Pgno {
        self.page_count
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        if self.disposed {
            return Err(Error::disposed("shadow page source"));
        }
        if let Some(bytes) = self.dirty_page_bytes(pgno) {
            return Ok(PageRef::Slice(bytes));
        }
        if pgno == 0 || pgno > self.page_count {
            return Err(Error::range(format!(
                "page {} out of range 1..={}",
                pgno, self.page_count
            )));
        }
        self.base.get_page(pgno)
    }

    fn invalidate(&mut self, pgno: Pgno) -> Result<()> {
        // Dropping a dirty slot would lose writes; forward to the base,
        // which caches nothing or handles it itself.
        self.base.invalidate(pgno)
    }

    fn data_version(&self) -> u64 {
        self.shadow_version + self.base.data_version()
    }

    fn dispose(&mut self) {
        self.reset();
        self.arena = Vec::new();
        self.disposed = true;
        self.base.dispose();
    }
}

impl<S: PageSource> WritablePageSource for ShadowPageSource<S> {
    fn write_page(&mut self, pgno: Pgno, src: &[u8]) -> Result<()> {
        if src.len() != self.page_size {
            return Err(Error::range("source is not one page long"));
        }
        if pgno == self.page_count + 1 {
            self.allocate_page()?;
        }
        let slot = self.page_for_write(pgno)?;
        slot.copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Dirty pages stay in the shadow until the transaction commits.
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::source::HeapPageSource;

    fn base_with_pages(pages: u32) -> HeapPageSource {
        let mut src = HeapPageSource::new(256);
        for p in 1..=pages {
            let mut page = vec![0u8; 256];
            page[0] = p as u8;
            src.write_page(p, &page).unwrap();
        }
        src
    }

    #[test]
    fn test_reads_fall_through_until_written() {
        let mut shadow = ShadowPageSource::new(base_with_pages(2));
        assert_eq!(shadow.get_page(1).unwrap()[0], 1);

        let slot = shadow.page_for_write(1).unwrap();
        assert_eq!(slot[0], 1, "copy-on-write must seed from the base");
        slot[0] = 0x99;

        assert_eq!(shadow.get_page(1).unwrap()[0], 0x99);
        assert_eq!(shadow.get_page(2).unwrap()[0], 2);
        // Base is untouched.
        assert_eq!(shadow.base().get_page(1).unwrap()[0], 1);
    }

    #[test]
    fn test_allocate_extends_page_count() {
        let mut shadow = ShadowPageSource::new(base_with_pages(2));
        let pgno = shadow.allocate_page().unwrap();
        assert_eq!(pgno, 3);
        assert_eq!(shadow.page_count(), 3);
        assert!(shadow.get_page(3).unwrap().iter().all(|&b| b == 0));
        // Base does not see the new page.
        assert_eq!(shadow.base().page_count(), 2);
    }

    #[test]
    fn test_clear_shadow_rolls_back() {
        let mut shadow = ShadowPageSource::new(base_with_pages(1));
        shadow.page_for_write(1).unwrap()[0] = 0xFF;
        shadow.allocate_page().unwrap();
        assert!(shadow.data_version() > 0);

        shadow.clear_shadow();
        assert_eq!(shadow.page_count(), 1);
        assert_eq!(shadow.get_page(1).unwrap()[0], 1);
        assert!(shadow.is_clean());
    }

    #[test]
    fn test_commit_into_applies_in_order() {
        let mut shadow = ShadowPageSource::new(base_with_pages(2));
        shadow.page_for_write(2).unwrap()[0] = 0xB2;
        shadow.page_for_write(1).unwrap()[0] = 0xB1;
        shadow.allocate_page().unwrap();

        let mut sink = base_with_pages(2);
        shadow.commit_into(&mut sink).unwrap();
        assert_eq!(sink.page_count(), 3);
        assert_eq!(sink.get_page(1).unwrap()[0], 0xB1);
        assert_eq!(sink.get_page(2).unwrap()[0], 0xB2);
    }

    #[test]
    fn test_write_page_whole_page() {
        let mut shadow = ShadowPageSource::new(base_with_pages(1));
        let page = vec![0xCCu8; 256];
        shadow.write_page(1, &page).unwrap();
        shadow.write_page(2, &page).unwrap(); // append
        assert_eq!(shadow.page_count(), 2);
        assert_eq!(shadow.dirty_count(), 2);
    }
}

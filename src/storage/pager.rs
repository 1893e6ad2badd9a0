//! Page manager: copy-on-write transaction state and the atomic commit
//! phases.
//!
//! A `PageManager` overlays the read chain with a shadow of dirty pages.
//! Reads through the manager see the writer's own writes; nothing escapes
//! until commit. Commit phases: (1) stamp page 1 and materialize originals
//! into the rollback journal (or frames into the WAL), (2) fsync the
//! journal/WAL, (3) apply dirty pages to the file (rollback mode only),
//! (4) fsync the file, (5) delete the journal / leave frames for the
//! checkpoint. A crash after (2) is recoverable; before (2) the base file
//! is untouched.

use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::types::Pgno;

use super::btree::insert::PageWriter;
use super::header::DbHeader;
use super::journal::JournalWriter;
use super::source::{FilePageSource, PageRef, PageSource, ShadowPageSource, WritablePageSource};
use super::wal::{wal_path, WalSnapshot, WalWriter};

/// Copy-on-write transaction state over a base source.
pub struct PageManager<B: PageSource> {
    shadow: ShadowPageSource<B>,
    usable: u32,
}

impl<B: PageSource> PageManager<B> {
    /// Start a transaction over `base`.
    pub fn new(base: B, usable: u32) -> Self {
        PageManager {
            shadow: ShadowPageSource::new(base),
            usable,
        }
    }

    /// True when nothing has been written.
    pub fn is_clean(&self) -> bool {
        self.shadow.is_clean()
    }

    /// Dirty page count.
    pub fn dirty_count(&self) -> usize {
        self.shadow.dirty_count()
    }

    /// Discard all dirty pages.
    pub fn rollback(&mut self) {
        debug!("rollback discards {} dirty page(s)", self.shadow.dirty_count());
        self.shadow.clear_shadow();
    }

    /// Recover the base source.
    pub fn into_base(self) -> B {
        self.shadow.into_base()
    }

    /// Stamp page 1 with the post-transaction page count and a bumped
    /// change counter. Runs inside commit, never earlier, so journal
    /// recovery can rely on the on-disk header's pre-transaction count.
    fn stamp_header(&mut self) -> Result<DbHeader> {
        let new_count = self.shadow.page_count();
        let page1 = self.shadow.page_for_write(1)?;
        let mut header = DbHeader::parse(page1)?;
        header.page_count = new_count;
        header.change_counter = header.change_counter.wrapping_add(1);
        header.encode(page1);
        Ok(header)
    }

    /// Commit through a rollback journal into `file`.
    pub fn commit_rollback(&mut self, db_path: &Path, file: &mut FilePageSource) -> Result<()> {
        if self.shadow.is_clean() {
            return Ok(());
        }
        self.stamp_header()?;

        let base_count = self.shadow.base_page_count();
        let page_size = self.shadow.page_size();

        // Phase 1: original images of every dirty pre-existing page.
        let mut journal = JournalWriter::create(db_path, page_size, base_count)?;
        let mut original = vec![0u8; page_size as usize];
        for pgno in self.shadow.dirty_pages() {
            if pgno <= base_count {
                self.shadow.base().read_page(pgno, &mut original)?;
                journal.write_frame(pgno, &original)?;
            }
        }
        // Phase 2: the journal is durable before the file changes.
        journal.sync()?;

        // Phase 3: apply dirty pages in ascending order.
        let result = self.shadow.commit_into(file).and_then(|_| file.flush());
        match result {
            Ok(()) => {
                // Phase 5: done; the journal is obsolete.
                journal.finalize()?;
                info!("committed {} page(s) via rollback journal", self.shadow.dirty_count());
                Ok(())
            }
            Err(err) => {
                // The half-applied file is repaired from the journal now;
                // had the process died instead, open-time recovery would
                // have done the same.
                drop(journal);
                let _ = super::journal::recover(db_path);
                self.rollback();
                Err(err)
            }
        }
    }

    /// Commit by appending WAL frames; the database file itself is only
    /// touched at checkpoint time.
    pub fn commit_wal(&mut self, wal: &mut WalWriter) -> Result<()> {
        if self.shadow.is_clean() {
            return Ok(());
        }
        self.stamp_header()?;

        let new_count = self.shadow.page_count();
        let dirty = self.shadow.dirty_pages();
        for (i, pgno) in dirty.iter().enumerate() {
            let bytes = self
                .shadow
                .dirty_page_bytes(*pgno)
                .expect("dirty page listed but missing");
            let commit_size = if i == dirty.len() - 1 { new_count } else { 0 };
            wal.append_frame(*pgno, bytes, commit_size)?;
        }
        wal.sync()?;
        info!("committed {} wal frame(s)", dirty.len());
        Ok(())
    }

    /// Stamp the header and hand back the dirty page images in ascending
    /// order. Used by commit paths that apply pages themselves.
    pub fn finish_dirty(&mut self) -> Result<Vec<(Pgno, Vec<u8>)>> {
        if self.shadow.is_clean() {
            return Ok(Vec::new());
        }
        self.stamp_header()?;
        let mut out = Vec::with_capacity(self.shadow.dirty_count());
        for pgno in self.shadow.dirty_pages() {
            let bytes = self
                .shadow
                .dirty_page_bytes(pgno)
                .expect("dirty page listed but missing");
            out.push((pgno, bytes.to_vec()));
        }
        Ok(out)
    }

    /// Commit straight into a writable sink (memory-mode databases, which
    /// have no crash-durability story).
    pub fn commit_direct(&mut self, sink: &mut dyn WritablePageSource) -> Result<()> {
        if self.shadow.is_clean() {
            return Ok(());
        }
        self.stamp_header()?;
        self.shadow.commit_into(sink)?;
        sink.flush()
    }
}

impl<B: PageSource> PageSource for PageManager<B> {
    fn page_size(&self) -> u32 {
        self.shadow.page_size()
    }

    fn page_count(&self) -> Pgno {
        self.shadow.page_count()
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        self.shadow.get_page(pgno)
    }

    fn data_version(&self) -> u64 {
        self.shadow.data_version()
    }

    fn dispose(&mut self) {
        self.shadow.dispose();
    }
}

impl<B: PageSource> PageWriter for PageManager<B> {
    fn usable_size(&self) -> u32 {
        self.usable
    }

    fn page_for_write(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        self.shadow.page_for_write(pgno)
    }

    fn allocate_page(&mut self) -> Result<Pgno> {
        self.shadow.allocate_page()
    }
}

/// Fold the WAL's committed frames into the database file and delete the
/// WAL. Returns true when frames were applied. Safe to call with no WAL
/// present.
pub fn checkpoint(db_path: &Path, page_size: u32) -> Result<bool> {
    let Some(snapshot) = WalSnapshot::load(db_path, page_size)? else {
        return Ok(false);
    };
    if snapshot.is_empty() {
        let _ = std::fs::remove_file(wal_path(db_path));
        return Ok(false);
    }

    let mut file = FilePageSource::open(db_path, page_size, true)?;
    for pgno in snapshot.committed_pages() {
        let bytes = snapshot.page(pgno).expect("committed page listed but missing");
        // Appends may arrive out of order relative to the file's current
        // end; grow with zero pages first.
        while file.page_count() + 1 < pgno {
            let filler = vec![0u8; page_size as usize];
            file.write_page(file.page_count() + 1, &filler)?;
        }
        file.write_page(pgno, bytes)?;
    }
    if file.page_count() > snapshot.db_size {
        file.truncate(snapshot.db_size)?;
    }
    file.flush()?;
    drop(file);
    std::fs::remove_file(wal_path(db_path))
        .map_err(|e| Error::io("delete wal after checkpoint", e))?;
    info!(
        "checkpoint applied {} page(s), database now {} page(s)",
        snapshot.committed_page_count(),
        snapshot.db_size
    );
    Ok(true)
}

// ============================================================================
// Tests
// ============================================================================

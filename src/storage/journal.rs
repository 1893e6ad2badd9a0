//! Rollback journal: pre-transaction page images plus recovery.
//!
//! Layout: a 16-byte header (8-byte magic `SHARC_RJ`, big-endian page size,
//! big-endian original page count) followed by frames of (big-endian page
//! number, full original page bytes). Only pages that existed in the base
//! file are journaled; pages appended by the transaction are undone by
//! truncating back to the recorded original page count during recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::types::Pgno;

use super::{read_u32, write_u32};

/// Journal file magic.
pub const JOURNAL_MAGIC: &[u8; 8] = b"SHARC_RJ";

/// Journal header size.
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// Path of the journal that belongs to a database file.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

/// Streams original page images into the journal file.
pub struct JournalWriter {
    file: File,
    path: PathBuf,
    page_size: u32,
    frames: u32,
}

impl JournalWriter {
    /// Create the journal and write its header. `original_page_count` is
    /// the base file's page count before the transaction touched anything.
    pub fn create(db_path: &Path, page_size: u32, original_page_count: Pgno) -> Result<Self> {
        let path = journal_path(db_path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(format!("create journal {}", path.display()), e))?;

        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        header[..8].copy_from_slice(JOURNAL_MAGIC);
        write_u32(&mut header, 8, page_size);
        write_u32(&mut header, 12, original_page_count);
        file.write_all(&header)
            .map_err(|e| Error::io("write journal header", e))?;

        Ok(JournalWriter {
            file,
            path,
            page_size,
            frames: 0,
        })
    }

    /// Append one frame holding the pre-transaction image of `pgno`.
    pub fn write_frame(&mut self, pgno: Pgno, original: &[u8]) -> Result<()> {
        debug_assert_eq!(original.len(), self.page_size as usize);
        self.file
            .write_all(&pgno.to_be_bytes())
            .map_err(|e| Error::io("write journal frame header", e))?;
        self.file
            .write_all(original)
            .map_err(|e| Error::io("write journal frame", e))?;
        self.frames += 1;
        Ok(())
    }

    /// Number of frames written.
    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    /// Make the journal durable before the base file is touched.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::io("fsync journal", e))
    }

    /// Commit finished: the journal is no longer needed.
    pub fn finalize(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)
            .map_err(|e| Error::io(format!("delete journal {}", self.path.display()), e))
    }
}

/// Roll a hot journal back into the database file, if one is present.
/// Returns true when a recovery was performed.
///
/// A journal too short to hold its header is discarded without touching
/// the database: the crash happened before anything was applied. Frames
/// are replayed up to the first truncated one.
pub fn recover(db_path: &Path) -> Result<bool> {
    let jpath = journal_path(db_path);
    let mut journal = match File::open(&jpath) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io(format!("open journal {}", jpath.display()), e)),
    };

    let mut header = [0u8; JOURNAL_HEADER_SIZE];
    let mut read = 0;
    loop {
        match journal.read(&mut header[read..]) {
            Ok(0) => break,
            Ok(n) => {
                read += n;
                if read == JOURNAL_HEADER_SIZE {
                    break;
                }
            }
            Err(e) => return Err(Error::io("read journal header", e)),
        }
    }
    if read < JOURNAL_HEADER_SIZE || &header[..8] != JOURNAL_MAGIC {
        warn!(
            "discarding unusable journal {} ({} header bytes)",
            jpath.display(),
            read
        );
        drop(journal);
        std::fs::remove_file(&jpath).map_err(|e| Error::io("delete unusable journal", e))?;
        return Ok(false);
    }

    let page_size = read_u32(&header, 8).unwrap();
    let original_page_count = read_u32(&header, 12).unwrap();
    if page_size < 512 || !page_size.is_power_of_two() {
        return Err(Error::corrupt("journal header declares invalid page size"));
    }

    let mut db = OpenOptions::new()
        .read(true)
        .write(true)
        .open(db_path)
        .map_err(|e| Error::io(format!("open database {}", db_path.display()), e))?;

    let mut frame = vec![0u8; 4 + page_size as usize];
    let mut restored = 0u32;
    loop {
        let mut filled = 0;
        while filled < frame.len() {
            match journal.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(Error::io("read journal frame", e)),
            }
        }
        if filled == 0 {
            break;
        }
        if filled < frame.len() {
            // Crash mid-frame: everything before it is intact.
            warn!("journal ends with a truncated frame; stopping replay");
            break;
        }
        let pgno = read_u32(&frame, 0).unwrap();
        if pgno == 0 || pgno > original_page_count {
            return Err(Error::corrupt("journal frame for out-of-range page"));
        }
        db.seek(SeekFrom::Start((pgno as u64 - 1) * page_size as u64))
            .map_err(|e| Error::io("seek during journal replay", e))?;
        db.write_all(&frame[4..])
            .map_err(|e| Error::io("restore journal frame", e))?;
        restored += 1;
    }

    db.set_len(original_page_count as u64 * page_size as u64)
        .map_err(|e| Error::io("truncate during journal replay", e))?;
    db.sync_all()
        .map_err(|e| Error::io("fsync after journal replay", e))?;
    drop(db);
    std::fs::remove_file(&jpath).map_err(|e| Error::io("delete journal after replay", e))?;

    info!(
        "journal recovery restored {} page(s), truncated to {} page(s)",
        restored, original_page_count
    );
    Ok(true)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 512;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE as usize]
    }

    fn write_db(path: &Path, pages: &[Vec<u8>]) {
        let mut image = Vec::new();
        for p in pages {
            image.extend_from_slice(p);
        }
        std::fs::write(path, image).unwrap();
    }

    #[test]
    fn test_recover_restores_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        write_db(&db, &[page_of(1), page_of(2)]);

        // Journal the originals, then simulate a half-applied transaction
        // that rewrote page 2 and appended page 3.
        let mut journal = JournalWriter::create(&db, PAGE, 2).unwrap();
        journal.write_frame(2, &page_of(2)).unwrap();
        journal.sync().unwrap();
        write_db(&db, &[page_of(1), page_of(0xEE), page_of(0xFF)]);

        assert!(recover(&db).unwrap());

        let image = std::fs::read(&db).unwrap();
        assert_eq!(image.len(), 2 * PAGE as usize, "appended page truncated");
        assert_eq!(image[PAGE as usize], 2, "page 2 restored");
        assert!(!journal_path(&db).exists());
    }

    #[test]
    fn test_recover_without_journal_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        write_db(&db, &[page_of(1)]);
        assert!(!recover(&db).unwrap());
        assert_eq!(std::fs::read(&db).unwrap()[0], 1);
    }

    #[test]
    fn test_short_journal_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        write_db(&db, &[page_of(1)]);
        std::fs::write(journal_path(&db), b"SHARC").unwrap();

        assert!(!recover(&db).unwrap());
        assert!(!journal_path(&db).exists());
        assert_eq!(std::fs::read(&db).unwrap()[0], 1);
    }

    #[test]
    fn test_truncated_frame_replays_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        write_db(&db, &[page_of(1), page_of(2)]);

        let mut journal = JournalWriter::create(&db, PAGE, 2).unwrap();
        journal.write_frame(1, &page_of(1)).unwrap();
        journal.sync().unwrap();
        // Append a torn frame by hand.
        let jp = journal_path(&db);
        drop(journal);
        let mut f = OpenOptions::new().append(true).open(&jp).unwrap();
        f.write_all(&2u32.to_be_bytes()).unwrap();
        f.write_all(&[0u8; 10]).unwrap();
        drop(f);

        write_db(&db, &[page_of(0xAA), page_of(0xBB)]);
        assert!(recover(&db).unwrap());
        let image = std::fs::read(&db).unwrap();
        assert_eq!(image[0], 1, "complete frame replayed");
        assert_eq!(image[PAGE as usize], 0xBB, "torn frame ignored");
    }
}

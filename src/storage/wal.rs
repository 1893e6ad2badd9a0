//! Write-ahead log: frame codec, writer, reader, and the overlay source.
//!
//! The WAL is SQLite's frame layout: a 32-byte header carrying salts and a
//! seed checksum over its first 24 bytes, then frames of a 24-byte header
//! plus one page image. Checksums are cumulative from the header seed; a
//! frame is valid only when its salts match the header and its running
//! checksum matches. Frames after the last valid commit frame are ignored;
//! later committed versions of a page shadow earlier ones.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::source::{PageRef, PageSource};
use super::{read_u32, write_u32};

/// Magic for little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;

/// Magic for big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;

/// WAL format version.
pub const WAL_VERSION: u32 = 3_007_000;

/// WAL file header size.
pub const WAL_HEADER_SIZE: usize = 32;

/// Per-frame header size.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Path of the WAL that belongs to a database file.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}

/// Salt pair for a fresh WAL, seeded from the wall clock.
pub fn generate_salts() -> (u32, u32) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    ((nanos & 0xFFFF_FFFF) as u32, ((nanos >> 17) & 0xFFFF_FFFF) as u32)
}

/// Cumulative WAL checksum over 8-byte chunks.
///
/// Word endianness is selected by the header magic; the running pair
/// `(s1, s2)` threads from the header seed through every valid frame.
pub fn wal_checksum(big_endian: bool, data: &[u8], init1: u32, init2: u32) -> (u32, u32) {
    let mut s1 = init1;
    let mut s2 = init2;
    for chunk in data.chunks_exact(8) {
        let (w1, w2) = if big_endian {
            (
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        } else {
            (
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        };
        s1 = s1.wrapping_add(w1).wrapping_add(s2);
        s2 = s2.wrapping_add(w2).wrapping_add(s1);
    }
    (s1, s2)
}

// ============================================================================
// Header and Frame Codec
// ============================================================================

/// Parsed 32-byte WAL header.
#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    /// Magic selecting checksum endianness
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Database page size
    pub page_size: u32,
    /// Checkpoint sequence number
    pub checkpoint_seq: u32,
    /// Salt 1, bumped per checkpoint
    pub salt1: u32,
    /// Salt 2, random per checkpoint
    pub salt2: u32,
    /// Seed checksum over bytes 0..24
    pub checksum1: u32,
    /// Seed checksum over bytes 0..24
    pub checksum2: u32,
}

impl WalHeader {
    /// Fresh header with the native (little-endian word) magic.
    pub fn new(page_size: u32, checkpoint_seq: u32, salt1: u32, salt2: u32) -> Self {
        let mut hdr = WalHeader {
            magic: WAL_MAGIC_LE,
            version: WAL_VERSION,
            page_size,
            checkpoint_seq,
            salt1,
            salt2,
            checksum1: 0,
            checksum2: 0,
        };
        let bytes = hdr.to_bytes();
        let (c1, c2) = wal_checksum(hdr.big_endian_checksums(), &bytes[..24], 0, 0);
        hdr.checksum1 = c1;
        hdr.checksum2 = c2;
        hdr
    }

    /// True when the magic selects big-endian checksum words.
    pub fn big_endian_checksums(&self) -> bool {
        self.magic == WAL_MAGIC_BE
    }

    /// Encode; header fields themselves are big-endian on disk.
    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        write_u32(&mut buf, 0, self.magic);
        write_u32(&mut buf, 4, self.version);
        write_u32(&mut buf, 8, self.page_size);
        write_u32(&mut buf, 12, self.checkpoint_seq);
        write_u32(&mut buf, 16, self.salt1);
        write_u32(&mut buf, 20, self.salt2);
        write_u32(&mut buf, 24, self.checksum1);
        write_u32(&mut buf, 28, self.checksum2);
        buf
    }

    /// Decode and validate magic plus seed checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_HEADER_SIZE {
            return Err(Error::corrupt("wal shorter than its header"));
        }
        let magic = read_u32(data, 0).unwrap();
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(Error::new(ErrorCode::NotADb));
        }
        let hdr = WalHeader {
            magic,
            version: read_u32(data, 4).unwrap(),
            page_size: read_u32(data, 8).unwrap(),
            checkpoint_seq: read_u32(data, 12).unwrap(),
            salt1: read_u32(data, 16).unwrap(),
            salt2: read_u32(data, 20).unwrap(),
            checksum1: read_u32(data, 24).unwrap(),
            checksum2: read_u32(data, 28).unwrap(),
        };
        let (c1, c2) = wal_checksum(hdr.big_endian_checksums(), &data[..24], 0, 0);
        if c1 != hdr.checksum1 || c2 != hdr.checksum2 {
            return Err(Error::corrupt("wal header checksum mismatch"));
        }
        Ok(hdr)
    }
}

/// Parsed 24-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct WalFrameHeader {
    /// Page this frame carries
    pub pgno: Pgno,
    /// Database size in pages after commit; nonzero marks a commit frame
    pub db_size_after_commit: Pgno,
    /// Salt 1 (must match the WAL header)
    pub salt1: u32,
    /// Salt 2 (must match the WAL header)
    pub salt2: u32,
    /// Cumulative checksum through this frame
    pub checksum1: u32,
    /// Cumulative checksum through this frame
    pub checksum2: u32,
}

impl WalFrameHeader {
    /// True when this frame commits a transaction.
    pub fn is_commit(&self) -> bool {
        self.db_size_after_commit != 0
    }

    /// Encode.
    pub fn to_bytes(&self) -> [u8; WAL_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; WAL_FRAME_HEADER_SIZE];
        write_u32(&mut buf, 0, self.pgno);
        write_u32(&mut buf, 4, self.db_size_after_commit);
        write_u32(&mut buf, 8, self.salt1);
        write_u32(&mut buf, 12, self.salt2);
        write_u32(&mut buf, 16, self.checksum1);
        write_u32(&mut buf, 20, self.checksum2);
        buf
    }

    /// Decode.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_FRAME_HEADER_SIZE {
            return Err(Error::corrupt("wal frame header truncated"));
        }
        Ok(WalFrameHeader {
            pgno: read_u32(data, 0).unwrap(),
            db_size_after_commit: read_u32(data, 4).unwrap(),
            salt1: read_u32(data, 8).unwrap(),
            salt2: read_u32(data, 12).unwrap(),
            checksum1: read_u32(data, 16).unwrap(),
            checksum2: read_u32(data, 20).unwrap(),
        })
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Appends checksummed frames to a WAL file.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    header: WalHeader,
    s1: u32,
    s2: u32,
    frames: u32,
}

impl WalWriter {
    /// Create (or truncate) the WAL for `db_path` and write its header.
    pub fn create(
        db_path: &Path,
        page_size: u32,
        checkpoint_seq: u32,
        salt1: u32,
        salt2: u32,
    ) -> Result<Self> {
        let path = wal_path(db_path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(format!("create wal {}", path.display()), e))?;
        let header = WalHeader::new(page_size, checkpoint_seq, salt1, salt2);
        file.write_all(&header.to_bytes())
            .map_err(|e| Error::io("write wal header", e))?;
        Ok(WalWriter {
            file,
            path,
            s1: header.checksum1,
            s2: header.checksum2,
            header,
            frames: 0,
        })
    }

    /// Append one frame. `db_size_after_commit` is nonzero only on the
    /// transaction's final frame.
    pub fn append_frame(
        &mut self,
        pgno: Pgno,
        page: &[u8],
        db_size_after_commit: Pgno,
    ) -> Result<()> {
        debug_assert_eq!(page.len(), self.header.page_size as usize);
        let mut frame = WalFrameHeader {
            pgno,
            db_size_after_commit,
            salt1: self.header.salt1,
            salt2: self.header.salt2,
            checksum1: 0,
            checksum2: 0,
        };
        let be = self.header.big_endian_checksums();
        let head = frame.to_bytes();
        let (s1, s2) = wal_checksum(be, &head[..8], self.s1, self.s2);
        let (s1, s2) = wal_checksum(be, page, s1, s2);
        frame.checksum1 = s1;
        frame.checksum2 = s2;
        self.s1 = s1;
        self.s2 = s2;

        self.file
            .write_all(&frame.to_bytes())
            .map_err(|e| Error::io("write wal frame header", e))?;
        self.file
            .write_all(page)
            .map_err(|e| Error::io("write wal frame", e))?;
        self.frames += 1;
        Ok(())
    }

    /// Continue an existing WAL, appending after its last valid frame, or
    /// start a fresh one when none (or an unusable one) is present. The
    /// running checksum resumes from the last valid frame; a torn tail is
    /// truncated away.
    pub fn open_for_append(db_path: &Path, page_size: u32) -> Result<Self> {
        let path = wal_path(db_path);
        let buffer = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::io(format!("read wal {}", path.display()), e)),
        };

        let header = match WalHeader::from_bytes(&buffer) {
            Ok(h) if h.page_size == page_size => h,
            _ => {
                let (salt1, salt2) = generate_salts();
                return Self::create(db_path, page_size, 1, salt1, salt2);
            }
        };

        // Walk valid frames to find the append point and running checksum.
        let be = header.big_endian_checksums();
        let frame_len = WAL_FRAME_HEADER_SIZE + page_size as usize;
        let mut s1 = header.checksum1;
        let mut s2 = header.checksum2;
        let mut end = WAL_HEADER_SIZE;
        let mut frames = 0u32;
        while end + frame_len <= buffer.len() {
            let frame = WalFrameHeader::from_bytes(&buffer[end..])?;
            if frame.salt1 != header.salt1 || frame.salt2 != header.salt2 {
                break;
            }
            let page_at = end + WAL_FRAME_HEADER_SIZE;
            let (c1, c2) = wal_checksum(be, &buffer[end..end + 8], s1, s2);
            let (c1, c2) =
                wal_checksum(be, &buffer[page_at..page_at + page_size as usize], c1, c2);
            if c1 != frame.checksum1 || c2 != frame.checksum2 {
                break;
            }
            s1 = c1;
            s2 = c2;
            end += frame_len;
            frames += 1;
        }

        use std::io::Seek;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(format!("open wal {}", path.display()), e))?;
        file.set_len(end as u64)
            .map_err(|e| Error::io("truncate torn wal tail", e))?;
        file.seek(std::io::SeekFrom::End(0))
            .map_err(|e| Error::io("seek wal end", e))?;

        Ok(WalWriter {
            file,
            path,
            header,
            s1,
            s2,
            frames,
        })
    }

    /// Frames appended so far.
    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    /// Make appended frames durable.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("fsync wal", e))
    }

    /// Path of the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Committed view of a WAL file: page number to byte offset of the latest
/// committed image inside the buffer.
pub struct WalSnapshot {
    buffer: Arc<[u8]>,
    frames: HashMap<Pgno, usize>,
    page_size: u32,
    /// Database size after the last valid commit frame
    pub db_size: Pgno,
    /// Header of the WAL the snapshot came from
    pub header: WalHeader,
}

impl WalSnapshot {
    /// Parse a WAL image. Walks frames in order, stopping at the first
    /// salt or checksum mismatch, and keeps only frames covered by a
    /// commit frame.
    pub fn parse(buffer: Vec<u8>, expected_page_size: u32) -> Result<Self> {
        let header = WalHeader::from_bytes(&buffer)?;
        if header.page_size != expected_page_size {
            return Err(Error::corrupt(format!(
                "wal page size {} does not match database {}",
                header.page_size, expected_page_size
            )));
        }
        let be = header.big_endian_checksums();
        let frame_len = WAL_FRAME_HEADER_SIZE + header.page_size as usize;

        let mut committed: HashMap<Pgno, usize> = HashMap::new();
        let mut pending: Vec<(Pgno, usize)> = Vec::new();
        let mut db_size: Pgno = 0;
        let mut s1 = header.checksum1;
        let mut s2 = header.checksum2;

        let mut at = WAL_HEADER_SIZE;
        while at + frame_len <= buffer.len() {
            let frame = WalFrameHeader::from_bytes(&buffer[at..])?;
            if frame.salt1 != header.salt1 || frame.salt2 != header.salt2 {
                debug!("wal frame at {} has stale salts; stopping", at);
                break;
            }
            let page_at = at + WAL_FRAME_HEADER_SIZE;
            let (c1, c2) = wal_checksum(be, &buffer[at..at + 8], s1, s2);
            let (c1, c2) = wal_checksum(be, &buffer[page_at..page_at + header.page_size as usize], c1, c2);
            if c1 != frame.checksum1 || c2 != frame.checksum2 {
                warn!("wal frame at {} fails its checksum; stopping", at);
                break;
            }
            s1 = c1;
            s2 = c2;

            pending.push((frame.pgno, page_at));
            if frame.is_commit() {
                for (pgno, offset) in pending.drain(..) {
                    committed.insert(pgno, offset);
                }
                db_size = frame.db_size_after_commit;
            }
            at += frame_len;
        }
        if !pending.is_empty() {
            debug!("discarding {} uncommitted trailing wal frame(s)", pending.len());
        }

        Ok(WalSnapshot {
            buffer: buffer.into(),
            frames: committed,
            page_size: header.page_size,
            db_size,
            header,
        })
    }

    /// Read and parse the WAL that belongs to `db_path`. `Ok(None)` when
    /// no WAL file exists.
    pub fn load(db_path: &Path, expected_page_size: u32) -> Result<Option<Self>> {
        let path = wal_path(db_path);
        let buffer = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("read wal {}", path.display()), e)),
        };
        if buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::parse(buffer, expected_page_size)?))
    }

    /// True when no committed frame is present.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of distinct committed pages.
    pub fn committed_page_count(&self) -> usize {
        self.frames.len()
    }

    /// Latest committed image of `pgno`, if the WAL holds one.
    pub fn page(&self, pgno: Pgno) -> Option<&[u8]> {
        self.frames
            .get(&pgno)
            .map(|&off| &self.buffer[off..off + self.page_size as usize])
    }

    /// Committed page numbers in ascending order (checkpointing).
    pub fn committed_pages(&self) -> Vec<Pgno> {
        let mut pages: Vec<Pgno> = self.frames.keys().copied().collect();
        pages.sort_unstable();
        pages
    }
}

// ============================================================================
// Overlay Source
// ============================================================================

/// Immutable snapshot source: reads prefer the WAL's committed frames and
/// fall through to the inner source.
pub struct WalPageSource<S> {
    inner: S,
    snapshot: WalSnapshot,
    disposed: bool,
}

impl<S: PageSource> WalPageSource<S> {
    /// Overlay `snapshot` on `inner`.
    pub fn new(inner: S, snapshot: WalSnapshot) -> Self {
        WalPageSource {
            inner,
            snapshot,
            disposed: false,
        }
    }

    /// The overlay's snapshot.
    pub fn snapshot(&self) -> &WalSnapshot {
        &self.snapshot
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: PageSource> PageSource for WalPageSource<S> {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn page_count(&self) -> Pgno {
        // The WAL's committed size supersedes the base file's length.
        if self.snapshot.db_size != 0 {
            self.snapshot.db_size
        } else {
            self.inner.page_count()
        }
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        if self.disposed {
            return Err(Error::disposed("wal page source"));
        }
        if pgno == 0 || pgno > self.page_count() {
            return Err(Error::range(format!(
                "page {} out of range 1..={}",
                pgno,
                self.page_count()
            )));
        }
        if let Some(bytes) = self.snapshot.page(pgno) {
            return Ok(PageRef::Slice(bytes));
        }
        self.inner.get_page(pgno)
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.inner.dispose();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::source::{HeapPageSource, MemoryPageSource};

    const PAGE: u32 = 512;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE as usize]
    }

    fn write_wal(db: &Path, frames: &[(Pgno, u8, Pgno)]) -> Vec<u8> {
        let mut writer = WalWriter::create(db, PAGE, 1, 0x1111, 0x2222).unwrap();
        for &(pgno, fill, commit) in frames {
            writer.append_frame(pgno, &page_of(fill), commit).unwrap();
        }
        writer.sync().unwrap();
        std::fs::read(wal_path(db)).unwrap()
    }

    #[test]
    fn test_header_roundtrip_and_checksum() {
        let hdr = WalHeader::new(PAGE, 3, 7, 9);
        let parsed = WalHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed.page_size, PAGE);
        assert_eq!(parsed.checkpoint_seq, 3);
        assert_eq!(parsed.salt1, 7);

        let mut corrupted = hdr.to_bytes();
        corrupted[16] ^= 0xFF;
        assert!(WalHeader::from_bytes(&corrupted).is_err());
    }

    #[test]
    fn test_committed_frames_promote() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("w.db");
        std::fs::write(&db, page_of(0)).unwrap();

        // Txn 1 commits pages 1 and 2; txn 2 rewrites page 2.
        let wal = write_wal(
            &db,
            &[(1, 0xA1, 0), (2, 0xA2, 2), (2, 0xB2, 2)],
        );
        let snap = WalSnapshot::parse(wal, PAGE).unwrap();
        assert_eq!(snap.committed_page_count(), 2);
        assert_eq!(snap.page(1).unwrap()[0], 0xA1);
        assert_eq!(snap.page(2).unwrap()[0], 0xB2, "later commit wins");
        assert_eq!(snap.db_size, 2);
    }

    #[test]
    fn test_trailing_uncommitted_frames_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("w.db");
        let wal = write_wal(&db, &[(1, 0xA1, 1), (2, 0xCC, 0)]);
        let snap = WalSnapshot::parse(wal, PAGE).unwrap();
        assert_eq!(snap.committed_page_count(), 1);
        assert!(snap.page(2).is_none());
    }

    #[test]
    fn test_corrupt_frame_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("w.db");
        let mut wal = write_wal(&db, &[(1, 0xA1, 1), (2, 0xA2, 2)]);
        // Flip a byte inside the second frame's page image.
        let second_page = WAL_HEADER_SIZE + (WAL_FRAME_HEADER_SIZE + PAGE as usize) + WAL_FRAME_HEADER_SIZE + 10;
        wal[second_page] ^= 0xFF;

        let snap = WalSnapshot::parse(wal, PAGE).unwrap();
        assert_eq!(snap.committed_page_count(), 1, "replay stops at bad frame");
        assert_eq!(snap.db_size, 1);
    }

    #[test]
    fn test_salt_mismatch_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("w.db");
        let mut wal = write_wal(&db, &[(1, 0xA1, 1), (2, 0xA2, 2)]);
        // Stale salt on the second frame.
        let frame2 = WAL_HEADER_SIZE + WAL_FRAME_HEADER_SIZE + PAGE as usize;
        wal[frame2 + 8..frame2 + 12].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());

        let snap = WalSnapshot::parse(wal, PAGE).unwrap();
        assert_eq!(snap.committed_page_count(), 1);
    }

    #[test]
    fn test_overlay_prefers_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("w.db");
        let wal = write_wal(&db, &[(2, 0xEE, 3)]);
        let snap = WalSnapshot::parse(wal, PAGE).unwrap();

        let mut image = Vec::new();
        image.extend_from_slice(&page_of(1));
        image.extend_from_slice(&page_of(2));
        let base = MemoryPageSource::new(image, PAGE).unwrap();

        let overlay = WalPageSource::new(base, snap);
        assert_eq!(overlay.page_count(), 3, "wal commit grew the database");
        assert_eq!(overlay.get_page(1).unwrap()[0], 1);
        assert_eq!(overlay.get_page(2).unwrap()[0], 0xEE);
    }

    #[test]
    fn test_writer_reader_roundtrip_via_heap_apply() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("w.db");
        let wal = write_wal(&db, &[(1, 0x11, 0), (2, 0x22, 2)]);
        let snap = WalSnapshot::parse(wal, PAGE).unwrap();

        // Checkpoint into a heap sink.
        let mut sink = HeapPageSource::new(PAGE);
        for pgno in snap.committed_pages() {
            use crate::storage::source::WritablePageSource;
            sink.write_page(pgno, snap.page(pgno).unwrap()).unwrap();
        }
        assert_eq!(sink.page_count(), 2);
        assert_eq!(sink.get_page(1).unwrap()[0], 0x11);
    }
}

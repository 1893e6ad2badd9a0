//! The 100-byte database header at the start of page 1.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::{read_u16, read_u32, write_u16, write_u32};

/// File magic: the first 16 bytes of every database file.
pub const FILE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the database header.
pub const HEADER_SIZE: usize = 100;

/// Smallest legal page size.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest legal page size. Stored in the header as the magic value 1.
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default page size for newly created databases.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Journal mode declared by the header's read/write version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Rollback-journal mode (version byte 1)
    Rollback,
    /// Write-ahead-log mode (version byte 2)
    Wal,
}

/// Parsed database header.
#[derive(Debug, Clone)]
pub struct DbHeader {
    /// Page size in bytes (power of two in 512..=65536)
    pub page_size: u32,
    /// Reserved bytes at the end of every page
    pub reserved: u8,
    /// Journal mode declared by the write-version byte
    pub write_format: FileFormat,
    /// Journal mode declared by the read-version byte
    pub read_format: FileFormat,
    /// File change counter, bumped on every committed write
    pub change_counter: u32,
    /// Database size in pages
    pub page_count: Pgno,
    /// First freelist trunk page (0 when the freelist is empty)
    pub freelist_head: Pgno,
    /// Total freelist pages
    pub freelist_count: u32,
    /// Schema cookie, bumped on every schema change
    pub schema_cookie: u32,
    /// Schema format number (1..=4)
    pub schema_format: u32,
    /// Text encoding (1 = UTF-8; the only encoding this engine writes)
    pub text_encoding: u32,
    /// User version
    pub user_version: u32,
    /// Application id
    pub application_id: u32,
}

impl DbHeader {
    /// Parse the header from the first page. Checks the magic and the
    /// page-size constraints.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupt("page 1 shorter than the database header"));
        }
        if &data[0..16] != FILE_MAGIC {
            return Err(Error::new(ErrorCode::NotADb));
        }

        let raw_page_size = read_u16(data, 16).unwrap() as u32;
        let page_size = if raw_page_size == 1 {
            MAX_PAGE_SIZE
        } else {
            raw_page_size
        };
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::corrupt(format!("invalid page size {}", page_size)));
        }

        let write_format = match data[18] {
            1 => FileFormat::Rollback,
            2 => FileFormat::Wal,
            v => return Err(Error::corrupt(format!("invalid write version {}", v))),
        };
        let read_format = match data[19] {
            1 => FileFormat::Rollback,
            2 => FileFormat::Wal,
            v => return Err(Error::corrupt(format!("invalid read version {}", v))),
        };

        Ok(DbHeader {
            page_size,
            reserved: data[20],
            write_format,
            read_format,
            change_counter: read_u32(data, 24).unwrap(),
            page_count: read_u32(data, 28).unwrap(),
            freelist_head: read_u32(data, 32).unwrap(),
            freelist_count: read_u32(data, 36).unwrap(),
            schema_cookie: read_u32(data, 40).unwrap(),
            schema_format: read_u32(data, 44).unwrap(),
            text_encoding: read_u32(data, 56).unwrap(),
            user_version: read_u32(data, 60).unwrap(),
            application_id: read_u32(data, 68).unwrap(),
        })
    }

    /// Usable bytes per page: page size minus the reserved region.
    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved as u32
    }

    /// Header for a freshly created database.
    pub fn new(page_size: u32, wal: bool) -> Self {
        let format = if wal {
            FileFormat::Wal
        } else {
            FileFormat::Rollback
        };
        DbHeader {
            page_size,
            reserved: 0,
            write_format: format,
            read_format: format,
            change_counter: 1,
            page_count: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 1,
            schema_format: 4,
            text_encoding: 1,
            user_version: 0,
            application_id: 0,
        }
    }

    /// Encode into the first 100 bytes of `page1`.
    ///
    /// The page-count field travels through here; callers on the write path
    /// must encode only as part of the commit step so journal recovery can
    /// rely on the pre-transaction count (see the journal module).
    pub fn encode(&self, page1: &mut [u8]) {
        assert!(page1.len() >= HEADER_SIZE);
        page1[0..16].copy_from_slice(FILE_MAGIC);
        let raw_page_size = if self.page_size == MAX_PAGE_SIZE {
            1u16
        } else {
            self.page_size as u16
        };
        write_u16(page1, 16, raw_page_size);
        page1[18] = match self.write_format {
            FileFormat::Rollback => 1,
            FileFormat::Wal => 2,
        };
        page1[19] = match self.read_format {
            FileFormat::Rollback => 1,
            FileFormat::Wal => 2,
        };
        page1[20] = self.reserved;
        // Embedded payload fractions are fixed by the format.
        page1[21] = 64;
        page1[22] = 32;
        page1[23] = 32;
        write_u32(page1, 24, self.change_counter);
        write_u32(page1, 28, self.page_count);
        write_u32(page1, 32, self.freelist_head);
        write_u32(page1, 36, self.freelist_count);
        write_u32(page1, 40, self.schema_cookie);
        write_u32(page1, 44, self.schema_format);
        write_u32(page1, 48, 0); // default cache size
        write_u32(page1, 52, 0); // largest root page (no autovacuum)
        write_u32(page1, 56, self.text_encoding);
        write_u32(page1, 60, self.user_version);
        write_u32(page1, 64, 0); // incremental vacuum
        write_u32(page1, 68, self.application_id);
        // 72..92 reserved, zero
        write_u32(page1, 92, self.change_counter); // version-valid-for
        write_u32(page1, 96, 3_045_001); // library version stamp
    }
}

// ============================================================================
// Tests
// ============================================================================

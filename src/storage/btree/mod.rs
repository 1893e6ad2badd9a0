//! B-tree page structure: page kinds, per-page headers, cell pointers,
//! and the local-payload/overflow thresholds.

use crate::error::{Error, Result};
use crate::types::Pgno;

use super::{read_u16, read_u32, write_u16, write_u32};

pub mod cursor;
pub mod insert;

/// Per-page header size for leaf pages.
pub const PAGE_HEADER_SIZE_LEAF: usize = 8;

/// Per-page header size for interior pages (adds the right-most child).
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;

/// Bytes per entry of the cell pointer array.
pub const CELL_PTR_SIZE: usize = 2;

/// Offset of the b-tree area on page 1, past the database header.
pub const PAGE1_HEADER_OFFSET: usize = 100;

/// The four b-tree page kinds, discriminated by the page's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// 0x02: index interior
    IndexInterior = 0x02,
    /// 0x05: table interior
    TableInterior = 0x05,
    /// 0x0A: index leaf
    IndexLeaf = 0x0A,
    /// 0x0D: table leaf
    TableLeaf = 0x0D,
}

impl PageKind {
    /// Decode the type byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x02 => Ok(PageKind::IndexInterior),
            0x05 => Ok(PageKind::TableInterior),
            0x0A => Ok(PageKind::IndexLeaf),
            0x0D => Ok(PageKind::TableLeaf),
            other => Err(Error::corrupt(format!("invalid page type 0x{:02X}", other))),
        }
    }

    /// True for the two leaf kinds.
    pub fn is_leaf(&self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::IndexLeaf)
    }

    /// True for the two table kinds.
    pub fn is_table(&self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::TableInterior)
    }

    /// Per-page header size for this kind.
    pub fn header_size(&self) -> usize {
        if self.is_leaf() {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        }
    }
}

/// Parsed per-page header.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Page kind
    pub kind: PageKind,
    /// Offset of the first freeblock (0 when none)
    pub first_freeblock: u16,
    /// Number of cells on the page
    pub cell_count: u16,
    /// Start of the cell content area; stored 0 means 65536
    pub content_start: u32,
    /// Fragmented free bytes within the content area
    pub frag_free: u8,
    /// Right-most child pointer (interior pages only)
    pub right_child: Option<Pgno>,
}

impl PageHeader {
    /// Parse the header at `hdr_offset` (100 on page 1, 0 elsewhere).
    pub fn parse(page: &[u8], hdr_offset: usize) -> Result<Self> {
        if hdr_offset + PAGE_HEADER_SIZE_LEAF > page.len() {
            return Err(Error::corrupt("page too small for b-tree header"));
        }
        let kind = PageKind::from_byte(page[hdr_offset])?;
        if !kind.is_leaf() && hdr_offset + PAGE_HEADER_SIZE_INTERIOR > page.len() {
            return Err(Error::corrupt("page too small for interior header"));
        }

        let raw_content = read_u16(page, hdr_offset + 5).unwrap() as u32;
        let content_start = if raw_content == 0 { 65536 } else { raw_content };

        Ok(PageHeader {
            kind,
            first_freeblock: read_u16(page, hdr_offset + 1).unwrap(),
            cell_count: read_u16(page, hdr_offset + 3).unwrap(),
            content_start,
            frag_free: page[hdr_offset + 7],
            right_child: if kind.is_leaf() {
                None
            } else {
                Some(read_u32(page, hdr_offset + 8).unwrap())
            },
        })
    }

    /// Encode the header back at `hdr_offset`.
    pub fn encode(&self, page: &mut [u8], hdr_offset: usize) {
        page[hdr_offset] = self.kind as u8;
        write_u16(page, hdr_offset + 1, self.first_freeblock);
        write_u16(page, hdr_offset + 3, self.cell_count);
        let raw_content = if self.content_start == 65536 {
            0
        } else {
            self.content_start as u16
        };
        write_u16(page, hdr_offset + 5, raw_content);
        page[hdr_offset + 7] = self.frag_free;
        if let Some(right) = self.right_child {
            write_u32(page, hdr_offset + 8, right);
        }
    }
}

/// Header offset for a page: only page 1 carries the database header.
pub fn header_offset(pgno: Pgno) -> usize {
    if pgno == 1 {
        PAGE1_HEADER_OFFSET
    } else {
        0
    }
}

/// Read the `idx`-th cell pointer; bounds-checks against the page.
pub fn cell_pointer(page: &[u8], hdr_offset: usize, kind: PageKind, idx: u16) -> Result<usize> {
    let ptr_offset = hdr_offset + kind.header_size() + idx as usize * CELL_PTR_SIZE;
    let ptr = read_u16(page, ptr_offset)
        .ok_or_else(|| Error::corrupt("cell pointer array past end of page"))? as usize;
    if ptr >= page.len() {
        return Err(Error::corrupt(format!("cell pointer {} out of page", ptr)));
    }
    Ok(ptr)
}

/// Payload-threshold arithmetic derived from the usable page size.
#[derive(Debug, Clone, Copy)]
pub struct PageGeometry {
    /// Usable bytes per page (page size minus reserved region)
    pub usable: u32,
}

impl PageGeometry {
    /// Geometry for the given usable size.
    pub fn new(usable: u32) -> Self {
        PageGeometry { usable }
    }

    /// Largest payload stored fully in-page for this kind.
    pub fn max_local(&self, kind: PageKind) -> u32 {
        if kind.is_table() {
            self.usable - 35
        } else {
            (self.usable - 12) * 64 / 255 - 23
        }
    }

    /// Smallest local prefix of an overflowing payload.
    pub fn min_local(&self) -> u32 {
        (self.usable - 12) * 32 / 255 - 23
    }

    /// Split `payload_len` into the locally stored prefix length; the
    /// remainder walks the overflow chain. Returns (local_len, overflows).
    pub fn local_payload(&self, kind: PageKind, payload_len: usize) -> (usize, bool) {
        let x = self.max_local(kind) as usize;
        if payload_len <= x {
            return (payload_len, false);
        }
        let m = self.min_local() as usize;
        let k = m + (payload_len - m) % (self.usable as usize - 4);
        if k <= x {
            (k, true)
        } else {
            (m, true)
        }
    }

    /// Usable data bytes per overflow page (4 bytes go to the next pointer).
    pub fn overflow_capacity(&self) -> usize {
        self.usable as usize - 4
    }
}

/// Initialize `page` as an empty b-tree page of `kind`. The cell content
/// area starts empty at the usable end.
pub fn init_page(page: &mut [u8], hdr_offset: usize, kind: PageKind, usable: u32) {
    page[hdr_offset..].iter_mut().for_each(|b| *b = 0);
    PageHeader {
        kind,
        first_freeblock: 0,
        cell_count: 0,
        content_start: usable,
        frag_free: 0,
        right_child: if kind.is_leaf() { None } else { Some(0) },
    }
    .encode(page, hdr_offset);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_kind_decode() {
        assert_eq!(PageKind::from_byte(0x0D).unwrap(), PageKind::TableLeaf);
        assert_eq!(PageKind::from_byte(0x05).unwrap(), PageKind::TableInterior);
        assert_eq!(PageKind::from_byte(0x0A).unwrap(), PageKind::IndexLeaf);
        assert_eq!(PageKind::from_byte(0x02).unwrap(), PageKind::IndexInterior);
        assert!(PageKind::from_byte(0x00).is_err());
        assert!(PageKind::from_byte(0x0C).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let mut page = vec![0u8; 512];
        let hdr = PageHeader {
            kind: PageKind::TableInterior,
            first_freeblock: 0,
            cell_count: 3,
            content_start: 400,
            frag_free: 2,
            right_child: Some(77),
        };
        hdr.encode(&mut page, 0);
        let parsed = PageHeader::parse(&page, 0).unwrap();
        assert_eq!(parsed.kind, PageKind::TableInterior);
        assert_eq!(parsed.cell_count, 3);
        assert_eq!(parsed.content_start, 400);
        assert_eq!(parsed.right_child, Some(77));
    }

    #[test]
    fn test_content_start_zero_means_64k() {
        let mut page = vec![0u8; 512];
        PageHeader {
            kind: PageKind::TableLeaf,
            first_freeblock: 0,
            cell_count: 0,
            content_start: 65536,
            frag_free: 0,
            right_child: None,
        }
        .encode(&mut page, 0);
        assert_eq!(PageHeader::parse(&page, 0).unwrap().content_start, 65536);
    }

    #[test]
    fn test_local_payload_thresholds() {
        let geom = PageGeometry::new(4096);
        // Fits locally.
        let (local, overflow) = geom.local_payload(PageKind::TableLeaf, 4061);
        assert_eq!(local, 4061);
        assert!(!overflow);
        // One byte over the threshold spills.
        let (local, overflow) = geom.local_payload(PageKind::TableLeaf, 4062);
        assert!(overflow);
        assert!(local >= geom.min_local() as usize);
        assert!(local <= geom.max_local(PageKind::TableLeaf) as usize);
        // Index pages spill much sooner.
        let (_, overflow) = geom.local_payload(PageKind::IndexLeaf, 2000);
        assert!(overflow);
    }

    #[test]
    fn test_init_page_is_empty_leaf() {
        let mut page = vec![0xFFu8; 512];
        init_page(&mut page, 0, PageKind::TableLeaf, 512);
        let hdr = PageHeader::parse(&page, 0).unwrap();
        assert_eq!(hdr.cell_count, 0);
        assert_eq!(hdr.content_start, 512);
        assert!(hdr.right_child.is_none());
    }
}

//! Read-only memory-mapped page source.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::{check_pgno, PageRef, PageSource};

/// Files larger than this are refused; the map must fit the addressable
/// span assumed by 32-bit page arithmetic.
pub const MAX_MAP_LEN: u64 = 2 * 1024 * 1024 * 1024;

/// Maps the database file read-only and serves true zero-copy slices valid
/// for the source's lifetime.
pub struct MmapPageSource {
    map: Option<Mmap>,
    page_size: u32,
    page_count: Pgno,
}

impl MmapPageSource {
    /// Map an existing file.
    pub fn open(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(format!("open {}", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("stat database file", e))?
            .len();
        if len > MAX_MAP_LEN {
            return Err(Error::with_message(
                ErrorCode::TooBig,
                format!("file is {} bytes, mmap cap is {}", len, MAX_MAP_LEN),
            ));
        }
        // Safety: the map is read-only and private to this source; writers
        // going through this engine re-base readers instead of mutating a
        // mapped file in place.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::io(format!("mmap {}", path.display()), e))?;
        Ok(MmapPageSource {
            page_count: (map.len() as u64 / page_size as u64) as Pgno,
            map: Some(map),
            page_size,
        })
    }

    fn map(&self) -> Result<&Mmap> {
        self.map
            .as_ref()
            .ok_or_else(|| Error::disposed("mmap page source"))
    }
}

impl PageSource for MmapPageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.page_count
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        let map = self.map()?;
        check_pgno(pgno, self.page_count)?;
        let start = (pgno as usize - 1) * self.page_size as usize;
        Ok(PageRef::Slice(&map[start..start + self.page_size as usize]))
    }

    fn dispose(&mut self) {
        self.map = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mmap_source_reads_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let mut f = File::create(&path).unwrap();
        let mut image = vec![0u8; 1024];
        image[0] = 0x11;
        image[512] = 0x22;
        f.write_all(&image).unwrap();
        f.sync_all().unwrap();

        let src = MmapPageSource::open(&path, 512).unwrap();
        assert_eq!(src.page_count(), 2);
        assert_eq!(src.get_page(1).unwrap()[0], 0x11);
        assert_eq!(src.get_page(2).unwrap()[0], 0x22);
        assert!(matches!(src.get_page(1).unwrap(), PageRef::Slice(_)));
    }

    #[test]
    fn test_mmap_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        let mut src = MmapPageSource::open(&path, 512).unwrap();
        src.dispose();
        assert_eq!(src.get_page(1).unwrap_err().code(), ErrorCode::Misuse);
    }
}

//! On-demand positional file I/O page source.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorCode, Result};
use crate::mem;
use crate::types::Pgno;

use super::{check_pgno, PageRef, PageSource, WritablePageSource};

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Page source reading (and optionally writing) a database file with
/// positional I/O. `get_page` serves pool-leased buffers: the bytes stay
/// valid for the life of the lease, then return to the pool.
pub struct FilePageSource {
    file: Option<File>,
    path: PathBuf,
    page_size: u32,
    page_count: Pgno,
    writable: bool,
    version: u64,
}

impl FilePageSource {
    /// Open an existing file. `page_size` normally comes from the parsed
    /// database header; the file length is rounded down to whole pages.
    pub fn open(path: impl AsRef<Path>, page_size: u32, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| Error::io(format!("open {}", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("stat database file", e))?
            .len();
        Ok(FilePageSource {
            file: Some(file),
            path,
            page_size,
            page_count: (len / page_size as u64) as Pgno,
            writable,
            version: 0,
        })
    }

    /// Create a new, empty file (truncating any existing one).
    pub fn create(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(format!("create {}", path.display()), e))?;
        Ok(FilePageSource {
            file: Some(file),
            path,
            page_size,
            page_count: 0,
            writable: true,
            version: 0,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate to `page_count` pages (journal recovery).
    pub fn truncate(&mut self, page_count: Pgno) -> Result<()> {
        let file = self.file()?;
        file.set_len(page_count as u64 * self.page_size as u64)
            .map_err(|e| Error::io("truncate database file", e))?;
        self.page_count = page_count;
        Ok(())
    }

    /// Re-read the file length (after an external append).
    pub fn refresh_page_count(&mut self) -> Result<()> {
        let file = self.file()?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("stat database file", e))?
            .len();
        self.page_count = (len / self.page_size as u64) as Pgno;
        Ok(())
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::disposed("file page source"))
    }

    fn page_offset(&self, pgno: Pgno) -> u64 {
        (pgno as u64 - 1) * self.page_size as u64
    }
}

impl PageSource for FilePageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.page_count
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        let mut buf = mem::lease(self.page_size as usize);
        self.read_page(pgno, &mut buf)?;
        Ok(PageRef::Pooled(buf))
    }

    fn read_page(&self, pgno: Pgno, dst: &mut [u8]) -> Result<()> {
        let file = self.file()?;
        check_pgno(pgno, self.page_count)?;
        if dst.len() != self.page_size as usize {
            return Err(Error::range("destination is not one page long"));
        }
        read_exact_at(file, dst, self.page_offset(pgno))
            .map_err(|e| Error::io(format!("read page {}", pgno), e))
    }

    fn data_version(&self) -> u64 {
        self.version
    }

    fn dispose(&mut self) {
        self.file = None;
    }
}

impl WritablePageSource for FilePageSource {
    fn write_page(&mut self, pgno: Pgno, src: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if src.len() != self.page_size as usize {
            return Err(Error::range("source is not one page long"));
        }
        if pgno == 0 || pgno > self.page_count + 1 {
            return Err(Error::range(format!(
                "page {} outside writable range 1..={}",
                pgno,
                self.page_count + 1
            )));
        }
        let offset = self.page_offset(pgno);
        let file = self.file()?;
        write_all_at(file, src, offset)
            .map_err(|e| Error::io(format!("write page {}", pgno), e))?;
        if pgno > self.page_count {
            self.page_count = pgno;
        }
        self.version += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?
            .sync_all()
            .map_err(|e| Error::io("fsync database file", e))
    }
}

// ============================================================================
// Tests
// ============================================================================

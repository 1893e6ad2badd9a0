//! Database façade: open/create, the page-source chain, schema access,
//! row readers, and write transactions.
//!
//! Chain construction on open: file (or mmap) base, optional cipher
//! wrapper, optional WAL overlay when committed frames exist, CLOCK cache
//! on top. Memory databases read straight from their heap image. One
//! handle per thread; readers and cursors borrow the handle and end their
//! borrows before a write transaction begins.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::mem;
use crate::schema::{SharcSchema, TableInfo};
use crate::storage::btree::cursor::{IndexCursor, TableCursor};
use crate::storage::btree::insert::{create_table_root, insert_row, max_rowid, PageWriter};
use crate::storage::btree::{header_offset, init_page, PageKind};
use crate::storage::header::{DbHeader, FileFormat, DEFAULT_PAGE_SIZE, HEADER_SIZE};
use crate::storage::pager::{checkpoint, PageManager};
use crate::storage::record::{self, RecordBuilder, ValueRef};
use crate::storage::source::{
    CacheConfig, CachedPageSource, FilePageSource, HeapPageSource, MmapPageSource, PageRef,
    PageSource, SharedBytes, WritablePageSource,
};
use crate::storage::wal::{wal_path, WalPageSource, WalSnapshot, WalWriter};
use crate::storage::journal;
use crate::types::{OpenFlags, Pgno, RowId, Value};

// ============================================================================
// Options and the cipher seam
// ============================================================================

/// Per-page cipher hook. The engine ships no cipher; implementations plug
/// in here and the chain applies them between the file and the cache.
pub trait PageCipher {
    /// Decrypt one page in place after it is read.
    fn decrypt_page(&self, pgno: Pgno, page: &mut [u8]) -> Result<()>;

    /// Encrypt one page in place before it is written.
    fn encrypt_page(&self, pgno: Pgno, page: &mut [u8]) -> Result<()>;

    /// Zeroize key material. Called on database disposal.
    fn destroy_key(&self);
}

/// Tuning for `Database::open`.
pub struct DatabaseOptions {
    /// Page cache tuning
    pub cache: CacheConfig,
    /// Map the file read-only instead of positional reads
    pub use_mmap: bool,
    /// Optional page cipher
    pub cipher: Option<Rc<dyn PageCipher>>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            cache: CacheConfig::default(),
            use_mmap: false,
            cipher: None,
        }
    }
}

/// Decrypting wrapper between the base source and the cache.
struct CipherPageSource<S> {
    inner: S,
    cipher: Rc<dyn PageCipher>,
}

impl<S: PageSource> PageSource for CipherPageSource<S> {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn page_count(&self) -> Pgno {
        self.inner.page_count()
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        let mut buf = mem::lease(self.inner.page_size() as usize);
        self.inner.read_page(pgno, &mut buf)?;
        self.cipher.decrypt_page(pgno, &mut buf)?;
        Ok(PageRef::Pooled(buf))
    }

    fn data_version(&self) -> u64 {
        self.inner.data_version()
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

// ============================================================================
// Database
// ============================================================================

/// An open database handle. Owns the page-source chain; not thread-safe.
pub struct Database {
    path: Option<PathBuf>,
    flags: OpenFlags,
    options: DatabaseOptions,
    header: DbHeader,
    chain: Option<Box<dyn PageSource>>,
    heap: Option<HeapPageSource>,
    schema_cache: RefCell<Option<(u32, Rc<SharcSchema>)>>,
}

impl Database {
    /// Open a database file. Hot-journal and WAL recovery run first when
    /// the handle is writable.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        Self::open_with(path, flags, DatabaseOptions::default())
    }

    /// Open with explicit options.
    pub fn open_with(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        options: DatabaseOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::with_message(
                ErrorCode::CantOpen,
                format!("{} does not exist", path.display()),
            ));
        }

        let writable = flags.contains(OpenFlags::READWRITE) || flags.contains(OpenFlags::CREATE);
        if writable {
            if journal::recover(&path)? {
                info!("rolled back a hot journal for {}", path.display());
            }
        }

        let header = read_header(&path)?;
        if writable {
            // Fold any committed WAL frames into the file so the session
            // starts from a checkpointed base.
            if checkpoint(&path, header.page_size)? {
                info!("checkpointed wal for {}", path.display());
            }
        }
        let header = read_header(&path)?;

        let mut db = Database {
            chain: None,
            heap: None,
            schema_cache: RefCell::new(None),
            path: Some(path),
            flags,
            options,
            header,
        };
        db.chain = Some(db.build_chain()?);
        Ok(db)
    }

    /// Open an in-memory database over an existing image.
    pub fn open_memory(image: Vec<u8>) -> Result<Self> {
        if image.len() < HEADER_SIZE {
            return Err(Error::new(ErrorCode::NotADb));
        }
        let header = DbHeader::parse(&image)?;
        let heap = HeapPageSource::from_vec(image, header.page_size);
        Ok(Database {
            path: None,
            flags: OpenFlags::READWRITE,
            options: DatabaseOptions::default(),
            header,
            chain: None,
            heap: Some(heap),
            schema_cache: RefCell::new(None),
        })
    }

    /// Create a new database file with an empty schema table.
    pub fn create(path: impl AsRef<Path>, wal: bool) -> Result<Self> {
        let path = path.as_ref();
        let image = fresh_image(DEFAULT_PAGE_SIZE, wal);
        std::fs::write(path, &image).map_err(|e| Error::io("write new database", e))?;
        Self::open(path, OpenFlags::READWRITE | if wal { OpenFlags::WAL } else { OpenFlags::empty() })
    }

    /// Create a new in-memory database with an empty schema table.
    pub fn create_memory() -> Result<Self> {
        Self::open_memory(fresh_image(DEFAULT_PAGE_SIZE, false))
    }

    /// Parsed database header (page size, counts, cookies).
    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    /// Usable bytes per page.
    pub fn usable_page_size(&self) -> u32 {
        self.header.usable_size()
    }

    /// Monotonic counter that advances with every committed write.
    pub fn data_version(&self) -> u64 {
        self.header.change_counter as u64
    }

    /// File path; None for memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The read source every cursor and reader goes through.
    pub fn reader_source(&self) -> Result<&dyn PageSource> {
        if let Some(chain) = &self.chain {
            return Ok(chain);
        }
        if let Some(heap) = &self.heap {
            return Ok(heap);
        }
        Err(Error::with_message(
            ErrorCode::Misuse,
            "database has no active source (failed commit or open transaction)",
        ))
    }

    /// Parsed schema, cached until the schema cookie changes.
    pub fn schema(&self) -> Result<Rc<SharcSchema>> {
        let cookie = self.header.schema_cookie;
        if let Some((cached_cookie, schema)) = self.schema_cache.borrow().as_ref() {
            if *cached_cookie == cookie {
                return Ok(schema.clone());
            }
        }
        let schema = Rc::new(SharcSchema::load(
            self.reader_source()?,
            self.usable_page_size(),
        )?);
        *self.schema_cache.borrow_mut() = Some((cookie, schema.clone()));
        Ok(schema)
    }

    /// Cursor over an arbitrary table b-tree root.
    pub fn create_cursor(&self, root: Pgno) -> Result<TableCursor<'_>> {
        Ok(TableCursor::new(
            self.reader_source()?,
            root,
            self.usable_page_size(),
        ))
    }

    /// Cursor over an arbitrary index b-tree root.
    pub fn create_index_cursor(&self, root: Pgno) -> Result<IndexCursor<'_>> {
        Ok(IndexCursor::new(
            self.reader_source()?,
            root,
            self.usable_page_size(),
        ))
    }

    /// Row reader over a named table, with optional column projection and
    /// row filters.
    pub fn create_reader(
        &self,
        table: &str,
        projection: Option<&[&str]>,
        filters: Vec<RowFilter>,
    ) -> Result<TableReader<'_>> {
        let schema = self.schema()?;
        let info = schema.require_table(table)?.clone();
        let projection = match projection {
            None => None,
            Some(names) => {
                let mut ordinals = Vec::with_capacity(names.len());
                for name in names {
                    let ordinal = info.column_ordinal(name).ok_or_else(|| {
                        Error::with_message(
                            ErrorCode::NotFound,
                            format!("no column '{}' in table '{}'", name, table),
                        )
                    })?;
                    ordinals.push(ordinal);
                }
                Some(ordinals)
            }
        };
        let mut resolved_filters = Vec::with_capacity(filters.len());
        for filter in filters {
            let ordinal = info.column_ordinal(&filter.column).ok_or_else(|| {
                Error::with_message(
                    ErrorCode::NotFound,
                    format!("no column '{}' in table '{}'", filter.column, table),
                )
            })?;
            resolved_filters.push((ordinal, filter));
        }
        Ok(TableReader {
            cursor: self.create_cursor(info.root_page)?,
            table: info,
            projection,
            filters: resolved_filters,
            serial_types: Vec::new(),
            offsets: Vec::new(),
            column_count: 0,
        })
    }

    /// Begin a write transaction. The read chain moves into the
    /// transaction; it comes back (or is rebuilt) on rollback/commit.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>> {
        if !self.flags.contains(OpenFlags::READWRITE) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if self.options.cipher.is_some() {
            // The cipher seam decrypts reads; an encrypting write path
            // needs the (external) cipher to cover commit and journal too.
            return Err(Error::with_message(
                ErrorCode::NotSupported,
                "write transactions on ciphered databases are not supported",
            ));
        }
        let base = if let Some(chain) = self.chain.take() {
            TxnBase::Chain(chain)
        } else if let Some(heap) = self.heap.take() {
            TxnBase::Heap(heap)
        } else {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "a transaction is already active",
            ));
        };
        let usable = self.header.usable_size();
        Ok(Transaction {
            mgr: Some(PageManager::new(base, usable)),
            db: self,
            root_cache: Vec::new(),
        })
    }

    /// Lightweight integrity walk: every table iterates fully with
    /// strictly ascending rowids. Returns human-readable findings; empty
    /// means no problems detected.
    pub fn quick_check(&self) -> Result<Vec<String>> {
        let schema = self.schema()?;
        let mut findings = Vec::new();
        for table in schema.tables() {
            let mut cursor = self.create_cursor(table.root_page)?;
            let mut last: Option<RowId> = None;
            loop {
                match cursor.move_next() {
                    Ok(true) => {
                        if let Some(prev) = last {
                            if cursor.rowid() <= prev {
                                findings.push(format!(
                                    "table '{}': rowid order violation at {}",
                                    table.name,
                                    cursor.rowid()
                                ));
                            }
                        }
                        // Payload access exercises overflow chains.
                        if let Err(e) = cursor.payload() {
                            findings.push(format!("table '{}': {}", table.name, e));
                            break;
                        }
                        last = Some(cursor.rowid());
                    }
                    Ok(false) => break,
                    Err(e) => {
                        findings.push(format!("table '{}': {}", table.name, e));
                        break;
                    }
                }
            }
        }
        Ok(findings)
    }

    /// Release every resource: cache buffers return to the pool, files
    /// close, maps unmap, cipher key material is zeroized.
    pub fn dispose(&mut self) {
        if let (Some(path), true) = (self.path.as_deref(), self.flags.contains(OpenFlags::READWRITE))
        {
            // Clean close folds the WAL; an unclean exit leaves it for
            // open-time recovery.
            if wal_path(path).exists() {
                if let Err(e) = checkpoint(path, self.header.page_size) {
                    warn!("checkpoint on close failed: {}", e);
                }
            }
        }
        if let Some(mut chain) = self.chain.take() {
            chain.dispose();
        }
        if let Some(mut heap) = self.heap.take() {
            heap.dispose();
        }
        if let Some(cipher) = self.options.cipher.take() {
            cipher.destroy_key();
        }
        self.schema_cache.borrow_mut().take();
    }

    /// Build the read chain: base, cipher, WAL overlay, cache.
    fn build_chain(&self) -> Result<Box<dyn PageSource>> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let page_size = self.header.page_size;

        let mut base: Box<dyn PageSource> = if self.options.use_mmap {
            Box::new(MmapPageSource::open(path, page_size)?)
        } else {
            Box::new(FilePageSource::open(path, page_size, false)?)
        };
        if let Some(cipher) = &self.options.cipher {
            base = Box::new(CipherPageSource {
                inner: base,
                cipher: cipher.clone(),
            });
        }
        if let Some(snapshot) = WalSnapshot::load(path, page_size)? {
            if !snapshot.is_empty() {
                debug!(
                    "overlaying {} committed wal page(s)",
                    snapshot.committed_page_count()
                );
                base = Box::new(WalPageSource::new(base, snapshot));
            }
        }
        Ok(Box::new(CachedPageSource::with_config(
            base,
            self.options.cache,
        )))
    }

    /// Refresh header and chain after a committed transaction.
    fn refresh_after_commit(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or_else(|| Error::new(ErrorCode::Internal))?;
        // The committed header may live in the WAL rather than the file.
        let mut header = read_header(&path)?;
        if let Some(snapshot) = WalSnapshot::load(&path, header.page_size)? {
            if let Some(page1) = snapshot.page(1) {
                header = DbHeader::parse(page1)?;
            }
        }
        self.header = header;
        self.chain = Some(self.build_chain()?);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Read and parse the database header from a file.
fn read_header(path: &Path) -> Result<DbHeader> {
    let mut first = vec![0u8; HEADER_SIZE];
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("open {}", path.display()), e))?;
    use std::io::Read;
    file.read_exact(&mut first)
        .map_err(|_| Error::new(ErrorCode::NotADb))?;
    DbHeader::parse(&first)
}

/// A one-page database image holding an empty schema table.
fn fresh_image(page_size: u32, wal: bool) -> Vec<u8> {
    let mut page1 = vec![0u8; page_size as usize];
    let header = DbHeader::new(page_size, wal);
    header.encode(&mut page1);
    init_page(&mut page1, header_offset(1), PageKind::TableLeaf, header.usable_size());
    page1
}

// ============================================================================
// Row reader
// ============================================================================

/// Comparison operator of a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

/// Declarative row predicate applied by `TableReader`.
#[derive(Debug, Clone)]
pub struct RowFilter {
    /// Column name (case-insensitive)
    pub column: String,
    /// Comparison
    pub op: FilterOp,
    /// Right-hand value
    pub value: Value,
}

impl RowFilter {
    /// Convenience constructor.
    pub fn new(column: impl Into<String>, op: FilterOp, value: Value) -> Self {
        RowFilter {
            column: column.into(),
            op,
            value,
        }
    }

    /// True when `actual` satisfies the filter.
    pub fn passes(&self, actual: &Value) -> bool {
        use std::cmp::Ordering;
        let ord = compare_values(actual, &self.value);
        match self.op {
            FilterOp::Eq => ord == Ordering::Equal,
            FilterOp::Ne => ord != Ordering::Equal,
            FilterOp::Lt => ord == Ordering::Less,
            FilterOp::Le => ord != Ordering::Greater,
            FilterOp::Gt => ord == Ordering::Greater,
            FilterOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Storage-class ordering over owned values.
fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Integer(x), Value::Real(y)) => {
            (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Value::Real(x), Value::Integer(y)) => {
            x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)
        }
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Forward-only row reader with projection and filters.
pub struct TableReader<'db> {
    cursor: TableCursor<'db>,
    table: TableInfo,
    projection: Option<Vec<usize>>,
    filters: Vec<(usize, RowFilter)>,
    serial_types: Vec<u64>,
    offsets: Vec<usize>,
    column_count: usize,
}

impl TableReader<'_> {
    /// Number of output columns (after projection).
    pub fn output_columns(&self) -> usize {
        match &self.projection {
            Some(p) => p.len(),
            None => self.table.columns.len(),
        }
    }

    /// Column name of output ordinal `i`.
    pub fn column_name(&self, i: usize) -> Option<&str> {
        let ordinal = match &self.projection {
            Some(p) => *p.get(i)?,
            None => i,
        };
        self.table.columns.get(ordinal).map(|c| c.name.as_str())
    }

    /// Rowid of the current row.
    pub fn rowid(&self) -> RowId {
        self.cursor.rowid()
    }

    /// Advance to the next row that passes every filter.
    pub fn move_next(&mut self) -> Result<bool> {
        loop {
            if !self.cursor.move_next()? {
                return Ok(false);
            }
            self.decode_header()?;
            if self.passes_filters()? {
                return Ok(true);
            }
        }
    }

    /// Seek directly to a rowid (ignores filters).
    pub fn seek(&mut self, rowid: RowId) -> Result<bool> {
        let found = self.cursor.seek(rowid)?;
        if found {
            self.decode_header()?;
        }
        Ok(found)
    }

    /// Materialize output column `i` of the current row.
    pub fn value(&mut self, i: usize) -> Result<Value> {
        let ordinal = match &self.projection {
            Some(p) => *p
                .get(i)
                .ok_or_else(|| Error::range("projection ordinal out of range"))?,
            None => i,
        };
        self.physical_value(ordinal)
    }

    /// Materialize every output column.
    pub fn row(&mut self) -> Result<Vec<Value>> {
        (0..self.output_columns()).map(|i| self.value(i)).collect()
    }

    fn decode_header(&mut self) -> Result<()> {
        if self.serial_types.len() < 8 {
            self.serial_types.resize(8, 0);
            self.offsets.resize(8, 0);
        }
        let header = loop {
            let payload = self.cursor.payload()?;
            match record::read_header(payload, &mut self.serial_types) {
                Ok(h) => break h,
                Err(e) if e.code() == ErrorCode::Range => {
                    let new_len = self.serial_types.len() * 2;
                    self.serial_types.resize(new_len, 0);
                    self.offsets.resize(new_len, 0);
                }
                Err(e) => return Err(e),
            }
        };
        record::column_offsets(
            &self.serial_types[..header.column_count],
            header.body_start,
            &mut self.offsets[..header.column_count],
        )?;
        self.column_count = header.column_count;
        Ok(())
    }

    fn physical_value(&mut self, ordinal: usize) -> Result<Value> {
        if ordinal >= self.table.columns.len() {
            return Err(Error::range(format!(
                "column ordinal {} out of range",
                ordinal
            )));
        }
        if ordinal >= self.column_count {
            // Rows written before a column was added decode as NULL.
            return Ok(Value::Null);
        }
        let rowid = self.cursor.rowid();
        let serial_type = self.serial_types[ordinal];
        let offset = self.offsets[ordinal];
        let payload = self.cursor.payload()?;
        let value = record::decode_column(payload, serial_type, offset)?;
        // An INTEGER PRIMARY KEY column aliases the rowid and is stored
        // as NULL in the record.
        if matches!(value, ValueRef::Null)
            && self.table.columns[ordinal].primary_key
            && self.table.columns[ordinal].affinity == crate::schema::Affinity::Integer
        {
            return Ok(Value::Integer(rowid));
        }
        value.to_owned()
    }

    fn passes_filters(&mut self) -> Result<bool> {
        if self.filters.is_empty() {
            return Ok(true);
        }
        let filters: Vec<(usize, RowFilter)> = self.filters.clone();
        for (ordinal, filter) in &filters {
            let actual = self.physical_value(*ordinal)?;
            if !filter.passes(&actual) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// The read base moved into a transaction for the shadow overlay.
enum TxnBase {
    Chain(Box<dyn PageSource>),
    Heap(HeapPageSource),
}

impl PageSource for TxnBase {
    fn page_size(&self) -> u32 {
        match self {
            TxnBase::Chain(c) => c.page_size(),
            TxnBase::Heap(h) => h.page_size(),
        }
    }

    fn page_count(&self) -> Pgno {
        match self {
            TxnBase::Chain(c) => c.page_count(),
            TxnBase::Heap(h) => h.page_count(),
        }
    }

    fn get_page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        match self {
            TxnBase::Chain(c) => c.get_page(pgno),
            TxnBase::Heap(h) => h.get_page(pgno),
        }
    }

    fn get_page_memory(&self, pgno: Pgno) -> Result<SharedBytes> {
        match self {
            TxnBase::Chain(c) => c.get_page_memory(pgno),
            TxnBase::Heap(h) => h.get_page_memory(pgno),
        }
    }

    fn data_version(&self) -> u64 {
        match self {
            TxnBase::Chain(c) => c.data_version(),
            TxnBase::Heap(h) => h.data_version(),
        }
    }

    fn dispose(&mut self) {
        match self {
            TxnBase::Chain(c) => c.dispose(),
            TxnBase::Heap(h) => h.dispose(),
        }
    }
}

/// A write transaction. Reads through the transaction see its own writes;
/// nothing is visible outside until `commit`. Dropping without commit
/// rolls back.
pub struct Transaction<'db> {
    db: &'db mut Database,
    mgr: Option<PageManager<TxnBase>>,
    root_cache: Vec<(String, Pgno)>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl Transaction<'_> {
    fn mgr(&mut self) -> &mut PageManager<TxnBase> {
        self.mgr.as_mut().expect("transaction already finished")
    }

    /// Root page of a named table, resolved through the shadow so tables
    /// created inside this transaction are visible.
    pub fn table_root(&mut self, table: &str) -> Result<Pgno> {
        let key = table.to_ascii_lowercase();
        if let Some((_, root)) = self.root_cache.iter().find(|(name, _)| *name == key) {
            return Ok(*root);
        }
        let usable = self.mgr().usable_size();
        let mgr = self.mgr.as_ref().expect("transaction already finished");
        let schema = SharcSchema::load(mgr, usable)?;
        let root = schema.require_table(table)?.root_page;
        self.root_cache.push((key, root));
        Ok(root)
    }

    /// Insert a row built from `values`. A explicit `rowid` of None
    /// assigns max+1. Returns the rowid used.
    pub fn insert(
        &mut self,
        table: &str,
        rowid: Option<RowId>,
        values: &[Value],
    ) -> Result<RowId> {
        let root = self.table_root(table)?;
        self.insert_at_root(root, rowid, values)
    }

    /// Insert into a table identified by its root page.
    pub fn insert_at_root(
        &mut self,
        root: Pgno,
        rowid: Option<RowId>,
        values: &[Value],
    ) -> Result<RowId> {
        let mgr = self.mgr();
        let rowid = match rowid {
            Some(r) => r,
            None => max_rowid(mgr, root)? + 1,
        };
        let mut builder = RecordBuilder::new();
        for value in values {
            builder.push(value);
        }
        insert_row(mgr, root, rowid, &builder.finish())?;
        Ok(rowid)
    }

    /// Create a table: allocates its root and appends the schema row.
    /// `columns_sql` is the parenthesized column list body.
    pub fn create_table(&mut self, name: &str, columns_sql: &str) -> Result<Pgno> {
        let mgr = self.mgr();
        let root = create_table_root(mgr)?;
        let sql = format!("CREATE TABLE {} ({})", name, columns_sql);
        let schema_rowid = max_rowid(mgr, crate::schema::SCHEMA_ROOT_PAGE)? + 1;
        let mut builder = RecordBuilder::new();
        builder.push(&Value::Text("table".into()));
        builder.push(&Value::Text(name.into()));
        builder.push(&Value::Text(name.into()));
        builder.push(&Value::Integer(root as i64));
        builder.push(&Value::Text(sql));
        insert_row(mgr, crate::schema::SCHEMA_ROOT_PAGE, schema_rowid, &builder.finish())?;
        self.bump_schema_cookie()?;
        self.root_cache.push((name.to_ascii_lowercase(), root));
        Ok(root)
    }

    fn bump_schema_cookie(&mut self) -> Result<()> {
        let page1 = self.mgr().page_for_write(1)?;
        let mut header = DbHeader::parse(page1)?;
        header.schema_cookie = header.schema_cookie.wrapping_add(1);
        header.encode(page1);
        Ok(())
    }

    /// Raw COW access for callers layering their own structures.
    pub fn page_for_write(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        self.mgr().page_for_write(pgno)
    }

    /// Allocate a fresh page.
    pub fn allocate_page(&mut self) -> Result<Pgno> {
        self.mgr().allocate_page()
    }

    /// Read through the transaction (sees its own writes).
    pub fn source(&self) -> &dyn PageSource {
        self.mgr.as_ref().expect("transaction already finished")
    }

    /// Commit atomically. On error the database reverts to its
    /// pre-transaction state.
    pub fn commit(mut self) -> Result<()> {
        let mut mgr = self.mgr.take().expect("transaction already finished");
        if mgr.is_clean() {
            return self.restore_base(mgr);
        }

        match self.db.path.clone() {
            None => {
                // Memory mode: apply straight into the heap image.
                let (base, dirty) = finishing_split(&mut mgr)?;
                let mut heap = match base {
                    TxnBase::Heap(h) => h,
                    TxnBase::Chain(_) => return Err(Error::new(ErrorCode::Internal)),
                };
                for (pgno, bytes) in dirty {
                    heap.write_page(pgno, &bytes)?;
                }
                self.db.header = {
                    let page1 = heap.get_page(1)?;
                    DbHeader::parse(&page1)?
                };
                self.db.heap = Some(heap);
                Ok(())
            }
            Some(path) => {
                let page_size = self.db.header.page_size;
                let result = if self.db.header.write_format == FileFormat::Wal {
                    let mut wal = WalWriter::open_for_append(&path, page_size)?;
                    mgr.commit_wal(&mut wal)
                } else {
                    let mut file = FilePageSource::open(&path, page_size, true)?;
                    mgr.commit_rollback(&path, &mut file)
                };
                match result {
                    Ok(()) => {
                        drop(mgr);
                        self.db.refresh_after_commit()
                    }
                    Err(e) => {
                        // commit_rollback already repaired the file; the
                        // old chain may hold stale cache entries, so
                        // rebuild instead of restoring it.
                        drop(mgr);
                        let _ = self.db.refresh_after_commit();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Roll back: dirty pages are discarded, the read base is restored.
    pub fn rollback(mut self) -> Result<()> {
        let mut mgr = self.mgr.take().expect("transaction already finished");
        mgr.rollback();
        self.restore_base(mgr)
    }

    fn restore_base(&mut self, mgr: PageManager<TxnBase>) -> Result<()> {
        match mgr.into_base() {
            TxnBase::Chain(chain) => self.db.chain = Some(chain),
            TxnBase::Heap(heap) => self.db.heap = Some(heap),
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(mut mgr) = self.mgr.take() {
            mgr.rollback();
            match mgr.into_base() {
                TxnBase::Chain(chain) => self.db.chain = Some(chain),
                TxnBase::Heap(heap) => self.db.heap = Some(heap),
            }
        }
    }
}

/// Stamp the header, collect dirty page images, and recover the base.
fn finishing_split(
    mgr: &mut PageManager<TxnBase>,
) -> Result<(TxnBase, Vec<(Pgno, Vec<u8>)>)> {
    let dirty = mgr.finish_dirty()?;
    let mgr = std::mem::replace(
        mgr,
        PageManager::new(TxnBase::Heap(HeapPageSource::new(512)), 512),
    );
    Ok((mgr.into_base(), dirty))
}

// ============================================================================
// Tests
// ============================================================================

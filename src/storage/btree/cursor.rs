//! Table and index b-tree cursors.
//!
//! Cursors traverse with an explicit stack of (page, child-index) frames,
//! never recursion, so tree depth cannot exhaust the native stack. Each
//! visited node is copied into the cursor's reusable node buffer via
//! `read_page`, so no cache read lock or per-call scratch borrow is held
//! across a cross-page link. Payloads are borrowed from the node buffer;
//! overflowing payloads are reassembled once per cell into the cursor's
//! reusable overflow buffer.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::mem::{self, PooledBuf};
use crate::storage::read_u32;
use crate::storage::record::{self, ValueRef};
use crate::storage::source::PageSource;
use crate::types::{Pgno, RowId, Value};

use super::{cell_pointer, header_offset, PageGeometry, PageHeader, PageKind};

/// Deepest tree a cursor will follow before declaring corruption.
pub const MAX_TREE_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    OnCell,
    AtEnd,
}

/// One interior level on the descent path: the child index last taken.
#[derive(Debug, Clone, Copy)]
struct Frame {
    pgno: Pgno,
    child_idx: u16,
    cell_count: u16,
}

/// State shared by both cursor kinds: the current node copy and the cell
/// decoded from it.
struct CursorCore<'s> {
    source: &'s dyn PageSource,
    root: Pgno,
    geom: PageGeometry,
    stack: Vec<Frame>,
    node: PooledBuf,
    node_pgno: Pgno,
    node_kind: PageKind,
    cell_count: u16,
    right_child: Pgno,
    position: Position,
    cell_idx: u16,
    payload_len: usize,
    local_len: usize,
    payload_offset: usize,
    overflow_head: Pgno,
    overflow_buf: PooledBuf,
    overflow_valid: bool,
}

impl<'s> CursorCore<'s> {
    fn new(source: &'s dyn PageSource, root: Pgno, usable: u32) -> Self {
        let page_size = source.page_size() as usize;
        CursorCore {
            source,
            root,
            geom: PageGeometry::new(usable),
            stack: Vec::new(),
            node: mem::lease(page_size),
            node_pgno: 0,
            node_kind: PageKind::TableLeaf,
            cell_count: 0,
            right_child: 0,
            position: Position::BeforeFirst,
            cell_idx: 0,
            payload_len: 0,
            local_len: 0,
            payload_offset: 0,
            overflow_head: 0,
            overflow_buf: mem::lease(0),
            overflow_valid: false,
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.position = Position::BeforeFirst;
        self.overflow_valid = false;
        self.node_pgno = 0;
    }

    /// Copy page `pgno` into the node buffer and parse its header.
    fn load_node(&mut self, pgno: Pgno) -> Result<PageHeader> {
        self.source.read_page(pgno, &mut self.node)?;
        let hdr = PageHeader::parse(&self.node, header_offset(pgno))?;
        self.node_pgno = pgno;
        self.node_kind = hdr.kind;
        self.cell_count = hdr.cell_count;
        self.right_child = hdr.right_child.unwrap_or(0);
        self.overflow_valid = false;
        Ok(hdr)
    }

    /// Child pointer `idx` of the currently loaded interior node;
    /// `idx == cell_count` selects the right-most child.
    fn child_at(&self, idx: u16) -> Result<Pgno> {
        let child = if idx < self.cell_count {
            let ptr = cell_pointer(
                &self.node,
                header_offset(self.node_pgno),
                self.node_kind,
                idx,
            )?;
            read_u32(&self.node, ptr)
                .ok_or_else(|| Error::corrupt("interior cell truncated"))?
        } else {
            self.right_child
        };
        if child == 0 {
            return Err(Error::corrupt("interior node with null child pointer"));
        }
        Ok(child)
    }

    fn push_frame(&mut self, pgno: Pgno, child_idx: u16) -> Result<()> {
        if self.stack.len() >= MAX_TREE_DEPTH {
            return Err(Error::corrupt("b-tree deeper than supported maximum"));
        }
        self.stack.push(Frame {
            pgno,
            child_idx,
            cell_count: self.cell_count,
        });
        Ok(())
    }

    /// Record the cell's payload geometry once the byte offsets are known.
    fn set_cell(
        &mut self,
        idx: u16,
        payload_len: usize,
        payload_offset: usize,
        kind: PageKind,
    ) -> Result<()> {
        let (local_len, overflows) = self.geom.local_payload(kind, payload_len);
        let tail = payload_offset + local_len + if overflows { 4 } else { 0 };
        if tail > self.node.len() {
            return Err(Error::corrupt("cell payload runs past end of page"));
        }
        self.overflow_head = if overflows {
            let head = read_u32(&self.node, payload_offset + local_len).unwrap();
            if head == 0 {
                return Err(Error::corrupt("overflowing cell with null chain head"));
            }
            head
        } else {
            0
        };
        self.cell_idx = idx;
        self.payload_len = payload_len;
        self.local_len = local_len;
        self.payload_offset = payload_offset;
        self.overflow_valid = false;
        self.position = Position::OnCell;
        Ok(())
    }

    /// Borrow the current cell's full payload, assembling the overflow
    /// chain on first access.
    fn payload(&mut self) -> Result<&[u8]> {
        if self.position != Position::OnCell {
            return Err(Error::with_message(
                crate::error::ErrorCode::Misuse,
                "cursor is not positioned on a cell",
            ));
        }
        if self.overflow_head == 0 {
            return Ok(&self.node[self.payload_offset..self.payload_offset + self.local_len]);
        }
        if !self.overflow_valid {
            self.assemble_overflow()?;
        }
        Ok(&self.overflow_buf[..self.payload_len])
    }

    fn assemble_overflow(&mut self) -> Result<()> {
        self.overflow_buf.resize(self.payload_len);
        self.overflow_buf[..self.local_len]
            .copy_from_slice(&self.node[self.payload_offset..self.payload_offset + self.local_len]);

        let capacity = self.geom.overflow_capacity();
        let mut written = self.local_len;
        let mut pgno = self.overflow_head;
        let mut chain = mem::lease(self.source.page_size() as usize);
        let mut steps: u64 = 0;
        let max_steps = self.source.page_count() as u64 + 1;

        while written < self.payload_len {
            steps += 1;
            if steps > max_steps {
                return Err(Error::corrupt("overflow chain loop"));
            }
            if pgno == 0 {
                return Err(Error::corrupt("overflow chain ends before payload"));
            }
            self.source.read_page(pgno, &mut chain)?;
            let next = read_u32(&chain, 0).unwrap();
            let take = capacity.min(self.payload_len - written);
            self.overflow_buf[written..written + take].copy_from_slice(&chain[4..4 + take]);
            written += take;
            pgno = next;
        }
        self.overflow_valid = true;
        Ok(())
    }

    /// Pop frames until one has an untaken child; advance into it.
    /// Returns the next child's page number, or None at the tree's end.
    fn next_sibling(&mut self) -> Result<Option<Pgno>> {
        while let Some(mut frame) = self.stack.pop() {
            if frame.child_idx < frame.cell_count {
                frame.child_idx += 1;
                self.load_node(frame.pgno)?;
                let child = self.child_at(frame.child_idx)?;
                self.stack.push(frame);
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Table Cursor
// ============================================================================

/// Rowid-ordered cursor over a table b-tree.
pub struct TableCursor<'s> {
    core: CursorCore<'s>,
    rowid: RowId,
}

impl<'s> TableCursor<'s> {
    /// Cursor over the tree rooted at `root`. `usable` is the usable page
    /// size from the database header.
    pub fn new(source: &'s dyn PageSource, root: Pgno, usable: u32) -> Self {
        TableCursor {
            core: CursorCore::new(source, root, usable),
            rowid: 0,
        }
    }

    /// Return to "before first".
    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// Rowid of the current cell.
    pub fn rowid(&self) -> RowId {
        self.rowid
    }

    /// Full payload length of the current cell.
    pub fn payload_len(&self) -> usize {
        self.core.payload_len
    }

    /// Borrow the current record bytes (overflow assembled transparently).
    /// Valid until the cursor moves.
    pub fn payload(&mut self) -> Result<&[u8]> {
        self.core.payload()
    }

    /// Advance in rowid order; false at the end.
    pub fn move_next(&mut self) -> Result<bool> {
        match self.core.position {
            Position::BeforeFirst => {
                self.core.stack.clear();
                let root = self.core.root;
                self.descend_first(root)
            }
            Position::AtEnd => Ok(false),
            Position::OnCell => {
                if self.core.cell_idx + 1 < self.core.cell_count {
                    let next = self.core.cell_idx + 1;
                    self.load_leaf_cell(next)?;
                    Ok(true)
                } else {
                    match self.core.next_sibling()? {
                        Some(child) => self.descend_first(child),
                        None => {
                            self.core.position = Position::AtEnd;
                            Ok(false)
                        }
                    }
                }
            }
        }
    }

    /// Position on `rowid` if present (true), else on the first cell with a
    /// larger rowid or at the end (false).
    pub fn seek(&mut self, rowid: RowId) -> Result<bool> {
        self.core.reset();
        let mut pgno = self.core.root;
        loop {
            let hdr = self.core.load_node(pgno)?;
            match hdr.kind {
                PageKind::TableLeaf => {
                    let mut lo = 0u16;
                    let mut hi = self.core.cell_count;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        if self.leaf_cell_rowid(mid)? < rowid {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    if lo < self.core.cell_count {
                        self.load_leaf_cell(lo)?;
                        return Ok(self.rowid == rowid);
                    }
                    // Every cell here is smaller; the successor (if any)
                    // lives in the next leaf.
                    return match self.core.next_sibling()? {
                        Some(child) => {
                            self.descend_first(child)?;
                            Ok(false)
                        }
                        None => {
                            self.core.position = Position::AtEnd;
                            Ok(false)
                        }
                    };
                }
                PageKind::TableInterior => {
                    // First cell whose max-rowid key admits the target.
                    let mut lo = 0u16;
                    let mut hi = self.core.cell_count;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        if self.interior_cell_key(mid)? < rowid {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    let child = self.core.child_at(lo)?;
                    self.core.push_frame(pgno, lo)?;
                    pgno = child;
                }
                _ => return Err(Error::corrupt("index page inside table b-tree")),
            }
        }
    }

    /// Descend to the smallest cell of the subtree at `pgno`.
    fn descend_first(&mut self, mut pgno: Pgno) -> Result<bool> {
        loop {
            let hdr = self.core.load_node(pgno)?;
            match hdr.kind {
                PageKind::TableLeaf => {
                    if self.core.cell_count > 0 {
                        self.load_leaf_cell(0)?;
                        return Ok(true);
                    }
                    // Empty leaf: continue with the next subtree over.
                    match self.core.next_sibling()? {
                        Some(child) => pgno = child,
                        None => {
                            self.core.position = Position::AtEnd;
                            return Ok(false);
                        }
                    }
                }
                PageKind::TableInterior => {
                    self.core.push_frame(pgno, 0)?;
                    pgno = self.core.child_at(0)?;
                }
                _ => return Err(Error::corrupt("index page inside table b-tree")),
            }
        }
    }

    /// Rowid of leaf cell `idx` without repositioning the cursor.
    fn leaf_cell_rowid(&self, idx: u16) -> Result<RowId> {
        let ptr = cell_pointer(
            &self.core.node,
            header_offset(self.core.node_pgno),
            PageKind::TableLeaf,
            idx,
        )?;
        let (_, n) = record::read_varint(&self.core.node, ptr)?;
        let (rowid, _) = record::read_varint_i64(&self.core.node, ptr + n)?;
        Ok(rowid)
    }

    /// Max-rowid key of interior cell `idx`.
    fn interior_cell_key(&self, idx: u16) -> Result<RowId> {
        let ptr = cell_pointer(
            &self.core.node,
            header_offset(self.core.node_pgno),
            PageKind::TableInterior,
            idx,
        )?;
        let (key, _) = record::read_varint_i64(&self.core.node, ptr + 4)?;
        Ok(key)
    }

    fn load_leaf_cell(&mut self, idx: u16) -> Result<()> {
        let ptr = cell_pointer(
            &self.core.node,
            header_offset(self.core.node_pgno),
            PageKind::TableLeaf,
            idx,
        )?;
        let (payload_len, n1) = record::read_varint(&self.core.node, ptr)?;
        let (rowid, n2) = record::read_varint_i64(&self.core.node, ptr + n1)?;
        self.rowid = rowid;
        self.core
            .set_cell(idx, payload_len as usize, ptr + n1 + n2, PageKind::TableLeaf)
    }
}

// ============================================================================
// Index Cursor
// ============================================================================

/// Key-ordered cursor over an index b-tree. Index cells live on interior
/// pages too, so in-order traversal interleaves leaf runs with ancestor
/// cells.
pub struct IndexCursor<'s> {
    core: CursorCore<'s>,
    on_interior: bool,
    // Scratch for key comparisons; sized to the widest record seen.
    serial_types: Vec<u64>,
    offsets: Vec<usize>,
}

impl<'s> IndexCursor<'s> {
    /// Cursor over the index tree rooted at `root`.
    pub fn new(source: &'s dyn PageSource, root: Pgno, usable: u32) -> Self {
        IndexCursor {
            core: CursorCore::new(source, root, usable),
            on_interior: false,
            serial_types: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Return to "before first".
    pub fn reset(&mut self) {
        self.core.reset();
        self.on_interior = false;
    }

    /// Borrow the current key record (overflow assembled transparently).
    pub fn payload(&mut self) -> Result<&[u8]> {
        self.core.payload()
    }

    /// Full payload length of the current cell.
    pub fn payload_len(&self) -> usize {
        self.core.payload_len
    }

    /// The referenced table rowid: the key record's last column.
    pub fn table_rowid(&mut self) -> Result<RowId> {
        let header = self.decode_current_header()?;
        let n = header.column_count;
        if n == 0 {
            return Err(Error::corrupt("index record has no columns"));
        }
        let payload = self.core.payload()?;
        record::decode_integer(payload, self.serial_types[n - 1], self.offsets[n - 1])
    }

    /// Scan the current key record's header into the cursor scratch,
    /// growing it as needed, and precompute column offsets.
    fn decode_current_header(&mut self) -> Result<record::RecordHeader> {
        if self.serial_types.len() < 8 {
            self.serial_types.resize(8, 0);
            self.offsets.resize(8, 0);
        }
        let header = loop {
            let payload = self.core.payload()?;
            match record::read_header(payload, &mut self.serial_types) {
                Ok(h) => break h,
                Err(e) if e.code() == crate::error::ErrorCode::Range => {
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
        Ok(header)
    }

    /// Advance in key order; false at the end.
    pub fn move_next(&mut self) -> Result<bool> {
        match self.core.position {
            Position::BeforeFirst => {
                self.core.stack.clear();
                let root = self.core.root;
                self.descend_first(root)
            }
            Position::AtEnd => Ok(false),
            Position::OnCell => {
                if self.on_interior {
                    // The cell's successor is the leftmost entry of the
                    // next child subtree.
                    let next_child_idx = self.core.cell_idx + 1;
                    let child = self.core.child_at(next_child_idx)?;
                    let pgno = self.core.node_pgno;
                    self.core.push_frame(pgno, next_child_idx)?;
                    self.descend_first(child)
                } else if self.core.cell_idx + 1 < self.core.cell_count {
                    let next = self.core.cell_idx + 1;
                    self.load_leaf_cell(next)?;
                    Ok(true)
                } else {
                    self.ascend()
                }
            }
        }
    }

    /// Position on the first cell whose leading key columns compare >=
    /// `prefix`; false iff no such cell exists.
    pub fn seek_first(&mut self, prefix: &[Value]) -> Result<bool> {
        self.reset();
        let mut pgno = self.core.root;
        loop {
            let hdr = self.core.load_node(pgno)?;
            match hdr.kind {
                PageKind::IndexLeaf => {
                    let mut lo = 0u16;
                    let mut hi = self.core.cell_count;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        self.load_leaf_cell(mid)?;
                        if self.compare_current(prefix)? == Ordering::Less {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    if lo < self.core.cell_count {
                        self.load_leaf_cell(lo)?;
                        return Ok(true);
                    }
                    // All leaf keys are smaller; the successor is an
                    // ancestor cell recorded on the stack.
                    return self.ascend();
                }
                PageKind::IndexInterior => {
                    let mut lo = 0u16;
                    let mut hi = self.core.cell_count;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        self.load_interior_cell(mid)?;
                        if self.compare_current(prefix)? == Ordering::Less {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    // Reload: the binary search left an arbitrary cell
                    // decoded; child_at needs the node intact, which it is,
                    // but position bookkeeping belongs to the descent.
                    let child = self.core.child_at(lo)?;
                    self.core.push_frame(pgno, lo)?;
                    pgno = child;
                }
                _ => return Err(Error::corrupt("table page inside index b-tree")),
            }
        }
    }

    fn descend_first(&mut self, mut pgno: Pgno) -> Result<bool> {
        loop {
            let hdr = self.core.load_node(pgno)?;
            match hdr.kind {
                PageKind::IndexLeaf => {
                    if self.core.cell_count > 0 {
                        return self.load_leaf_cell(0).map(|_| true);
                    }
                    return self.ascend();
                }
                PageKind::IndexInterior => {
                    self.core.push_frame(pgno, 0)?;
                    pgno = self.core.child_at(0)?;
                }
                _ => return Err(Error::corrupt("table page inside index b-tree")),
            }
        }
    }

    /// In-order successor after an exhausted subtree: the ancestor cell at
    /// the child index we came through, when one remains.
    fn ascend(&mut self) -> Result<bool> {
        while let Some(frame) = self.core.stack.pop() {
            if frame.child_idx < frame.cell_count {
                self.core.load_node(frame.pgno)?;
                // The frame stays popped: the cursor position itself
                // remembers (node, cell_idx); advancing pushes it back.
                return self.load_interior_cell(frame.child_idx).map(|_| true);
            }
        }
        self.core.position = Position::AtEnd;
        Ok(false)
    }

    fn load_leaf_cell(&mut self, idx: u16) -> Result<()> {
        let ptr = cell_pointer(
            &self.core.node,
            header_offset(self.core.node_pgno),
            PageKind::IndexLeaf,
            idx,
        )?;
        let (payload_len, n) = record::read_varint(&self.core.node, ptr)?;
        self.on_interior = false;
        self.core
            .set_cell(idx, payload_len as usize, ptr + n, PageKind::IndexLeaf)
    }

    fn load_interior_cell(&mut self, idx: u16) -> Result<()> {
        let ptr = cell_pointer(
            &self.core.node,
            header_offset(self.core.node_pgno),
            PageKind::IndexInterior,
            idx,
        )?;
        let (payload_len, n) = record::read_varint(&self.core.node, ptr + 4)?;
        self.on_interior = true;
        self.core
            .set_cell(idx, payload_len as usize, ptr + 4 + n, PageKind::IndexInterior)
    }

    /// Compare the current cell's leading key columns against `prefix`.
    fn compare_current(&mut self, prefix: &[Value]) -> Result<Ordering> {
        let header = self.decode_current_header()?;
        let payload = self.core.payload()?;
        for (i, want) in prefix.iter().enumerate() {
            if i >= header.column_count {
                // Shorter key sorts before a longer prefix.
                return Ok(Ordering::Less);
            }
            let got = record::decode_column(payload, self.serial_types[i], self.offsets[i])?;
            let ord = compare_value(&got, want);
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }
}

/// Storage-class ordering: NULL < numeric < text < blob; numerics compare
/// numerically across int/real, text and blob compare bytewise.
fn compare_value(got: &ValueRef<'_>, want: &Value) -> Ordering {
    fn rank_ref(v: &ValueRef<'_>) -> u8 {
        match v {
            ValueRef::Null => 0,
            ValueRef::Integer(_) | ValueRef::Real(_) => 1,
            ValueRef::Text(_) => 2,
            ValueRef::Blob(_) => 3,
        }
    }
    fn rank_owned(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    let (ra, rb) = (rank_ref(got), rank_owned(want));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (got, want) {
        (ValueRef::Null, Value::Null) => Ordering::Equal,
        (ValueRef::Integer(a), Value::Integer(b)) => a.cmp(b),
        (ValueRef::Integer(a), Value::Real(b)) => {
            (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (ValueRef::Real(a), Value::Integer(b)) => {
            a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
        }
        (ValueRef::Real(a), Value::Real(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (ValueRef::Text(a), Value::Text(b)) => a.cmp(&b.as_bytes()),
        (ValueRef::Blob(a), Value::Blob(b)) => a.cmp(&b.as_slice()),
        _ => Ordering::Equal,
    }
}

// ============================================================================
// Tests
// ============================================================================

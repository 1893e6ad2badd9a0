//! Relation (edge) store: adjacency cursors over the edge table.
//!
//! Two cursor strategies share one surface: the index cursor binary
//! searches an origin/target index (`seek_first`) and follows stored
//! rowids back into the edge table; the scan cursor walks the whole table
//! with an early exit per row. Both reuse their decode scratch and expose
//! `reset` so multi-hop traversals run on a single cursor object.

use crate::database::Database;
use crate::error::Result;
use crate::storage::btree::cursor::{IndexCursor, TableCursor};
use crate::types::{Pgno, RowId, Value};

use super::{
    optional_ordinal, pick_index, require_ordinal, table_root, RelationTableAdapter, RowScratch,
};

/// A materialized graph edge.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Rowid of the backing row
    pub rowid: RowId,
    /// Edge identifier
    pub id: i64,
    /// Origin node key
    pub origin: i64,
    /// Target node key
    pub target: i64,
    /// Edge kind
    pub kind: i64,
    /// Opaque/JSON payload
    pub data: Value,
    /// Weight, when tracked
    pub weight: Option<f64>,
    /// Content version, when tracked
    pub cvn: Option<i64>,
    /// Local version, when tracked
    pub lvn: Option<i64>,
    /// Sync status, when tracked
    pub sync_status: Option<i64>,
}

/// Which endpoint the cursor matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEndpoint {
    /// Match edges leaving the node (`origin == key`)
    Origin,
    /// Match edges entering the node (`target == key`)
    Target,
}

struct Ordinals {
    id: usize,
    origin: usize,
    target: usize,
    kind: usize,
    data: usize,
    weight: Option<usize>,
    cvn: Option<usize>,
    lvn: Option<usize>,
    sync_status: Option<usize>,
}

/// Edge store over a relation table.
pub struct RelationStore<'db> {
    db: &'db Database,
    root: Pgno,
    ordinals: Ordinals,
    origin_index: Option<Pgno>,
    target_index: Option<Pgno>,
}

impl<'db> RelationStore<'db> {
    /// Resolve the adapter and pick origin/target indexes.
    pub fn initialize(db: &'db Database, adapter: &RelationTableAdapter) -> Result<Self> {
        let schema = db.schema()?;
        let table = schema.require_table(&adapter.table)?;
        let ordinals = Ordinals {
            id: require_ordinal(table, &adapter.col_id, "edge id")?,
            origin: require_ordinal(table, &adapter.col_origin, "edge origin")?,
            target: require_ordinal(table, &adapter.col_target, "edge target")?,
            kind: require_ordinal(table, &adapter.col_kind, "edge kind")?,
            data: require_ordinal(table, &adapter.col_data, "edge data")?,
            weight: optional_ordinal(table, &adapter.col_weight),
            cvn: optional_ordinal(table, &adapter.col_cvn),
            lvn: optional_ordinal(table, &adapter.col_lvn),
            sync_status: optional_ordinal(table, &adapter.col_sync_status),
        };
        Ok(RelationStore {
            root: table_root(&schema, &adapter.table)?,
            origin_index: pick_index(&schema, &adapter.table, &adapter.col_origin)
                .map(|idx| idx.root_page),
            target_index: pick_index(&schema, &adapter.table, &adapter.col_target)
                .map(|idx| idx.root_page),
            db,
            ordinals,
        })
    }

    /// True when the given endpoint is index-accelerated.
    pub fn has_index(&self, endpoint: EdgeEndpoint) -> bool {
        match endpoint {
            EdgeEndpoint::Origin => self.origin_index.is_some(),
            EdgeEndpoint::Target => self.target_index.is_some(),
        }
    }

    /// Adjacency cursor for `key` on the given endpoint, optionally
    /// restricted to one edge kind.
    pub fn edges(
        &self,
        endpoint: EdgeEndpoint,
        key: i64,
        kind: Option<i64>,
    ) -> Result<EdgeCursor<'db>> {
        let source = self.db.reader_source()?;
        let usable = self.db.usable_page_size();
        let index_root = match endpoint {
            EdgeEndpoint::Origin => self.origin_index,
            EdgeEndpoint::Target => self.target_index,
        };
        let table = TableCursor::new(source, self.root, usable);
        let strategy = match index_root {
            Some(root) => Strategy::Index {
                index: IndexCursor::new(source, root, usable),
                started: false,
            },
            None => Strategy::Scan { started: false },
        };
        Ok(EdgeCursor {
            table,
            strategy,
            scratch: RowScratch::new(),
            ordinals: OrdinalsView::from(&self.ordinals),
            endpoint,
            match_key: key,
            kind,
            loaded: false,
        })
    }

    /// Outgoing adjacency (`origin == key`).
    pub fn outgoing(&self, key: i64, kind: Option<i64>) -> Result<EdgeCursor<'db>> {
        self.edges(EdgeEndpoint::Origin, key, kind)
    }

    /// Incoming adjacency (`target == key`).
    pub fn incoming(&self, key: i64, kind: Option<i64>) -> Result<EdgeCursor<'db>> {
        self.edges(EdgeEndpoint::Target, key, kind)
    }
}

/// Copy of the resolved ordinals small enough to live inside cursors.
#[derive(Clone, Copy)]
struct OrdinalsView {
    id: usize,
    origin: usize,
    target: usize,
    kind: usize,
    data: usize,
    weight: Option<usize>,
    cvn: Option<usize>,
    lvn: Option<usize>,
    sync_status: Option<usize>,
}

impl From<&Ordinals> for OrdinalsView {
    fn from(o: &Ordinals) -> Self {
        OrdinalsView {
            id: o.id,
            origin: o.origin,
            target: o.target,
            kind: o.kind,
            data: o.data,
            weight: o.weight,
            cvn: o.cvn,
            lvn: o.lvn,
            sync_status: o.sync_status,
        }
    }
}

enum Strategy<'db> {
    /// Position on the first index match, then scan while the leading
    /// column still matches.
    Index {
        index: IndexCursor<'db>,
        started: bool,
    },
    /// Full table scan with per-row early exit.
    Scan { started: bool },
}

/// Adjacency cursor. After `move_next` returns true, accessors are O(1)
/// over the precomputed column offsets.
pub struct EdgeCursor<'db> {
    table: TableCursor<'db>,
    strategy: Strategy<'db>,
    scratch: RowScratch,
    ordinals: OrdinalsView,
    endpoint: EdgeEndpoint,
    match_key: i64,
    kind: Option<i64>,
    loaded: bool,
}

impl EdgeCursor<'_> {
    /// Re-aim the cursor at another node (and optional kind) without
    /// reallocating its scratch. The next `move_next` starts the new scan.
    pub fn reset(&mut self, match_key: i64, kind: Option<i64>) {
        self.match_key = match_key;
        self.kind = kind;
        self.loaded = false;
        match &mut self.strategy {
            Strategy::Index { index, started } => {
                index.reset();
                *started = false;
            }
            Strategy::Scan { started } => {
                self.table.reset();
                *started = false;
            }
        }
    }

    /// Advance to the next matching edge.
    pub fn move_next(&mut self) -> Result<bool> {
        self.loaded = false;
        match &mut self.strategy {
            Strategy::Index { .. } => self.next_via_index(),
            Strategy::Scan { .. } => self.next_via_scan(),
        }
    }

    fn next_via_index(&mut self) -> Result<bool> {
        loop {
            let rowid = {
                let Strategy::Index { index, started } = &mut self.strategy else {
                    unreachable!()
                };
                let advanced = if !*started {
                    *started = true;
                    index.seek_first(&[Value::Integer(self.match_key)])?
                } else {
                    index.move_next()?
                };
                if !advanced {
                    return Ok(false);
                }
                index.table_rowid()?
            };

            if !self.table.seek(rowid)? {
                // Index points at a row the table no longer has.
                continue;
            }
            self.scratch.load(&mut self.table)?;
            let endpoint_key = self.endpoint_key()?;
            if endpoint_key != self.match_key {
                // Past the matching run of the index.
                return Ok(false);
            }
            if self.kind_matches()? {
                self.loaded = true;
                return Ok(true);
            }
        }
    }

    fn next_via_scan(&mut self) -> Result<bool> {
        let Strategy::Scan { started } = &mut self.strategy else {
            unreachable!()
        };
        if !*started {
            *started = true;
            self.table.reset();
        }
        while self.table.move_next()? {
            self.scratch.load(&mut self.table)?;
            if self.endpoint_key()? == self.match_key && self.kind_matches()? {
                self.loaded = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn endpoint_key(&mut self) -> Result<i64> {
        let ordinal = match self.endpoint {
            EdgeEndpoint::Origin => self.ordinals.origin,
            EdgeEndpoint::Target => self.ordinals.target,
        };
        self.scratch.integer_at(&mut self.table, ordinal)
    }

    fn kind_matches(&mut self) -> Result<bool> {
        let Some(want) = self.kind else {
            return Ok(true);
        };
        Ok(self.scratch.integer_at(&mut self.table, self.ordinals.kind)? == want)
    }

    /// Origin key of the current edge.
    pub fn origin(&mut self) -> Result<i64> {
        debug_assert!(self.loaded);
        self.scratch.integer_at(&mut self.table, self.ordinals.origin)
    }

    /// Target key of the current edge.
    pub fn target(&mut self) -> Result<i64> {
        debug_assert!(self.loaded);
        self.scratch.integer_at(&mut self.table, self.ordinals.target)
    }

    /// Kind of the current edge.
    pub fn kind(&mut self) -> Result<i64> {
        debug_assert!(self.loaded);
        self.scratch.integer_at(&mut self.table, self.ordinals.kind)
    }

    /// Weight of the current edge, when tracked.
    pub fn weight(&mut self) -> Result<Option<f64>> {
        let Some(ordinal) = self.ordinals.weight else {
            return Ok(None);
        };
        Ok(match self.scratch.value_at(&mut self.table, ordinal)? {
            Value::Null => None,
            v => Some(v.to_f64()),
        })
    }

    /// Approximate token cost of the current edge, derived from its data
    /// payload size.
    pub fn token_cost(&mut self) -> Result<i64> {
        let data = self.scratch.value_at(&mut self.table, self.ordinals.data)?;
        let bytes = match &data {
            Value::Text(s) => s.len(),
            Value::Blob(b) => b.len(),
            Value::Null => 0,
            _ => 8,
        };
        Ok((bytes as i64 / 4).max(1))
    }

    /// Materialize the whole current edge.
    pub fn edge(&mut self) -> Result<Edge> {
        debug_assert!(self.loaded);
        let o = self.ordinals;
        Ok(Edge {
            rowid: self.scratch.rowid(),
            id: self.scratch.integer_at(&mut self.table, o.id)?,
            origin: self.scratch.integer_at(&mut self.table, o.origin)?,
            target: self.scratch.integer_at(&mut self.table, o.target)?,
            kind: self.scratch.integer_at(&mut self.table, o.kind)?,
            data: self.scratch.value_at(&mut self.table, o.data)?,
            weight: self.weight()?,
            cvn: self.scratch.opt_integer_at(&mut self.table, o.cvn)?,
            lvn: self.scratch.opt_integer_at(&mut self.table, o.lvn)?,
            sync_status: self.scratch.opt_integer_at(&mut self.table, o.sync_status)?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::sample_graph_db;
    use crate::graph::RelationTableAdapter;

    fn collect_targets(cursor: &mut EdgeCursor<'_>) -> Vec<i64> {
        let mut out = Vec::new();
        while cursor.move_next().unwrap() {
            out.push(cursor.target().unwrap());
        }
        out
    }

    #[test]
    fn test_outgoing_scan() {
        let db = sample_graph_db(false);
        let store = RelationStore::initialize(&db, &RelationTableAdapter::default()).unwrap();
        assert!(!store.has_index(EdgeEndpoint::Origin));

        let mut cursor = store.outgoing(1, None).unwrap();
        assert_eq!(collect_targets(&mut cursor), vec![2, 3]);
    }

    #[test]
    fn test_outgoing_via_index() {
        let db = sample_graph_db(true);
        let store = RelationStore::initialize(&db, &RelationTableAdapter::default()).unwrap();
        assert!(store.has_index(EdgeEndpoint::Origin));

        let mut cursor = store.outgoing(1, None).unwrap();
        let mut targets = collect_targets(&mut cursor);
        targets.sort_unstable();
        assert_eq!(targets, vec![2, 3]);
    }

    #[test]
    fn test_incoming() {
        let db = sample_graph_db(false);
        let store = RelationStore::initialize(&db, &RelationTableAdapter::default()).unwrap();
        let mut cursor = store.incoming(4, None).unwrap();
        let mut origins = Vec::new();
        while cursor.move_next().unwrap() {
            origins.push(cursor.origin().unwrap());
        }
        origins.sort_unstable();
        assert_eq!(origins, vec![2, 3]);
    }

    #[test]
    fn test_reset_reuses_cursor() {
        let db = sample_graph_db(true);
        let store = RelationStore::initialize(&db, &RelationTableAdapter::default()).unwrap();
        let mut cursor = store.outgoing(1, None).unwrap();
        assert_eq!(collect_targets(&mut cursor).len(), 2);

        cursor.reset(4, None);
        assert_eq!(collect_targets(&mut cursor), vec![5]);

        cursor.reset(5, None);
        assert!(collect_targets(&mut cursor).is_empty());
    }

    #[test]
    fn test_kind_filter() {
        let db = sample_graph_db(false);
        let store = RelationStore::initialize(&db, &RelationTableAdapter::default()).unwrap();
        // Sample edges from node 1 have kinds 10 (->2) and 20 (->3).
        let mut cursor = store.outgoing(1, Some(20)).unwrap();
        assert_eq!(collect_targets(&mut cursor), vec![3]);
    }

    #[test]
    fn test_edge_materialization() {
        let db = sample_graph_db(false);
        let store = RelationStore::initialize(&db, &RelationTableAdapter::default()).unwrap();
        let mut cursor = store.outgoing(4, None).unwrap();
        assert!(cursor.move_next().unwrap());
        let edge = cursor.edge().unwrap();
        assert_eq!(edge.origin, 4);
        assert_eq!(edge.target, 5);
        assert!(edge.weight.is_some());
    }
}

//! Graph store layered over the b-tree: concept (node) and relation
//! (edge) tables with index-accelerated adjacency and BFS traversal.
//!
//! Adapters map the logical node/edge roles onto physical column names so
//! any schema with the right shape can back the graph. Stores pick an
//! index at initialization time (first index whose leading column matches
//! the role) and fall back to full scans with early exit when none exists.

use crate::error::{Error, ErrorCode, Result};
use crate::schema::{IndexInfo, SharcSchema, TableInfo};
use crate::storage::btree::cursor::TableCursor;
use crate::storage::record;
use crate::types::{Pgno, RowId, Value};

pub mod concept;
pub mod relation;
pub mod traverse;

pub use concept::{Concept, ConceptStore};
pub use relation::{Edge, EdgeCursor, EdgeEndpoint, RelationStore};
pub use traverse::{
    Direction, GraphTraversal, StopReason, TraversalNode, TraversalResult, TraverseOptions,
};

// ============================================================================
// Adapters
// ============================================================================

/// Maps logical concept (node) roles to physical column names.
#[derive(Debug, Clone)]
pub struct ConceptTableAdapter {
    /// Node table name
    pub table: String,
    /// String identifier column
    pub col_id: String,
    /// Integer node-key column
    pub col_key: String,
    /// Integer node-type column
    pub col_kind: String,
    /// Opaque/JSON data column
    pub col_data: String,
    /// Optional content-version column
    pub col_cvn: Option<String>,
    /// Optional local-version column
    pub col_lvn: Option<String>,
    /// Optional sync-status column
    pub col_sync_status: Option<String>,
    /// Optional update-timestamp column (unix seconds)
    pub col_updated_at: Option<String>,
    /// Optional alias column
    pub col_alias: Option<String>,
    /// Optional token-estimate column
    pub col_token_estimate: Option<String>,
}

impl Default for ConceptTableAdapter {
    fn default() -> Self {
        ConceptTableAdapter {
            table: "concepts".into(),
            col_id: "id".into(),
            col_key: "key".into(),
            col_kind: "type".into(),
            col_data: "data".into(),
            col_cvn: Some("cvn".into()),
            col_lvn: Some("lvn".into()),
            col_sync_status: Some("sync_status".into()),
            col_updated_at: Some("updated_at".into()),
            col_alias: Some("alias".into()),
            col_token_estimate: Some("token_estimate".into()),
        }
    }
}

/// Maps logical relation (edge) roles to physical column names.
#[derive(Debug, Clone)]
pub struct RelationTableAdapter {
    /// Edge table name
    pub table: String,
    /// Edge identifier column
    pub col_id: String,
    /// Origin node-key column
    pub col_origin: String,
    /// Target node-key column
    pub col_target: String,
    /// Integer edge-kind column
    pub col_kind: String,
    /// Opaque/JSON data column
    pub col_data: String,
    /// Optional weight column
    pub col_weight: Option<String>,
    /// Optional content-version column
    pub col_cvn: Option<String>,
    /// Optional local-version column
    pub col_lvn: Option<String>,
    /// Optional sync-status column
    pub col_sync_status: Option<String>,
}

impl Default for RelationTableAdapter {
    fn default() -> Self {
        RelationTableAdapter {
            table: "relations".into(),
            col_id: "id".into(),
            col_origin: "origin_key".into(),
            col_target: "target_key".into(),
            col_kind: "kind".into(),
            col_data: "data".into(),
            col_weight: Some("weight".into()),
            col_cvn: Some("cvn".into()),
            col_lvn: Some("lvn".into()),
            col_sync_status: Some("sync_status".into()),
        }
    }
}

// ============================================================================
// Shared resolution and decode plumbing
// ============================================================================

/// Required column ordinal, by role.
pub(crate) fn require_ordinal(table: &TableInfo, column: &str, role: &str) -> Result<usize> {
    table.column_ordinal(column).ok_or_else(|| {
        Error::with_message(
            ErrorCode::NotFound,
            format!(
                "table '{}' has no column '{}' for the {} role",
                table.name, column, role
            ),
        )
    })
}

/// Optional column ordinal.
pub(crate) fn optional_ordinal(table: &TableInfo, column: &Option<String>) -> Option<usize> {
    column.as_deref().and_then(|c| table.column_ordinal(c))
}

/// First index on `table` whose leading column is `column`.
pub(crate) fn pick_index<'s>(
    schema: &'s SharcSchema,
    table: &'s str,
    column: &str,
) -> Option<&'s IndexInfo> {
    schema.indexes_on(table).find(|idx| {
        idx.columns
            .first()
            .is_some_and(|leading| leading.eq_ignore_ascii_case(column))
    })
}

/// Per-cursor decode scratch: serial types and precomputed offsets,
/// allocated once per cursor and reused for every row.
pub(crate) struct RowScratch {
    serial_types: Vec<u64>,
    offsets: Vec<usize>,
    count: usize,
    rowid: RowId,
}

impl RowScratch {
    pub(crate) fn new() -> Self {
        RowScratch {
            serial_types: vec![0; 16],
            offsets: vec![0; 16],
            count: 0,
            rowid: 0,
        }
    }

    /// Decode the current row's header and column offsets.
    pub(crate) fn load(&mut self, cursor: &mut TableCursor<'_>) -> Result<()> {
        let header = loop {
            let payload = cursor.payload()?;
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
        self.count = header.column_count;
        self.rowid = cursor.rowid();
        Ok(())
    }

    /// O(1) integer column, honoring the rowid alias for NULL.
    pub(crate) fn integer_at(&self, cursor: &mut TableCursor<'_>, ordinal: usize) -> Result<i64> {
        if ordinal >= self.count {
            return Ok(0);
        }
        let serial_type = self.serial_types[ordinal];
        let offset = self.offsets[ordinal];
        let payload = cursor.payload()?;
        Ok(
            match record::decode_column(payload, serial_type, offset)? {
                record::ValueRef::Null => self.rowid,
                other => other.as_i64(),
            },
        )
    }

    /// O(1) optional integer column (NULL stays None).
    pub(crate) fn opt_integer_at(
        &self,
        cursor: &mut TableCursor<'_>,
        ordinal: Option<usize>,
    ) -> Result<Option<i64>> {
        let Some(ordinal) = ordinal else {
            return Ok(None);
        };
        if ordinal >= self.count {
            return Ok(None);
        }
        let serial_type = self.serial_types[ordinal];
        let offset = self.offsets[ordinal];
        let payload = cursor.payload()?;
        Ok(
            match record::decode_column(payload, serial_type, offset)? {
                record::ValueRef::Null => None,
                other => Some(other.as_i64()),
            },
        )
    }

    /// Owned value of a column.
    pub(crate) fn value_at(&self, cursor: &mut TableCursor<'_>, ordinal: usize) -> Result<Value> {
        if ordinal >= self.count {
            return Ok(Value::Null);
        }
        let serial_type = self.serial_types[ordinal];
        let offset = self.offsets[ordinal];
        let payload = cursor.payload()?;
        record::decode_column(payload, serial_type, offset)?.to_owned()
    }

    pub(crate) fn rowid(&self) -> RowId {
        self.rowid
    }
}

/// Root page of a table, through the schema.
pub(crate) fn table_root(schema: &SharcSchema, table: &str) -> Result<Pgno> {
    Ok(schema.require_table(table)?.root_page)
}

// ============================================================================
// Shared test fixture
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use crate::database::{Database, Transaction};
    use crate::schema::SCHEMA_ROOT_PAGE;
    use crate::storage::btree::{init_page, PageKind, PAGE_HEADER_SIZE_LEAF};
    use crate::storage::record::{self, RecordBuilder};
    use crate::storage::write_u16;
    use crate::types::{RowId, Value};

    /// (key, id, kind) per node.
    pub const NODES: &[(i64, &str, i64)] = &[
        (1, "node-1", 100),
        (2, "node-2", 100),
        (3, "node-3", 200),
        (4, "node-4", 200),
        (5, "node-5", 300),
    ];

    /// (origin, target, kind) per edge, in insertion order.
    pub const EDGES: &[(i64, i64, i64)] =
        &[(1, 2, 10), (1, 3, 20), (2, 4, 10), (3, 4, 20), (4, 5, 30)];

    /// A memory database with the sample graph; optionally with key and
    /// origin indexes built by hand (single leaf each).
    pub fn sample_graph_db(with_indexes: bool) -> Database {
        let mut db = Database::create_memory().unwrap();
        let mut txn = db.begin_transaction().unwrap();

        txn.create_table("concepts", "key INTEGER, id TEXT, type INTEGER, data TEXT")
            .unwrap();
        for &(key, id, kind) in NODES {
            txn.insert(
                "concepts",
                None,
                &[
                    Value::Integer(key),
                    id.into(),
                    Value::Integer(kind),
                    format!("data-{}", key).into(),
                ],
            )
            .unwrap();
        }

        txn.create_table(
            "relations",
            "id INTEGER PRIMARY KEY, origin_key INTEGER, target_key INTEGER, kind INTEGER, data TEXT, weight REAL",
        )
        .unwrap();
        for &(origin, target, kind) in EDGES {
            txn.insert(
                "relations",
                None,
                &[
                    Value::Null,
                    Value::Integer(origin),
                    Value::Integer(target),
                    Value::Integer(kind),
                    format!("edge {}->{}", origin, target).into(),
                    Value::Real(0.1 * (origin + target) as f64),
                ],
            )
            .unwrap();
        }

        if with_indexes {
            let key_entries: Vec<(Value, RowId)> = NODES
                .iter()
                .enumerate()
                .map(|(i, &(key, _, _))| (Value::Integer(key), i as RowId + 1))
                .collect();
            build_index(
                &mut txn,
                "idx_concepts_key",
                "concepts",
                "key",
                &key_entries,
            );
            let origin_entries: Vec<(Value, RowId)> = EDGES
                .iter()
                .enumerate()
                .map(|(i, &(origin, _, _))| (Value::Integer(origin), i as RowId + 1))
                .collect();
            build_index(
                &mut txn,
                "idx_relations_origin",
                "relations",
                "origin_key",
                &origin_entries,
            );
        }

        txn.commit().unwrap();
        db
    }

    /// Write a single index leaf holding `entries` (sorted by caller) and
    /// register it in the schema.
    fn build_index(
        txn: &mut Transaction<'_>,
        name: &str,
        table: &str,
        column: &str,
        entries: &[(Value, RowId)],
    ) {
        let root = txn.allocate_page().unwrap();
        {
            let page = txn.page_for_write(root).unwrap();
            let usable = page.len() as u32;
            init_page(page, 0, PageKind::IndexLeaf, usable);
        }
        for (value, rowid) in entries {
            let mut b = RecordBuilder::new();
            b.push(value);
            b.push(&Value::Integer(*rowid));
            let payload = b.finish();
            let mut cell = Vec::new();
            record::write_varint(payload.len() as u64, &mut cell);
            cell.extend_from_slice(&payload);

            let page = txn.page_for_write(root).unwrap();
            let hdr = crate::storage::btree::PageHeader::parse(page, 0).unwrap();
            let content = hdr.content_start as usize - cell.len();
            page[content..content + cell.len()].copy_from_slice(&cell);
            write_u16(
                page,
                PAGE_HEADER_SIZE_LEAF + hdr.cell_count as usize * 2,
                content as u16,
            );
            crate::storage::btree::PageHeader {
                cell_count: hdr.cell_count + 1,
                content_start: content as u32,
                ..hdr
            }
            .encode(page, 0);
        }

        let sql = format!("CREATE INDEX {} ON {} ({})", name, table, column);
        txn.insert_at_root(
            SCHEMA_ROOT_PAGE,
            None,
            &[
                Value::Text("index".into()),
                Value::Text(name.into()),
                Value::Text(table.into()),
                Value::Integer(root as i64),
                Value::Text(sql),
            ],
        )
        .unwrap();
    }
}

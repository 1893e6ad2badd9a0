//! Concept (node) store: lookups by integer key or string id.

use chrono::{DateTime, TimeZone, Utc};

use crate::database::Database;
use crate::error::Result;
use crate::storage::btree::cursor::{IndexCursor, TableCursor};
use crate::types::{Pgno, RowId, Value};

use super::{
    optional_ordinal, pick_index, require_ordinal, table_root, ConceptTableAdapter, RowScratch,
};

/// A materialized graph node.
#[derive(Debug, Clone)]
pub struct Concept {
    /// Rowid of the backing row
    pub rowid: RowId,
    /// String identifier
    pub id: String,
    /// Integer node key
    pub key: i64,
    /// Integer node type
    pub kind: i64,
    /// Opaque/JSON payload
    pub data: Value,
    /// Content version, when tracked
    pub cvn: Option<i64>,
    /// Local version, when tracked
    pub lvn: Option<i64>,
    /// Sync status, when tracked
    pub sync_status: Option<i64>,
    /// Last update time, when tracked
    pub updated_at: Option<DateTime<Utc>>,
    /// Alias, when present
    pub alias: Option<String>,
    /// Token estimate, when tracked
    pub token_estimate: Option<i64>,
}

struct Ordinals {
    id: usize,
    key: usize,
    kind: usize,
    data: usize,
    cvn: Option<usize>,
    lvn: Option<usize>,
    sync_status: Option<usize>,
    updated_at: Option<usize>,
    alias: Option<usize>,
    token_estimate: Option<usize>,
}

/// Node store over a concept table.
pub struct ConceptStore<'db> {
    db: &'db Database,
    root: Pgno,
    ordinals: Ordinals,
    key_index: Option<Pgno>,
    id_index: Option<Pgno>,
}

impl<'db> ConceptStore<'db> {
    /// Resolve the adapter against the schema and pick lookup indexes:
    /// the first index whose leading column is the node key (and likewise
    /// for the string id).
    pub fn initialize(db: &'db Database, adapter: &ConceptTableAdapter) -> Result<Self> {
        let schema = db.schema()?;
        let table = schema.require_table(&adapter.table)?;
        let ordinals = Ordinals {
            id: require_ordinal(table, &adapter.col_id, "node id")?,
            key: require_ordinal(table, &adapter.col_key, "node key")?,
            kind: require_ordinal(table, &adapter.col_kind, "node type")?,
            data: require_ordinal(table, &adapter.col_data, "node data")?,
            cvn: optional_ordinal(table, &adapter.col_cvn),
            lvn: optional_ordinal(table, &adapter.col_lvn),
            sync_status: optional_ordinal(table, &adapter.col_sync_status),
            updated_at: optional_ordinal(table, &adapter.col_updated_at),
            alias: optional_ordinal(table, &adapter.col_alias),
            token_estimate: optional_ordinal(table, &adapter.col_token_estimate),
        };
        Ok(ConceptStore {
            root: table_root(&schema, &adapter.table)?,
            key_index: pick_index(&schema, &adapter.table, &adapter.col_key)
                .map(|idx| idx.root_page),
            id_index: pick_index(&schema, &adapter.table, &adapter.col_id)
                .map(|idx| idx.root_page),
            db,
            ordinals,
        })
    }

    /// Fetch by integer node key.
    pub fn get_by_key(&self, key: i64) -> Result<Option<Concept>> {
        match self.key_index {
            Some(index_root) => self.get_via_index(index_root, &Value::Integer(key), |c| {
                c.key == key
            }),
            None => self.scan_first(|c| c.key == key),
        }
    }

    /// Fetch by string identifier.
    pub fn get_by_id(&self, id: &str) -> Result<Option<Concept>> {
        match self.id_index {
            Some(index_root) => {
                self.get_via_index(index_root, &Value::Text(id.into()), |c| c.id == id)
            }
            None => self.scan_first(|c| c.id == id),
        }
    }

    /// Binary-search the index for the first matching entry, then follow
    /// the stored rowid back into the concept table.
    fn get_via_index(
        &self,
        index_root: Pgno,
        needle: &Value,
        matches: impl Fn(&Concept) -> bool,
    ) -> Result<Option<Concept>> {
        let source = self.db.reader_source()?;
        let usable = self.db.usable_page_size();
        let mut index = IndexCursor::new(source, index_root, usable);
        if !index.seek_first(std::slice::from_ref(needle))? {
            return Ok(None);
        }
        let rowid = index.table_rowid()?;

        let mut cursor = TableCursor::new(source, self.root, usable);
        if !cursor.seek(rowid)? {
            return Ok(None);
        }
        let mut scratch = RowScratch::new();
        scratch.load(&mut cursor)?;
        let concept = self.decode(&mut cursor, &scratch)?;
        // seek_first is a lower bound; confirm the hit is exact.
        Ok(if matches(&concept) { Some(concept) } else { None })
    }

    /// Full scan with early exit, for tables without a usable index.
    fn scan_first(&self, matches: impl Fn(&Concept) -> bool) -> Result<Option<Concept>> {
        let mut cursor =
            TableCursor::new(self.db.reader_source()?, self.root, self.db.usable_page_size());
        let mut scratch = RowScratch::new();
        while cursor.move_next()? {
            scratch.load(&mut cursor)?;
            let concept = self.decode(&mut cursor, &scratch)?;
            if matches(&concept) {
                return Ok(Some(concept));
            }
        }
        Ok(None)
    }

    fn decode(&self, cursor: &mut TableCursor<'_>, scratch: &RowScratch) -> Result<Concept> {
        let o = &self.ordinals;
        let updated_at = scratch
            .opt_integer_at(cursor, o.updated_at)?
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        let alias = match o.alias {
            Some(ordinal) => match scratch.value_at(cursor, ordinal)? {
                Value::Null => None,
                other => Some(other.to_text()),
            },
            None => None,
        };
        Ok(Concept {
            rowid: scratch.rowid(),
            id: scratch.value_at(cursor, o.id)?.to_text(),
            key: scratch.integer_at(cursor, o.key)?,
            kind: scratch.integer_at(cursor, o.kind)?,
            data: scratch.value_at(cursor, o.data)?,
            cvn: scratch.opt_integer_at(cursor, o.cvn)?,
            lvn: scratch.opt_integer_at(cursor, o.lvn)?,
            sync_status: scratch.opt_integer_at(cursor, o.sync_status)?,
            updated_at,
            alias,
            token_estimate: scratch.opt_integer_at(cursor, o.token_estimate)?,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Schema loader: walks the `sqlite_schema` table rooted at page 1 and
//! parses CREATE statements into table, index, and view metadata.
//!
//! The SQL parsing here is deliberately shallow: it recovers column names,
//! declared-type affinity, PRIMARY KEY / NOT NULL flags, index key columns,
//! and the merged 128-bit column pairs (`name__hi`/`name__lo` ids and
//! `name__dhi`/`name__dlo` decimals). It tolerates whitespace, quoted and
//! bracketed identifiers, and table-level constraint clauses.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::cursor::TableCursor;
use crate::storage::record;
use crate::storage::source::PageSource;
use crate::types::Pgno;

/// Root page of the schema table.
pub const SCHEMA_ROOT_PAGE: Pgno = 1;

/// Declared-type affinity, per the standard affinity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Contains "INT"
    Integer,
    /// Contains "CHAR", "CLOB", or "TEXT"
    Text,
    /// "BLOB" or no declared type
    Blob,
    /// Contains "REAL", "FLOA", or "DOUB"
    Real,
    /// Everything else
    Numeric,
}

impl Affinity {
    /// Affinity of a declared type string.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

/// One table column.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column name as declared (case preserved)
    pub name: String,
    /// Declared type text (may be empty)
    pub declared_type: String,
    /// Resolved affinity
    pub affinity: Affinity,
    /// PRIMARY KEY flag
    pub primary_key: bool,
    /// NOT NULL flag
    pub not_null: bool,
}

/// Which flavor of merged 128-bit pair a column participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WideKind {
    /// `name__hi` / `name__lo`: a 128-bit identifier
    Id128,
    /// `name__dhi` / `name__dlo`: a 128-bit decimal
    Decimal128,
}

/// A logical 128-bit column split across two physical integer columns.
#[derive(Debug, Clone)]
pub struct WideColumn {
    /// Logical name (the shared prefix)
    pub logical_name: String,
    /// Pair flavor
    pub kind: WideKind,
    /// Ordinal of the high half
    pub hi_ordinal: usize,
    /// Ordinal of the low half
    pub lo_ordinal: usize,
}

/// One table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table name (case preserved)
    pub name: String,
    /// Root page of the table b-tree
    pub root_page: Pgno,
    /// Original CREATE statement
    pub sql: String,
    /// Columns in declaration order
    pub columns: Vec<ColumnInfo>,
    /// Merged 128-bit pairs found among the columns
    pub wide_columns: Vec<WideColumn>,
}

impl TableInfo {
    /// Ordinal of a column by name, case-insensitive.
    pub fn column_ordinal(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// One index.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Index name
    pub name: String,
    /// Table the index covers
    pub table: String,
    /// Root page of the index b-tree
    pub root_page: Pgno,
    /// CREATE statement; absent for auto-created indexes
    pub sql: Option<String>,
    /// Key column names in index order
    pub columns: Vec<String>,
}

/// One view (definition only; views have no storage).
#[derive(Debug, Clone)]
pub struct ViewInfo {
    /// View name
    pub name: String,
    /// CREATE statement
    pub sql: String,
}

/// Full parsed schema with case-insensitive name lookup.
#[derive(Debug, Default)]
pub struct SharcSchema {
    tables: BTreeMap<String, TableInfo>,
    indexes: BTreeMap<String, IndexInfo>,
    views: BTreeMap<String, ViewInfo>,
}

impl SharcSchema {
    /// Walk `sqlite_schema` and parse every row.
    pub fn load(source: &dyn PageSource, usable: u32) -> Result<Self> {
        let mut schema = SharcSchema::default();
        let mut cursor = TableCursor::new(source, SCHEMA_ROOT_PAGE, usable);
        let mut serial_types = [0u64; 8];
        let mut offsets = [0usize; 8];

        while cursor.move_next()? {
            let payload = cursor.payload()?;
            let header = record::read_header(payload, &mut serial_types)?;
            if header.column_count < 5 {
                return Err(Error::corrupt("schema row with fewer than 5 columns"));
            }
            record::column_offsets(
                &serial_types[..header.column_count],
                header.body_start,
                &mut offsets[..header.column_count],
            )?;

            let text_at = |i: usize| -> Result<String> {
                match record::decode_column(payload, serial_types[i], offsets[i])? {
                    record::ValueRef::Text(bytes) => Ok(std::str::from_utf8(bytes)
                        .map_err(|_| Error::corrupt("schema text is not UTF-8"))?
                        .to_string()),
                    record::ValueRef::Null => Ok(String::new()),
                    _ => Err(Error::corrupt("schema column has unexpected type")),
                }
            };

            let kind = text_at(0)?;
            let name = text_at(1)?;
            let tbl_name = text_at(2)?;
            let root_page =
                record::decode_column(payload, serial_types[3], offsets[3])?.as_i64() as Pgno;
            let sql = text_at(4)?;

            match kind.as_str() {
                "table" => {
                    let columns = parse_create_table_columns(&sql)?;
                    let wide_columns = detect_wide_columns(&columns);
                    schema.tables.insert(
                        name.to_ascii_lowercase(),
                        TableInfo {
                            name,
                            root_page,
                            sql,
                            columns,
                            wide_columns,
                        },
                    );
                }
                "index" => {
                    let columns = if sql.is_empty() {
                        Vec::new()
                    } else {
                        parse_create_index_columns(&sql)?
                    };
                    schema.indexes.insert(
                        name.to_ascii_lowercase(),
                        IndexInfo {
                            name,
                            table: tbl_name,
                            root_page,
                            sql: if sql.is_empty() { None } else { Some(sql) },
                            columns,
                        },
                    );
                }
                "view" => {
                    schema
                        .views
                        .insert(name.to_ascii_lowercase(), ViewInfo { name, sql });
                }
                other => {
                    debug!("ignoring schema row of kind '{}'", other);
                }
            }
        }
        Ok(schema)
    }

    /// Table lookup, case-insensitive.
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    /// Index lookup, case-insensitive.
    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.get(&name.to_ascii_lowercase())
    }

    /// View lookup, case-insensitive.
    pub fn view(&self, name: &str) -> Option<&ViewInfo> {
        self.views.get(&name.to_ascii_lowercase())
    }

    /// All tables.
    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    /// All indexes.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indexes.values()
    }

    /// All views.
    pub fn views(&self) -> impl Iterator<Item = &ViewInfo> {
        self.views.values()
    }

    /// Indexes whose subject table is `table`, case-insensitive.
    pub fn indexes_on<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a IndexInfo> {
        self.indexes
            .values()
            .filter(move |idx| idx.table.eq_ignore_ascii_case(table))
    }

    /// Required table lookup.
    pub fn require_table(&self, name: &str) -> Result<&TableInfo> {
        self.table(name)
            .ok_or_else(|| Error::with_message(ErrorCode::NotFound, format!("no table '{}'", name)))
    }
}

// ============================================================================
// CREATE statement parsing
// ============================================================================

/// Slice out the parenthesized body of a CREATE statement.
fn paren_body(sql: &str) -> Result<&str> {
    let open = sql
        .find('(')
        .ok_or_else(|| Error::corrupt("CREATE statement without column list"))?;
    let mut depth = 0usize;
    for (i, ch) in sql[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&sql[open + 1..open + i]);
                }
            }
            _ => {}
        }
    }
    Err(Error::corrupt("unbalanced parentheses in CREATE statement"))
}

/// Split on commas at parenthesis depth zero, respecting quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut quote: Option<char> = None;
    for (i, ch) in body.char_indices() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '[' => quote = Some(']'),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(&body[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Take the leading identifier of a column definition, unquoting as needed.
/// Returns (identifier, rest).
fn take_identifier(def: &str) -> Option<(String, &str)> {
    let def = def.trim_start();
    let mut chars = def.char_indices();
    let (_, first) = chars.next()?;
    match first {
        '"' | '\'' | '`' => {
            let close = def[1..].find(first)? + 1;
            Some((def[1..close].to_string(), &def[close + 1..]))
        }
        '[' => {
            let close = def.find(']')?;
            Some((def[1..close].to_string(), &def[close + 1..]))
        }
        _ => {
            let end = def
                .find(|c: char| c.is_whitespace() || c == '(' || c == ',')
                .unwrap_or(def.len());
            if end == 0 {
                None
            } else {
                Some((def[..end].to_string(), &def[end..]))
            }
        }
    }
}

const TABLE_CONSTRAINT_KEYWORDS: [&str; 5] =
    ["PRIMARY", "UNIQUE", "CHECK", "FOREIGN", "CONSTRAINT"];

const COLUMN_CONSTRAINT_KEYWORDS: [&str; 9] = [
    "PRIMARY",
    "NOT",
    "NULL",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
];

/// Parse the column list of a CREATE TABLE statement.
pub fn parse_create_table_columns(sql: &str) -> Result<Vec<ColumnInfo>> {
    let body = paren_body(sql)?;
    let mut columns = Vec::new();
    for def in split_top_level(body) {
        let def = def.trim();
        if def.is_empty() {
            continue;
        }
        let Some((name, rest)) = take_identifier(def) else {
            continue;
        };
        if TABLE_CONSTRAINT_KEYWORDS
            .iter()
            .any(|kw| name.eq_ignore_ascii_case(kw))
        {
            continue;
        }

        // Declared type: tokens up to the first constraint keyword.
        let mut declared = Vec::new();
        for token in rest.split_whitespace() {
            let bare = token.trim_matches(|c: char| c == '(' || c == ')' || c == ',');
            if COLUMN_CONSTRAINT_KEYWORDS
                .iter()
                .any(|kw| bare.eq_ignore_ascii_case(kw))
            {
                break;
            }
            declared.push(token);
        }
        let declared_type = declared.join(" ");

        let upper = rest.to_ascii_uppercase();
        columns.push(ColumnInfo {
            affinity: Affinity::from_declared(&declared_type),
            declared_type,
            primary_key: upper.contains("PRIMARY KEY"),
            not_null: upper.contains("NOT NULL"),
            name,
        });
    }
    Ok(columns)
}

/// Parse the key column names of a CREATE INDEX statement.
pub fn parse_create_index_columns(sql: &str) -> Result<Vec<String>> {
    let body = paren_body(sql)?;
    let mut columns = Vec::new();
    for def in split_top_level(body) {
        let def = def.trim();
        if def.is_empty() {
            continue;
        }
        if let Some((name, _)) = take_identifier(def) {
            columns.push(name);
        }
    }
    Ok(columns)
}

/// Pair `x__hi`/`x__lo` and `x__dhi`/`x__dlo` physical columns into
/// logical 128-bit columns.
pub fn detect_wide_columns(columns: &[ColumnInfo]) -> Vec<WideColumn> {
    let ordinal_of = |suffixed: &str| -> Option<usize> {
        columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(suffixed))
    };

    let mut wide = Vec::new();
    for (hi_ordinal, col) in columns.iter().enumerate() {
        let lower = col.name.to_ascii_lowercase();
        let (prefix, kind, lo_suffix) = if let Some(p) = lower.strip_suffix("__dhi") {
            (p.to_string(), WideKind::Decimal128, "__dlo")
        } else if let Some(p) = lower.strip_suffix("__hi") {
            (p.to_string(), WideKind::Id128, "__lo")
        } else {
            continue;
        };
        if let Some(lo_ordinal) = ordinal_of(&format!("{}{}", prefix, lo_suffix)) {
            wide.push(WideColumn {
                logical_name: prefix,
                kind,
                hi_ordinal,
                lo_ordinal,
            });
        }
    }
    wide
}

// ============================================================================
// Tests
// ============================================================================

//! Layers: named forward-only cursors over any row source, composed from
//! projection and filter decorators.
//!
//! A layer definition names its base (a table or another layer), an
//! optional column projection (ordinal remap), and optional row filters.
//! Chains resolve at open time, terminate at a table leaf, are capped at
//! depth 10, and reject cycles.

use std::collections::{BTreeMap, HashSet};

use crate::database::{Database, RowFilter, TableReader};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{RowId, Value};

/// Deepest allowed decorator chain.
pub const MAX_LAYER_DEPTH: usize = 10;

/// Forward-only row source: the surface shared by table readers and layer
/// decorators.
pub trait RowSource {
    /// Number of output columns.
    fn column_count(&self) -> usize;

    /// Name of output column `i`.
    fn column_name(&self, i: usize) -> Option<&str>;

    /// Advance to the next row; false at the end.
    fn move_next(&mut self) -> Result<bool>;

    /// Materialize output column `i` of the current row.
    fn value(&mut self, i: usize) -> Result<Value>;

    /// Rowid of the current row, where the source has one.
    fn rowid(&self) -> Option<RowId> {
        None
    }
}

impl RowSource for TableReader<'_> {
    fn column_count(&self) -> usize {
        self.output_columns()
    }

    fn column_name(&self, i: usize) -> Option<&str> {
        TableReader::column_name(self, i)
    }

    fn move_next(&mut self) -> Result<bool> {
        TableReader::move_next(self)
    }

    fn value(&mut self, i: usize) -> Result<Value> {
        TableReader::value(self, i)
    }

    fn rowid(&self) -> Option<RowId> {
        Some(TableReader::rowid(self))
    }
}

// ============================================================================
// Definitions and registry
// ============================================================================

/// What a layer sits on.
#[derive(Debug, Clone)]
pub enum LayerBase {
    /// A physical table
    Table(String),
    /// Another named layer
    Layer(String),
}

/// Declarative layer definition.
#[derive(Debug, Clone)]
pub struct LayerDef {
    /// Layer name (case-insensitive key)
    pub name: String,
    /// Base row source
    pub base: LayerBase,
    /// Optional projection: output column names, in order
    pub projection: Option<Vec<String>>,
    /// Row filters applied before projection
    pub filters: Vec<RowFilter>,
}

/// Named layer definitions with cycle-safe resolution.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    defs: BTreeMap<String, LayerDef>,
}

impl LayerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        LayerRegistry::default()
    }

    /// Register a definition. Duplicate names are a misuse error.
    pub fn register(&mut self, def: LayerDef) -> Result<()> {
        let key = def.name.to_ascii_lowercase();
        if self.defs.contains_key(&key) {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("layer '{}' already registered", def.name),
            ));
        }
        self.defs.insert(key, def);
        Ok(())
    }

    /// Definition lookup, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&LayerDef> {
        self.defs.get(&name.to_ascii_lowercase())
    }

    /// Open a named layer as a cursor over `db`. Resolves the chain down
    /// to its table leaf, rejecting cycles and over-deep chains.
    pub fn open<'db>(&self, db: &'db Database, name: &str) -> Result<LayerCursor<'db>> {
        let mut visited = HashSet::new();
        let source = self.resolve(db, name, &mut visited, 0)?;
        Ok(LayerCursor {
            name: name.to_string(),
            inner: source,
        })
    }

    fn resolve<'db>(
        &self,
        db: &'db Database,
        name: &str,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> Result<Box<dyn RowSource + 'db>> {
        if depth >= MAX_LAYER_DEPTH {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("layer chain deeper than {}", MAX_LAYER_DEPTH),
            ));
        }
        let key = name.to_ascii_lowercase();
        if !visited.insert(key.clone()) {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("layer cycle through '{}'", name),
            ));
        }
        let def = self.defs.get(&key).ok_or_else(|| {
            Error::with_message(ErrorCode::NotFound, format!("no layer '{}'", name))
        })?;

        let mut source: Box<dyn RowSource + 'db> = match &def.base {
            LayerBase::Table(table) => Box::new(db.create_reader(table, None, Vec::new())?),
            LayerBase::Layer(inner) => self.resolve(db, inner, visited, depth + 1)?,
        };

        if !def.filters.is_empty() {
            source = Box::new(FilterLayer::over(source, &def.filters)?);
        }
        if let Some(names) = &def.projection {
            source = Box::new(ProjectLayer::over(source, names)?);
        }
        Ok(source)
    }
}

/// An opened layer chain.
impl<'db> std::fmt::Debug for LayerCursor<'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCursor").field("name", &self.name).finish()
    }
}

pub struct LayerCursor<'db> {
    name: String,
    inner: Box<dyn RowSource + 'db>,
}

impl LayerCursor<'_> {
    /// The layer's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RowSource for LayerCursor<'_> {
    fn column_count(&self) -> usize {
        self.inner.column_count()
    }

    fn column_name(&self, i: usize) -> Option<&str> {
        self.inner.column_name(i)
    }

    fn move_next(&mut self) -> Result<bool> {
        self.inner.move_next()
    }

    fn value(&mut self, i: usize) -> Result<Value> {
        self.inner.value(i)
    }

    fn rowid(&self) -> Option<RowId> {
        self.inner.rowid()
    }
}

// ============================================================================
// Decorators
// ============================================================================

/// Ordinal-remapping projection decorator.
struct ProjectLayer<'db> {
    inner: Box<dyn RowSource + 'db>,
    ordinals: Vec<usize>,
    names: Vec<String>,
}

impl<'db> ProjectLayer<'db> {
    fn over(inner: Box<dyn RowSource + 'db>, names: &[String]) -> Result<Self> {
        let mut ordinals = Vec::with_capacity(names.len());
        for name in names {
            let ordinal = (0..inner.column_count())
                .find(|&i| {
                    inner
                        .column_name(i)
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
                })
                .ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::NotFound,
                        format!("no column '{}' in layer base", name),
                    )
                })?;
            ordinals.push(ordinal);
        }
        Ok(ProjectLayer {
            inner,
            ordinals,
            names: names.to_vec(),
        })
    }
}

impl RowSource for ProjectLayer<'_> {
    fn column_count(&self) -> usize {
        self.ordinals.len()
    }

    fn column_name(&self, i: usize) -> Option<&str> {
        self.names.get(i).map(String::as_str)
    }

    fn move_next(&mut self) -> Result<bool> {
        self.inner.move_next()
    }

    fn value(&mut self, i: usize) -> Result<Value> {
        let ordinal = *self
            .ordinals
            .get(i)
            .ok_or_else(|| Error::range("projection ordinal out of range"))?;
        self.inner.value(ordinal)
    }

    fn rowid(&self) -> Option<RowId> {
        self.inner.rowid()
    }
}

/// Row-predicate decorator.
struct FilterLayer<'db> {
    inner: Box<dyn RowSource + 'db>,
    filters: Vec<(usize, RowFilter)>,
}

impl<'db> FilterLayer<'db> {
    fn over(inner: Box<dyn RowSource + 'db>, filters: &[RowFilter]) -> Result<Self> {
        let mut resolved = Vec::with_capacity(filters.len());
        for filter in filters {
            let ordinal = (0..inner.column_count())
                .find(|&i| {
                    inner
                        .column_name(i)
                        .is_some_and(|n| n.eq_ignore_ascii_case(&filter.column))
                })
                .ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::NotFound,
                        format!("no column '{}' in layer base", filter.column),
                    )
                })?;
            resolved.push((ordinal, filter.clone()));
        }
        Ok(FilterLayer {
            inner,
            filters: resolved,
        })
    }
}

impl RowSource for FilterLayer<'_> {
    fn column_count(&self) -> usize {
        self.inner.column_count()
    }

    fn column_name(&self, i: usize) -> Option<&str> {
        self.inner.column_name(i)
    }

    fn move_next(&mut self) -> Result<bool> {
        'rows: loop {
            if !self.inner.move_next()? {
                return Ok(false);
            }
            for (ordinal, filter) in &self.filters {
                let actual = self.inner.value(*ordinal)?;
                if !filter.passes(&actual) {
                    continue 'rows;
                }
            }
            return Ok(true);
        }
    }

    fn value(&mut self, i: usize) -> Result<Value> {
        self.inner.value(i)
    }

    fn rowid(&self) -> Option<RowId> {
        self.inner.rowid()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::FilterOp;

    fn sample_db() -> Database {
        let mut db = Database::create_memory().unwrap();
        let mut txn = db.begin_transaction().unwrap();
        txn.create_table("metrics", "id INTEGER PRIMARY KEY, name TEXT, score INTEGER")
            .unwrap();
        for (name, score) in [("a", 10), ("b", 20), ("c", 30)] {
            txn.insert(
                "metrics",
                None,
                &[Value::Null, name.into(), Value::Integer(score)],
            )
            .unwrap();
        }
        txn.commit().unwrap();
        db
    }

    fn registry() -> LayerRegistry {
        let mut reg = LayerRegistry::new();
        reg.register(LayerDef {
            name: "high_scores".into(),
            base: LayerBase::Table("metrics".into()),
            projection: None,
            filters: vec![RowFilter::new("score", FilterOp::Ge, Value::Integer(20))],
        })
        .unwrap();
        reg.register(LayerDef {
            name: "high_names".into(),
            base: LayerBase::Layer("high_scores".into()),
            projection: Some(vec!["name".into()]),
            filters: Vec::new(),
        })
        .unwrap();
        reg
    }

    #[test]
    fn test_filter_layer() {
        let db = sample_db();
        let reg = registry();
        let mut layer = reg.open(&db, "high_scores").unwrap();
        let mut names = Vec::new();
        while layer.move_next().unwrap() {
            names.push(layer.value(1).unwrap().to_text());
        }
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_projection_over_filter() {
        let db = sample_db();
        let reg = registry();
        let mut layer = reg.open(&db, "high_names").unwrap();
        assert_eq!(layer.column_count(), 1);
        assert_eq!(layer.column_name(0), Some("name"));
        assert!(layer.move_next().unwrap());
        assert_eq!(layer.value(0).unwrap(), Value::Text("b".into()));
    }

    #[test]
    fn test_cycle_rejected() {
        let db = sample_db();
        let mut reg = LayerRegistry::new();
        reg.register(LayerDef {
            name: "x".into(),
            base: LayerBase::Layer("y".into()),
            projection: None,
            filters: Vec::new(),
        })
        .unwrap();
        reg.register(LayerDef {
            name: "y".into(),
            base: LayerBase::Layer("x".into()),
            projection: None,
            filters: Vec::new(),
        })
        .unwrap();
        let err = reg.open(&db, "x").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_depth_cap() {
        let db = sample_db();
        let mut reg = LayerRegistry::new();
        reg.register(LayerDef {
            name: "l0".into(),
            base: LayerBase::Table("metrics".into()),
            projection: None,
            filters: Vec::new(),
        })
        .unwrap();
        for i in 1..=MAX_LAYER_DEPTH {
            reg.register(LayerDef {
                name: format!("l{}", i),
                base: LayerBase::Layer(format!("l{}", i - 1)),
                projection: None,
                filters: Vec::new(),
            })
            .unwrap();
        }
        assert!(reg.open(&db, "l3").is_ok());
        let err = reg.open(&db, &format!("l{}", MAX_LAYER_DEPTH)).unwrap_err();
        assert!(err.to_string().contains("deeper"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = registry();
        let err = reg
            .register(LayerDef {
                name: "HIGH_SCORES".into(),
                base: LayerBase::Table("metrics".into()),
                projection: None,
                filters: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);
    }
}

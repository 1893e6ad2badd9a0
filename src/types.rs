//! Core type aliases, the dynamic `Value` type, and open flags.

use bitflags::bitflags;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type. Pages are numbered from 1; 0 is never a valid page.
pub type Pgno = u32;

/// Row ID type (64-bit signed, per table b-tree key).
pub type RowId = i64;

/// Database file offset.
pub type DbOffset = u64;

// ============================================================================
// Open Flags
// ============================================================================

bitflags! {
    /// Flags controlling how a database is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading only
        const READONLY  = 0x0001;
        /// Open for reading and writing
        const READWRITE = 0x0002;
        /// Create the file if it does not exist
        const CREATE    = 0x0004;
        /// Use a memory map for the base source
        const MMAP      = 0x0008;
        /// Journal commits through the write-ahead log
        const WAL       = 0x0010;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::READONLY
    }
}

// ============================================================================
// Dynamic Value
// ============================================================================

/// Owned dynamic value, the materialized form of one record column.
///
/// The zero-copy counterpart is `storage::record::ValueRef`, which borrows
/// text and blob bytes from a payload; `Value` is what crosses API
/// boundaries that outlive the payload borrow.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// NULL value
    #[default]
    Null,
    /// Integer value (64-bit signed)
    Integer(i64),
    /// Real value (64-bit IEEE 754)
    Real(f64),
    /// Text value (UTF-8 string)
    Text(String),
    /// Binary large object
    Blob(Vec<u8>),
}

impl Value {
    /// Check if value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to i64 with lossy coercion.
    ///
    /// - NULL -> 0
    /// - Integer -> value
    /// - Real -> truncated
    /// - Text -> parsed, or 0 if invalid
    /// - Blob -> 0
    pub fn to_i64(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(i) => *i,
            Value::Real(f) => *f as i64,
            Value::Text(s) => s.parse().unwrap_or(0),
            Value::Blob(_) => 0,
        }
    }

    /// Convert to f64 with lossy coercion.
    pub fn to_f64(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Integer(i) => *i as f64,
            Value::Real(f) => *f,
            Value::Text(s) => s.parse().unwrap_or(0.0),
            Value::Blob(_) => 0.0,
        }
    }

    /// Convert to text with lossy coercion. NULL renders empty.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Borrow text content if this value is Text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow blob content if this value is Blob.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercion_to_i64() {
        assert_eq!(Value::Null.to_i64(), 0);
        assert_eq!(Value::Integer(42).to_i64(), 42);
        assert_eq!(Value::Real(3.7).to_i64(), 3);
        assert_eq!(Value::Text("123".into()).to_i64(), 123);
        assert_eq!(Value::Text("abc".into()).to_i64(), 0);
        assert_eq!(Value::Blob(vec![1, 2, 3]).to_i64(), 0);
    }

    #[test]
    fn test_value_from_conversions() {
        assert_eq!(Value::from(42i64), Value::Integer(42));
        assert_eq!(Value::from("hello"), Value::Text("hello".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(7i64)), Value::Integer(7));
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READWRITE));
        assert!(!flags.contains(OpenFlags::READONLY));
    }
}

//! The `arc://` URI grammar.
//!
//! `arc://<authority>/<path>[#<table>[/<rowid>]]`. The scheme and the
//! authority are case-insensitive; the path preserves case. A missing
//! rowid parses as -1.

use crate::error::{Error, ErrorCode, Result};
use crate::types::RowId;

/// Parsed arc URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcUri {
    /// Locator-selecting authority, lowercased
    pub authority: String,
    /// Resource path, case preserved
    pub path: String,
    /// Optional table fragment
    pub table: Option<String>,
    /// Optional rowid fragment; -1 when absent
    pub rowid: RowId,
}

impl ArcUri {
    /// Parse an arc URI string.
    pub fn parse(input: &str) -> Result<Self> {
        const SCHEME: &str = "arc://";
        if input.len() < SCHEME.len() || !input[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
            return Err(malformed(input, "missing arc:// scheme"));
        }
        let rest = &input[SCHEME.len()..];

        let Some(slash) = rest.find('/') else {
            return Err(malformed(input, "no path separator after authority"));
        };
        let authority = &rest[..slash];
        if authority.is_empty() {
            return Err(malformed(input, "empty authority"));
        }
        let path_and_fragment = &rest[slash + 1..];

        let (path, fragment) = match path_and_fragment.find('#') {
            Some(hash) => (
                &path_and_fragment[..hash],
                Some(&path_and_fragment[hash + 1..]),
            ),
            None => (path_and_fragment, None),
        };
        if path.is_empty() {
            return Err(malformed(input, "empty path"));
        }

        let (table, rowid) = match fragment {
            None | Some("") => (None, -1),
            Some(frag) => match frag.find('/') {
                None => (Some(frag.to_string()), -1),
                Some(sep) => {
                    let table = &frag[..sep];
                    let rowid_text = &frag[sep + 1..];
                    let rowid = rowid_text
                        .parse::<RowId>()
                        .map_err(|_| malformed(input, "fragment rowid is not an integer"))?;
                    (Some(table.to_string()), rowid)
                }
            },
        };

        Ok(ArcUri {
            authority: authority.to_ascii_lowercase(),
            path: path.to_string(),
            table,
            rowid,
        })
    }
}

impl std::fmt::Display for ArcUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "arc://{}/{}", self.authority, self.path)?;
        if let Some(table) = &self.table {
            write!(f, "#{}", table)?;
            if self.rowid >= 0 {
                write!(f, "/{}", self.rowid)?;
            }
        }
        Ok(())
    }
}

fn malformed(input: &str, why: &str) -> Error {
    Error::with_message(
        ErrorCode::Misuse,
        format!("malformed arc uri '{}': {}", input, why),
    )
}

// ============================================================================
// Tests
// ============================================================================

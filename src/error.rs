//! Error codes and the crate-wide `Result` alias.
//!
//! Every fallible surface in the storage engine returns `Result<T>`. Errors
//! carry a coarse `ErrorCode` for programmatic dispatch plus an optional
//! human-readable message. Arc resolution never surfaces these directly;
//! the locators fold them into `ArcOpenResult` variants.

use std::fmt;
use std::io;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error
    Error = 1,
    /// Internal logic error (should not happen)
    Internal = 2,
    /// Malformed page, cell, record, or chain
    Corrupt = 11,
    /// Page number or column ordinal out of range
    Range = 25,
    /// Read/write/fsync failure
    IoErr = 10,
    /// Operation not supported by this object (e.g. write to a read-only source)
    NotSupported = 12,
    /// Write attempted through a read-only handle
    ReadOnly = 8,
    /// API misuse, including use after dispose
    Misuse = 21,
    /// File could not be opened
    CantOpen = 14,
    /// File is not a database (bad magic or header)
    NotADb = 26,
    /// Named object (table, index, column role) not found
    NotFound = 27,
    /// Resource exhausted (page allocation, pool)
    Full = 13,
    /// Value or payload exceeds a hard limit
    TooBig = 18,
    /// Uniqueness violation (duplicate rowid)
    Constraint = 19,
}

impl ErrorCode {
    /// Stable human-readable name for the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Error => "error",
            ErrorCode::Internal => "internal error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::Range => "index out of range",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::NotSupported => "operation not supported",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Misuse => "library routine called out of sequence",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::NotADb => "file is not a database",
            ErrorCode::NotFound => "not found",
            ErrorCode::Full => "database or pool is full",
            ErrorCode::TooBig => "value exceeds maximum size",
            ErrorCode::Constraint => "constraint violation",
        }
    }
}

/// Error value carried by every fallible operation.
#[derive(Debug)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
    source: Option<io::Error>,
}

impl Error {
    /// Create an error from a bare code.
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
            source: None,
        }
    }

    /// Create an error with a contextual message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Wrap an I/O error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error {
            code: ErrorCode::IoErr,
            message: Some(context.into()),
            source: Some(source),
        }
    }

    /// The coarse classification of this error.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The contextual message, if one was attached.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Shorthand for corruption errors, the most common typed failure in
    /// the cursor and codec layers.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Error::with_message(ErrorCode::Corrupt, message)
    }

    /// Shorthand for range errors (bad page number, bad column ordinal).
    pub fn range(message: impl Into<String>) -> Self {
        Error::with_message(ErrorCode::Range, message)
    }

    /// Shorthand for use-after-dispose.
    pub fn disposed(what: &str) -> Self {
        Error::with_message(ErrorCode::Misuse, format!("{} used after dispose", what))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.source) {
            (Some(msg), Some(src)) => write!(f, "{}: {} ({})", self.code.as_str(), msg, src),
            (Some(msg), None) => write!(f, "{}: {}", self.code.as_str(), msg),
            (None, Some(src)) => write!(f, "{} ({})", self.code.as_str(), src),
            (None, None) => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            code: ErrorCode::IoErr,
            message: None,
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_message() {
        let err = Error::with_message(ErrorCode::Corrupt, "cell pointer out of range");
        let text = err.to_string();
        assert!(text.contains("malformed"));
        assert!(text.contains("cell pointer out of range"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoErr);
    }

    #[test]
    fn test_code_accessor() {
        assert_eq!(Error::new(ErrorCode::Range).code(), ErrorCode::Range);
        assert_eq!(Error::disposed("page source").code(), ErrorCode::Misuse);
    }
}

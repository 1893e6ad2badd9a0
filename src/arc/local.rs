//! The `local` arc locator: filesystem paths under an optional base
//! directory, plus the shared validation pipeline every locator finishes
//! with (size cap, magic check, open, ledger verification, trust policy).

use std::path::{Component, Path, PathBuf};

use log::{debug, warn};

use crate::database::Database;
use crate::error::ErrorCode;
use crate::storage::header::FILE_MAGIC;
use crate::types::OpenFlags;

use super::ledger::Ledger;
use super::{ArcHandle, ArcLocator, ArcOpenOptions, ArcOpenResult, ArcUri, UnknownSignerPolicy};

/// Locator for `arc://local/...`.
#[derive(Debug, Default)]
pub struct LocalArcLocator;

impl LocalArcLocator {
    /// New locator.
    pub fn new() -> Self {
        LocalArcLocator
    }
}

impl ArcLocator for LocalArcLocator {
    fn authority(&self) -> &str {
        "local"
    }

    fn open(&self, uri: &ArcUri, options: &ArcOpenOptions) -> ArcOpenResult {
        let raw = PathBuf::from(&uri.path);

        // Resolve against the base directory and enforce the fence.
        let candidate = match &options.base_directory {
            Some(base) => {
                let joined = if raw.is_absolute() { raw } else { base.join(raw) };
                let fence = normalize_lexically(base);
                let resolved = normalize_lexically(&joined);
                if !resolved.starts_with(&fence) {
                    return ArcOpenResult::Untrusted {
                        message: format!(
                            "path traversal: '{}' escapes base directory '{}'",
                            uri.path,
                            base.display()
                        ),
                    };
                }
                resolved
            }
            None => raw,
        };

        if !candidate.exists() {
            return ArcOpenResult::Unreachable {
                message: format!("arc file '{}' does not exist", candidate.display()),
            };
        }

        validate_and_open(&candidate, uri, options, None)
    }
}

/// Lexical path normalization: resolves `.` and `..` without touching the
/// filesystem, so the traversal fence holds for nonexistent paths too.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// The shared tail of every locator: size cap, magic bytes, database
/// open, ledger verification, and the trust-anchor policy.
pub(super) fn validate_and_open(
    path: &Path,
    uri: &ArcUri,
    options: &ArcOpenOptions,
    download: Option<tempfile::NamedTempFile>,
) -> ArcOpenResult {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            return ArcOpenResult::Unreachable {
                message: format!("cannot stat '{}': {}", path.display(), e),
            }
        }
    };
    if size > options.max_file_size_bytes {
        return ArcOpenResult::Untrusted {
            message: format!(
                "arc is {} bytes, above the {} byte cap",
                size, options.max_file_size_bytes
            ),
        };
    }

    match read_magic(path) {
        Ok(true) => {}
        Ok(false) => {
            return ArcOpenResult::Untrusted {
                message: format!("'{}' does not begin with the database magic", path.display()),
            }
        }
        Err(e) => {
            return ArcOpenResult::Unreachable {
                message: format!("cannot read '{}': {}", path.display(), e),
            }
        }
    }

    let database = match Database::open(path, OpenFlags::READONLY) {
        Ok(db) => db,
        Err(e) if e.code() == ErrorCode::NotADb || e.code() == ErrorCode::Corrupt => {
            return ArcOpenResult::Untrusted {
                message: format!("'{}' failed header validation: {}", path.display(), e),
            }
        }
        Err(e) => {
            return ArcOpenResult::Unreachable {
                message: format!("cannot open '{}': {}", path.display(), e),
            }
        }
    };

    let mut warnings = Vec::new();
    let ledger = match Ledger::load(&database) {
        Ok(Some(ledger)) => {
            if options.validate_on_open {
                if let Err(broken) = ledger.verify_chain() {
                    return ArcOpenResult::Untrusted {
                        message: format!("ledger integrity failure: {}", broken),
                    };
                }
                debug!("ledger chain verified ({} entries)", ledger.entries().len());
            }
            Some(ledger)
        }
        Ok(None) => {
            warnings.push("arc carries no ledger".to_string());
            None
        }
        Err(e) => {
            return ArcOpenResult::Untrusted {
                message: format!("ledger is unreadable: {}", e),
            }
        }
    };

    // Trust-anchor policy over the ledger's agent identities.
    if let (Some(ledger), Some(anchors)) = (&ledger, &options.trust_anchors) {
        let unknown: Vec<String> = ledger
            .agent_ids()
            .into_iter()
            .filter(|agent| !anchors.contains(*agent))
            .map(str::to_string)
            .collect();
        if !unknown.is_empty() {
            match options.unknown_signer_policy {
                UnknownSignerPolicy::AcceptAll => {}
                UnknownSignerPolicy::WarnUnknown => {
                    for agent in &unknown {
                        warn!("arc {} signed by unknown agent '{}'", uri, agent);
                        warnings.push(format!("unknown signer '{}'", agent));
                    }
                }
                UnknownSignerPolicy::RejectUnknown => {
                    return ArcOpenResult::Untrusted {
                        message: format!("unknown signer(s): {}", unknown.join(", ")),
                    };
                }
            }
        }
    }

    ArcOpenResult::Available {
        handle: Box::new(ArcHandle::new(database, ledger, uri.clone(), download)),
        warnings,
    }
}

/// True when the file starts with the 16 database magic bytes.
fn read_magic(path: &Path) -> std::io::Result<bool> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 16];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == FILE_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arc::ArcResolver;

    fn make_arc(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        drop(Database::create(&path, false).unwrap());
        path
    }

    fn options_with_base(base: &Path) -> ArcOpenOptions {
        ArcOpenOptions {
            base_directory: Some(base.to_path_buf()),
            ..ArcOpenOptions::default()
        }
    }

    #[test]
    fn test_local_open_available() {
        let dir = tempfile::tempdir().unwrap();
        make_arc(dir.path(), "ok.arc");
        let resolver = ArcResolver::with_defaults();
        let result = resolver.resolve("arc://local/ok.arc", &options_with_base(dir.path()));
        match result {
            ArcOpenResult::Available { warnings, .. } => {
                // No ledger table in a fresh arc.
                assert!(warnings.iter().any(|w| w.contains("no ledger")));
            }
            other => panic!("expected Available, got {:?}", other),
        }
    }

    #[test]
    fn test_traversal_escape_is_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArcResolver::with_defaults();
        let result = resolver.resolve(
            "arc://local/../outside.arc",
            &options_with_base(dir.path()),
        );
        match result {
            ArcOpenResult::Untrusted { message } => {
                assert!(message.contains("traversal"), "message: {}", message)
            }
            other => panic!("expected Untrusted, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArcResolver::with_defaults();
        let result = resolver.resolve("arc://local/absent.arc", &options_with_base(dir.path()));
        assert!(matches!(result, ArcOpenResult::Unreachable { .. }));
    }

    #[test]
    fn test_bad_magic_is_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.arc"), b"definitely not a database").unwrap();
        let resolver = ArcResolver::with_defaults();
        let result = resolver.resolve("arc://local/junk.arc", &options_with_base(dir.path()));
        match result {
            ArcOpenResult::Untrusted { message } => assert!(message.contains("magic")),
            other => panic!("expected Untrusted, got {:?}", other),
        }
    }

    #[test]
    fn test_size_cap_is_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        make_arc(dir.path(), "big.arc");
        let options = ArcOpenOptions {
            max_file_size_bytes: 100,
            ..options_with_base(dir.path())
        };
        let result = ArcResolver::with_defaults().resolve("arc://local/big.arc", &options);
        match result {
            ArcOpenResult::Untrusted { message } => assert!(message.contains("cap")),
            other => panic!("expected Untrusted, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(
            normalize_lexically(Path::new("base/../../etc")),
            PathBuf::from("../etc")
        );
    }
}

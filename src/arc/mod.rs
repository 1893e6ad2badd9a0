//! Cross-arc layer: URI-addressed database resolution.
//!
//! An arc is a database file addressed by `arc://<authority>/<path>`.
//! The resolver dispatches on the authority to a registered locator.
//! Locators never raise: every failure folds into an `ArcOpenResult`
//! variant, and non-fatal findings travel as warnings on success.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::database::Database;

mod http;
mod ledger;
mod local;
mod uri;

pub use http::HttpArcLocator;
pub use ledger::{Ledger, LedgerEntry};
pub use local::LocalArcLocator;
pub use uri::ArcUri;

/// Default per-arc size cap: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Policy for ledger agents that are not trust anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownSignerPolicy {
    /// Accept any signer without checking
    AcceptAll,
    /// Accept but attach a warning per unknown signer
    #[default]
    WarnUnknown,
    /// Report the arc as untrusted
    RejectUnknown,
}

/// Options recognized by every locator.
#[derive(Debug, Clone)]
pub struct ArcOpenOptions {
    /// Cap per arc; early reject via content-length, hard cap while
    /// streaming
    pub max_file_size_bytes: u64,
    /// Verify the ledger hash chain after open
    pub validate_on_open: bool,
    /// Expected signer identities; None disables the anchor check
    pub trust_anchors: Option<HashSet<String>>,
    /// What to do with signers outside the anchor set
    pub unknown_signer_policy: UnknownSignerPolicy,
    /// Root for relative local paths; also the traversal fence
    pub base_directory: Option<PathBuf>,
    /// HTTP request timeout
    pub http_timeout: Duration,
}

impl Default for ArcOpenOptions {
    fn default() -> Self {
        ArcOpenOptions {
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
            validate_on_open: true,
            trust_anchors: None,
            unknown_signer_policy: UnknownSignerPolicy::default(),
            base_directory: None,
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// An opened arc: the database bundled with its ledger and the agent
/// identities found in it.
pub struct ArcHandle {
    /// The opened database
    pub database: Database,
    /// Parsed ledger, when the arc carries one
    pub ledger: Option<Ledger>,
    /// The URI the arc was resolved from
    pub uri: ArcUri,
    /// Keeps a downloaded arc's backing file alive for the handle's life
    _download: Option<tempfile::NamedTempFile>,
}

impl ArcHandle {
    pub(crate) fn new(
        database: Database,
        ledger: Option<Ledger>,
        uri: ArcUri,
        download: Option<tempfile::NamedTempFile>,
    ) -> Self {
        ArcHandle {
            database,
            ledger,
            uri,
            _download: download,
        }
    }

    /// Agent identities recorded in the ledger.
    pub fn agent_ids(&self) -> Vec<String> {
        self.ledger
            .as_ref()
            .map(|l| l.agent_ids().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Outcome of resolving an arc. Locators never raise.
pub enum ArcOpenResult {
    /// The arc opened; warnings carry non-fatal findings
    Available {
        /// The opened arc
        handle: Box<ArcHandle>,
        /// Non-fatal findings (unknown signers, missing ledger)
        warnings: Vec<String>,
    },
    /// The arc could not be reached (missing file, network failure,
    /// malformed URI)
    Unreachable {
        /// Human-readable reason
        message: String,
    },
    /// The arc was reached but failed a safety check (magic, size cap,
    /// traversal fence, broken ledger, rejected signer)
    Untrusted {
        /// Human-readable reason
        message: String,
    },
    /// No locator is registered for the URI's authority
    UnsupportedAuthority {
        /// Human-readable reason
        message: String,
    },
}

impl ArcOpenResult {
    /// True for `Available`.
    pub fn is_available(&self) -> bool {
        matches!(self, ArcOpenResult::Available { .. })
    }

    /// The failure message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            ArcOpenResult::Available { .. } => None,
            ArcOpenResult::Unreachable { message }
            | ArcOpenResult::Untrusted { message }
            | ArcOpenResult::UnsupportedAuthority { message } => Some(message),
        }
    }
}

impl std::fmt::Debug for ArcOpenResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArcOpenResult::Available { warnings, .. } => f
                .debug_struct("Available")
                .field("warnings", warnings)
                .finish(),
            ArcOpenResult::Unreachable { message } => {
                f.debug_struct("Unreachable").field("message", message).finish()
            }
            ArcOpenResult::Untrusted { message } => {
                f.debug_struct("Untrusted").field("message", message).finish()
            }
            ArcOpenResult::UnsupportedAuthority { message } => f
                .debug_struct("UnsupportedAuthority")
                .field("message", message)
                .finish(),
        }
    }
}

/// A named opener for one authority.
pub trait ArcLocator: Send + Sync {
    /// The authority this locator serves, lowercase.
    fn authority(&self) -> &str;

    /// Open the arc. Must not panic or raise; failures become results.
    fn open(&self, uri: &ArcUri, options: &ArcOpenOptions) -> ArcOpenResult;
}

/// Name-keyed dispatcher over locators.
#[derive(Default)]
pub struct ArcResolver {
    locators: HashMap<String, Box<dyn ArcLocator>>,
}

impl ArcResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        ArcResolver::default()
    }

    /// Resolver with the built-in `local` and `https` locators.
    pub fn with_defaults() -> Self {
        let mut resolver = ArcResolver::new();
        resolver.register(Box::new(LocalArcLocator::new()));
        resolver.register(Box::new(HttpArcLocator::new()));
        resolver
    }

    /// Register a locator under its authority. Callers register before
    /// issuing concurrent resolves.
    pub fn register(&mut self, locator: Box<dyn ArcLocator>) {
        self.locators
            .insert(locator.authority().to_ascii_lowercase(), locator);
    }

    /// Authorities currently registered.
    pub fn authorities(&self) -> Vec<&str> {
        self.locators.keys().map(String::as_str).collect()
    }

    /// Resolve an arc URI string.
    pub fn resolve(&self, uri: &str, options: &ArcOpenOptions) -> ArcOpenResult {
        let parsed = match ArcUri::parse(uri) {
            Ok(p) => p,
            Err(e) => {
                return ArcOpenResult::Unreachable {
                    message: e.to_string(),
                }
            }
        };
        match self.locators.get(&parsed.authority) {
            Some(locator) => locator.open(&parsed, options),
            None => ArcOpenResult::UnsupportedAuthority {
                message: format!("no locator for authority '{}'", parsed.authority),
            },
        }
    }
}

lazy_static! {
    static ref DEFAULT_RESOLVER: ArcResolver = ArcResolver::with_defaults();
}

/// Resolve through the process-wide default resolver (`local` + `https`).
pub fn resolve(uri: &str, options: &ArcOpenOptions) -> ArcOpenResult {
    DEFAULT_RESOLVER.resolve(uri, options)
}

// ============================================================================
// Tests
// ============================================================================

//! Arc ledger: an append-only, hash-chained record of the agents that
//! produced the arc's contents.
//!
//! The ledger lives in a table named `ledger` with columns
//! `(seq, agent, payload_sha, prev_sha)`. Each entry's `prev_sha` must
//! equal the chain digest of its predecessor; the genesis entry carries an
//! empty `prev_sha`. Signature verification over the digests is external;
//! this module only checks the chain and enumerates agent identities for
//! the trust-anchor policy.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::database::Database;
use crate::error::Result;
use crate::types::Value;

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Monotonic sequence number
    pub seq: i64,
    /// Agent identity that produced this entry
    pub agent: String,
    /// Digest of the entry's payload, lowercase hex
    pub payload_sha: String,
    /// Chain digest of the previous entry; empty for the genesis entry
    pub prev_sha: String,
}

impl LedgerEntry {
    /// Chain digest of this entry: sha256 over its canonical rendering.
    pub fn chain_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_be_bytes());
        hasher.update(b":");
        hasher.update(self.agent.as_bytes());
        hasher.update(b":");
        hasher.update(self.payload_sha.as_bytes());
        hasher.update(b":");
        hasher.update(self.prev_sha.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Parsed ledger.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Load the ledger table, if the database carries one.
    pub fn load(db: &Database) -> Result<Option<Ledger>> {
        if db.schema()?.table("ledger").is_none() {
            return Ok(None);
        }
        let mut reader = db.create_reader("ledger", None, Vec::new())?;
        let mut entries = Vec::new();
        while reader.move_next()? {
            let text = |v: Value| -> String {
                match v {
                    Value::Text(s) => s,
                    other => other.to_text(),
                }
            };
            entries.push(LedgerEntry {
                seq: reader.value(0)?.to_i64(),
                agent: text(reader.value(1)?),
                payload_sha: text(reader.value(2)?),
                prev_sha: text(reader.value(3)?),
            });
        }
        entries.sort_by_key(|e| e.seq);
        Ok(Some(Ledger { entries }))
    }

    /// Build a ledger from entries (tests, arc authoring).
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        Ledger { entries }
    }

    /// All entries in sequence order.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Distinct agent identities, sorted.
    pub fn agent_ids(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.agent.as_str()).collect()
    }

    /// Verify the hash chain. `Err` carries a description of the first
    /// broken link.
    pub fn verify_chain(&self) -> std::result::Result<(), String> {
        let mut prev_digest: Option<String> = None;
        for entry in &self.entries {
            match &prev_digest {
                None => {
                    if !entry.prev_sha.is_empty() {
                        return Err(format!(
                            "genesis entry {} carries a previous-link digest",
                            entry.seq
                        ));
                    }
                }
                Some(expected) => {
                    if &entry.prev_sha != expected {
                        return Err(format!(
                            "entry {} breaks the hash chain (expected {}, found {})",
                            entry.seq, expected, entry.prev_sha
                        ));
                    }
                }
            }
            prev_digest = Some(entry.chain_digest());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

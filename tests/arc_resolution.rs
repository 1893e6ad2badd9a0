//! Arc resolution integration: local locator pipeline, traversal fence,
//! size caps, ledger verification, and the trust-anchor policy.

use std::collections::HashSet;
use std::path::Path;

use sharc::arc::{Ledger, LedgerEntry};
use sharc::{ArcOpenOptions, ArcOpenResult, ArcResolver, Database, UnknownSignerPolicy, Value};

fn make_plain_arc(path: &Path) {
    drop(Database::create(path, false).unwrap());
}

/// An arc whose ledger chain links two agents; optionally broken.
fn make_ledger_arc(path: &Path, break_chain: bool) {
    let mut db = Database::create(path, false).unwrap();
    let first = LedgerEntry {
        seq: 1,
        agent: "agent-a".into(),
        payload_sha: "aa".repeat(32),
        prev_sha: String::new(),
    };
    let second = LedgerEntry {
        seq: 2,
        agent: "agent-b".into(),
        payload_sha: "bb".repeat(32),
        prev_sha: if break_chain {
            "00".repeat(32)
        } else {
            first.chain_digest()
        },
    };
    let mut txn = db.begin_transaction().unwrap();
    txn.create_table("ledger", "seq INTEGER, agent TEXT, payload_sha TEXT, prev_sha TEXT")
        .unwrap();
    for e in [&first, &second] {
        txn.insert(
            "ledger",
            None,
            &[
                Value::Integer(e.seq),
                e.agent.as_str().into(),
                e.payload_sha.as_str().into(),
                e.prev_sha.as_str().into(),
            ],
        )
        .unwrap();
    }
    txn.commit().unwrap();
}

fn options(base: &Path) -> ArcOpenOptions {
    ArcOpenOptions {
        base_directory: Some(base.to_path_buf()),
        ..ArcOpenOptions::default()
    }
}

#[test]
fn test_local_available_inside_base() {
    let dir = tempfile::tempdir().unwrap();
    let fixtures = dir.path().join("fixtures");
    std::fs::create_dir(&fixtures).unwrap();
    make_plain_arc(&fixtures.join("ok.arc"));

    let resolver = ArcResolver::with_defaults();
    let result = resolver.resolve("arc://local/./ok.arc", &options(&fixtures));
    assert!(result.is_available(), "{:?}", result.message());
}

#[test]
fn test_local_traversal_escape_untrusted() {
    let dir = tempfile::tempdir().unwrap();
    let fixtures = dir.path().join("fixtures");
    std::fs::create_dir(&fixtures).unwrap();
    make_plain_arc(&dir.path().join("outside.arc"));

    let resolver = ArcResolver::with_defaults();
    let result = resolver.resolve("arc://local/../outside.arc", &options(&fixtures));
    match result {
        ArcOpenResult::Untrusted { message } => {
            assert!(message.contains("traversal"), "message: {}", message)
        }
        other => panic!("expected Untrusted, got {:?}", other),
    }
}

#[test]
fn test_magic_and_size_cap() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fake.arc"), vec![0x41u8; 4096]).unwrap();
    make_plain_arc(&dir.path().join("fat.arc"));

    let resolver = ArcResolver::with_defaults();

    let result = resolver.resolve("arc://local/fake.arc", &options(dir.path()));
    assert!(matches!(result, ArcOpenResult::Untrusted { .. }));

    let capped = ArcOpenOptions {
        max_file_size_bytes: 1024,
        ..options(dir.path())
    };
    let result = resolver.resolve("arc://local/fat.arc", &capped);
    assert!(matches!(result, ArcOpenResult::Untrusted { .. }));
}

#[test]
fn test_ledger_verified_and_agents_exposed() {
    let dir = tempfile::tempdir().unwrap();
    make_ledger_arc(&dir.path().join("signed.arc"), false);

    let resolver = ArcResolver::with_defaults();
    match resolver.resolve("arc://local/signed.arc", &options(dir.path())) {
        ArcOpenResult::Available { handle, warnings } => {
            assert!(warnings.is_empty(), "warnings: {:?}", warnings);
            assert_eq!(handle.agent_ids(), vec!["agent-a", "agent-b"]);
            let ledger: &Ledger = handle.ledger.as_ref().unwrap();
            assert_eq!(ledger.entries().len(), 2);
        }
        other => panic!("expected Available, got {:?}", other),
    }
}

#[test]
fn test_broken_ledger_chain_untrusted() {
    let dir = tempfile::tempdir().unwrap();
    make_ledger_arc(&dir.path().join("tampered.arc"), true);

    let resolver = ArcResolver::with_defaults();
    let result = resolver.resolve("arc://local/tampered.arc", &options(dir.path()));
    match result {
        ArcOpenResult::Untrusted { message } => assert!(message.contains("ledger")),
        other => panic!("expected Untrusted, got {:?}", other),
    }
}

#[test]
fn test_unknown_signer_policies() {
    let dir = tempfile::tempdir().unwrap();
    make_ledger_arc(&dir.path().join("signed.arc"), false);
    let resolver = ArcResolver::with_defaults();
    let anchors: HashSet<String> = ["agent-a".to_string()].into_iter().collect();

    // RejectUnknown: agent-b is not anchored.
    let reject = ArcOpenOptions {
        trust_anchors: Some(anchors.clone()),
        unknown_signer_policy: UnknownSignerPolicy::RejectUnknown,
        ..options(dir.path())
    };
    let result = resolver.resolve("arc://local/signed.arc", &reject);
    match result {
        ArcOpenResult::Untrusted { message } => assert!(message.contains("agent-b")),
        other => panic!("expected Untrusted, got {:?}", other),
    }

    // WarnUnknown: available, with a warning naming the stranger.
    let warn = ArcOpenOptions {
        trust_anchors: Some(anchors.clone()),
        unknown_signer_policy: UnknownSignerPolicy::WarnUnknown,
        ..options(dir.path())
    };
    match resolver.resolve("arc://local/signed.arc", &warn) {
        ArcOpenResult::Available { warnings, .. } => {
            assert!(warnings.iter().any(|w| w.contains("agent-b")));
        }
        other => panic!("expected Available, got {:?}", other),
    }

    // AcceptAll: no signer warnings at all.
    let accept = ArcOpenOptions {
        trust_anchors: Some(anchors),
        unknown_signer_policy: UnknownSignerPolicy::AcceptAll,
        ..options(dir.path())
    };
    match resolver.resolve("arc://local/signed.arc", &accept) {
        ArcOpenResult::Available { warnings, .. } => {
            assert!(!warnings.iter().any(|w| w.contains("signer")));
        }
        other => panic!("expected Available, got {:?}", other),
    }
}

#[test]
fn test_fragment_carries_table_and_rowid() {
    let dir = tempfile::tempdir().unwrap();
    make_plain_arc(&dir.path().join("frag.arc"));

    let resolver = ArcResolver::with_defaults();
    match resolver.resolve("arc://local/frag.arc#concepts/42", &options(dir.path())) {
        ArcOpenResult::Available { handle, .. } => {
            assert_eq!(handle.uri.table.as_deref(), Some("concepts"));
            assert_eq!(handle.uri.rowid, 42);
        }
        other => panic!("expected Available, got {:?}", other),
    }
}

#[test]
fn test_unsupported_authority_and_malformed_uri() {
    let resolver = ArcResolver::with_defaults();
    let opts = ArcOpenOptions::default();

    assert!(matches!(
        resolver.resolve("arc://s3/bucket/x.arc", &opts),
        ArcOpenResult::UnsupportedAuthority { .. }
    ));
    assert!(matches!(
        resolver.resolve("arc://local", &opts),
        ArcOpenResult::Unreachable { .. }
    ));
}

//! Write-path integration: shadow isolation, rollback atomicity, and
//! crash recovery through the rollback journal.

use sharc::storage::journal::{journal_path, JournalWriter};
use sharc::{Database, OpenFlags, Value};

fn create_people(path: &std::path::Path) {
    let mut db = Database::create(path, false).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.create_table("people", "id INTEGER PRIMARY KEY, name TEXT")
        .unwrap();
    txn.insert("people", None, &[Value::Null, "ada".into()]).unwrap();
    txn.commit().unwrap();
}

fn count_rows(path: &std::path::Path, table: &str) -> usize {
    let db = Database::open(path, OpenFlags::READONLY).unwrap();
    let mut reader = db.create_reader(table, None, Vec::new()).unwrap();
    let mut count = 0;
    while reader.move_next().unwrap() {
        count += 1;
    }
    count
}

#[test]
fn test_rollback_discards_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.db");
    create_people(&path);

    let mut db = Database::open(&path, OpenFlags::READWRITE).unwrap();
    let page_count_before = db.header().page_count;
    {
        let mut txn = db.begin_transaction().unwrap();
        for i in 0..10 {
            txn.insert("people", None, &[Value::Null, format!("ghost-{}", i).into()])
                .unwrap();
        }
        txn.rollback().unwrap();
    }
    assert_eq!(db.header().page_count, page_count_before);
    drop(db);

    assert_eq!(count_rows(&path, "people"), 1);
}

#[test]
fn test_dropped_transaction_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("d.db");
    create_people(&path);

    let mut db = Database::open(&path, OpenFlags::READWRITE).unwrap();
    {
        let mut txn = db.begin_transaction().unwrap();
        txn.insert("people", None, &[Value::Null, "ghost".into()]).unwrap();
        // Dropped without commit.
    }
    // The handle is still usable and unchanged.
    let mut reader = db.create_reader("people", None, Vec::new()).unwrap();
    assert!(reader.move_next().unwrap());
    assert!(!reader.move_next().unwrap());
}

#[test]
fn test_shadow_isolation_between_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iso.db");
    create_people(&path);

    let mut writer = Database::open(&path, OpenFlags::READWRITE).unwrap();
    let mut txn = writer.begin_transaction().unwrap();
    for i in 0..50 {
        txn.insert("people", None, &[Value::Null, format!("new-{}", i).into()])
            .unwrap();
    }

    // A reader on the base file sees nothing of the open transaction.
    assert_eq!(count_rows(&path, "people"), 1);

    txn.commit().unwrap();
    drop(writer);

    // Readers opened after the commit see every write.
    assert_eq!(count_rows(&path, "people"), 51);
}

#[test]
fn test_commit_survives_reopen_with_page_growth() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.db");
    create_people(&path);

    {
        let mut db = Database::open(&path, OpenFlags::READWRITE).unwrap();
        let mut txn = db.begin_transaction().unwrap();
        for i in 0..500 {
            txn.insert(
                "people",
                None,
                &[Value::Null, format!("person-number-{:04}", i).into()],
            )
            .unwrap();
        }
        txn.commit().unwrap();

        // Header page count matches the file length invariant.
        let header = db.header();
        let file_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_len, header.page_count as u64 * header.page_size as u64);
    }
    assert_eq!(count_rows(&path, "people"), 501);
}

#[test]
fn test_hot_journal_recovery_restores_pretxn_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.db");
    create_people(&path);

    let original = std::fs::read(&path).unwrap();
    let page_size = Database::open(&path, OpenFlags::READONLY)
        .unwrap()
        .header()
        .page_size;
    let original_pages = (original.len() / page_size as usize) as u32;

    // Simulate a crash mid-commit: journal the originals, then scribble
    // over the file and append a page, as a dying writer would have.
    {
        let mut journal = JournalWriter::create(&path, page_size, original_pages).unwrap();
        for p in 0..original_pages {
            let start = p as usize * page_size as usize;
            journal
                .write_frame(p + 1, &original[start..start + page_size as usize])
                .unwrap();
        }
        journal.sync().unwrap();

        let mut mangled = original.clone();
        for byte in mangled.iter_mut().skip(page_size as usize) {
            *byte = 0xEE;
        }
        mangled.extend(vec![0xFFu8; page_size as usize]);
        std::fs::write(&path, mangled).unwrap();
    }
    assert!(journal_path(&path).exists());

    // Opening runs recovery: contents and page count revert.
    let db = Database::open(&path, OpenFlags::READWRITE).unwrap();
    assert_eq!(db.header().page_count, original_pages);
    drop(db);
    assert!(!journal_path(&path).exists());
    assert_eq!(std::fs::read(&path).unwrap(), original);
    assert_eq!(count_rows(&path, "people"), 1);
}

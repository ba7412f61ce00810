//! Crashes between commit and apply, with and without a torn log tail.

use std::io::Write;

use crate::btree::TreeState;
use crate::e2e_tests::helpers::*;
use crate::journal::journal_path;
use crate::journal::record::JournalRecord;

#[test]
fn test_committed_units_survive_crash_before_apply() {
    let store = TestStore::new(small_config());
    {
        let file = store.open();
        let mut tree = int_tree(&file, &store.config);
        tree.create().expect("create");
        file.commit().expect("commit create");

        for k in 0..200 {
            tree.put(k, k + 1).expect("put");
        }
        file.commit().expect("commit puts");

        // staged only, lost in the crash
        for k in 200..300 {
            tree.put(k, k + 1).expect("put");
        }
        // dropped without apply_journal or close
    }

    let data_len = std::fs::metadata(&store.path).expect("data file").len();
    assert_eq!(data_len, 0, "nothing was applied before the crash");

    let file = store.open();
    let recovery = file.recovery();
    assert_eq!(recovery.units_replayed, 2);
    assert_eq!(recovery.records_discarded, 0);
    assert!(recovery.pages_applied > 0);

    let tree = int_tree(&file, &store.config);
    assert_eq!(tree.state(), TreeState::Ready);
    assert_eq!(
        contents(&tree),
        (0..200).map(|k| (k, k + 1)).collect::<Vec<_>>()
    );
    assert_eq!(tree.get(&250).expect("get"), None);
    tree.check().expect("check");
}

#[test]
fn test_torn_tail_is_discarded() {
    let store = TestStore::new(small_config());
    {
        let file = store.open();
        let mut tree = int_tree(&file, &store.config);
        tree.create().expect("create");
        tree.put(1, 10).expect("put");
        file.commit().expect("commit");
    }

    // a page record whose commit record never made it to disk
    let torn = JournalRecord::Page {
        pointer: 0,
        bytes: vec![0xEE; store.config.page_size],
    }
    .to_bytes();
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(journal_path(&store.path))
        .expect("open log");
    log.write_all(&torn).expect("append torn record");
    log.write_all(&[0x07; 9]).expect("append garbage");
    drop(log);

    let file = store.open();
    let recovery = file.recovery();
    assert_eq!(recovery.units_replayed, 1);
    assert_eq!(recovery.records_discarded, 1);
    assert_eq!(recovery.bytes_discarded, torn.len() as u64 + 9);
    assert_eq!(file.journal_len().expect("len"), 0);

    let tree = int_tree(&file, &store.config);
    assert_eq!(tree.get(&1).expect("get"), Some(10));
    tree.check().expect("check");
}

#[test]
fn test_close_applies_everything() {
    let store = TestStore::new(small_config());
    {
        let file = store.open();
        let mut tree = int_tree(&file, &store.config);
        tree.create().expect("create");
        for k in 0..50 {
            tree.put(k, -k).expect("put");
        }
        tree.close().expect("close tree");
        file.close().expect("close file");
        assert!(file.commit().is_err());
    }

    let log_len = std::fs::metadata(journal_path(&store.path))
        .expect("log")
        .len();
    assert_eq!(log_len, 0);

    let file = store.open();
    assert_eq!(file.recovery().units_replayed, 0);
    let tree = int_tree(&file, &store.config);
    assert_eq!(contents(&tree).len(), 50);
}

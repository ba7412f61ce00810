//! A thousand keys in, every other one out, then the rest.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::*;
use crate::file::MemoryPageFile;

const KEYS: i32 = 1024;

#[test]
fn test_insert_scan_and_drain_1024_keys() {
    let config = small_config();
    let file = MemoryPageFile::new(config.page_size);
    let mut tree = int_tree(&file, &config);
    tree.create().expect("create");

    let mut order: Vec<i32> = (0..KEYS).collect();
    order.shuffle(&mut StdRng::seed_from_u64(1024));
    for &k in &order {
        tree.put(k, k * 3).expect("put");
    }

    for k in 0..KEYS {
        assert_eq!(tree.get(&k).expect("get"), Some(k * 3), "key {k}");
    }
    let stats = tree.check().expect("check");
    assert_eq!(stats.entries, 1024);
    assert!(stats.depth >= 3);

    let low: Vec<i32> = tree
        .keys(&0, &512)
        .expect("keys")
        .collect::<Result<_, _>>()
        .expect("scan");
    assert_eq!(low, (0..512).collect::<Vec<_>>());

    for k in (0..KEYS).step_by(2) {
        assert!(tree.remove(&k).expect("remove even"));
    }
    let stats = tree.check().expect("check after evens");
    assert_eq!(stats.entries, 512);
    assert_eq!(tree.get(&10).expect("get"), None);
    assert_eq!(tree.get(&11).expect("get"), Some(33));

    for k in (1..KEYS).step_by(2) {
        assert!(tree.remove(&k).expect("remove odd"));
    }
    let stats = tree.check().expect("check after odds");
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.nodes, 1);
    assert_eq!(stats.depth, 1);
    assert_eq!(tree.free_pages(), config.max_pages - 1);
    assert!(contents(&tree).is_empty());
}

#[test]
fn test_random_operations_match_model() {
    let config = small_config();
    let file = MemoryPageFile::new(config.page_size);
    let mut tree = int_tree(&file, &config);
    tree.create().expect("create");

    let mut rng = StdRng::seed_from_u64(7);
    let mut model = BTreeMap::new();
    for step in 0..3000 {
        let key = rng.random_range(0..400);
        if rng.random_bool(0.6) {
            let value = rng.random_range(-1000..1000);
            tree.put(key, value).expect("put");
            model.insert(key, value);
        } else {
            assert_eq!(
                tree.remove(&key).expect("remove"),
                model.remove(&key).is_some(),
                "remove {key} at step {step}"
            );
        }
        if step % 500 == 0 {
            tree.check().expect("check");
        }
    }

    tree.check().expect("final check");
    assert_eq!(contents(&tree), model.into_iter().collect::<Vec<_>>());
}

#[test]
fn test_values_markers_and_payloads_share_one_order() {
    let config = small_config();
    let file = MemoryPageFile::new(config.page_size);
    let mut tree = int_tree(&file, &config);
    tree.create().expect("create");

    for k in 0..90 {
        match k % 3 {
            0 => tree.put(k, -k).expect("put"),
            1 => tree.put_terminal(k).expect("terminal"),
            _ => {
                let byte = u8::try_from(k).expect("small key");
                tree.put_payload(k, &[byte; 40]).expect("payload");
            }
        }
    }

    let all: Vec<i32> = tree
        .keys(&0, &90)
        .expect("keys")
        .collect::<Result<_, _>>()
        .expect("scan");
    assert_eq!(all, (0..90).collect::<Vec<_>>());
    assert_eq!(contents(&tree).len(), 30);
    assert!(tree.get_terminal(&4).expect("terminal"));
    assert_eq!(tree.get_payload(&5).expect("payload"), Some(vec![5; 40]));
    assert_eq!(tree.check().expect("check").payloads, 30);

    // replacing a payload with a value frees its page
    tree.put(5, 50).expect("put over payload");
    assert_eq!(tree.get_payload(&5).expect("payload"), None);
    assert_eq!(tree.check().expect("check").payloads, 29);
}

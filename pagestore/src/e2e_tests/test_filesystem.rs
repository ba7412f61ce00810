//! Long names and file contents through the file system on disk.

use crate::btree::{BTree, BTreeBuilder, NaturalOrder};
use crate::config::StoreConfig;
use crate::e2e_tests::helpers::*;
use crate::fs::keys::{KEY_SIZE, PATH_SIZE};
use crate::fs::{FileSystem, FileSystemKeySet};
use crate::serialize::{FixedBytesSerializer, PointerSerializer};

const LONG_NAME: &[u8] = b"a/very/long/path/exceeding/one/chunk";

fn fs_config() -> StoreConfig {
    StoreConfig {
        page_size: 1024,
        max_pages: 512,
        ..StoreConfig::default()
    }
}

#[test]
fn test_long_name_listed_once_and_removed_cleanly() {
    assert!(LONG_NAME.len() > PATH_SIZE);
    let store = TestStore::new(fs_config());
    let file = store.open();
    let mut tree: BTree<'_, Vec<u8>, u32> =
        BTreeBuilder::new(FixedBytesSerializer { len: KEY_SIZE }, PointerSerializer)
            .from_config(&store.config)
            .build(&file, NaturalOrder)
            .expect("build");
    tree.create().expect("create");

    let mut set = FileSystemKeySet::new(&mut tree);
    set.add(LONG_NAME).expect("add");
    assert_eq!(set.list(None, None).expect("list"), vec![LONG_NAME.to_vec()]);
    assert_eq!(
        set.list(Some(LONG_NAME), Some(LONG_NAME)).expect("bounded list"),
        vec![LONG_NAME.to_vec()]
    );
    assert!(set.contains(LONG_NAME).expect("contains"));
    // a prefix of the name is not itself a member
    assert!(!set.contains(&LONG_NAME[..PATH_SIZE]).expect("contains"));

    assert!(set.remove(LONG_NAME).expect("remove"));
    assert!(set.list(None, None).expect("list").is_empty());
    assert_eq!(tree.check().expect("check").entries, 0);
}

#[test]
fn test_files_survive_close_and_reopen() {
    let store = TestStore::new(fs_config());
    let big: Vec<u8> = (0..5000usize)
        .map(|i| u8::try_from(i % 256).expect("byte"))
        .collect();
    let files: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (LONG_NAME.to_vec(), b"chunked name".to_vec()),
        (b"big.bin".to_vec(), big),
        (b"empty".to_vec(), Vec::new()),
    ];

    {
        let file = store.open();
        let fs = FileSystem::open(&file, &file, &store.config).expect("open");
        fs.create().expect("create");
        let mut m = fs.mutate().expect("mutate");
        for (name, content) in &files {
            m.replace(name, Some(content.as_slice())).expect("write");
        }
        drop(m);
        fs.close().expect("close fs");
        file.close().expect("close file");
    }

    let file = store.open();
    let fs = FileSystem::open(&file, &file, &store.config).expect("reopen");
    let mut names = fs.list(None, None).expect("list");
    names.sort();
    let mut expected: Vec<Vec<u8>> = files.iter().map(|(name, _)| name.clone()).collect();
    expected.sort();
    assert_eq!(names, expected);
    for (name, content) in &files {
        assert_eq!(fs.read(name).expect("read").as_ref(), Some(content));
    }

    fs.mutate()
        .expect("mutate")
        .replace(b"big.bin", None)
        .expect("delete");
    assert_eq!(fs.read(b"big.bin").expect("read"), None);
    assert_eq!(fs.list(None, None).expect("list").len(), 2);
}

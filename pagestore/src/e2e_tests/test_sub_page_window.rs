//! Windows over one file keep their users apart.

use crate::config::StoreConfig;
use crate::e2e_tests::helpers::*;
use crate::file::{
    FileError, MemoryPageFile, PageFile, PagingError, SerializedPageFile, SubPageFile,
    sub_page_files,
};
use crate::page::{PageId, PageType};
use crate::persist::{PersistSlot, SlotPersister};
use crate::serialize::{IntSerializer, StringSerializer};

#[test]
fn test_window_confines_typed_pages() {
    let parent = MemoryPageFile::new(512);
    let window = SubPageFile::new(&parent, 10, 20);
    let names = SerializedPageFile::new(window, StringSerializer { max: 32 }, PageType::Payload);

    for i in 0..10 {
        names.save(i, &format!("page {i}")).expect("save inside window");
    }
    assert_eq!(names.load(9).expect("load"), "page 9");
    assert_eq!(names.load(0).expect("load"), "page 0");

    assert!(matches!(
        names.save(10, &"past the end".to_string()),
        Err(PagingError::File(FileError::PageOutOfRange {
            pointer: 20,
            start: 10,
            end: 20
        }))
    ));
    assert!(names.load(PageId::MAX).is_err());

    // parent pages on either side were never touched
    assert_eq!(parent.page_count().expect("count"), 20);
    let below = parent.load(9).expect("parent page 9");
    assert!(below.as_bytes().iter().all(|&b| b == 0));
    assert!(parent.load(20).is_err());
}

#[test]
fn test_tree_and_persister_share_one_journal() {
    let config = StoreConfig {
        page_size: 512,
        max_pages: 256,
        branch_factor: Some(8),
        journal_apply_threshold: 1000,
    };
    let store = TestStore::new(config);
    let bounds = [0, 300, PageId::MAX];

    {
        let file = store.open();
        let windows = sub_page_files(&file, &bounds);
        let mut tree = int_tree(&windows[0], &store.config);
        tree.create().expect("create");
        for k in 0..100 {
            tree.put(k, k * k).expect("put");
        }

        let persister = SlotPersister::open(&windows[1], IntSerializer).expect("open persister");
        let leaf = persister
            .save(PersistSlot {
                pairs: vec![(Some(1), None), (Some(2), None)],
            })
            .expect("save leaf");
        persister
            .save(PersistSlot {
                pairs: vec![(Some(1), Some(leaf))],
            })
            .expect("save root");
        persister.close().expect("close persister");

        tree.close().expect("close tree");
        file.close().expect("close file");
    }

    let file = store.open();
    let windows = sub_page_files(&file, &bounds);
    let tree = int_tree(&windows[0], &store.config);
    assert_eq!(
        contents(&tree),
        (0..100).map(|k| (k, k * k)).collect::<Vec<_>>()
    );
    tree.check().expect("check");

    let persister = SlotPersister::open(&windows[1], IntSerializer).expect("reopen persister");
    assert_eq!(persister.count().expect("count"), 2);
    assert_eq!(
        persister.load(1).expect("root").pairs,
        vec![(Some(1), Some(0))]
    );
}

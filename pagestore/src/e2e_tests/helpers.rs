//! Common helpers for end-to-end tests.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::btree::{BTree, BTreeBuilder, NaturalOrder};
use crate::config::StoreConfig;
use crate::file::PageFile;
use crate::journal::JournalledPageFile;
use crate::serialize::IntSerializer;
use crate::testing::init_tracing;

/// A store file in its own temporary directory, removed on drop.
pub struct TestStore {
    pub config: StoreConfig,
    pub path: PathBuf,
    _dir: TempDir,
}

impl TestStore {
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(config: StoreConfig) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("store.db");
        Self {
            config,
            path,
            _dir: dir,
        }
    }

    /// Open (or reopen) the journalled store file.
    #[allow(clippy::expect_used)]
    pub fn open(&self) -> JournalledPageFile {
        JournalledPageFile::open_with_config(&self.path, &self.config)
            .expect("Failed to open store")
    }
}

/// Small pages so that a few hundred keys already build a deep tree.
#[must_use]
pub fn small_config() -> StoreConfig {
    StoreConfig {
        page_size: 512,
        max_pages: 1024,
        branch_factor: Some(8),
        journal_apply_threshold: 1000,
    }
}

/// Open an `i32 -> i32` tree over `file`.
#[allow(clippy::expect_used)]
pub fn int_tree<'a>(file: &'a dyn PageFile, config: &StoreConfig) -> BTree<'a, i32, i32> {
    BTreeBuilder::new(IntSerializer, IntSerializer)
        .from_config(config)
        .build(file, NaturalOrder)
        .expect("Failed to build tree")
}

/// All `(key, value)` pairs of the tree in order.
#[allow(clippy::expect_used)]
pub fn contents(tree: &BTree<'_, i32, i32>) -> Vec<(i32, i32)> {
    tree.range(&i32::MIN, &i32::MAX)
        .expect("range")
        .collect::<Result<_, _>>()
        .expect("scan")
}

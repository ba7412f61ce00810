//! B-tree over serialized node pages.
//!
//! This module provides an ordered key-value index stored in a page file.
//!
//! # Structure
//!
//! The tree's page file is cut into three windows:
//! - page 0: superblock (root pointer and geometry)
//! - pages `[1, 1 + b)`: allocation bitmap for the node region
//! - pages `[1 + b, 1 + b + max_pages)`: node and payload pages
//!
//! Nodes are addressed by page pointer only. There are no sibling links and
//! no in-memory parent references; scans and rebalancing walk a stack of
//! nodes loaded on the way down.
//!
//! # Usage
//!
//! ```
//! use pagestore::btree::{BTreeBuilder, NaturalOrder};
//! use pagestore::file::MemoryPageFile;
//! use pagestore::serialize::{IntSerializer, StringSerializer};
//!
//! let file = MemoryPageFile::new(512);
//! let mut tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 16 })
//!     .max_pages(64)
//!     .build(&file, NaturalOrder)
//!     .expect("build");
//! tree.create().expect("create");
//!
//! tree.put(7, "seven".to_string()).expect("put");
//! assert_eq!(tree.get(&7).expect("get"), Some("seven".to_string()));
//! ```

mod mutator;
mod node;
mod tree;

use std::cmp::Ordering;
use std::sync::Arc;

pub use mutator::{BTreeMutator, CommitHook, KeyDataStore};
pub use node::{Entry, MIN_BRANCH_FACTOR, NODE_HEADER_SIZE, Node, Slot, slot_size};
pub use tree::{BTree, Cursor, TreeState, TreeStats};

use crate::config::StoreConfig;
use crate::file::{FileError, PageFile, PagingError};
use crate::journal::JournalError;
use crate::page::PageId;
use crate::serialize::Serializer;

/// Total order over keys, supplied when a tree is built.
pub trait Comparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

impl<K, F> Comparator<K> for F
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

/// The key type's own [`Ord`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Builds a [`BTree`] over a page file.
pub struct BTreeBuilder<K, V> {
    key: Arc<dyn Serializer<K>>,
    value: Arc<dyn Serializer<V>>,
    max_pages: PageId,
    branch_factor: Option<usize>,
}

impl<K: Clone + 'static, V: Clone + 'static> BTreeBuilder<K, V> {
    pub fn new(
        key: impl Serializer<K> + 'static,
        value: impl Serializer<V> + 'static,
    ) -> Self {
        Self {
            key: Arc::new(key),
            value: Arc::new(value),
            max_pages: StoreConfig::DEFAULT_MAX_PAGES,
            branch_factor: None,
        }
    }

    /// Number of pages available for nodes and payloads.
    #[must_use]
    pub const fn max_pages(mut self, max_pages: PageId) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Maximum slots per node. Derived from the page size when not set.
    #[must_use]
    pub const fn branch_factor(mut self, branch_factor: usize) -> Self {
        self.branch_factor = Some(branch_factor);
        self
    }

    /// Take the tree geometry from a store configuration.
    #[must_use]
    pub const fn from_config(mut self, config: &StoreConfig) -> Self {
        self.max_pages = config.max_pages;
        self.branch_factor = config.branch_factor;
        self
    }

    /// Open a tree over `file`.
    ///
    /// The tree is `Ready` when the file already holds a superblock and
    /// `Uninitialized` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`BTreeError::PageTooSmall`] when `branch_factor` slots do not
    /// fit on one page, and [`BTreeError::InvalidBranchFactor`] when the
    /// branch factor is below [`MIN_BRANCH_FACTOR`].
    pub fn build<'a>(
        self,
        file: &'a dyn PageFile,
        comparator: impl Comparator<K> + 'a,
    ) -> Result<BTree<'a, K, V>, BTreeError> {
        let page_size = file.page_size();
        let slot = slot_size(self.key.size(), self.value.size());
        let fits = page_size.saturating_sub(NODE_HEADER_SIZE) / slot;
        let branch_factor = self.branch_factor.unwrap_or(fits);

        if branch_factor < MIN_BRANCH_FACTOR {
            if self.branch_factor.is_some() {
                return Err(BTreeError::InvalidBranchFactor(branch_factor));
            }
            return Err(BTreeError::PageTooSmall {
                page_size,
                required: NODE_HEADER_SIZE + MIN_BRANCH_FACTOR * slot,
            });
        }
        if branch_factor > fits {
            return Err(BTreeError::PageTooSmall {
                page_size,
                required: NODE_HEADER_SIZE + branch_factor * slot,
            });
        }

        BTree::open(
            file,
            Box::new(comparator),
            self.key,
            self.value,
            self.max_pages,
            branch_factor,
        )
    }
}

/// Errors from tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// A node, payload, bitmap or superblock page could not be read or written.
    Paging(PagingError),
    /// The commit hook failed.
    Commit(JournalError),
    /// Operation not allowed in the tree's current state.
    InvalidState {
        expected: TreeState,
        actual: TreeState,
    },
    /// `branch_factor` slots do not fit on one page.
    PageTooSmall { page_size: usize, required: usize },
    /// Branch factor below the minimum.
    InvalidBranchFactor(usize),
    /// A tree invariant does not hold on disk.
    Corrupt(String),
    /// No free node pages left.
    StoreFull,
    /// Payload does not fit on one page.
    PayloadTooLarge { len: usize, max: usize },
    /// The `dump` sink failed.
    Format(std::fmt::Error),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paging(e) => write!(f, "B-tree paging error: {e}"),
            Self::Commit(e) => write!(f, "B-tree commit failed: {e}"),
            Self::InvalidState { expected, actual } => {
                write!(f, "B-tree is {actual:?}, expected {expected:?}")
            }
            Self::PageTooSmall {
                page_size,
                required,
            } => write!(
                f,
                "page size {page_size} too small for B-tree nodes, need {required} bytes"
            ),
            Self::InvalidBranchFactor(n) => {
                write!(
                    f,
                    "branch factor {n} is below the minimum of {MIN_BRANCH_FACTOR}"
                )
            }
            Self::Corrupt(message) => write!(f, "corrupt B-tree: {message}"),
            Self::StoreFull => write!(f, "B-tree page region is full"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds the maximum of {max}")
            }
            Self::Format(e) => write!(f, "B-tree dump failed: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Paging(e) => Some(e),
            Self::Commit(e) => Some(e),
            Self::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PagingError> for BTreeError {
    fn from(e: PagingError) -> Self {
        Self::Paging(e)
    }
}

impl From<FileError> for BTreeError {
    fn from(e: FileError) -> Self {
        Self::Paging(PagingError::File(e))
    }
}

impl From<JournalError> for BTreeError {
    fn from(e: JournalError) -> Self {
        Self::Commit(e)
    }
}

impl From<std::fmt::Error> for BTreeError {
    fn from(e: std::fmt::Error) -> Self {
        Self::Format(e)
    }
}

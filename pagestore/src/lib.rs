// Layers, bottom up:
// 1. Pages: fixed-size byte blocks with a typed, checksummed header
// 2. Page files: disk, memory, windows over a parent, typed values
// 3. Journal: staged writes, committed units, replay on open
// 4. Allocation bitmap over a window of node pages
// 5. B-tree: ordered keys over node pages, with payload pages on the side
// 6. File system: names of any length and their contents in one tree
//
// The slot persister sits beside the tree and stores immutable nodes
// append-only, compacted by gc.

pub mod allocator;
pub mod btree;
pub mod config;
pub mod file;
pub mod fs;
pub mod journal;
pub mod page;
pub mod persist;
pub mod serialize;

mod e2e_tests;
#[cfg(test)]
mod testing;

pub use btree::{BTree, BTreeBuilder, BTreeError, BTreeMutator, CommitHook, KeyDataStore};
pub use config::{ConfigError, StoreConfig};
pub use file::{FileError, PageFile, PagingError, SerializedPageFile, SubPageFile};
pub use fs::{FileSystem, FsError};
pub use journal::{JournalError, JournalledPageFile};
pub use page::{Page, PageId};
pub use persist::{PersistSlot, SlotPersister};

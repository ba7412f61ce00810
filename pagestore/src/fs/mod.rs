//! Files with names of any length, stored in one tree.
//!
//! # Keys
//!
//! Every key is a 48-byte [`NameKey`](keys::NameKey):
//! - id 0: chunks of the file names ([`FileSystemKeySet`])
//! - id 1: file size, an inline `u32` value
//! - id 2: content pages, one payload page per index
//!
//! # Concurrency
//!
//! The tree sits behind an `RwLock`. A [`FileSystemMutator`] holds the
//! write half for its whole lifetime and commits each `replace` as one
//! unit, so readers holding the read half only ever see committed files.

pub mod key_set;
pub mod keys;

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use key_set::FileSystemKeySet;

use crate::btree::{
    BTree, BTreeBuilder, BTreeError, BTreeMutator, CommitHook, KeyDataStore, NaturalOrder,
};
use crate::config::StoreConfig;
use crate::file::PageFile;
use crate::journal::JournalError;
use crate::serialize::{FixedBytesSerializer, PointerSerializer};

type NameTree<'a> = BTree<'a, Vec<u8>, u32>;

/// A file store over a page file.
pub struct FileSystem<'a> {
    tree: RwLock<NameTree<'a>>,
    hook: &'a dyn CommitHook,
}

impl<'a> FileSystem<'a> {
    /// Open the store kept in `pages`. `hook` commits each unit of writes,
    /// usually the journal `pages` belongs to.
    pub fn open(
        pages: &'a dyn PageFile,
        hook: &'a dyn CommitHook,
        config: &StoreConfig,
    ) -> Result<Self, FsError> {
        let tree = BTreeBuilder::new(FixedBytesSerializer { len: keys::KEY_SIZE }, PointerSerializer)
            .from_config(config)
            .build(pages, NaturalOrder)?;
        tracing::debug!(state = ?tree.state(), branch_factor = tree.branch_factor(), "opened file system");

        Ok(Self {
            tree: RwLock::new(tree),
            hook,
        })
    }

    fn read_tree(&self) -> Result<RwLockReadGuard<'_, NameTree<'a>>, FsError> {
        self.tree.read().map_err(|_| FsError::LockPoisoned)
    }

    fn write_tree(&self) -> Result<RwLockWriteGuard<'_, NameTree<'a>>, FsError> {
        self.tree.write().map_err(|_| FsError::LockPoisoned)
    }

    /// Format an empty store and commit it.
    pub fn create(&self) -> Result<(), FsError> {
        self.write_tree()?.create()?;
        self.hook.commit()?;
        tracing::info!("created file system");
        Ok(())
    }

    /// Close the tree and commit whatever it still holds.
    pub fn close(&self) -> Result<(), FsError> {
        self.write_tree()?.close()?;
        self.hook.commit()?;
        Ok(())
    }

    /// Names of stored files, see [`key_set::list`].
    pub fn list(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<Vec<Vec<u8>>, FsError> {
        Ok(key_set::list(&*self.read_tree()?, lo, hi)?)
    }

    /// Content of file `name`, or `None` when there is no such file.
    pub fn read(&self, name: &[u8]) -> Result<Option<Vec<u8>>, FsError> {
        read_content(&*self.read_tree()?, name)
    }

    /// Take the write lock for a series of changes.
    pub fn mutate(&self) -> Result<FileSystemMutator<'_, 'a>, FsError> {
        Ok(FileSystemMutator {
            tree: self.write_tree()?,
            hook: self.hook,
        })
    }
}

/// Exclusive write access to a [`FileSystem`].
pub struct FileSystemMutator<'f, 'a> {
    tree: RwLockWriteGuard<'f, NameTree<'a>>,
    hook: &'a dyn CommitHook,
}

impl FileSystemMutator<'_, '_> {
    pub fn list(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<Vec<Vec<u8>>, FsError> {
        Ok(key_set::list(&*self.tree, lo, hi)?)
    }

    pub fn read(&self, name: &[u8]) -> Result<Option<Vec<u8>>, FsError> {
        read_content(&*self.tree, name)
    }

    /// Write file `name`, or delete it when `content` is `None`.
    ///
    /// The change is committed as one unit. On failure nothing of it
    /// remains.
    pub fn replace(&mut self, name: &[u8], content: Option<&[u8]>) -> Result<(), FsError> {
        let mut mutator = BTreeMutator::new(&mut *self.tree, self.hook);
        write_content(&mut mutator, name, content)?;
        mutator.end(true)?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn page_count(size: u32, page: usize) -> u32 {
    (size as usize).div_ceil(page) as u32
}

fn read_content<S>(store: &S, name: &[u8]) -> Result<Option<Vec<u8>>, FsError>
where
    S: KeyDataStore<Vec<u8>, u32> + ?Sized,
{
    let Some(size) = store.get(&keys::size_key(name).to_bytes())? else {
        return Ok(None);
    };
    let page = store.payload_capacity().max(1);

    let mut content = Vec::with_capacity(size as usize);
    for index in 0..page_count(size, page) {
        let bytes = store
            .get_payload(&keys::data_key(name, index).to_bytes())?
            .ok_or_else(|| FsError::Corrupt(format!("page {index} of a {size}-byte file is missing")))?;
        content.extend_from_slice(&bytes);
    }
    if content.len() != size as usize {
        return Err(FsError::Corrupt(format!(
            "file holds {} bytes, size record says {size}",
            content.len()
        )));
    }
    Ok(Some(content))
}

fn write_content<S>(store: &mut S, name: &[u8], content: Option<&[u8]>) -> Result<(), FsError>
where
    S: KeyDataStore<Vec<u8>, u32> + ?Sized,
{
    let size = content
        .map(|bytes| u32::try_from(bytes.len()).map_err(|_| FsError::FileTooLarge { len: bytes.len() }))
        .transpose()?;
    let size_key = keys::size_key(name).to_bytes();
    let page = store.payload_capacity().max(1);

    if let Some(old) = store.get(&size_key)? {
        for index in 0..page_count(old, page) {
            store.remove(&keys::data_key(name, index).to_bytes())?;
        }
        store.remove(&size_key)?;
    }

    let (Some(size), Some(bytes)) = (size, content) else {
        FileSystemKeySet::new(store).remove(name)?;
        return Ok(());
    };

    FileSystemKeySet::new(&mut *store).add(name)?;
    for (index, chunk) in (0..).zip(bytes.chunks(page)) {
        store.put_payload(keys::data_key(name, index).to_bytes(), chunk)?;
    }
    store.put(size_key, size)?;
    Ok(())
}

/// Errors from the file store.
#[derive(Debug)]
pub enum FsError {
    /// The underlying tree failed.
    Tree(BTreeError),
    /// The tree lock was poisoned by a panicking thread.
    LockPoisoned,
    /// Stored file records disagree with each other.
    Corrupt(String),
    /// Content longer than a `u32` size record can describe.
    FileTooLarge { len: usize },
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(e) => write!(f, "file system tree error: {e}"),
            Self::LockPoisoned => write!(f, "file system lock poisoned"),
            Self::Corrupt(message) => write!(f, "corrupt file system: {message}"),
            Self::FileTooLarge { len } => write!(f, "file of {len} bytes is too large"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BTreeError> for FsError {
    fn from(e: BTreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<JournalError> for FsError {
    fn from(e: JournalError) -> Self {
        Self::Tree(BTreeError::Commit(e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::journal::{JournalState, JournalledPageFile};
    use crate::testing::{MemoryJournal, init_tracing, memory_journal};

    fn journal() -> MemoryJournal {
        init_tracing();
        memory_journal(512, 4).expect("open journal")
    }

    fn config() -> StoreConfig {
        StoreConfig {
            page_size: 512,
            max_pages: 256,
            ..StoreConfig::default()
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Commits through the journal until armed, then fails every commit.
    struct FlakyCommit<'j> {
        journal: &'j MemoryJournal,
        fail: AtomicBool,
    }

    impl CommitHook for FlakyCommit<'_> {
        fn commit(&self) -> Result<(), JournalError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(JournalError::Closed);
            }
            self.journal.commit()
        }

        fn rollback(&self) -> Result<(), JournalError> {
            self.journal.rollback()
        }
    }

    #[test]
    fn test_write_read_overwrite_delete() {
        let pages = journal();
        let fs = FileSystem::open(&pages, &pages, &config()).expect("open");
        fs.create().expect("create");

        let big = content(1800);
        let mut m = fs.mutate().expect("mutate");
        m.replace(b"docs/big.bin", Some(big.as_slice())).expect("write");
        m.replace(b"docs/empty", Some(b"".as_slice())).expect("write empty");
        assert_eq!(m.read(b"docs/big.bin").expect("read"), Some(big));
        drop(m);

        assert_eq!(fs.read(b"docs/empty").expect("read"), Some(Vec::new()));
        assert_eq!(fs.read(b"docs/missing").expect("read"), None);

        let mut m = fs.mutate().expect("mutate");
        m.replace(b"docs/big.bin", Some(b"small".as_slice())).expect("overwrite");
        m.replace(b"docs/empty", None).expect("delete");
        m.replace(b"docs/never", None).expect("delete absent");
        drop(m);

        assert_eq!(fs.read(b"docs/big.bin").expect("read"), Some(b"small".to_vec()));
        assert_eq!(fs.read(b"docs/empty").expect("read"), None);
        assert_eq!(fs.list(None, None).expect("list"), vec![b"docs/big.bin".to_vec()]);

        let stats = fs.read_tree().expect("lock").check().expect("check");
        // one chunk, one terminal, the size record and one data page
        assert_eq!(stats.entries, 4);
        assert_eq!(stats.payloads, 1);
    }

    #[test]
    fn test_long_names_are_listed_whole() {
        let pages = journal();
        let fs = FileSystem::open(&pages, &pages, &config()).expect("open");
        fs.create().expect("create");

        let names: Vec<Vec<u8>> = vec![
            b"a/very/long/path/exceeding/one/chunk".to_vec(),
            b"a/very/long/path/exceeding/one/chunk/and/then/some/more/segments".to_vec(),
            b"b".to_vec(),
        ];
        let mut m = fs.mutate().expect("mutate");
        for name in &names {
            m.replace(name, Some(name.as_slice())).expect("write");
        }
        drop(m);

        assert_eq!(fs.list(None, None).expect("list"), names);
        for name in &names {
            assert_eq!(fs.read(name).expect("read").as_deref(), Some(name.as_slice()));
        }
    }

    #[test]
    fn test_failed_unit_leaves_nothing_behind() {
        let pages = journal();
        let hook = FlakyCommit {
            journal: &pages,
            fail: AtomicBool::new(false),
        };
        let fs = FileSystem::open(&pages, &hook, &config()).expect("open");
        fs.create().expect("create");
        fs.mutate()
            .expect("mutate")
            .replace(b"kept", Some(b"v1".as_slice()))
            .expect("write");

        hook.fail.store(true, Ordering::SeqCst);
        let mut m = fs.mutate().expect("mutate");
        assert!(m.replace(b"lost", Some(b"v2".as_slice())).is_err());
        assert!(m.replace(b"kept", None).is_err());
        drop(m);

        assert_eq!(fs.read(b"lost").expect("read"), None);
        assert_eq!(fs.read(b"kept").expect("read"), Some(b"v1".to_vec()));
        assert_eq!(fs.list(None, None).expect("list"), vec![b"kept".to_vec()]);
        assert_ne!(pages.state().expect("state"), JournalState::Dirty);
        fs.read_tree().expect("lock").check().expect("check");
    }

    #[test]
    fn test_files_survive_reopen() {
        let pages = journal();
        {
            let fs = FileSystem::open(&pages, &pages, &config()).expect("open");
            fs.create().expect("create");
            fs.mutate()
                .expect("mutate")
                .replace(b"notes.txt", Some(content(700).as_slice()))
                .expect("write");
            fs.close().expect("close");
        }
        let (data, log) = pages.into_parts().expect("parts");
        let pages = JournalledPageFile::with_parts(data, log, 4).expect("reopen journal");

        let fs = FileSystem::open(&pages, &pages, &config()).expect("reopen");
        assert_eq!(fs.read(b"notes.txt").expect("read"), Some(content(700)));
    }
}

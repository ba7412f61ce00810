//! Batched tree writes with a commit callback.
//!
//! A [`BTreeMutator`] wraps a tree for one unit of work. Ending it with
//! `complete = true` runs the commit hook once; ending it with `false`, or
//! dropping it, runs the rollback hook and reloads the tree from the file
//! so that the in-memory root and allocator match the pages that remain.

use crate::btree::{BTree, BTreeError};
use crate::file::PageFile;
use crate::journal::{JournalError, JournalledPageFile, LogFile};

/// Called when a unit of tree writes ends.
pub trait CommitHook: Send + Sync {
    fn commit(&self) -> Result<(), JournalError>;

    /// Discard the unit's writes.
    fn rollback(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

impl<F> CommitHook for F
where
    F: Fn() -> Result<(), JournalError> + Send + Sync,
{
    fn commit(&self) -> Result<(), JournalError> {
        self()
    }
}

impl<P: PageFile, L: LogFile> CommitHook for JournalledPageFile<P, L> {
    fn commit(&self) -> Result<(), JournalError> {
        Self::commit(self)
    }

    fn rollback(&self) -> Result<(), JournalError> {
        Self::rollback(self)
    }
}

/// Key-value operations shared by a tree and a mutator over it.
pub trait KeyDataStore<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>, BTreeError>;

    fn get_terminal(&self, key: &K) -> Result<bool, BTreeError>;

    fn get_payload(&self, key: &K) -> Result<Option<Vec<u8>>, BTreeError>;

    /// Keys of every kind in `[lo, hi)`.
    fn keys<'s>(
        &'s self,
        lo: &K,
        hi: &K,
    ) -> Result<Box<dyn Iterator<Item = Result<K, BTreeError>> + 's>, BTreeError>;

    fn put(&mut self, key: K, value: V) -> Result<(), BTreeError>;

    fn put_terminal(&mut self, key: K) -> Result<(), BTreeError>;

    fn put_payload(&mut self, key: K, bytes: &[u8]) -> Result<(), BTreeError>;

    fn remove(&mut self, key: &K) -> Result<bool, BTreeError>;

    fn payload_capacity(&self) -> usize;
}

impl<K: Clone + 'static, V: Clone + 'static> KeyDataStore<K, V> for BTree<'_, K, V> {
    fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        Self::get(self, key)
    }

    fn get_terminal(&self, key: &K) -> Result<bool, BTreeError> {
        Self::get_terminal(self, key)
    }

    fn get_payload(&self, key: &K) -> Result<Option<Vec<u8>>, BTreeError> {
        Self::get_payload(self, key)
    }

    fn keys<'s>(
        &'s self,
        lo: &K,
        hi: &K,
    ) -> Result<Box<dyn Iterator<Item = Result<K, BTreeError>> + 's>, BTreeError> {
        Ok(Box::new(Self::keys(self, lo, hi)?))
    }

    fn put(&mut self, key: K, value: V) -> Result<(), BTreeError> {
        Self::put(self, key, value)
    }

    fn put_terminal(&mut self, key: K) -> Result<(), BTreeError> {
        Self::put_terminal(self, key)
    }

    fn put_payload(&mut self, key: K, bytes: &[u8]) -> Result<(), BTreeError> {
        Self::put_payload(self, key, bytes)
    }

    fn remove(&mut self, key: &K) -> Result<bool, BTreeError> {
        Self::remove(self, key)
    }

    fn payload_capacity(&self) -> usize {
        Self::payload_capacity(self)
    }
}

/// One unit of writes against a tree.
pub struct BTreeMutator<'t, 'a, K: Clone + 'static, V: Clone + 'static> {
    tree: &'t mut BTree<'a, K, V>,
    hook: &'t dyn CommitHook,
    ended: bool,
}

impl<'t, 'a, K: Clone + 'static, V: Clone + 'static> BTreeMutator<'t, 'a, K, V> {
    pub fn new(tree: &'t mut BTree<'a, K, V>, hook: &'t dyn CommitHook) -> Self {
        Self {
            tree,
            hook,
            ended: false,
        }
    }

    /// The tree as modified so far.
    #[must_use]
    pub fn tree(&self) -> &BTree<'a, K, V> {
        self.tree
    }

    /// Finish the unit: commit it when `complete`, otherwise discard it.
    ///
    /// A failed commit discards the unit as well and returns the error.
    pub fn end(mut self, complete: bool) -> Result<(), BTreeError> {
        self.ended = true;
        if !complete {
            return self.abort();
        }
        if let Err(e) = self.hook.commit() {
            if let Err(abort_error) = self.abort() {
                tracing::warn!(error = %abort_error, "failed to discard unit after failed commit");
            }
            return Err(BTreeError::Commit(e));
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<(), BTreeError> {
        self.hook.rollback()?;
        self.tree.reload()?;
        tracing::debug!("discarded tree writes");
        Ok(())
    }
}

impl<K: Clone + 'static, V: Clone + 'static> Drop for BTreeMutator<'_, '_, K, V> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        tracing::warn!("tree mutator dropped without end, discarding writes");
        if let Err(e) = self.abort() {
            tracing::warn!(error = %e, "failed to discard writes of dropped mutator");
        }
    }
}

impl<K: Clone + 'static, V: Clone + 'static> KeyDataStore<K, V> for BTreeMutator<'_, '_, K, V> {
    fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        self.tree.get(key)
    }

    fn get_terminal(&self, key: &K) -> Result<bool, BTreeError> {
        self.tree.get_terminal(key)
    }

    fn get_payload(&self, key: &K) -> Result<Option<Vec<u8>>, BTreeError> {
        self.tree.get_payload(key)
    }

    fn keys<'s>(
        &'s self,
        lo: &K,
        hi: &K,
    ) -> Result<Box<dyn Iterator<Item = Result<K, BTreeError>> + 's>, BTreeError> {
        Ok(Box::new(self.tree.keys(lo, hi)?))
    }

    fn put(&mut self, key: K, value: V) -> Result<(), BTreeError> {
        self.tree.put(key, value)
    }

    fn put_terminal(&mut self, key: K) -> Result<(), BTreeError> {
        self.tree.put_terminal(key)
    }

    fn put_payload(&mut self, key: K, bytes: &[u8]) -> Result<(), BTreeError> {
        self.tree.put_payload(key, bytes)
    }

    fn remove(&mut self, key: &K) -> Result<bool, BTreeError> {
        self.tree.remove(key)
    }

    fn payload_capacity(&self) -> usize {
        self.tree.payload_capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::btree::{BTreeBuilder, NaturalOrder};
    use crate::file::{FaultConfig, MemoryPageFile};
    use crate::journal::JournalState;
    use crate::serialize::IntSerializer;
    use crate::testing::{MemoryJournal, memory_journal};

    fn journal() -> MemoryJournal {
        memory_journal(512, 64).expect("open journal")
    }

    fn created_tree(file: &MemoryJournal) -> BTree<'_, i32, i32> {
        let mut tree = BTreeBuilder::new(IntSerializer, IntSerializer)
            .max_pages(64)
            .branch_factor(4)
            .build(file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");
        file.commit().expect("commit create");
        tree
    }

    #[test]
    fn test_complete_unit_is_committed() {
        let file = journal();
        let mut tree = created_tree(&file);

        let mut mutator = BTreeMutator::new(&mut tree, &file);
        for k in 0..20 {
            mutator.put(k, k * 10).expect("put");
        }
        mutator.end(true).expect("end");

        assert_eq!(file.state().expect("state"), JournalState::Committed);
        assert_eq!(tree.get(&7).expect("get"), Some(70));
        tree.check().expect("check");
    }

    #[test]
    fn test_unit_logged_but_not_applied_still_ends_ok() {
        let file = memory_journal(512, 1).expect("open journal");
        let mut tree = created_tree(&file);
        file.data()
            .set_fault_config(FaultConfig::failing_writes())
            .expect("faults");

        let mut mutator = BTreeMutator::new(&mut tree, &file);
        mutator.put(7, 70).expect("put");
        mutator.end(true).expect("end");

        assert_eq!(file.state().expect("state"), JournalState::Committed);
        assert_eq!(tree.get(&7).expect("get"), Some(70));
        tree.check().expect("check");
    }

    #[test]
    fn test_incomplete_unit_is_discarded() {
        let file = journal();
        let mut tree = created_tree(&file);
        tree.put(1, 1).expect("put");
        file.commit().expect("commit");

        let mut mutator = BTreeMutator::new(&mut tree, &file);
        for k in 2..40 {
            mutator.put(k, k).expect("put");
        }
        assert!(mutator.remove(&1).expect("remove"));
        mutator.end(false).expect("end");

        assert_eq!(tree.get(&1).expect("get"), Some(1));
        assert_eq!(tree.get(&2).expect("get"), None);
        let stats = tree.check().expect("check");
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.nodes, 1);
    }

    #[test]
    fn test_dropped_mutator_discards() {
        let file = journal();
        let mut tree = created_tree(&file);
        {
            let mut mutator = BTreeMutator::new(&mut tree, &file);
            mutator.put(5, 5).expect("put");
            assert_eq!(mutator.get(&5).expect("get"), Some(5));
        }
        assert_eq!(tree.get(&5).expect("get"), None);
        assert_eq!(file.state().expect("state"), JournalState::Committed);
    }

    #[test]
    fn test_closure_hook_runs_once() {
        let file = MemoryPageFile::new(512);
        let mut tree = BTreeBuilder::new(IntSerializer, IntSerializer)
            .max_pages(16)
            .build(&file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");

        let calls = AtomicUsize::new(0);
        let hook = || -> Result<(), JournalError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let mut mutator = BTreeMutator::new(&mut tree, &hook);
        mutator.put_terminal(3).expect("terminal");
        mutator.end(true).expect("end");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tree.get_terminal(&3).expect("terminal"));
    }

    #[test]
    fn test_failed_commit_discards_unit() {
        let file = journal();
        let mut tree = created_tree(&file);

        let failing = || -> Result<(), JournalError> { Err(JournalError::Closed) };
        let mut mutator = BTreeMutator::new(&mut tree, &failing);
        mutator.put(9, 9).expect("put");
        assert!(matches!(
            mutator.end(true),
            Err(BTreeError::Commit(JournalError::Closed))
        ));
    }
}

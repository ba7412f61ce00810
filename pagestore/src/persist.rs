//! Append-only persistence for immutable tree nodes.
//!
//! Every saved [`PersistSlot`] gets the next free page and is never
//! rewritten in place, so a saved pointer identifies one version of a node
//! forever. Old versions pile up at the front of the file until [`gc`]
//! compacts the tail: it keeps the pages reachable from the given roots and
//! slides them down, rewriting child pointers as it goes.
//!
//! # Layout
//!
//! ```text
//! page 0        page count (u32)
//! pages 1..     slot pages, numbered from 0
//! ```
//!
//! [`gc`]: SlotPersister::gc

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::file::{FileError, PageFile, PagingError, SerializedPageFile, SubPageFile, sub_page_files};
use crate::page::{PageHeader, PageId, PageType};
use crate::serialize::{
    ListSerializer, NullableSerializer, PairSerializer, PointerSerializer, SerInput, SerOutput,
    SerializeError, Serializer,
};

/// One stored node: pivots with optional child pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistSlot<T> {
    pub pairs: Vec<(Option<T>, Option<PageId>)>,
}

impl<T> PersistSlot<T> {
    fn children(&self) -> impl Iterator<Item = PageId> + '_ {
        self.pairs.iter().filter_map(|(_, child)| *child)
    }
}

type PairList<S> =
    ListSerializer<PairSerializer<NullableSerializer<S>, NullableSerializer<PointerSerializer>>>;

struct PersistSlotSerializer<S> {
    list: PairList<S>,
}

impl<T, S: Serializer<T>> Serializer<PersistSlot<T>> for PersistSlotSerializer<S> {
    fn read(&self, input: &mut SerInput<'_>) -> Result<PersistSlot<T>, SerializeError> {
        Ok(PersistSlot {
            pairs: self.list.read(input)?,
        })
    }

    fn write(&self, output: &mut SerOutput, value: &PersistSlot<T>) -> Result<(), SerializeError> {
        self.list.write(output, &value.pairs)
    }

    fn size(&self) -> usize {
        self.list.size()
    }
}

struct PersistState<T> {
    count: PageId,
    cache: HashMap<PageId, Arc<PersistSlot<T>>>,
}

/// Stores [`PersistSlot`]s on consecutive pages of a file.
pub struct SlotPersister<'a, T> {
    count_file: SerializedPageFile<SubPageFile<'a>, u32>,
    slots: SerializedPageFile<SubPageFile<'a>, PersistSlot<T>>,
    max_pairs: usize,
    state: Mutex<PersistState<T>>,
}

impl<'a, T: 'static> SlotPersister<'a, T> {
    /// Open the persister over `file`, reading its page count.
    pub fn open<S>(file: &'a dyn PageFile, serializer: S) -> Result<Self, PagingError>
    where
        S: Serializer<T> + 'static,
    {
        let windows = sub_page_files(file, &[0, 1, PageId::MAX]);
        let &[count_window, slot_window] = windows.as_slice() else {
            return Err(PagingError::File(FileError::PageOutOfRange {
                pointer: 0,
                start: 0,
                end: 0,
            }));
        };

        let pair = PairSerializer(NullableSerializer(serializer), NullableSerializer(PointerSerializer));
        let capacity = file.page_size().saturating_sub(PageHeader::SIZE + 4);
        let max_pairs = capacity / pair.size().max(1);
        let slots = SerializedPageFile::new(
            slot_window,
            PersistSlotSerializer {
                list: ListSerializer {
                    item: pair,
                    max_len: max_pairs,
                },
            },
            PageType::Slots,
        );
        let count_file = SerializedPageFile::new(count_window, PointerSerializer, PageType::Counter);

        let count = match count_file.load(0) {
            Ok(count) => count,
            Err(e) if e.is_unwritten() => 0,
            Err(e) => return Err(e),
        };
        tracing::debug!(count, max_pairs, "opened slot persister");

        Ok(Self {
            count_file,
            slots,
            max_pairs,
            state: Mutex::new(PersistState {
                count,
                cache: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PersistState<T>>, PagingError> {
        self.state
            .lock()
            .map_err(|_| PagingError::File(FileError::LockPoisoned))
    }

    /// Largest number of pairs one slot page holds.
    #[must_use]
    pub const fn max_pairs(&self) -> usize {
        self.max_pairs
    }

    /// Number of slot pages in use.
    pub fn count(&self) -> Result<PageId, PagingError> {
        Ok(self.lock()?.count)
    }

    /// Load the slot stored at `pointer`.
    pub fn load(&self, pointer: PageId) -> Result<Arc<PersistSlot<T>>, PagingError> {
        let mut state = self.lock()?;
        if pointer >= state.count {
            return Err(PagingError::File(FileError::PageOutOfRange {
                pointer: u64::from(pointer),
                start: 0,
                end: u64::from(state.count),
            }));
        }
        if let Some(slot) = state.cache.get(&pointer) {
            return Ok(Arc::clone(slot));
        }
        let slot = Arc::new(self.slots.load(pointer)?);
        state.cache.insert(pointer, Arc::clone(&slot));
        Ok(slot)
    }

    /// Append `slot` on a new page and return its pointer.
    pub fn save(&self, slot: PersistSlot<T>) -> Result<PageId, PagingError> {
        let mut state = self.lock()?;
        let pointer = state.count;
        self.slots.save(pointer, &slot)?;
        state.count += 1;
        state.cache.insert(pointer, Arc::new(slot));
        Ok(pointer)
    }

    /// Compact the last `back` pages, keeping only those reachable from
    /// `roots`.
    ///
    /// Pages below the window are kept as they are. Returns the new pointer
    /// of every kept page in the window; pointers not in the map are
    /// unchanged.
    pub fn gc(&self, roots: &[PageId], back: PageId) -> Result<HashMap<PageId, PageId>, PagingError> {
        let mut state = self.lock()?;
        let end = state.count;
        let start = end.saturating_sub(back);
        let mut in_use = vec![false; (end - start) as usize];

        mark(&mut in_use, start, roots.iter().copied());
        // children always sit below their parents
        for pointer in (start..end).rev() {
            if in_use[(pointer - start) as usize] {
                let slot = self.slots.load(pointer)?;
                mark(&mut in_use, start, slot.children());
            }
        }

        let mut map = HashMap::new();
        let mut next = start;
        for pointer in start..end {
            if !in_use[(pointer - start) as usize] {
                continue;
            }
            let mut slot = self.slots.load(pointer)?;
            for child in slot.pairs.iter_mut().filter_map(|(_, child)| child.as_mut()) {
                let old = *child;
                *child = map.get(&old).copied().unwrap_or(old);
            }
            self.slots.save(next, &slot)?;
            map.insert(pointer, next);
            next += 1;
        }

        state.count = next;
        state.cache.clear();
        tracing::info!(
            window = end - start,
            kept = next - start,
            count = next,
            "compacted slot pages"
        );
        Ok(map)
    }

    /// Persist the page count and sync.
    pub fn close(&self) -> Result<(), PagingError> {
        let state = self.lock()?;
        self.count_file.save(0, &state.count)?;
        self.count_file.sync()
    }
}

fn mark(in_use: &mut [bool], start: PageId, pointers: impl Iterator<Item = PageId>) {
    for pointer in pointers {
        if let Some(flag) = pointer
            .checked_sub(start)
            .and_then(|i| in_use.get_mut(i as usize))
        {
            *flag = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryPageFile;
    use crate::serialize::IntSerializer;

    fn leaf(values: &[i32]) -> PersistSlot<i32> {
        PersistSlot {
            pairs: values.iter().map(|&v| (Some(v), None)).collect(),
        }
    }

    fn branch(children: &[(i32, PageId)]) -> PersistSlot<i32> {
        PersistSlot {
            pairs: children.iter().map(|&(v, c)| (Some(v), Some(c))).collect(),
        }
    }

    #[test]
    fn test_save_appends_and_load_reads_back() {
        let file = MemoryPageFile::new(256);
        let persister = SlotPersister::open(&file, IntSerializer).expect("open");
        assert_eq!(persister.count().expect("count"), 0);

        let a = persister.save(leaf(&[1, 2])).expect("save");
        let b = persister.save(leaf(&[3])).expect("save");
        assert_eq!((a, b), (0, 1));
        assert_eq!(*persister.load(b).expect("load"), leaf(&[3]));
        assert!(persister.load(2).is_err());
    }

    #[test]
    fn test_count_survives_close() {
        let file = MemoryPageFile::new(256);
        {
            let persister = SlotPersister::open(&file, IntSerializer).expect("open");
            persister.save(leaf(&[1])).expect("save");
            persister
                .save(PersistSlot {
                    pairs: vec![(None, Some(0))],
                })
                .expect("save");
            persister.close().expect("close");
        }

        let persister = SlotPersister::open(&file, IntSerializer).expect("reopen");
        assert_eq!(persister.count().expect("count"), 2);
        assert_eq!(
            persister.load(1).expect("load").pairs,
            vec![(None, Some(0))]
        );
    }

    #[test]
    fn test_gc_keeps_reachable_pages_and_remaps_children() {
        let file = MemoryPageFile::new(256);
        let persister = SlotPersister::open(&file, IntSerializer).expect("open");

        let stale = persister.save(leaf(&[0])).expect("save");
        let left = persister.save(leaf(&[1])).expect("save");
        let garbage = persister.save(leaf(&[99])).expect("save");
        let right = persister.save(leaf(&[2])).expect("save");
        let root = persister.save(branch(&[(1, left), (2, right)])).expect("save");
        assert_eq!((stale, garbage), (0, 2));

        let map = persister.gc(&[root], 4).expect("gc");

        // page 0 is below the window and stays
        assert_eq!(map.get(&left), Some(&1));
        assert_eq!(map.get(&right), Some(&2));
        assert_eq!(map.get(&root), Some(&3));
        assert!(!map.contains_key(&garbage));
        assert_eq!(persister.count().expect("count"), 4);

        let new_root = persister.load(3).expect("load");
        assert_eq!(*new_root, branch(&[(1, 1), (2, 2)]));
        assert_eq!(*persister.load(2).expect("load"), leaf(&[2]));
        assert_eq!(*persister.load(0).expect("load"), leaf(&[0]));
    }

    #[test]
    fn test_gc_with_no_roots_empties_window() {
        let file = MemoryPageFile::new(256);
        let persister = SlotPersister::open(&file, IntSerializer).expect("open");
        for v in 0..5 {
            persister.save(leaf(&[v])).expect("save");
        }

        let map = persister.gc(&[], 3).expect("gc");
        assert!(map.is_empty());
        assert_eq!(persister.count().expect("count"), 2);
    }

    #[test]
    fn test_oversized_slot_is_refused() {
        let file = MemoryPageFile::new(256);
        let persister = SlotPersister::open(&file, IntSerializer).expect("open");
        let values: Vec<i32> = (0..=i32::try_from(persister.max_pairs()).expect("fits")).collect();

        assert!(matches!(
            persister.save(leaf(&values)),
            Err(PagingError::Encode(SerializeError::TooLong { .. }))
        ));
        assert_eq!(persister.count().expect("count"), 0);
    }
}

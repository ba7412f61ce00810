//! B-tree operations.
//!
//! Writes descend from the root keeping the path of visited nodes, change
//! the leaf, then walk the path back up: splitting nodes that grew past the
//! branch factor, merging or redistributing nodes that fell below half of
//! it, and keeping every parent slot equal to its child's first key. Node
//! pages are written through the page file; committing them is left to the
//! caller (see [`BTreeMutator`](super::BTreeMutator)).

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use crate::allocator::{BitmapFile, PageAllocator, bitmap_file, bitmap_pages_needed};
use crate::btree::node::{Entry, Node, NodeSerializer, Slot, Superblock, SuperblockSerializer};
use crate::btree::{BTreeError, Comparator};
use crate::file::{PageFile, SerializedPageFile, SubPageFile, sub_page_files};
use crate::page::{PageHeader, PageId, PageType};
use crate::serialize::{BytesSerializer, Serializer};

/// Guard against cycles in a corrupt file.
const MAX_DEPTH: usize = 64;

/// Lifecycle of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    /// The file holds no superblock yet; only `create` is allowed.
    Uninitialized,
    Ready,
    Closed,
}

/// Shape of a tree, as counted by [`BTree::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from the root to the leaves.
    pub depth: usize,
    /// Node pages.
    pub nodes: usize,
    /// Leaf slots of every kind.
    pub entries: usize,
    /// Payload pages.
    pub payloads: usize,
}

/// An ordered index over a page file.
pub struct BTree<'a, K, V> {
    superblock: SerializedPageFile<SubPageFile<'a>, Superblock>,
    bitmap: BitmapFile<SubPageFile<'a>>,
    nodes: SerializedPageFile<SubPageFile<'a>, Node<K, V>>,
    payloads: SerializedPageFile<SubPageFile<'a>, Vec<u8>>,
    comparator: Box<dyn Comparator<K> + 'a>,
    allocator: PageAllocator,
    root: PageId,
    branch_factor: usize,
    max_pages: PageId,
    page_size: usize,
    state: TreeState,
}

type Path<K, V> = Vec<(Node<K, V>, usize)>;

impl<'a, K: Clone + 'static, V: Clone + 'static> BTree<'a, K, V> {
    pub(super) fn open(
        file: &'a dyn PageFile,
        comparator: Box<dyn Comparator<K> + 'a>,
        key: Arc<dyn Serializer<K>>,
        value: Arc<dyn Serializer<V>>,
        max_pages: PageId,
        branch_factor: usize,
    ) -> Result<Self, BTreeError> {
        let page_size = file.page_size();
        let bitmap_pages = bitmap_pages_needed(max_pages, page_size);
        let end = bitmap_pages
            .checked_add(1)
            .and_then(|p| p.checked_add(max_pages))
            .ok_or(BTreeError::StoreFull)?;

        let windows = sub_page_files(file, &[0, 1, 1 + bitmap_pages, end]);
        let &[superblock, bitmap, nodes] = windows.as_slice() else {
            return Err(BTreeError::Corrupt("bad page layout".to_string()));
        };

        let payload_max = page_size.saturating_sub(PageHeader::SIZE + 4);
        let mut tree = Self {
            superblock: SerializedPageFile::new(superblock, SuperblockSerializer, PageType::Superblock),
            bitmap: bitmap_file(bitmap),
            nodes: SerializedPageFile::new(
                nodes,
                NodeSerializer {
                    key,
                    value,
                    max_slots: branch_factor,
                },
                PageType::BTreeNode,
            ),
            payloads: SerializedPageFile::new(
                nodes,
                BytesSerializer { max: payload_max },
                PageType::Payload,
            ),
            comparator,
            allocator: PageAllocator::new(max_pages, page_size),
            root: 0,
            branch_factor,
            max_pages,
            page_size,
            state: TreeState::Uninitialized,
        };
        tree.reload()?;
        Ok(tree)
    }

    #[must_use]
    pub const fn state(&self) -> TreeState {
        self.state
    }

    #[must_use]
    pub const fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    /// Pointer of the root node within the node region.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    /// Largest payload `put_payload` accepts.
    #[must_use]
    pub const fn payload_capacity(&self) -> usize {
        self.page_size.saturating_sub(PageHeader::SIZE + 4)
    }

    /// Free pages left in the node region.
    #[must_use]
    pub const fn free_pages(&self) -> PageId {
        self.allocator.free_count()
    }

    fn require(&self, expected: TreeState) -> Result<(), BTreeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BTreeError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Format an empty tree: bitmap, an empty root leaf and the superblock.
    pub fn create(&mut self) -> Result<(), BTreeError> {
        self.require(TreeState::Uninitialized)?;

        self.allocator = PageAllocator::new(self.max_pages, self.page_size);
        let root = self.allocate()?;
        self.save_node(&Node::new(root))?;
        self.allocator.flush(&self.bitmap)?;
        self.set_root(root)?;
        self.state = TreeState::Ready;

        tracing::info!(
            root,
            branch_factor = self.branch_factor,
            max_pages = self.max_pages,
            "created tree"
        );
        Ok(())
    }

    /// Re-read the root pointer and allocation bitmap from the file.
    ///
    /// Needed after staged pages were rolled back underneath the tree.
    pub fn reload(&mut self) -> Result<(), BTreeError> {
        if self.state == TreeState::Closed {
            return Err(BTreeError::InvalidState {
                expected: TreeState::Ready,
                actual: self.state,
            });
        }

        let superblock = match self.superblock.load(0) {
            Ok(superblock) => superblock,
            Err(e) if e.is_unwritten() => return self.reload_blank(),
            Err(e) => return Err(e.into()),
        };

        if superblock.page_size as usize != self.page_size
            || superblock.max_pages != self.max_pages
            || superblock.branch_factor as usize != self.branch_factor
        {
            return Err(BTreeError::Corrupt(format!(
                "stored geometry (page size {}, max pages {}, branch factor {}) differs from configured ({}, {}, {})",
                superblock.page_size,
                superblock.max_pages,
                superblock.branch_factor,
                self.page_size,
                self.max_pages,
                self.branch_factor
            )));
        }

        self.allocator = PageAllocator::load(&self.bitmap, self.max_pages)?;
        self.root = superblock.root;
        self.state = TreeState::Ready;
        Ok(())
    }

    /// No superblock: a fresh file, unless the bitmap says pages are in use.
    fn reload_blank(&mut self) -> Result<(), BTreeError> {
        match PageAllocator::load(&self.bitmap, self.max_pages) {
            Ok(allocator) if allocator.used_count() > 0 => {
                return Err(BTreeError::Corrupt(format!(
                    "superblock is blank but {} node pages are allocated",
                    allocator.used_count()
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_unwritten() => {}
            Err(e) => return Err(e.into()),
        }
        self.state = TreeState::Uninitialized;
        Ok(())
    }

    /// Mark the tree closed. Later operations fail with `InvalidState`.
    pub fn close(&mut self) -> Result<(), BTreeError> {
        if self.state == TreeState::Closed {
            return Err(BTreeError::InvalidState {
                expected: TreeState::Ready,
                actual: self.state,
            });
        }
        if self.state == TreeState::Ready {
            self.allocator.flush(&self.bitmap)?;
        }
        self.state = TreeState::Closed;
        Ok(())
    }

    /// Look up an inline value.
    pub fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        Ok(match self.lookup(key)? {
            Some(Entry::Value(value)) => Some(value),
            _ => None,
        })
    }

    /// Whether `key` is stored as a terminal marker.
    pub fn get_terminal(&self, key: &K) -> Result<bool, BTreeError> {
        Ok(matches!(self.lookup(key)?, Some(Entry::Terminal)))
    }

    /// Look up a payload.
    pub fn get_payload(&self, key: &K) -> Result<Option<Vec<u8>>, BTreeError> {
        match self.lookup(key)? {
            Some(Entry::Payload(pointer)) => Ok(Some(self.payloads.load(pointer)?)),
            _ => Ok(None),
        }
    }

    /// Insert or overwrite an inline value.
    pub fn put(&mut self, key: K, value: V) -> Result<(), BTreeError> {
        self.insert(key, Entry::Value(value))
    }

    /// Insert or overwrite a key without a value.
    pub fn put_terminal(&mut self, key: K) -> Result<(), BTreeError> {
        self.insert(key, Entry::Terminal)
    }

    /// Store `bytes` on a page of their own under `key`.
    pub fn put_payload(&mut self, key: K, bytes: &[u8]) -> Result<(), BTreeError> {
        self.require(TreeState::Ready)?;
        let max = self.payload_capacity();
        if bytes.len() > max {
            return Err(BTreeError::PayloadTooLarge {
                len: bytes.len(),
                max,
            });
        }

        let pointer = self.allocate()?;
        let stored = self
            .payloads
            .save(pointer, &bytes.to_vec())
            .map_err(BTreeError::from)
            .and_then(|()| self.insert(key, Entry::Payload(pointer)));
        if stored.is_err() {
            self.allocator.free(pointer);
        }
        stored
    }

    /// Remove a key of any kind. Returns whether it was present.
    pub fn remove(&mut self, key: &K) -> Result<bool, BTreeError> {
        self.require(TreeState::Ready)?;
        let (path, mut leaf) = self.descend(key)?;
        let Ok(index) = self.search(&leaf, key) else {
            return Ok(false);
        };

        let removed = leaf.slots.remove(index);
        if let Entry::Payload(pointer) = removed.entry {
            self.allocator.free(pointer);
        }
        self.rebalance(path, leaf)?;
        self.allocator.flush(&self.bitmap)?;
        Ok(true)
    }

    /// Slots with keys in `[lo, hi)`, in order.
    pub fn entries(&self, lo: &K, hi: &K) -> Result<Cursor<'_, 'a, K, V>, BTreeError> {
        self.require(TreeState::Ready)?;
        Cursor::new(self, lo, hi.clone())
    }

    /// Keys of every kind in `[lo, hi)`, in order.
    pub fn keys<'t>(
        &'t self,
        lo: &K,
        hi: &K,
    ) -> Result<impl Iterator<Item = Result<K, BTreeError>> + use<'t, 'a, K, V>, BTreeError> {
        Ok(self.entries(lo, hi)?.map(|item| item.map(|(key, _)| key)))
    }

    /// Keys and inline values in `[lo, hi)`, in order.
    pub fn range<'t>(
        &'t self,
        lo: &K,
        hi: &K,
    ) -> Result<impl Iterator<Item = Result<(K, V), BTreeError>> + use<'t, 'a, K, V>, BTreeError>
    {
        Ok(self.entries(lo, hi)?.filter_map(|item| match item {
            Ok((key, Entry::Value(value))) => Some(Ok((key, value))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }))
    }

    /// Write an indented listing of every node to `sink`.
    pub fn dump(&self, sink: &mut dyn std::fmt::Write) -> Result<(), BTreeError>
    where
        K: Debug,
        V: Debug,
    {
        self.require(TreeState::Ready)?;
        writeln!(
            sink,
            "tree root={} branch_factor={} free_pages={}",
            self.root,
            self.branch_factor,
            self.allocator.free_count()
        )?;
        self.dump_node(sink, self.root, 1)
    }

    fn dump_node(
        &self,
        sink: &mut dyn std::fmt::Write,
        pointer: PageId,
        depth: usize,
    ) -> Result<(), BTreeError>
    where
        K: Debug,
        V: Debug,
    {
        let node = self.load_node(pointer)?;
        let indent = "  ".repeat(depth);
        writeln!(sink, "{indent}page {pointer} ({} slots)", node.slots.len())?;
        for slot in &node.slots {
            match &slot.entry {
                Entry::Branch(child) => {
                    writeln!(sink, "{indent}  {:?} ->", slot.key)?;
                    self.dump_node(sink, *child, depth + 2)?;
                }
                Entry::Value(value) => writeln!(sink, "{indent}  {:?} = {value:?}", slot.key)?,
                Entry::Payload(page) => {
                    writeln!(sink, "{indent}  {:?} = payload page {page}", slot.key)?;
                }
                Entry::Terminal => writeln!(sink, "{indent}  {:?}", slot.key)?,
            }
        }
        Ok(())
    }

    /// Verify the tree invariants and count its pages.
    ///
    /// Checks key order, separator bounds, occupancy, equal leaf depth and
    /// that the allocator tracks exactly the reachable pages.
    pub fn check(&self) -> Result<TreeStats, BTreeError> {
        self.require(TreeState::Ready)?;
        let mut walk = CheckWalk::default();
        self.check_node(self.root, None, None, 1, &mut walk)?;

        let used = self.allocator.used_count() as usize;
        let reachable = walk.stats.nodes + walk.stats.payloads;
        if used != reachable {
            return Err(BTreeError::Corrupt(format!(
                "allocator tracks {used} pages but {reachable} are reachable"
            )));
        }

        walk.stats.depth = walk.leaf_depth.unwrap_or(1);
        Ok(walk.stats)
    }

    fn check_node(
        &self,
        pointer: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        walk: &mut CheckWalk,
    ) -> Result<(), BTreeError> {
        let node = self.load_node(pointer)?;
        walk.stats.nodes += 1;
        let corrupt = |message: &str| BTreeError::Corrupt(format!("page {pointer}: {message}"));

        if depth > MAX_DEPTH {
            return Err(corrupt("tree too deep"));
        }
        if pointer != self.root && node.slots.len() < self.branch_factor / 2 {
            return Err(corrupt("underfull node"));
        }
        if node.slots.len() > self.branch_factor {
            return Err(corrupt("overfull node"));
        }
        for pair in node.slots.windows(2) {
            if self.comparator.compare(&pair[0].key, &pair[1].key) != Ordering::Less {
                return Err(corrupt("keys out of order"));
            }
        }
        if let (Some(lower), Some(first)) = (lower, node.slots.first()) {
            if self.comparator.compare(&first.key, lower) == Ordering::Less {
                return Err(corrupt("key below its separator"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, node.slots.last()) {
            if self.comparator.compare(&last.key, upper) != Ordering::Less {
                return Err(corrupt("key above the next separator"));
            }
        }

        if node.is_leaf() {
            match walk.leaf_depth {
                None => walk.leaf_depth = Some(depth),
                Some(d) if d != depth => return Err(corrupt("leaves at different depths")),
                Some(_) => {}
            }
            for slot in &node.slots {
                match slot.entry {
                    Entry::Branch(_) => return Err(corrupt("branch slot in a leaf")),
                    Entry::Payload(page) => {
                        self.payloads.load(page)?;
                        walk.stats.payloads += 1;
                    }
                    Entry::Value(_) | Entry::Terminal => {}
                }
                walk.stats.entries += 1;
            }
            return Ok(());
        }

        for (i, slot) in node.slots.iter().enumerate() {
            let Entry::Branch(child) = slot.entry else {
                return Err(corrupt("value slot in an interior node"));
            };
            let next = node.slots.get(i + 1).map_or(upper, |s| Some(&s.key));
            self.check_node(child, Some(&slot.key), next, depth + 1, walk)?;
        }
        Ok(())
    }

    fn lookup(&self, key: &K) -> Result<Option<Entry<V>>, BTreeError> {
        self.require(TreeState::Ready)?;
        let (_, leaf) = self.descend(key)?;
        Ok(match self.search(&leaf, key) {
            Ok(index) => leaf.slots.into_iter().nth(index).map(|slot| slot.entry),
            Err(_) => None,
        })
    }

    fn insert(&mut self, key: K, entry: Entry<V>) -> Result<(), BTreeError> {
        self.require(TreeState::Ready)?;
        let (path, mut leaf) = self.descend(&key)?;
        let replaced = match self.search(&leaf, &key) {
            Ok(index) => Some(std::mem::replace(&mut leaf.slots[index].entry, entry)),
            Err(index) => {
                leaf.slots.insert(index, Slot { key, entry });
                None
            }
        };
        // Nothing may be written until every page the splits need is free.
        if self.pages_to_split(&path, &leaf) > self.allocator.free_count() {
            return Err(BTreeError::StoreFull);
        }
        if let Some(Entry::Payload(pointer)) = replaced {
            self.allocator.free(pointer);
        }
        self.split(path, leaf)?;
        self.allocator.flush(&self.bitmap)?;
        Ok(())
    }

    fn search(&self, node: &Node<K, V>, key: &K) -> Result<usize, usize> {
        node.slots
            .binary_search_by(|slot| self.comparator.compare(&slot.key, key))
    }

    /// Index of the child whose range holds `key`: the last slot whose key
    /// is not greater than it, or the first slot.
    fn child_index(&self, node: &Node<K, V>, key: &K) -> usize {
        match self.search(node, key) {
            Ok(index) => index,
            Err(index) => index.saturating_sub(1),
        }
    }

    fn child_at(node: &Node<K, V>, index: usize) -> Result<PageId, BTreeError> {
        match node.slots.get(index).map(|slot| &slot.entry) {
            Some(Entry::Branch(child)) => Ok(*child),
            _ => Err(BTreeError::Corrupt(format!(
                "page {}: slot {index} is not a branch",
                node.pointer
            ))),
        }
    }

    /// Load the path from the root to the leaf whose range holds `key`.
    fn descend(&self, key: &K) -> Result<(Path<K, V>, Node<K, V>), BTreeError> {
        let mut path = Vec::new();
        let mut node = self.load_node(self.root)?;
        while !node.is_leaf() {
            if path.len() >= MAX_DEPTH {
                return Err(BTreeError::Corrupt("tree too deep".to_string()));
            }
            let index = self.child_index(&node, key);
            let child = Self::child_at(&node, index)?;
            path.push((node, index));
            node = self.load_node(child)?;
        }
        Ok((path, node))
    }

    /// Pages `split` will allocate for `leaf`: one per full node on the way
    /// up, plus a new root when the old one splits too.
    fn pages_to_split(&self, path: &Path<K, V>, leaf: &Node<K, V>) -> PageId {
        if leaf.slots.len() <= self.branch_factor {
            return 0;
        }
        let mut pages = 1;
        for (parent, _) in path.iter().rev() {
            if parent.slots.len() < self.branch_factor {
                return pages;
            }
            pages += 1;
        }
        pages + 1
    }

    /// Store a node that may have grown past the branch factor, then fix up
    /// its ancestors.
    fn split(&mut self, mut path: Path<K, V>, mut node: Node<K, V>) -> Result<(), BTreeError> {
        loop {
            if node.slots.len() > self.branch_factor {
                let right_slots = node.slots.split_off(node.slots.len() / 2);
                let right = Node {
                    pointer: self.allocate()?,
                    slots: right_slots,
                };
                self.save_node(&node)?;
                self.save_node(&right)?;
                let left_key = first_key(&node)?;
                let right_key = first_key(&right)?;

                let Some((mut parent, index)) = path.pop() else {
                    let root = Node {
                        pointer: self.allocate()?,
                        slots: vec![
                            Slot {
                                key: left_key,
                                entry: Entry::Branch(node.pointer),
                            },
                            Slot {
                                key: right_key,
                                entry: Entry::Branch(right.pointer),
                            },
                        ],
                    };
                    self.save_node(&root)?;
                    self.set_root(root.pointer)?;
                    tracing::debug!(root = root.pointer, "split root");
                    return Ok(());
                };

                parent.slots[index].key = left_key;
                parent.slots.insert(
                    index + 1,
                    Slot {
                        key: right_key,
                        entry: Entry::Branch(right.pointer),
                    },
                );
                node = parent;
            } else {
                self.save_node(&node)?;
                let Some((parent, index)) = path.pop() else {
                    return Ok(());
                };
                match self.refresh_separator(parent, index, &node)? {
                    Some(parent) => node = parent,
                    None => return Ok(()),
                }
            }
        }
    }

    /// Store a node that may have dropped below half the branch factor,
    /// then fix up its ancestors.
    fn rebalance(&mut self, mut path: Path<K, V>, mut node: Node<K, V>) -> Result<(), BTreeError> {
        let min = self.branch_factor / 2;
        loop {
            let Some((mut parent, index)) = path.pop() else {
                return self.store_root(node);
            };

            if node.slots.len() >= min {
                self.save_node(&node)?;
                match self.refresh_separator(parent, index, &node)? {
                    Some(parent) => node = parent,
                    None => return Ok(()),
                }
                continue;
            }

            self.fix_underflow(&mut parent, index, node)?;
            node = parent;
        }
    }

    /// Make `parent`'s slot for `child` equal to the child's first key.
    ///
    /// Returns the parent when it changed and has to be stored.
    fn refresh_separator(
        &self,
        mut parent: Node<K, V>,
        index: usize,
        child: &Node<K, V>,
    ) -> Result<Option<Node<K, V>>, BTreeError> {
        let Some(first) = child.slots.first() else {
            return Ok(None);
        };
        let slot = parent.slots.get_mut(index).ok_or_else(|| {
            BTreeError::Corrupt(format!("page {}: no slot {index}", child.pointer))
        })?;
        if self.comparator.compare(&slot.key, &first.key) == Ordering::Equal {
            return Ok(None);
        }
        slot.key = first.key.clone();
        Ok(Some(parent))
    }

    /// Merge an underfull node with a sibling, or move slots over from it.
    fn fix_underflow(
        &mut self,
        parent: &mut Node<K, V>,
        index: usize,
        node: Node<K, V>,
    ) -> Result<(), BTreeError> {
        let sibling_index = if index + 1 < parent.slots.len() {
            index + 1
        } else if index > 0 {
            index - 1
        } else {
            return Err(BTreeError::Corrupt(format!(
                "page {}: interior node with a single child",
                parent.pointer
            )));
        };
        let sibling = self.load_node(Self::child_at(parent, sibling_index)?)?;

        let (left_index, mut left, mut right) = if sibling_index > index {
            (index, node, sibling)
        } else {
            (sibling_index, sibling, node)
        };

        if left.slots.len() + right.slots.len() <= self.branch_factor {
            left.slots.append(&mut right.slots);
            self.save_node(&left)?;
            self.allocator.free(right.pointer);
            parent.slots.remove(left_index + 1);
            parent.slots[left_index].key = first_key(&left)?;
        } else {
            let target = (left.slots.len() + right.slots.len()) / 2;
            if left.slots.len() < target {
                let moved = target - left.slots.len();
                left.slots.extend(right.slots.drain(..moved));
            } else {
                let moved: Vec<_> = left.slots.drain(target..).collect();
                right.slots.splice(0..0, moved);
            }
            self.save_node(&left)?;
            self.save_node(&right)?;
            parent.slots[left_index].key = first_key(&left)?;
            parent.slots[left_index + 1].key = first_key(&right)?;
        }
        Ok(())
    }

    /// Store the root, collapsing an interior root with a single child.
    fn store_root(&mut self, root: Node<K, V>) -> Result<(), BTreeError> {
        match root.slots.as_slice() {
            [
                Slot {
                    entry: Entry::Branch(child),
                    ..
                },
            ] => {
                let child = *child;
                self.allocator.free(root.pointer);
                self.set_root(child)?;
                tracing::debug!(root = child, "collapsed root");
                Ok(())
            }
            _ => self.save_node(&root),
        }
    }

    fn allocate(&mut self) -> Result<PageId, BTreeError> {
        self.allocator.allocate().ok_or(BTreeError::StoreFull)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_root(&mut self, root: PageId) -> Result<(), BTreeError> {
        self.root = root;
        let superblock = Superblock {
            root,
            branch_factor: self.branch_factor as u32,
            page_size: self.page_size as u32,
            max_pages: self.max_pages,
        };
        self.superblock.save(0, &superblock)?;
        Ok(())
    }

    fn load_node(&self, pointer: PageId) -> Result<Node<K, V>, BTreeError> {
        let node = self.nodes.load(pointer)?;
        if node.pointer != pointer {
            return Err(BTreeError::Corrupt(format!(
                "page {pointer} holds node {}",
                node.pointer
            )));
        }
        Ok(node)
    }

    fn save_node(&self, node: &Node<K, V>) -> Result<(), BTreeError> {
        self.nodes.save(node.pointer, node)?;
        Ok(())
    }
}

fn first_key<K: Clone, V>(node: &Node<K, V>) -> Result<K, BTreeError> {
    node.slots
        .first()
        .map(|slot| slot.key.clone())
        .ok_or_else(|| BTreeError::Corrupt(format!("page {}: empty node", node.pointer)))
}

#[derive(Default)]
struct CheckWalk {
    stats: TreeStats,
    leaf_depth: Option<usize>,
}

/// Forward iterator over the slots of a key range.
///
/// Holds the nodes from the root down to the current leaf; moving past the
/// end of a leaf pops back to the nearest ancestor with another child.
/// It reads the pages as they are when it gets there and is not a snapshot.
pub struct Cursor<'t, 'a, K, V> {
    tree: &'t BTree<'a, K, V>,
    stack: Path<K, V>,
    hi: K,
}

impl<'t, 'a, K: Clone + 'static, V: Clone + 'static> Cursor<'t, 'a, K, V> {
    fn new(tree: &'t BTree<'a, K, V>, lo: &K, hi: K) -> Result<Self, BTreeError> {
        let (mut stack, leaf) = tree.descend(lo)?;
        let (Ok(index) | Err(index)) = tree.search(&leaf, lo);
        stack.push((leaf, index));
        Ok(Self { tree, stack, hi })
    }
}

impl<K: Clone + 'static, V: Clone + 'static> Iterator for Cursor<'_, '_, K, V> {
    type Item = Result<(K, Entry<V>), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, index) = self.stack.last_mut()?;
            let Some(slot) = node.slots.get(*index) else {
                self.stack.pop();
                if let Some((_, parent_index)) = self.stack.last_mut() {
                    *parent_index += 1;
                }
                continue;
            };

            if let Entry::Branch(child) = slot.entry {
                match self.tree.load_node(child) {
                    Ok(child) => self.stack.push((child, 0)),
                    Err(e) => {
                        self.stack.clear();
                        return Some(Err(e));
                    }
                }
                continue;
            }

            if self.tree.comparator.compare(&slot.key, &self.hi) != Ordering::Less {
                self.stack.clear();
                return None;
            }
            let item = (slot.key.clone(), slot.entry.clone());
            *index += 1;
            return Some(Ok(item));
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::btree::{BTreeBuilder, NaturalOrder};
    use crate::file::MemoryPageFile;
    use crate::page::Page;
    use crate::serialize::{IntSerializer, StringSerializer};

    const PAGE_SIZE: usize = 256;

    fn build(file: &MemoryPageFile, branch_factor: usize) -> BTree<'_, i32, String> {
        let mut tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(512)
            .branch_factor(branch_factor)
            .build(file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");
        tree
    }

    fn collect_keys(tree: &BTree<'_, i32, String>, lo: i32, hi: i32) -> Vec<i32> {
        tree.keys(&lo, &hi)
            .expect("keys")
            .collect::<Result<_, _>>()
            .expect("scan")
    }

    #[test]
    fn test_operations_require_ready() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(16)
            .build(&file, NaturalOrder)
            .expect("build");

        assert!(matches!(
            tree.get(&1),
            Err(BTreeError::InvalidState {
                expected: TreeState::Ready,
                actual: TreeState::Uninitialized
            })
        ));
        tree.create().expect("create");
        assert!(matches!(
            tree.create(),
            Err(BTreeError::InvalidState { .. })
        ));

        tree.close().expect("close");
        assert_eq!(tree.state(), TreeState::Closed);
        assert!(tree.put(1, "x".to_string()).is_err());
        assert!(tree.close().is_err());
    }

    #[test]
    fn test_put_get_overwrite() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);

        tree.put(5, "five".to_string()).expect("put");
        tree.put(5, "FIVE".to_string()).expect("overwrite");
        assert_eq!(tree.get(&5).expect("get"), Some("FIVE".to_string()));
        assert_eq!(tree.get(&6).expect("get"), None);
        assert_eq!(tree.check().expect("check").entries, 1);
    }

    #[test]
    fn test_splits_keep_order() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);

        let mut keys: Vec<i32> = (0..200).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for &k in &keys {
            tree.put(k, k.to_string()).expect("put");
        }

        let stats = tree.check().expect("check");
        assert_eq!(stats.entries, 200);
        assert!(stats.depth >= 3);
        assert_eq!(collect_keys(&tree, 0, 200), (0..200).collect::<Vec<_>>());
        assert_eq!(collect_keys(&tree, 50, 60), (50..60).collect::<Vec<_>>());
        assert_eq!(tree.get(&123).expect("get"), Some("123".to_string()));
    }

    #[test]
    fn test_key_below_every_separator() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        for k in 10..40 {
            tree.put(k, String::new()).expect("put");
        }
        tree.put(-5, "low".to_string()).expect("put");

        tree.check().expect("check");
        assert_eq!(tree.get(&-5).expect("get"), Some("low".to_string()));
        assert_eq!(collect_keys(&tree, -10, 12), vec![-5, 10, 11]);
    }

    #[test]
    fn test_remove_rebalances_and_collapses() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        for k in 0..100 {
            tree.put(k, k.to_string()).expect("put");
        }

        let mut order: Vec<i32> = (0..100).collect();
        order.shuffle(&mut StdRng::seed_from_u64(11));
        for (i, k) in order.iter().enumerate() {
            assert!(tree.remove(k).expect("remove"));
            if i % 10 == 0 {
                tree.check().expect("check");
            }
        }

        let stats = tree.check().expect("check");
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.nodes, 1);
        assert_eq!(tree.free_pages(), 511);
    }

    #[test]
    fn test_remove_absent_key() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        tree.put(1, "one".to_string()).expect("put");

        assert!(!tree.remove(&2).expect("remove"));
        assert!(tree.remove(&1).expect("remove"));
        assert!(!tree.remove(&1).expect("remove again"));
        tree.check().expect("check");
    }

    #[test]
    fn test_range_skips_markers_and_payloads() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        tree.put(1, "one".to_string()).expect("put");
        tree.put_terminal(2).expect("terminal");
        tree.put_payload(3, b"three").expect("payload");
        tree.put(4, "four".to_string()).expect("put");

        let range: Vec<(i32, String)> = tree
            .range(&0, &10)
            .expect("range")
            .collect::<Result<_, _>>()
            .expect("scan");
        assert_eq!(range, vec![(1, "one".to_string()), (4, "four".to_string())]);
        assert_eq!(collect_keys(&tree, 0, 10), vec![1, 2, 3, 4]);

        assert!(tree.get_terminal(&2).expect("terminal"));
        assert!(!tree.get_terminal(&1).expect("terminal"));
        assert_eq!(tree.get(&2).expect("get"), None);
        assert_eq!(
            tree.get_payload(&3).expect("payload"),
            Some(b"three".to_vec())
        );
    }

    #[test]
    fn test_payload_pages_are_freed() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        let free = tree.free_pages();

        tree.put_payload(1, &[7; 100]).expect("payload");
        assert_eq!(tree.free_pages(), free - 1);
        tree.put_payload(1, &[8; 100]).expect("overwrite");
        assert_eq!(tree.free_pages(), free - 1);
        assert_eq!(tree.check().expect("check").payloads, 1);

        tree.remove(&1).expect("remove");
        assert_eq!(tree.free_pages(), free);

        let too_big = vec![0; tree.payload_capacity() + 1];
        assert!(matches!(
            tree.put_payload(2, &too_big),
            Err(BTreeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_and_inverted_ranges() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        assert!(collect_keys(&tree, 0, 100).is_empty());

        for k in 0..20 {
            tree.put(k, String::new()).expect("put");
        }
        assert!(collect_keys(&tree, 10, 10).is_empty());
        assert!(collect_keys(&tree, 15, 5).is_empty());
        assert_eq!(collect_keys(&tree, 18, 100), vec![18, 19]);
    }

    #[test]
    fn test_reopen_reads_superblock() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        {
            let mut tree = build(&file, 4);
            for k in 0..50 {
                tree.put(k, k.to_string()).expect("put");
            }
            tree.close().expect("close");
        }

        let tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(512)
            .branch_factor(4)
            .build(&file, NaturalOrder)
            .expect("reopen");
        assert_eq!(tree.state(), TreeState::Ready);
        assert_eq!(tree.get(&42).expect("get"), Some("42".to_string()));
        assert_eq!(tree.check().expect("check").entries, 50);

        let other = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(512)
            .branch_factor(5)
            .build(&file, NaturalOrder);
        assert!(matches!(other, Err(BTreeError::Corrupt(_))));
    }

    #[test]
    fn test_store_full() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(2)
            .branch_factor(4)
            .build(&file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");

        tree.put_payload(1, b"a").expect("payload");
        assert!(matches!(
            tree.put_payload(2, b"b"),
            Err(BTreeError::StoreFull)
        ));
    }

    #[test]
    fn test_store_full_leaves_stored_keys_intact() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = BTreeBuilder::new(IntSerializer, IntSerializer)
            .max_pages(6)
            .branch_factor(4)
            .build(&file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");

        let mut stored = 0;
        loop {
            match tree.put(stored, stored * 10) {
                Ok(()) => stored += 1,
                Err(BTreeError::StoreFull) => break,
                Err(e) => panic!("put {stored}: {e}"),
            }
        }
        assert!(stored > 4);

        let stats = tree.check().expect("check");
        assert_eq!(stats.entries, usize::try_from(stored).expect("count"));
        for k in 0..stored {
            assert_eq!(tree.get(&k).expect("get"), Some(k * 10), "key {k}");
        }
        assert_eq!(tree.get(&stored).expect("get"), None);

        // overwrites need no new pages
        tree.put(0, -1).expect("overwrite");
        assert_eq!(tree.get(&0).expect("get"), Some(-1));
    }

    #[test]
    fn test_payload_page_released_when_insert_cannot_split() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(2)
            .branch_factor(4)
            .build(&file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");
        for k in [1, 2, 4, 5] {
            tree.put(k, k.to_string()).expect("put");
        }
        assert_eq!(tree.free_pages(), 1);

        // the payload takes the last page, leaving none for the leaf split
        assert!(matches!(
            tree.put_payload(3, b"three"),
            Err(BTreeError::StoreFull)
        ));
        assert_eq!(tree.free_pages(), 1);
        assert_eq!(tree.check().expect("check").entries, 4);
        assert_eq!(tree.get_payload(&3).expect("payload"), None);
    }

    #[test]
    fn test_blank_superblock_over_used_pages_is_corrupt() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        {
            let mut tree = build(&file, 4);
            tree.put(1, "one".to_string()).expect("put");
            tree.close().expect("close");
        }
        file.save(0, &Page::new(PAGE_SIZE)).expect("zero superblock");

        let reopened = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(512)
            .branch_factor(4)
            .build(&file, NaturalOrder);
        assert!(matches!(reopened, Err(BTreeError::Corrupt(_))));

        let fresh = MemoryPageFile::new(PAGE_SIZE);
        let tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(512)
            .branch_factor(4)
            .build(&fresh, NaturalOrder)
            .expect("build");
        assert_eq!(tree.state(), TreeState::Uninitialized);
    }

    #[test]
    fn test_custom_comparator() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = BTreeBuilder::new(IntSerializer, StringSerializer { max: 8 })
            .max_pages(64)
            .branch_factor(4)
            .build(&file, |a: &i32, b: &i32| b.cmp(a))
            .expect("build");
        tree.create().expect("create");
        for k in 0..20 {
            tree.put(k, String::new()).expect("put");
        }

        let keys: Vec<i32> = tree
            .keys(&15, &10)
            .expect("keys")
            .collect::<Result<_, _>>()
            .expect("scan");
        assert_eq!(keys, vec![15, 14, 13, 12, 11]);
        tree.check().expect("check");
    }

    #[test]
    fn test_dump_lists_every_node() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        for k in 0..10 {
            tree.put(k, format!("v{k}")).expect("put");
        }

        let mut out = String::new();
        tree.dump(&mut out).expect("dump");
        assert!(out.starts_with("tree root="));
        assert!(out.contains("9 = \"v9\""));
        let nodes = out.lines().filter(|l| l.trim_start().starts_with("page ")).count();
        assert_eq!(nodes, tree.check().expect("check").nodes);
    }

    #[test]
    fn test_corrupt_node_page_is_reported() {
        let file = MemoryPageFile::new(PAGE_SIZE);
        let mut tree = build(&file, 4);
        tree.put(1, "one".to_string()).expect("put");

        // superblock, one bitmap page, then the root leaf
        let mut page = file.load(2).expect("raw load");
        page.as_bytes_mut()[20] ^= 0xFF;
        file.save(2, &page).expect("raw save");

        assert!(matches!(tree.get(&1), Err(BTreeError::Paging(_))));
    }
}

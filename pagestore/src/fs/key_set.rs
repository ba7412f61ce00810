//! A set of names of any length over a tree with 48-byte keys.
//!
//! Names are stored as chains of terminal markers (see
//! [`keys`](super::keys)). Listing walks the trie one hash bucket at a
//! time; removal deletes the name's terminal and then every chunk whose
//! bucket below it has become empty, so no stray chunks are left behind.

use crate::btree::{BTreeError, KeyDataStore};
use crate::fs::keys::{
    Hash, ID_NAME, ID_SIZE, NameKey, PATH_SIZE, bounding_key, hash, increment, to_name_keys,
};

/// Names stored in a key-value store.
pub struct FileSystemKeySet<'s, S: ?Sized> {
    store: &'s mut S,
}

impl<'s, S> FileSystemKeySet<'s, S>
where
    S: KeyDataStore<Vec<u8>, u32> + ?Sized,
{
    pub const fn new(store: &'s mut S) -> Self {
        Self { store }
    }

    /// See [`list`].
    pub fn list(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<Vec<Vec<u8>>, BTreeError> {
        list(&*self.store, lo, hi)
    }

    pub fn contains(&self, name: &[u8]) -> Result<bool, BTreeError> {
        let terminal = bounding_key(hash(name), ID_NAME);
        self.store.get_terminal(&terminal.to_bytes())
    }

    /// Add `name`. Adding a name twice is a no-op.
    pub fn add(&mut self, name: &[u8]) -> Result<(), BTreeError> {
        for key in to_name_keys(name) {
            self.store.put_terminal(key.to_bytes())?;
        }
        Ok(())
    }

    /// Remove `name` and the chunks no other name needs.
    ///
    /// Returns whether the name was present.
    pub fn remove(&mut self, name: &[u8]) -> Result<bool, BTreeError> {
        let keys = to_name_keys(name);
        let Some((terminal, chunks)) = keys.split_last() else {
            return Ok(false);
        };
        if !self.store.remove(&terminal.to_bytes())? {
            return Ok(false);
        }

        for (i, chunk) in chunks.iter().enumerate().rev() {
            // the bucket this chunk leads into
            let end = i * PATH_SIZE + chunk.path.len();
            if !bucket_is_empty(&*self.store, &hash(&name[..end]))? {
                break;
            }
            self.store.remove(&chunk.to_bytes())?;
        }
        Ok(true)
    }
}

fn bucket_is_empty<S>(store: &S, hash: &Hash) -> Result<bool, BTreeError>
where
    S: KeyDataStore<Vec<u8>, u32> + ?Sized,
{
    let lo = bounding_key(*hash, ID_NAME).to_bytes();
    let hi = bounding_key(*hash, ID_SIZE).to_bytes();
    Ok(store.keys(&lo, &hi)?.next().transpose()?.is_none())
}

/// Names whose first chunk lies between the first chunks of `lo` and `hi`,
/// both inclusive.
///
/// `None` leaves that end open. Only the first chunk is compared; every
/// name below a matching first chunk is listed. A name comes before the
/// names it is a prefix of.
pub fn list<S>(store: &S, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<Vec<Vec<u8>>, BTreeError>
where
    S: KeyDataStore<Vec<u8>, u32> + ?Sized,
{
    let first_chunk = |name: &[u8]| {
        to_name_keys(name)
            .into_iter()
            .next()
            .map(|key| key.to_bytes())
            .unwrap_or_default()
    };
    let root = hash(b"");
    let min = lo.map_or_else(|| bounding_key(root, ID_NAME).to_bytes(), first_chunk);
    let max = hi.map_or_else(
        || bounding_key(root, ID_SIZE).to_bytes(),
        |hi| increment(&first_chunk(hi)),
    );

    let mut names = Vec::new();
    scan(store, b"", &min, &max, &mut names)?;
    Ok(names)
}

fn scan<S>(
    store: &S,
    prefix: &[u8],
    lo: &Vec<u8>,
    hi: &Vec<u8>,
    names: &mut Vec<Vec<u8>>,
) -> Result<(), BTreeError>
where
    S: KeyDataStore<Vec<u8>, u32> + ?Sized,
{
    let bucket = hash(prefix);
    let keys: Vec<Vec<u8>> = store.keys(lo, hi)?.collect::<Result<_, _>>()?;

    for bytes in keys {
        let key = NameKey::from_bytes(&bytes)
            .map_err(|e| BTreeError::Corrupt(format!("bad name key: {e}")))?;
        if key.id != ID_NAME || key.hash != bucket {
            continue;
        }
        if key.is_terminal() {
            names.push(prefix.to_vec());
            continue;
        }

        let mut name = prefix.to_vec();
        name.extend_from_slice(&key.path);
        let next = hash(&name);
        scan(
            store,
            &name,
            &bounding_key(next, ID_NAME).to_bytes(),
            &bounding_key(next, ID_SIZE).to_bytes(),
            names,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTree, BTreeBuilder, NaturalOrder};
    use crate::file::MemoryPageFile;
    use crate::fs::keys::KEY_SIZE;
    use crate::serialize::{FixedBytesSerializer, PointerSerializer};

    fn tree(file: &MemoryPageFile) -> BTree<'_, Vec<u8>, u32> {
        let mut tree = BTreeBuilder::new(FixedBytesSerializer { len: KEY_SIZE }, PointerSerializer)
            .max_pages(256)
            .build(file, NaturalOrder)
            .expect("build");
        tree.create().expect("create");
        tree
    }

    fn entries(tree: &BTree<'_, Vec<u8>, u32>) -> usize {
        tree.check().expect("check").entries
    }

    #[test]
    fn test_add_list_remove_short_names() {
        let file = MemoryPageFile::new(1024);
        let mut tree = tree(&file);
        let mut set = FileSystemKeySet::new(&mut tree);

        set.add(b"b").expect("add");
        set.add(b"a").expect("add");
        set.add(b"ab").expect("add");
        set.add(b"a").expect("add again");

        assert_eq!(
            set.list(None, None).expect("list"),
            vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec()]
        );
        assert!(set.contains(b"ab").expect("contains"));
        assert!(!set.contains(b"abc").expect("contains"));

        assert!(set.remove(b"a").expect("remove"));
        assert!(!set.remove(b"a").expect("remove again"));
        assert_eq!(
            set.list(None, None).expect("list"),
            vec![b"ab".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn test_shared_chunk_survives_sibling_removal() {
        let file = MemoryPageFile::new(1024);
        let mut tree = tree(&file);
        let prefix = [b'p'; PATH_SIZE];
        let mut one = prefix.to_vec();
        one.extend_from_slice(b"/one");
        let mut two = prefix.to_vec();
        two.extend_from_slice(b"/two");

        let mut set = FileSystemKeySet::new(&mut tree);
        set.add(&one).expect("add");
        set.add(&two).expect("add");
        set.remove(&one).expect("remove");
        assert_eq!(set.list(None, None).expect("list"), vec![two.clone()]);

        set.remove(&two).expect("remove");
        assert!(set.list(None, None).expect("list").is_empty());
        assert_eq!(entries(&tree), 0);
    }

    #[test]
    fn test_prefix_name_keeps_longer_name() {
        let file = MemoryPageFile::new(1024);
        let mut tree = tree(&file);
        let short = vec![b's'; PATH_SIZE];
        let mut long = short.clone();
        long.extend_from_slice(b"tail");

        let mut set = FileSystemKeySet::new(&mut tree);
        set.add(&short).expect("add");
        set.add(&long).expect("add");
        assert_eq!(
            set.list(None, None).expect("list"),
            vec![short.clone(), long.clone()]
        );

        set.remove(&long).expect("remove");
        assert_eq!(set.list(None, None).expect("list"), vec![short]);
        // the shared first chunk and the short name's terminal remain
        assert_eq!(entries(&tree), 2);
    }

    #[test]
    fn test_list_bounds_on_first_chunk() {
        let file = MemoryPageFile::new(1024);
        let mut tree = tree(&file);
        let mut set = FileSystemKeySet::new(&mut tree);
        for name in [&b"apple"[..], b"banana", b"cherry", b"date"] {
            set.add(name).expect("add");
        }

        assert_eq!(
            set.list(Some(b"banana".as_slice()), Some(b"cherry".as_slice())).expect("list"),
            vec![b"banana".to_vec(), b"cherry".to_vec()]
        );
        assert_eq!(
            set.list(Some(b"c".as_slice()), None).expect("list"),
            vec![b"cherry".to_vec(), b"date".to_vec()]
        );
        assert_eq!(
            set.list(None, Some(b"apple".as_slice())).expect("list"),
            vec![b"apple".to_vec()]
        );
    }

    #[test]
    fn test_empty_name() {
        let file = MemoryPageFile::new(1024);
        let mut tree = tree(&file);
        let mut set = FileSystemKeySet::new(&mut tree);

        set.add(b"").expect("add");
        set.add(b"x").expect("add");
        assert_eq!(
            set.list(None, None).expect("list"),
            vec![Vec::new(), b"x".to_vec()]
        );
        assert!(set.remove(b"").expect("remove"));
        assert_eq!(set.list(None, None).expect("list"), vec![b"x".to_vec()]);
    }
}

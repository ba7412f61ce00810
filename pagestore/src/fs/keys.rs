//! Fixed-size tree keys for names of any length.
//!
//! # Key Format
//!
//! ```text
//! +----------+------------------------------------------------+
//! | 0-15     | XXH3-128 of the name prefix before this chunk  |
//! | 16       | id: 0 name chunk, 1 file size, 2 file data     |
//! | 17-46    | path bytes, zero padded                        |
//! | 47       | number of meaningful path bytes                |
//! +----------+------------------------------------------------+
//! ```
//!
//! A name is cut into chunks of up to 30 bytes. Chunk `i` is stored under
//! the hash of everything before it, and a chunk with no path bytes (the
//! terminal) closes the name under the hash of the whole name. The chunks
//! of all names form a trie whose levels are the hash buckets.

use crate::serialize::SerializeError;

pub const HASH_SIZE: usize = 16;
pub const PATH_SIZE: usize = 30;
pub const KEY_SIZE: usize = HASH_SIZE + 1 + PATH_SIZE + 1;

/// Chunks of names in the key set.
pub const ID_NAME: u8 = 0;
/// Size of a file's content.
pub const ID_SIZE: u8 = 1;
/// One page of a file's content.
pub const ID_DATA: u8 = 2;

pub type Hash = [u8; HASH_SIZE];

/// One decoded key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameKey {
    pub hash: Hash,
    pub id: u8,
    /// At most [`PATH_SIZE`] bytes.
    pub path: Vec<u8>,
}

impl NameKey {
    /// Whether this chunk closes a name.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.path.is_empty()
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.path.len().min(PATH_SIZE);
        let mut bytes = Vec::with_capacity(KEY_SIZE);
        bytes.extend_from_slice(&self.hash);
        bytes.push(self.id);
        bytes.extend_from_slice(&self.path[..size]);
        bytes.resize(KEY_SIZE - 1, 0);
        bytes.push(size as u8);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializeError> {
        if bytes.len() != KEY_SIZE {
            return Err(SerializeError::LengthMismatch {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let size = bytes[KEY_SIZE - 1] as usize;
        if size > PATH_SIZE {
            return Err(SerializeError::TooLong {
                len: size,
                max: PATH_SIZE,
            });
        }

        let mut hash = [0; HASH_SIZE];
        hash.copy_from_slice(&bytes[..HASH_SIZE]);
        let path_start = HASH_SIZE + 1;
        Ok(Self {
            hash,
            id: bytes[HASH_SIZE],
            path: bytes[path_start..path_start + size].to_vec(),
        })
    }
}

/// Hash of a name prefix.
#[must_use]
pub fn hash(bytes: &[u8]) -> Hash {
    xxhash_rust::xxh3::xxh3_128(bytes).to_be_bytes()
}

/// Cut a name into its chunks, ending with the terminal.
#[must_use]
pub fn to_name_keys(name: &[u8]) -> Vec<NameKey> {
    let mut keys: Vec<NameKey> = name
        .chunks(PATH_SIZE)
        .enumerate()
        .map(|(i, chunk)| NameKey {
            hash: hash(&name[..i * PATH_SIZE]),
            id: ID_NAME,
            path: chunk.to_vec(),
        })
        .collect();
    keys.push(NameKey {
        hash: hash(name),
        id: ID_NAME,
        path: Vec::new(),
    });
    keys
}

/// Join the path bytes of `keys` back into a name.
#[must_use]
pub fn to_name(keys: &[NameKey]) -> Vec<u8> {
    keys.iter().flat_map(|key| key.path.iter().copied()).collect()
}

/// Smallest key with `hash` and `id`; every key of that bucket and id
/// sorts at or after it.
///
/// `bounding_key(h, 0)` and `bounding_key(h, 1)` bound the name chunks
/// stored under `h`.
#[must_use]
pub const fn bounding_key(hash: Hash, id: u8) -> NameKey {
    NameKey {
        hash,
        id,
        path: Vec::new(),
    }
}

/// Key of the size record of file `name`.
#[must_use]
pub fn size_key(name: &[u8]) -> NameKey {
    bounding_key(hash(name), ID_SIZE)
}

/// Key of content page `index` of file `name`.
#[must_use]
pub fn data_key(name: &[u8], index: u32) -> NameKey {
    NameKey {
        hash: hash(name),
        id: ID_DATA,
        path: index.to_be_bytes().to_vec(),
    }
}

/// The next byte string of the same length: add one to the last byte,
/// carrying leftward.
///
/// All `0xFF` wraps to all zeros. Empty input is returned unchanged.
#[must_use]
pub fn increment(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for byte in out.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
    out
}

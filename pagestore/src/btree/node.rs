//! B-tree node and superblock encoding.
//!
//! # Node Page Format
//!
//! ```text
//! +----------+--------------------------------------------+
//! | 0-7      | page header (type, flags, CRC32)           |
//! | 8-11     | pointer (the node's own page, u32)         |
//! | 12-15    | slot count (u32)                           |
//! | 16-N     | slots                                      |
//! +----------+--------------------------------------------+
//! ```
//!
//! Each slot is a tag byte, the key, and then a child pointer (branch), a
//! value, a payload page pointer, or nothing (terminal).
//!
//! Interior nodes hold only branch slots. The key of slot `i` is the lower
//! bound of child `i`: every key below child `i` is at least that key and
//! below the key of slot `i + 1`.

use std::sync::Arc;

use crate::page::{PageHeader, PageId};
use crate::serialize::{SerInput, SerOutput, SerializeError, Serializer};

/// Bytes of a node page before the first slot.
pub const NODE_HEADER_SIZE: usize = PageHeader::SIZE + 8;

/// Smallest usable branch factor.
pub const MIN_BRANCH_FACTOR: usize = 4;

const TAG_BRANCH: u8 = 1;
const TAG_VALUE: u8 = 2;
const TAG_PAYLOAD: u8 = 3;
const TAG_TERMINAL: u8 = 4;

/// What a slot's key points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<V> {
    /// Child node (interior nodes only).
    Branch(PageId),
    /// Inline value.
    Value(V),
    /// Page holding a byte payload.
    Payload(PageId),
    /// Key without a value.
    Terminal,
}

impl<V> Entry<V> {
    const fn tag(&self) -> u8 {
        match self {
            Self::Branch(_) => TAG_BRANCH,
            Self::Value(_) => TAG_VALUE,
            Self::Payload(_) => TAG_PAYLOAD,
            Self::Terminal => TAG_TERMINAL,
        }
    }

    #[must_use]
    pub const fn is_branch(&self) -> bool {
        matches!(self, Self::Branch(_))
    }
}

/// One key and its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot<K, V> {
    pub key: K,
    pub entry: Entry<V>,
}

/// A node page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<K, V> {
    /// The page this node is stored on.
    pub pointer: PageId,
    /// Slots in ascending key order.
    pub slots: Vec<Slot<K, V>>,
}

impl<K, V> Node<K, V> {
    /// An empty leaf.
    #[must_use]
    pub const fn new(pointer: PageId) -> Self {
        Self {
            pointer,
            slots: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.slots.first().is_none_or(|slot| !slot.entry.is_branch())
    }
}

/// Encoded size of one slot.
#[must_use]
pub fn slot_size(key_size: usize, value_size: usize) -> usize {
    1 + key_size + value_size.max(4)
}

/// Serializer for node pages.
pub struct NodeSerializer<K, V> {
    pub key: Arc<dyn Serializer<K>>,
    pub value: Arc<dyn Serializer<V>>,
    pub max_slots: usize,
}

impl<K, V> Serializer<Node<K, V>> for NodeSerializer<K, V> {
    fn read(&self, input: &mut SerInput<'_>) -> Result<Node<K, V>, SerializeError> {
        let pointer = input.read_u32()?;
        let count = input.read_u32()? as usize;
        if count > self.max_slots {
            return Err(SerializeError::TooLong {
                len: count,
                max: self.max_slots,
            });
        }

        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = input.read_u8()?;
            let key = self.key.read(input)?;
            let entry = match tag {
                TAG_BRANCH => Entry::Branch(input.read_u32()?),
                TAG_VALUE => Entry::Value(self.value.read(input)?),
                TAG_PAYLOAD => Entry::Payload(input.read_u32()?),
                TAG_TERMINAL => Entry::Terminal,
                other => return Err(SerializeError::InvalidTag(other)),
            };
            slots.push(Slot { key, entry });
        }
        Ok(Node { pointer, slots })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&self, output: &mut SerOutput, node: &Node<K, V>) -> Result<(), SerializeError> {
        if node.slots.len() > self.max_slots {
            return Err(SerializeError::TooLong {
                len: node.slots.len(),
                max: self.max_slots,
            });
        }

        output.write_u32(node.pointer);
        output.write_u32(node.slots.len() as u32);
        for slot in &node.slots {
            output.write_u8(slot.entry.tag());
            self.key.write(output, &slot.key)?;
            match &slot.entry {
                Entry::Branch(p) | Entry::Payload(p) => output.write_u32(*p),
                Entry::Value(v) => self.value.write(output, v)?,
                Entry::Terminal => {}
            }
        }
        Ok(())
    }

    fn size(&self) -> usize {
        8 + self.max_slots * slot_size(self.key.size(), self.value.size())
    }
}

/// Magic number identifying a tree superblock ("PGTR").
pub const SUPERBLOCK_MAGIC: u32 = 0x5047_5452;

/// Current superblock format version.
pub const SUPERBLOCK_VERSION: u32 = 1;

/// Tree geometry and root pointer, stored on page 0 of the tree's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub root: PageId,
    pub branch_factor: u32,
    pub page_size: u32,
    pub max_pages: PageId,
}

/// Serializer for [`Superblock`] pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperblockSerializer;

impl Serializer<Superblock> for SuperblockSerializer {
    fn read(&self, input: &mut SerInput<'_>) -> Result<Superblock, SerializeError> {
        let magic = input.read_u32()?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(SerializeError::Malformed(format!(
                "bad superblock magic 0x{magic:08x}"
            )));
        }
        let version = input.read_u32()?;
        if version != SUPERBLOCK_VERSION {
            return Err(SerializeError::Malformed(format!(
                "unsupported superblock version {version}"
            )));
        }
        Ok(Superblock {
            root: input.read_u32()?,
            branch_factor: input.read_u32()?,
            page_size: input.read_u32()?,
            max_pages: input.read_u32()?,
        })
    }

    fn write(&self, output: &mut SerOutput, value: &Superblock) -> Result<(), SerializeError> {
        output.write_u32(SUPERBLOCK_MAGIC);
        output.write_u32(SUPERBLOCK_VERSION);
        output.write_u32(value.root);
        output.write_u32(value.branch_factor);
        output.write_u32(value.page_size);
        output.write_u32(value.max_pages);
        Ok(())
    }

    fn size(&self) -> usize {
        24
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{IntSerializer, StringSerializer, decode, encode};

    fn serializer(max_slots: usize) -> NodeSerializer<i32, String> {
        NodeSerializer {
            key: Arc::new(IntSerializer),
            value: Arc::new(StringSerializer { max: 8 }),
            max_slots,
        }
    }

    #[test]
    fn test_node_with_every_entry_kind() {
        let node = Node {
            pointer: 9,
            slots: vec![
                Slot {
                    key: 1,
                    entry: Entry::Value("one".to_string()),
                },
                Slot {
                    key: 2,
                    entry: Entry::Payload(40),
                },
                Slot {
                    key: 3,
                    entry: Entry::Terminal,
                },
            ],
        };
        let serializer = serializer(4);
        let bytes = encode(&serializer, &node).expect("encode");
        assert!(bytes.len() <= serializer.size());
        assert_eq!(decode(&serializer, &bytes).expect("decode"), node);
    }

    #[test]
    fn test_interior_node() {
        let node: Node<i32, String> = Node {
            pointer: 1,
            slots: vec![
                Slot {
                    key: 0,
                    entry: Entry::Branch(2),
                },
                Slot {
                    key: 50,
                    entry: Entry::Branch(3),
                },
            ],
        };
        assert!(!node.is_leaf());
        assert!(Node::<i32, String>::new(4).is_leaf());

        let bytes = encode(&serializer(4), &node).expect("encode");
        assert_eq!(decode(&serializer(4), &bytes).expect("decode"), node);
    }

    #[test]
    fn test_rejects_overfull_node_and_bad_tag() {
        let mut node: Node<i32, String> = Node::new(0);
        for key in 0..5 {
            node.slots.push(Slot {
                key,
                entry: Entry::Terminal,
            });
        }
        assert!(matches!(
            encode(&serializer(4), &node),
            Err(SerializeError::TooLong { len: 5, max: 4 })
        ));

        node.slots.truncate(1);
        let mut bytes = encode(&serializer(4), &node).expect("encode");
        bytes[8] = 0x7F;
        assert!(matches!(
            decode(&serializer(4), &bytes),
            Err(SerializeError::InvalidTag(0x7F))
        ));
    }

    #[test]
    fn test_superblock_magic_is_checked() {
        let superblock = Superblock {
            root: 3,
            branch_factor: 8,
            page_size: 4096,
            max_pages: 100,
        };
        let mut bytes = encode(&SuperblockSerializer, &superblock).expect("encode");
        assert_eq!(
            decode(&SuperblockSerializer, &bytes).expect("decode"),
            superblock
        );

        bytes[0] ^= 0xFF;
        assert!(matches!(
            decode(&SuperblockSerializer, &bytes),
            Err(SerializeError::Malformed(_))
        ));
    }
}

//! Fixed-size pages.
//!
//! A [`Page`] is just `page_size` bytes; files, windows and the journal
//! move pages around without looking inside. Pages written through a
//! [`SerializedPageFile`](crate::file::SerializedPageFile) start with a
//! [`PageHeader`]:
//!
//! ```text
//! +----------+---------------------------------------------+
//! | 0        | page type                                   |
//! | 1        | flags (unused, zero)                        |
//! | 2-5      | CRC32 of the page with this field zeroed    |
//! | 6-7      | reserved                                    |
//! +----------+---------------------------------------------+
//! ```
//!
//! An all-zero page has type byte 0, which no [`PageType`] uses, so a page
//! that was never written reads as [`PageError::InvalidPageType`]`(0)`.

use std::ops::Range;

/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Page number within a page file or window.
pub type PageId = u32;

const CHECKSUM: Range<usize> = 2..6;

/// What a typed page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Tree root pointer and geometry.
    Superblock = 0x01,
    AllocationBitmap = 0x02,
    BTreeNode = 0x03,
    /// Bytes stored beside the tree under one key.
    Payload = 0x04,
    /// Pivot and child lists of the slot persister.
    Slots = 0x05,
    /// A single `u32`.
    Counter = 0x06,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        const ALL: [PageType; 6] = [
            PageType::Superblock,
            PageType::AllocationBitmap,
            PageType::BTreeNode,
            PageType::Payload,
            PageType::Slots,
            PageType::Counter,
        ];
        ALL.into_iter().find(|t| *t as u8 == byte).ok_or(byte)
    }
}

/// Header of a typed page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    pub const SIZE: usize = 8;

    /// Header of an unsealed page of `page_type`.
    #[must_use]
    pub const fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            flags: 0,
            checksum: 0,
        }
    }

    #[must_use]
    pub fn encode(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.page_type as u8;
        bytes[1] = self.flags;
        bytes[CHECKSUM].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Read a header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PageError> {
        let Some(header) = bytes.get(..Self::SIZE) else {
            return Err(PageError::TooShort { len: bytes.len() });
        };
        let page_type = PageType::try_from(header[0]).map_err(PageError::InvalidPageType)?;
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&header[CHECKSUM]);
        Ok(Self {
            page_type,
            flags: header[1],
            checksum: u32::from_le_bytes(checksum),
        })
    }
}

/// One page of raw bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// A zeroed page.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Take `bytes` as a page; its length is the page size.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `bytes` into the page at `offset`.
    ///
    /// Panics when they do not fit, like slice indexing.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM.start]);
        hasher.update(&[0u8; 4]);
        hasher.update(self.data.get(CHECKSUM.end..).unwrap_or_default());
        hasher.finalize()
    }

    /// Write the page's checksum into its header.
    pub fn seal(&mut self) {
        if self.data.len() < PageHeader::SIZE {
            return;
        }
        let checksum = self.checksum();
        self.data[CHECKSUM].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Parse the header and check it against the page contents.
    pub fn verify(&self) -> Result<PageHeader, PageError> {
        let header = PageHeader::decode(&self.data)?;
        let actual = self.checksum();
        if header.checksum != actual {
            return Err(PageError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        Ok(header)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = &self.data[..self.data.len().min(PageHeader::SIZE)];
        f.debug_struct("Page")
            .field("len", &self.data.len())
            .field("head", &head)
            .finish_non_exhaustive()
    }
}

/// Errors from reading a typed page.
#[derive(Debug)]
pub enum PageError {
    /// The type byte names no [`PageType`]; 0 means the page was never written.
    InvalidPageType(u8),
    WrongPageType { expected: PageType, actual: PageType },
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Page smaller than its header.
    TooShort { len: usize },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(byte) => write!(f, "unknown page type 0x{byte:02x}"),
            Self::WrongPageType { expected, actual } => {
                write!(f, "expected a {expected:?} page, found {actual:?}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "page checksum {actual:#010x} does not match stored {expected:#010x}")
            }
            Self::TooShort { len } => write!(f, "{len}-byte page has no room for a header"),
        }
    }
}

impl std::error::Error for PageError {}

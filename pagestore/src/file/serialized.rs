//! Typed values stored one per page.
//!
//! # Page Format
//!
//! ```text
//! +----------+------------------------------------------+
//! | 0-7      | page header (type, flags, CRC32)         |
//! | 8-N      | encoded value                            |
//! | N-end    | zero padding                             |
//! +----------+------------------------------------------+
//! ```
//!
//! The checksum covers the whole page. Loading verifies the checksum and the
//! page type before decoding, so a torn or foreign page is reported instead
//! of being decoded into garbage.

use crate::file::{FileError, PageFile};
use crate::page::{Page, PageError, PageHeader, PageId, PageType};
use crate::serialize::{SerInput, SerOutput, SerializeError, Serializer};

/// A page file that exchanges values of type `T` instead of raw pages.
pub struct SerializedPageFile<F, T> {
    file: F,
    serializer: Box<dyn Serializer<T>>,
    page_type: PageType,
}

impl<F: PageFile, T> SerializedPageFile<F, T> {
    pub fn new<S: Serializer<T> + 'static>(file: F, serializer: S, page_type: PageType) -> Self {
        Self {
            file,
            serializer: Box::new(serializer),
            page_type,
        }
    }

    /// Bytes available to an encoded value on one page.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.file.page_size().saturating_sub(PageHeader::SIZE)
    }

    /// The underlying page file.
    #[must_use]
    pub const fn file(&self) -> &F {
        &self.file
    }

    pub fn load(&self, pointer: PageId) -> Result<T, PagingError> {
        let page = self.file.load(pointer)?;
        let header = page.verify()?;
        if header.page_type != self.page_type {
            return Err(PagingError::Page(PageError::WrongPageType {
                expected: self.page_type,
                actual: header.page_type,
            }));
        }

        let mut input = SerInput::new(&page.as_bytes()[PageHeader::SIZE..]);
        self.serializer
            .read(&mut input)
            .map_err(PagingError::Decode)
    }

    pub fn save(&self, pointer: PageId, value: &T) -> Result<(), PagingError> {
        let page_size = self.file.page_size();
        let mut output = SerOutput::new();
        output.write_bytes(&PageHeader::new(self.page_type).encode());
        self.serializer
            .write(&mut output, value)
            .map_err(PagingError::Encode)?;

        if output.len() > page_size {
            return Err(PagingError::Overflow {
                size: output.len(),
                page_size,
            });
        }

        let mut bytes = output.into_bytes();
        bytes.resize(page_size, 0);
        let mut page = Page::from_vec(bytes);
        page.seal();
        self.file.save(pointer, &page)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<(), PagingError> {
        self.file.sync().map_err(PagingError::File)
    }
}

/// Errors from typed page access.
#[derive(Debug)]
pub enum PagingError {
    /// The page could not be read or written.
    File(FileError),
    /// The page header is invalid or the checksum does not match.
    Page(PageError),
    /// Stored bytes do not decode into a value.
    Decode(SerializeError),
    /// The value could not be encoded.
    Encode(SerializeError),
    /// The encoded value does not fit into a page.
    Overflow { size: usize, page_size: usize },
}

impl PagingError {
    /// Whether the page was never written (all zeroes) or lies past the end
    /// of a growable file.
    #[must_use]
    pub const fn is_unwritten(&self) -> bool {
        matches!(
            self,
            Self::Page(PageError::InvalidPageType(0)) | Self::File(FileError::PageOutOfRange { .. })
        )
    }
}

impl std::fmt::Display for PagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(e) => write!(f, "paging file error: {e}"),
            Self::Page(e) => write!(f, "paging page error: {e}"),
            Self::Decode(e) => write!(f, "paging decode error: {e}"),
            Self::Encode(e) => write!(f, "paging encode error: {e}"),
            Self::Overflow { size, page_size } => {
                write!(f, "encoded value of {size} bytes exceeds page size {page_size}")
            }
        }
    }
}

impl std::error::Error for PagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            Self::Page(e) => Some(e),
            Self::Decode(e) | Self::Encode(e) => Some(e),
            Self::Overflow { .. } => None,
        }
    }
}

impl From<FileError> for PagingError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<PageError> for PagingError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

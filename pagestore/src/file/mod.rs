//! Page-addressed storage.
//!
//! Everything in the engine reads and writes whole pages through the
//! [`PageFile`] trait. Implementations:
//!
//! - [`FilePageFile`]: pages in an operating system file
//! - [`MemoryPageFile`]: pages in memory, with optional fault injection
//! - [`SubPageFile`]: a bounded, offset-translated window over a parent
//! - [`SerializedPageFile`]: typed values on top of any page file
//!
//! # Invariants
//!
//! - A page pointer outside the file's (or window's) range is an addressing
//!   error. It never wraps and never touches another page.
//! - Sub-views borrow their parent. Only the owner of a file closes it.

mod disk;
mod memory;
mod serialized;
mod sub;

pub use disk::FilePageFile;
pub use memory::{FaultConfig, MemoryPageFile, MemoryPageFileStats};
pub use serialized::{PagingError, SerializedPageFile};
pub use sub::{PageExtentFile, SubExtentFile, SubPageFile};

use crate::page::{Page, PageId};

/// Raw fixed-size page storage.
///
/// All methods take `&self` so that several sub-views can share one parent.
/// Implementations serialize access internally.
pub trait PageFile: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Number of addressable pages.
    fn page_count(&self) -> Result<PageId, FileError>;

    /// Read a page.
    fn load(&self, pointer: PageId) -> Result<Page, FileError>;

    /// Write a page. The page must be exactly `page_size` bytes.
    fn save(&self, pointer: PageId, page: &Page) -> Result<(), FileError>;

    /// Force written pages to stable storage.
    fn sync(&self) -> Result<(), FileError>;

    /// Release the file. A no-op for views that do not own their storage.
    fn close(&self) -> Result<(), FileError>;
}

impl<P: PageFile + ?Sized> PageFile for &P {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn page_count(&self) -> Result<PageId, FileError> {
        (**self).page_count()
    }

    fn load(&self, pointer: PageId) -> Result<Page, FileError> {
        (**self).load(pointer)
    }

    fn save(&self, pointer: PageId, page: &Page) -> Result<(), FileError> {
        (**self).save(pointer, page)
    }

    fn sync(&self) -> Result<(), FileError> {
        (**self).sync()
    }

    fn close(&self) -> Result<(), FileError> {
        (**self).close()
    }
}

/// A span of `count` consecutive pages starting at `pointer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub pointer: PageId,
    pub count: u32,
}

impl Extent {
    #[must_use]
    pub const fn new(pointer: PageId, count: u32) -> Self {
        Self { pointer, count }
    }
}

/// Variable-length storage addressed by extents.
pub trait ExtentFile: Send + Sync {
    /// Read all bytes covered by an extent.
    fn load(&self, extent: Extent) -> Result<Vec<u8>, FileError>;

    /// Write bytes into an extent. Shorter input is zero padded.
    fn save(&self, extent: Extent, bytes: &[u8]) -> Result<(), FileError>;

    fn sync(&self) -> Result<(), FileError>;

    fn close(&self) -> Result<(), FileError>;
}

/// Cut a parent file into consecutive windows.
///
/// `bounds = [0, 1, 5, 100]` yields the windows `[0, 1)`, `[1, 5)` and
/// `[5, 100)`.
#[must_use]
pub fn sub_page_files<'a>(parent: &'a dyn PageFile, bounds: &[PageId]) -> Vec<SubPageFile<'a>> {
    bounds
        .windows(2)
        .map(|w| SubPageFile::new(parent, w[0], w[1]))
        .collect()
}

/// Check that a page handed to `save` has the file's page size.
pub(crate) fn check_page_size(page: &Page, page_size: usize) -> Result<(), FileError> {
    if page.len() == page_size {
        Ok(())
    } else {
        Err(FileError::PageSizeMismatch {
            expected: page_size,
            actual: page.len(),
        })
    }
}

/// Errors that can occur during page I/O.
#[derive(Debug)]
pub enum FileError {
    /// I/O error from the underlying storage.
    Io(std::io::Error),
    /// Page pointer outside `[start, end)`.
    PageOutOfRange { pointer: u64, start: u64, end: u64 },
    /// Extent not fully inside `[start, end)`.
    ExtentOutOfRange {
        pointer: u64,
        count: u32,
        start: u64,
        end: u64,
    },
    /// Page buffer does not match the file's page size.
    PageSizeMismatch { expected: usize, actual: usize },
    /// Bytes do not fit into the extent.
    ExtentOverflow { len: usize, capacity: usize },
    /// File used after `close`.
    Closed,
    /// A lock guarding the file was poisoned by a panicking thread.
    LockPoisoned,
    /// Simulated failure from a fault-injecting file.
    InjectedFault(String),
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfRange {
                pointer,
                start,
                end,
            } => write!(f, "page index out of range: {pointer} not in [{start}, {end})"),
            Self::ExtentOutOfRange {
                pointer,
                count,
                start,
                end,
            } => write!(
                f,
                "extent out of range: {count} pages at {pointer} not in [{start}, {end})"
            ),
            Self::PageSizeMismatch { expected, actual } => {
                write!(f, "page size mismatch: expected {expected} bytes, got {actual}")
            }
            Self::ExtentOverflow { len, capacity } => {
                write!(f, "{len} bytes do not fit into an extent of {capacity} bytes")
            }
            Self::Closed => write!(f, "page file is closed"),
            Self::LockPoisoned => write!(f, "page file lock poisoned"),
            Self::InjectedFault(message) => write!(f, "injected fault: {message}"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

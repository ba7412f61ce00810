//! Bounded views over a parent file.
//!
//! A view translates every pointer by its `start` offset and validates the
//! translated pointer against its own `[start, end)` window, so a view can
//! never reach pages outside the range it was granted even when the parent
//! is larger. Views carry no durability state of their own: `sync` forwards
//! to the parent and `close` does nothing.

use crate::file::{Extent, ExtentFile, FileError, PageFile};
use crate::page::{Page, PageId};

/// A window `[start, end)` over a parent page file.
#[derive(Clone, Copy)]
pub struct SubPageFile<'a> {
    parent: &'a dyn PageFile,
    start: PageId,
    end: PageId,
}

impl<'a> SubPageFile<'a> {
    #[must_use]
    pub fn new(parent: &'a dyn PageFile, start: PageId, end: PageId) -> Self {
        Self { parent, start, end }
    }

    #[must_use]
    pub const fn start(&self) -> PageId {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> PageId {
        self.end
    }

    fn translate(&self, pointer: PageId) -> Result<PageId, FileError> {
        match pointer.checked_add(self.start) {
            Some(p) if self.start <= p && p < self.end => Ok(p),
            _ => Err(FileError::PageOutOfRange {
                pointer: u64::from(pointer) + u64::from(self.start),
                start: u64::from(self.start),
                end: u64::from(self.end),
            }),
        }
    }
}

impl PageFile for SubPageFile<'_> {
    fn page_size(&self) -> usize {
        self.parent.page_size()
    }

    fn page_count(&self) -> Result<PageId, FileError> {
        Ok(self.end.saturating_sub(self.start))
    }

    fn load(&self, pointer: PageId) -> Result<Page, FileError> {
        self.parent.load(self.translate(pointer)?)
    }

    fn save(&self, pointer: PageId, page: &Page) -> Result<(), FileError> {
        self.parent.save(self.translate(pointer)?, page)
    }

    fn sync(&self) -> Result<(), FileError> {
        self.parent.sync()
    }

    fn close(&self) -> Result<(), FileError> {
        Ok(())
    }
}

impl std::fmt::Debug for SubPageFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubPageFile")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

/// Extents laid out over consecutive pages of a page file.
#[derive(Clone, Copy)]
pub struct PageExtentFile<'a> {
    pages: &'a dyn PageFile,
}

impl<'a> PageExtentFile<'a> {
    #[must_use]
    pub fn new(pages: &'a dyn PageFile) -> Self {
        Self { pages }
    }

    fn pointers(extent: Extent) -> Result<std::ops::Range<PageId>, FileError> {
        extent
            .pointer
            .checked_add(extent.count)
            .map(|end| extent.pointer..end)
            .ok_or(FileError::ExtentOutOfRange {
                pointer: u64::from(extent.pointer),
                count: extent.count,
                start: 0,
                end: u64::from(PageId::MAX),
            })
    }
}

impl ExtentFile for PageExtentFile<'_> {
    fn load(&self, extent: Extent) -> Result<Vec<u8>, FileError> {
        let pointers = Self::pointers(extent)?;
        let page_count = self.pages.page_count()?;
        if pointers.end > page_count {
            return Err(FileError::ExtentOutOfRange {
                pointer: u64::from(extent.pointer),
                count: extent.count,
                start: 0,
                end: u64::from(page_count),
            });
        }

        let mut bytes = Vec::with_capacity(pointers.len() * self.pages.page_size());
        for pointer in pointers {
            bytes.extend_from_slice(self.pages.load(pointer)?.as_bytes());
        }
        Ok(bytes)
    }

    fn save(&self, extent: Extent, bytes: &[u8]) -> Result<(), FileError> {
        let page_size = self.pages.page_size();
        let capacity = extent.count as usize * page_size;
        if bytes.len() > capacity {
            return Err(FileError::ExtentOverflow {
                len: bytes.len(),
                capacity,
            });
        }

        for (i, pointer) in Self::pointers(extent)?.enumerate() {
            let mut page = Page::new(page_size);
            let from = (i * page_size).min(bytes.len());
            let to = ((i + 1) * page_size).min(bytes.len());
            page.write_bytes(0, &bytes[from..to]);
            self.pages.save(pointer, &page)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), FileError> {
        self.pages.sync()
    }

    fn close(&self) -> Result<(), FileError> {
        Ok(())
    }
}

/// A window `[start, end)` over a parent extent file.
#[derive(Clone, Copy)]
pub struct SubExtentFile<'a> {
    parent: &'a dyn ExtentFile,
    start: PageId,
    end: PageId,
}

impl<'a> SubExtentFile<'a> {
    #[must_use]
    pub fn new(parent: &'a dyn ExtentFile, start: PageId, end: PageId) -> Self {
        Self { parent, start, end }
    }

    fn translate(&self, extent: Extent) -> Result<Extent, FileError> {
        let pointer = u64::from(extent.pointer) + u64::from(self.start);
        let last = pointer + u64::from(extent.count);
        let out_of_range = || FileError::ExtentOutOfRange {
            pointer,
            count: extent.count,
            start: u64::from(self.start),
            end: u64::from(self.end),
        };
        if last > u64::from(self.end) {
            return Err(out_of_range());
        }
        let translated = PageId::try_from(pointer).map_err(|_| out_of_range())?;
        Ok(Extent::new(translated, extent.count))
    }
}

impl ExtentFile for SubExtentFile<'_> {
    fn load(&self, extent: Extent) -> Result<Vec<u8>, FileError> {
        self.parent.load(self.translate(extent)?)
    }

    fn save(&self, extent: Extent, bytes: &[u8]) -> Result<(), FileError> {
        self.parent.save(self.translate(extent)?, bytes)
    }

    fn sync(&self) -> Result<(), FileError> {
        self.parent.sync()
    }

    fn close(&self) -> Result<(), FileError> {
        Ok(())
    }
}

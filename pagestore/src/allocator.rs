//! Page allocator using a bitmap to track free/used pages.
//!
//! The allocator covers one window of a page file (a tree's node region).
//! Its bitmap is persisted in a separate window of typed bitmap pages, and
//! only the bitmap pages touched since the last flush are rewritten.
//! Each bit represents one page: 0 = free, 1 = used.

use std::collections::BTreeSet;

use crate::file::{PageFile, PagingError, SerializedPageFile};
use crate::page::{PageHeader, PageId, PageType};
use crate::serialize::FixedBytesSerializer;

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// Bitmap pages as stored in a page file.
pub type BitmapFile<F> = SerializedPageFile<F, Vec<u8>>;

/// Bitmap bytes stored on one page of the given size.
#[must_use]
pub const fn bitmap_bytes_per_page(page_size: usize) -> usize {
    page_size.saturating_sub(PageHeader::SIZE)
}

/// Calculate how many bitmap pages are needed to track `total_pages`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn bitmap_pages_needed(total_pages: PageId, page_size: usize) -> PageId {
    let per_page = bitmap_bytes_per_page(page_size) * BITS_PER_BYTE;
    if per_page == 0 {
        return 0;
    }
    (total_pages as usize).div_ceil(per_page) as PageId
}

/// Open the bitmap window of a page file as typed bitmap pages.
pub fn bitmap_file<F: PageFile>(file: F) -> BitmapFile<F> {
    let len = bitmap_bytes_per_page(file.page_size());
    SerializedPageFile::new(file, FixedBytesSerializer { len }, PageType::AllocationBitmap)
}

/// A page allocation bitmap.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    /// The bitmap data (in-memory representation).
    bitmap: Vec<u8>,
    /// Total number of pages being tracked.
    total_pages: PageId,
    /// Number of free pages.
    free_count: PageId,
    /// Hint for next free page search.
    next_search_hint: PageId,
    /// Bitmap bytes per bitmap page.
    bytes_per_page: usize,
    /// Bitmap pages changed since the last flush.
    dirty: BTreeSet<PageId>,
}

impl PageAllocator {
    /// Create an allocator with every page free.
    ///
    /// All bitmap pages start dirty so the first flush formats them.
    #[must_use]
    pub fn new(total_pages: PageId, page_size: usize) -> Self {
        let bitmap_bytes = (total_pages as usize).div_ceil(BITS_PER_BYTE);
        Self {
            bitmap: vec![0u8; bitmap_bytes],
            total_pages,
            free_count: total_pages,
            next_search_hint: 0,
            bytes_per_page: bitmap_bytes_per_page(page_size),
            dirty: (0..bitmap_pages_needed(total_pages, page_size)).collect(),
        }
    }

    /// Load an allocator from its bitmap pages.
    pub fn load<F: PageFile>(
        file: &BitmapFile<F>,
        total_pages: PageId,
    ) -> Result<Self, PagingError> {
        let page_size = file.file().page_size();
        let mut allocator = Self::new(total_pages, page_size);
        allocator.dirty.clear();

        let bitmap_bytes = allocator.bitmap.len();
        let mut offset = 0;
        for pointer in 0..bitmap_pages_needed(total_pages, page_size) {
            let chunk = file.load(pointer)?;
            let copy_len = (bitmap_bytes - offset).min(chunk.len());
            allocator.bitmap[offset..offset + copy_len].copy_from_slice(&chunk[..copy_len]);
            offset += copy_len;
        }

        let used: PageId = allocator.bitmap.iter().map(|b| b.count_ones()).sum();
        allocator.free_count = total_pages.saturating_sub(used);
        allocator.next_search_hint = (0..total_pages)
            .find(|&p| !get_bit(&allocator.bitmap, p as usize))
            .unwrap_or(0);
        Ok(allocator)
    }

    /// Write the bitmap pages changed since the last flush.
    ///
    /// Returns the number of pages written.
    pub fn flush<F: PageFile>(&mut self, file: &BitmapFile<F>) -> Result<usize, PagingError> {
        let dirty = std::mem::take(&mut self.dirty);
        for &pointer in &dirty {
            let start = pointer as usize * self.bytes_per_page;
            let end = (start + self.bytes_per_page).min(self.bitmap.len());
            let mut chunk = self.bitmap[start..end].to_vec();
            chunk.resize(self.bytes_per_page, 0);
            if let Err(e) = file.save(pointer, &chunk) {
                self.dirty.extend(dirty);
                return Err(e);
            }
        }
        Ok(dirty.len())
    }

    /// Allocate a single free page.
    ///
    /// Returns `None` if no free pages are available.
    pub fn allocate(&mut self) -> Option<PageId> {
        if self.free_count == 0 {
            return None;
        }

        // Search from hint, then wrap around
        let found = (self.next_search_hint..self.total_pages)
            .chain(0..self.next_search_hint)
            .find(|&p| !get_bit(&self.bitmap, p as usize))?;

        self.mark(found, true);
        self.free_count -= 1;
        self.next_search_hint = found + 1;
        Some(found)
    }

    /// Free a previously allocated page.
    pub fn free(&mut self, page_id: PageId) {
        if !self.is_allocated(page_id) {
            return;
        }

        self.mark(page_id, false);
        self.free_count += 1;
        if page_id < self.next_search_hint {
            self.next_search_hint = page_id;
        }
    }

    /// Check if a page is allocated.
    #[must_use]
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        if page_id >= self.total_pages {
            return false;
        }
        get_bit(&self.bitmap, page_id as usize)
    }

    /// Get the number of free pages.
    #[must_use]
    pub const fn free_count(&self) -> PageId {
        self.free_count
    }

    /// Get the number of allocated pages.
    #[must_use]
    pub const fn used_count(&self) -> PageId {
        self.total_pages - self.free_count
    }

    /// Get the total number of pages being tracked.
    #[must_use]
    pub const fn total_pages(&self) -> PageId {
        self.total_pages
    }

    #[allow(clippy::cast_possible_truncation)]
    fn mark(&mut self, page_id: PageId, used: bool) {
        let index = page_id as usize;
        if used {
            set_bit(&mut self.bitmap, index);
        } else {
            clear_bit(&mut self.bitmap, index);
        }
        if self.bytes_per_page > 0 {
            let byte = index / BITS_PER_BYTE;
            self.dirty.insert((byte / self.bytes_per_page) as PageId);
        }
    }
}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

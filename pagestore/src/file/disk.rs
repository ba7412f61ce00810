//! Page file backed by an operating system file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::file::{FileError, PageFile, check_page_size};
use crate::page::{Page, PageId};

/// A file of fixed-size pages.
///
/// The file grows when a page past the current end is saved. Pages in the
/// gap read back as zeroes. A trailing partial page (left by a crash while
/// the file was being extended) is not addressable.
pub struct FilePageFile {
    inner: Mutex<Inner>,
    page_size: usize,
}

struct Inner {
    file: File,
    page_count: PageId,
    closed: bool,
}

impl FilePageFile {
    /// Open or create a page file at the given path.
    #[allow(clippy::cast_possible_truncation)]
    pub fn open(path: &Path, page_size: usize) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let page_count = (len / page_size as u64) as PageId;

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                page_count,
                closed: false,
            }),
            page_size,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, FileError> {
        let inner = self.inner.lock().map_err(|_| FileError::LockPoisoned)?;
        if inner.closed {
            return Err(FileError::Closed);
        }
        Ok(inner)
    }

    fn offset(&self, pointer: PageId) -> u64 {
        u64::from(pointer) * self.page_size as u64
    }
}

impl PageFile for FilePageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> Result<PageId, FileError> {
        Ok(self.lock()?.page_count)
    }

    fn load(&self, pointer: PageId) -> Result<Page, FileError> {
        let mut inner = self.lock()?;
        if pointer >= inner.page_count {
            return Err(FileError::PageOutOfRange {
                pointer: u64::from(pointer),
                start: 0,
                end: u64::from(inner.page_count),
            });
        }

        let mut page = Page::new(self.page_size);
        inner.file.seek(SeekFrom::Start(self.offset(pointer)))?;
        inner.file.read_exact(page.as_bytes_mut())?;
        Ok(page)
    }

    fn save(&self, pointer: PageId, page: &Page) -> Result<(), FileError> {
        check_page_size(page, self.page_size)?;
        let mut inner = self.lock()?;

        inner.file.seek(SeekFrom::Start(self.offset(pointer)))?;
        inner.file.write_all(page.as_bytes())?;

        if pointer >= inner.page_count {
            inner.page_count = pointer + 1;
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), FileError> {
        self.lock()?.file.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<(), FileError> {
        let mut inner = self.lock()?;
        inner.file.sync_all()?;
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.pages");
        (dir, path)
    }

    fn filled(page_size: usize, byte: u8) -> Page {
        Page::from_vec(vec![byte; page_size])
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, path) = create_test_file();
        let file = FilePageFile::open(&path, 512).expect("open");

        file.save(0, &filled(512, 0xAB)).expect("save");
        file.save(3, &filled(512, 0xCD)).expect("save");

        assert_eq!(file.page_count().expect("count"), 4);
        assert_eq!(file.load(0).expect("load"), filled(512, 0xAB));
        assert_eq!(file.load(3).expect("load"), filled(512, 0xCD));
        // gap pages read back as zeroes
        assert_eq!(file.load(1).expect("load"), Page::new(512));
    }

    #[test]
    fn test_load_past_end_is_out_of_range() {
        let (_dir, path) = create_test_file();
        let file = FilePageFile::open(&path, 512).expect("open");
        file.save(0, &filled(512, 1)).expect("save");

        let result = file.load(1);
        assert!(matches!(
            result,
            Err(FileError::PageOutOfRange {
                pointer: 1,
                start: 0,
                end: 1
            })
        ));
    }

    #[test]
    fn test_wrong_page_size_rejected() {
        let (_dir, path) = create_test_file();
        let file = FilePageFile::open(&path, 512).expect("open");

        let result = file.save(0, &Page::new(256));
        assert!(matches!(
            result,
            Err(FileError::PageSizeMismatch {
                expected: 512,
                actual: 256
            })
        ));
    }

    #[test]
    fn test_reopen_keeps_pages() {
        let (_dir, path) = create_test_file();
        {
            let file = FilePageFile::open(&path, 512).expect("open");
            file.save(2, &filled(512, 7)).expect("save");
            file.close().expect("close");
        }

        let file = FilePageFile::open(&path, 512).expect("reopen");
        assert_eq!(file.page_count().expect("count"), 3);
        assert_eq!(file.load(2).expect("load"), filled(512, 7));
    }

    #[test]
    fn test_use_after_close() {
        let (_dir, path) = create_test_file();
        let file = FilePageFile::open(&path, 512).expect("open");
        file.close().expect("close");

        assert!(matches!(file.load(0), Err(FileError::Closed)));
    }
}

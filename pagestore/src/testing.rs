use std::io::Cursor;

use tracing_subscriber::EnvFilter;

use crate::file::MemoryPageFile;
use crate::journal::{JournalError, JournalledPageFile};

/// A journal whose data pages and log both live in memory.
pub type MemoryJournal = JournalledPageFile<MemoryPageFile, Cursor<Vec<u8>>>;

/// Route `tracing` output to the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create an empty in-memory journal.
pub fn memory_journal(page_size: usize, apply_threshold: usize) -> Result<MemoryJournal, JournalError> {
    JournalledPageFile::with_parts(
        MemoryPageFile::new(page_size),
        Cursor::new(Vec::new()),
        apply_threshold,
    )
}

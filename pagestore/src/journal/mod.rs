//! Write-ahead journal over a page file.
//!
//! [`JournalledPageFile`] stages every page write in memory. `commit` appends
//! the staged pages to a sibling log file as one unit closed by a commit
//! record, and only `apply_journal` copies committed pages onto the data
//! file. Loads read through the staged set, then the committed set, then the
//! data file, so callers always observe their own writes.
//!
//! # States
//!
//! ```text
//! Open --save--> Dirty --commit--> Committed --apply_journal--> Open
//! ```
//!
//! # Recovery
//!
//! On open the log is scanned. Every unit closed by a valid commit record is
//! replayed onto the data file. A trailing unit without its commit record is
//! discarded and truncated away, as if that commit never happened. Replay is
//! idempotent: a crash during replay is repaired by replaying again.

pub mod record;

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::StoreConfig;
use crate::file::{FileError, FilePageFile, PageFile, check_page_size};
use crate::page::{Page, PageId};

/// Storage for the journal log.
pub trait LogFile: Read + Write + Seek + Send {
    /// Force written bytes to stable storage.
    fn sync(&mut self) -> std::io::Result<()>;

    /// Cut the log to `len` bytes.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl LogFile for Cursor<Vec<u8>> {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().truncate(len as usize);
        if self.position() > len {
            self.set_position(len);
        }
        Ok(())
    }
}

/// Observable journal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// Nothing staged, nothing waiting to be applied.
    Open,
    /// Writes staged but not committed.
    Dirty,
    /// Committed units not yet applied to the data file.
    Committed,
}

/// What recovery found in the log when the file was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Well-formed records read from the log.
    pub records_scanned: usize,
    /// Complete commit units replayed onto the data file.
    pub units_replayed: usize,
    /// Page records of an incomplete trailing unit.
    pub records_discarded: usize,
    /// Bytes cut from the end of the log.
    pub bytes_discarded: u64,
    /// Distinct pages written by replay.
    pub pages_applied: usize,
}

/// A page file protected by a write-ahead journal.
pub struct JournalledPageFile<P = FilePageFile, L = File> {
    data: P,
    apply_threshold: usize,
    journal: Mutex<Journal<L>>,
    recovery: RecoveryReport,
}

struct Journal<L> {
    log: L,
    /// Length of the log holding complete units.
    log_len: u64,
    pending: BTreeMap<PageId, Page>,
    committed: HashMap<PageId, Page>,
    committed_units: usize,
    closed: bool,
}

impl<L: LogFile> Journal<L> {
    fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.log.seek(SeekFrom::Start(self.log_len))?;
        self.log.write_all(bytes)?;
        self.log.flush()
    }
}

/// Path of the log that journals `path`.
#[must_use]
pub fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".journal");
    PathBuf::from(name)
}

impl JournalledPageFile<FilePageFile, File> {
    /// Open or create a journalled file at `path`, recovering its journal.
    pub fn open(path: &Path, page_size: usize) -> Result<Self, JournalError> {
        let config = StoreConfig {
            page_size,
            ..StoreConfig::default()
        };
        Self::open_with_config(path, &config)
    }

    pub fn open_with_config(path: &Path, config: &StoreConfig) -> Result<Self, JournalError> {
        let data = FilePageFile::open(path, config.page_size)?;
        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(journal_path(path))?;
        Self::with_parts(data, log, config.journal_apply_threshold)
    }
}

impl<P: PageFile, L: LogFile> JournalledPageFile<P, L> {
    /// Wrap a data file and a log, replaying any committed units in the log.
    pub fn with_parts(data: P, mut log: L, apply_threshold: usize) -> Result<Self, JournalError> {
        let page_size = data.page_size();

        log.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        log.read_to_end(&mut bytes)?;
        let scan = record::scan(&bytes);

        let mut committed = HashMap::new();
        for unit in &scan.units {
            for (pointer, page_bytes) in unit {
                if page_bytes.len() != page_size {
                    return Err(JournalError::PageSizeMismatch {
                        expected: page_size,
                        actual: page_bytes.len(),
                    });
                }
                committed.insert(*pointer, Page::from_vec(page_bytes.clone()));
            }
        }

        let bytes_discarded = bytes.len() as u64 - scan.valid_len;
        if bytes_discarded > 0 {
            tracing::warn!(
                records = scan.records_discarded,
                bytes = bytes_discarded,
                "discarding incomplete journal tail"
            );
            log.truncate(scan.valid_len)?;
            log.sync()?;
        }

        let recovery = RecoveryReport {
            records_scanned: scan.records_scanned,
            units_replayed: scan.units.len(),
            records_discarded: scan.records_discarded,
            bytes_discarded,
            pages_applied: committed.len(),
        };

        let file = Self {
            data,
            apply_threshold: apply_threshold.max(1),
            journal: Mutex::new(Journal {
                log,
                log_len: scan.valid_len,
                pending: BTreeMap::new(),
                committed,
                committed_units: scan.units.len(),
                closed: false,
            }),
            recovery,
        };

        if file.recovery.units_replayed > 0 {
            file.apply_journal()?;
            tracing::info!(
                units = file.recovery.units_replayed,
                pages = file.recovery.pages_applied,
                "replayed journal"
            );
        }

        Ok(file)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Journal<L>>, JournalError> {
        let journal = self.journal.lock().map_err(|_| JournalError::LockPoisoned)?;
        if journal.closed {
            return Err(JournalError::Closed);
        }
        Ok(journal)
    }

    /// What recovery found when the file was opened.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// The wrapped data file.
    #[must_use]
    pub const fn data(&self) -> &P {
        &self.data
    }

    pub fn state(&self) -> Result<JournalState, JournalError> {
        let journal = self.lock()?;
        Ok(if !journal.pending.is_empty() {
            JournalState::Dirty
        } else if !journal.committed.is_empty() {
            JournalState::Committed
        } else {
            JournalState::Open
        })
    }

    /// Length of the log in bytes, complete units only.
    pub fn journal_len(&self) -> Result<u64, JournalError> {
        Ok(self.lock()?.log_len)
    }

    /// Append all staged pages to the log as one atomic unit.
    ///
    /// On failure the log is cut back to its previous length and the staged
    /// pages stay staged, so the caller may retry or roll back. Once the unit
    /// is in the log the commit succeeds; a failed threshold apply leaves the
    /// units committed for a later [`apply_journal`](Self::apply_journal) or
    /// replay on open.
    pub fn commit(&self) -> Result<(), JournalError> {
        let mut journal = self.lock()?;
        if journal.pending.is_empty() {
            return Ok(());
        }

        let unit = record::encode_unit(&journal.pending);
        if let Err(e) = journal.append(&unit) {
            let len = journal.log_len;
            if let Err(truncate_error) = journal.log.truncate(len) {
                tracing::warn!(error = %truncate_error, "failed to cut back journal after failed commit");
            }
            return Err(JournalError::Durability {
                context: "append commit unit",
                source: FileError::Io(e),
            });
        }

        journal.log_len += unit.len() as u64;
        let pending = std::mem::take(&mut journal.pending);
        let pages = pending.len();
        journal.committed.extend(pending);
        journal.committed_units += 1;
        tracing::debug!(pages, units = journal.committed_units, "committed journal unit");

        if journal.committed_units < self.apply_threshold {
            return Ok(());
        }
        if let Err(e) = self.apply_locked(&mut journal) {
            tracing::warn!(
                error = %e,
                units = journal.committed_units,
                "failed to apply journal after commit; units stay committed"
            );
        }
        Ok(())
    }

    /// Discard all staged pages.
    pub fn rollback(&self) -> Result<(), JournalError> {
        let mut journal = self.lock()?;
        let pages = journal.pending.len();
        journal.pending.clear();
        if pages > 0 {
            tracing::debug!(pages, "rolled back staged pages");
        }
        Ok(())
    }

    /// Force the log and the data file to stable storage.
    pub fn sync(&self) -> Result<(), JournalError> {
        let mut journal = self.lock()?;
        journal
            .log
            .flush()
            .and_then(|()| journal.log.sync())
            .map_err(|e| JournalError::Durability {
                context: "sync journal",
                source: FileError::Io(e),
            })?;
        self.data.sync().map_err(|e| JournalError::Durability {
            context: "sync data file",
            source: e,
        })
    }

    /// Copy committed pages onto the data file and clear the log.
    ///
    /// Returns the number of pages written.
    pub fn apply_journal(&self) -> Result<usize, JournalError> {
        let mut journal = self.lock()?;
        self.apply_locked(&mut journal)
    }

    fn apply_locked(&self, journal: &mut Journal<L>) -> Result<usize, JournalError> {
        if journal.committed.is_empty() {
            return Ok(0);
        }

        let mut pages: Vec<(&PageId, &Page)> = journal.committed.iter().collect();
        pages.sort_unstable_by_key(|(pointer, _)| **pointer);
        for (pointer, page) in &pages {
            self.data
                .save(**pointer, page)
                .map_err(|e| JournalError::Durability {
                    context: "apply journal page",
                    source: e,
                })?;
        }
        let count = pages.len();

        // the log may only shrink once the data file holds every page
        self.data.sync().map_err(|e| JournalError::Durability {
            context: "sync data file",
            source: e,
        })?;
        journal
            .log
            .truncate(0)
            .and_then(|()| journal.log.sync())
            .map_err(|e| JournalError::Durability {
                context: "clear journal",
                source: FileError::Io(e),
            })?;

        journal.log_len = 0;
        journal.committed.clear();
        journal.committed_units = 0;
        tracing::debug!(pages = count, "applied journal");
        Ok(count)
    }

    /// Commit staged pages, apply the journal and release the file.
    ///
    /// Later calls fail with [`JournalError::Closed`].
    pub fn close(&self) -> Result<(), JournalError> {
        self.commit()?;
        let mut journal = self.lock()?;
        self.apply_locked(&mut journal)?;
        journal.log.sync().map_err(|e| JournalError::Durability {
            context: "sync journal",
            source: FileError::Io(e),
        })?;
        self.data.close()?;
        journal.closed = true;
        Ok(())
    }

    /// Take the data file and log apart without applying anything.
    ///
    /// Whatever was committed stays in the log, whatever was staged is lost.
    pub fn into_parts(self) -> Result<(P, L), JournalError> {
        let journal = self
            .journal
            .into_inner()
            .map_err(|_| JournalError::LockPoisoned)?;
        Ok((self.data, journal.log))
    }
}

impl<P: PageFile, L: LogFile> PageFile for JournalledPageFile<P, L> {
    fn page_size(&self) -> usize {
        self.data.page_size()
    }

    fn page_count(&self) -> Result<PageId, FileError> {
        let journal = self.lock()?;
        let staged = journal
            .pending
            .keys()
            .chain(journal.committed.keys())
            .max()
            .map_or(0, |&p| p.saturating_add(1));
        Ok(self.data.page_count()?.max(staged))
    }

    fn load(&self, pointer: PageId) -> Result<Page, FileError> {
        let journal = self.lock()?;
        if let Some(page) = journal.pending.get(&pointer) {
            return Ok(page.clone());
        }
        if let Some(page) = journal.committed.get(&pointer) {
            return Ok(page.clone());
        }
        drop(journal);
        self.data.load(pointer)
    }

    fn save(&self, pointer: PageId, page: &Page) -> Result<(), FileError> {
        check_page_size(page, self.data.page_size())?;
        self.lock()?.pending.insert(pointer, page.clone());
        Ok(())
    }

    fn sync(&self) -> Result<(), FileError> {
        Self::sync(self).map_err(FileError::from)
    }

    fn close(&self) -> Result<(), FileError> {
        Self::close(self).map_err(FileError::from)
    }
}

/// Errors from the journal.
#[derive(Debug)]
pub enum JournalError {
    /// I/O error on the log.
    Io(std::io::Error),
    /// Error from the data file.
    File(FileError),
    /// A commit, sync or apply could not be completed.
    Durability {
        context: &'static str,
        source: FileError,
    },
    /// Corrupt journal record.
    CorruptRecord,
    /// Invalid record type byte.
    InvalidRecordType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A logged page does not match the data file's page size.
    PageSizeMismatch { expected: usize, actual: usize },
    /// File used after `close`.
    Closed,
    /// The journal lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "journal I/O error: {e}"),
            Self::File(e) => write!(f, "journal data file error: {e}"),
            Self::Durability { context, source } => {
                write!(f, "journal durability error ({context}): {source}")
            }
            Self::CorruptRecord => write!(f, "corrupt journal record"),
            Self::InvalidRecordType(t) => write!(f, "invalid journal record type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "journal checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
            Self::PageSizeMismatch { expected, actual } => {
                write!(
                    f,
                    "journal page size mismatch: expected {expected} bytes, got {actual}"
                )
            }
            Self::Closed => write!(f, "journal is closed"),
            Self::LockPoisoned => write!(f, "journal lock poisoned"),
        }
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::File(e) | Self::Durability { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FileError> for JournalError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Closed => Self::Closed,
            FileError::LockPoisoned => Self::LockPoisoned,
            e => Self::File(e),
        }
    }
}

impl From<JournalError> for FileError {
    fn from(e: JournalError) -> Self {
        match e {
            JournalError::File(e) | JournalError::Durability { source: e, .. } => e,
            JournalError::Io(e) => Self::Io(e),
            JournalError::Closed => Self::Closed,
            JournalError::LockPoisoned => Self::LockPoisoned,
            e => Self::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )),
        }
    }
}

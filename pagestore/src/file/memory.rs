//! In-memory page file for deterministic testing.
//!
//! Supports fault injection at several levels:
//! - Page-level read/write errors
//! - Byte-level corruption (bit flips)
//! - Partial writes
//! - Sync failures
//!
//! All faults are driven by a seeded RNG so a failing run can be replayed.

use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::file::{FileError, PageFile, check_page_size};
use crate::page::{Page, PageId};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of page corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Probability of partial write (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fail every write.
    #[must_use]
    pub fn failing_writes() -> Self {
        Self {
            write_error_rate: 1.0,
            ..Self::default()
        }
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.001,
            partial_write_rate: 0.001,
        }
    }
}

/// Statistics about in-memory page file operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryPageFileStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted pages returned.
    pub corrupted_reads: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

/// A growable page file held in memory.
pub struct MemoryPageFile {
    state: Mutex<MemoryState>,
    page_size: usize,
}

struct MemoryState {
    pages: Vec<Page>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryPageFileStats,
}

impl MemoryState {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a page by flipping random bits.
    fn corrupt_page(&mut self, page: &mut Page) {
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..page.len());
            let bit = self.rng.random_range(0..8u8);
            page.as_bytes_mut()[byte_offset] ^= 1 << bit;
        }
    }

    /// Simulate a partial write by zeroing out the tail of the page.
    fn make_partial_write(&mut self, page: &mut Page) {
        let cutoff = self.rng.random_range(0..page.len());
        for byte in page.as_bytes_mut().iter_mut().skip(cutoff) {
            *byte = 0;
        }
    }
}

impl MemoryPageFile {
    /// Create an empty, fault-free page file.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self::with_faults(page_size, 0, FaultConfig::default())
    }

    /// Create an empty page file with custom fault configuration.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn with_faults(page_size: usize, seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                pages: Vec::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryPageFileStats::default(),
            }),
            page_size,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, FileError> {
        self.state.lock().map_err(|_| FileError::LockPoisoned)
    }

    /// Get a snapshot of the current statistics.
    pub fn stats(&self) -> Result<MemoryPageFileStats, FileError> {
        Ok(self.lock()?.stats.clone())
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) -> Result<(), FileError> {
        self.lock()?.fault_config = config;
        Ok(())
    }
}

impl PageFile for MemoryPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    #[allow(clippy::cast_possible_truncation)]
    fn page_count(&self) -> Result<PageId, FileError> {
        Ok(self.lock()?.pages.len() as PageId)
    }

    fn load(&self, pointer: PageId) -> Result<Page, FileError> {
        let mut state = self.lock()?;
        state.stats.reads += 1;

        let Some(stored) = state.pages.get(pointer as usize) else {
            return Err(FileError::PageOutOfRange {
                pointer: u64::from(pointer),
                start: 0,
                end: state.pages.len() as u64,
            });
        };
        let mut page = stored.clone();

        let read_error_rate = state.fault_config.read_error_rate;
        if state.should_inject_fault(read_error_rate) {
            state.stats.injected_read_errors += 1;
            return Err(FileError::InjectedFault("simulated read error".to_string()));
        }

        let corruption_rate = state.fault_config.corruption_rate;
        if state.should_inject_fault(corruption_rate) {
            state.stats.corrupted_reads += 1;
            state.corrupt_page(&mut page);
        }

        Ok(page)
    }

    fn save(&self, pointer: PageId, page: &Page) -> Result<(), FileError> {
        check_page_size(page, self.page_size)?;
        let mut state = self.lock()?;
        state.stats.writes += 1;

        let write_error_rate = state.fault_config.write_error_rate;
        if state.should_inject_fault(write_error_rate) {
            state.stats.injected_write_errors += 1;
            return Err(FileError::InjectedFault("simulated write error".to_string()));
        }

        let mut page_to_write = page.clone();
        let partial_write_rate = state.fault_config.partial_write_rate;
        if state.should_inject_fault(partial_write_rate) {
            state.stats.partial_writes += 1;
            state.make_partial_write(&mut page_to_write);
        }

        let index = pointer as usize;
        if index >= state.pages.len() {
            let page_size = self.page_size;
            state.pages.resize_with(index + 1, || Page::new(page_size));
        }
        state.pages[index] = page_to_write;
        Ok(())
    }

    fn sync(&self) -> Result<(), FileError> {
        let mut state = self.lock()?;
        state.stats.syncs += 1;

        let sync_error_rate = state.fault_config.sync_error_rate;
        if state.should_inject_fault(sync_error_rate) {
            state.stats.injected_sync_errors += 1;
            return Err(FileError::InjectedFault("simulated sync error".to_string()));
        }

        // Writes are already "durable" in memory.
        Ok(())
    }

    fn close(&self) -> Result<(), FileError> {
        Ok(())
    }
}

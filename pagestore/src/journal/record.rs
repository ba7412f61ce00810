//! Journal record encoding.
//!
//! # Record Format
//!
//! Each record has the following layout:
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, includes header+trailer) |
//! | 4        | record_type (1 byte)                             |
//! | 5-N      | body (depends on type)                           |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```
//!
//! Page body: `pointer: u32`, `page_len: u32`, page bytes.
//! Commit body: `pages: u32`, the number of page records in the unit.
//!
//! A commit unit is a run of page records closed by one commit record whose
//! count matches. Anything after the last complete unit is a torn tail.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use crate::journal::JournalError;
use crate::page::{Page, PageId};

/// `record_length` (4) + `record_type` (1).
const RECORD_HEADER_SIZE: usize = 5;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// Journal record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// Full page image.
    Page = 0x01,
    /// End of a commit unit.
    Commit = 0x02,
}

impl TryFrom<u8> for JournalRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Page),
            0x02 => Ok(Self::Commit),
            _ => Err(value),
        }
    }
}

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Page { pointer: PageId, bytes: Vec<u8> },
    Commit { pages: u32 },
}

impl JournalRecord {
    #[must_use]
    pub const fn record_type(&self) -> JournalRecordType {
        match self {
            Self::Page { .. } => JournalRecordType::Page,
            Self::Commit { .. } => JournalRecordType::Commit,
        }
    }

    /// Serialize this record to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Self::Page { pointer, bytes } => {
                body.extend_from_slice(&pointer.to_le_bytes());
                body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                body.extend_from_slice(bytes);
            }
            Self::Commit { pages } => body.extend_from_slice(&pages.to_le_bytes()),
        }

        let total_len = RECORD_HEADER_SIZE + body.len() + CHECKSUM_SIZE;
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_le_bytes());
        out.push(self.record_type() as u8);
        out.extend_from_slice(&body);

        // CRC32 checksum - computed over everything before it
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Deserialize a record from bytes.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), JournalError> {
        if bytes.len() < RECORD_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(JournalError::CorruptRecord);
        }

        let record_len = read_u32(bytes, 0) as usize;
        if record_len < RECORD_HEADER_SIZE + CHECKSUM_SIZE || record_len > bytes.len() {
            return Err(JournalError::CorruptRecord);
        }

        let stored_checksum = read_u32(bytes, record_len - CHECKSUM_SIZE);
        let computed_checksum = crc32fast::hash(&bytes[..record_len - CHECKSUM_SIZE]);
        if stored_checksum != computed_checksum {
            return Err(JournalError::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        let record_type =
            JournalRecordType::try_from(bytes[4]).map_err(JournalError::InvalidRecordType)?;
        let body = &bytes[RECORD_HEADER_SIZE..record_len - CHECKSUM_SIZE];

        let record = match record_type {
            JournalRecordType::Page => {
                if body.len() < 8 {
                    return Err(JournalError::CorruptRecord);
                }
                let pointer = read_u32(body, 0);
                let page_len = read_u32(body, 4) as usize;
                if body.len() != 8 + page_len {
                    return Err(JournalError::CorruptRecord);
                }
                Self::Page {
                    pointer,
                    bytes: body[8..].to_vec(),
                }
            }
            JournalRecordType::Commit => {
                if body.len() != 4 {
                    return Err(JournalError::CorruptRecord);
                }
                Self::Commit {
                    pages: read_u32(body, 0),
                }
            }
        };

        Ok((record, record_len))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Encode pending pages as one commit unit.
#[must_use]
pub fn encode_unit(pages: &BTreeMap<PageId, Page>) -> Vec<u8> {
    let mut out = Vec::new();
    for (&pointer, page) in pages {
        let record = JournalRecord::Page {
            pointer,
            bytes: page.as_bytes().to_vec(),
        };
        out.extend_from_slice(&record.to_bytes());
    }
    out.extend_from_slice(
        &JournalRecord::Commit {
            pages: pages.len() as u32,
        }
        .to_bytes(),
    );
    out
}

/// Result of scanning a journal log.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Complete commit units, oldest first.
    pub units: Vec<Vec<(PageId, Vec<u8>)>>,
    /// Number of well-formed records read.
    pub records_scanned: usize,
    /// Page records after the last complete unit.
    pub records_discarded: usize,
    /// Length of the log prefix holding complete units.
    pub valid_len: u64,
}

/// Split a log into complete commit units and a discarded tail.
#[must_use]
pub fn scan(bytes: &[u8]) -> LogScan {
    let mut result = LogScan::default();
    let mut current = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Ok((record, used)) = JournalRecord::from_bytes(&bytes[offset..]) else {
            break;
        };
        offset += used;
        result.records_scanned += 1;

        match record {
            JournalRecord::Page { pointer, bytes } => current.push((pointer, bytes)),
            JournalRecord::Commit { pages } => {
                if pages as usize != current.len() {
                    break;
                }
                result.units.push(std::mem::take(&mut current));
                result.valid_len = offset as u64;
            }
        }
    }

    result.records_discarded = current.len();
    result
}

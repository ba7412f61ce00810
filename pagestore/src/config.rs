//! Store configuration module.
//!
//! This module provides configuration loading for the storage engine from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `PAGESTORE_PAGE_SIZE`: Page size in bytes (default: `4096`)
//! - `PAGESTORE_MAX_PAGES`: Pages reserved for tree nodes and payloads (default: `65536`)
//! - `PAGESTORE_BRANCH_FACTOR`: Maximum slots per node (default: derived from page size)
//! - `PAGESTORE_JOURNAL_APPLY_THRESHOLD`: Committed units kept in the journal
//!   before they are applied to the data file (default: `8`)
//!
//! # Invariants
//!
//! - `page_size` is a power of two in `512..=65536`
//! - `max_pages` and `journal_apply_threshold` are at least 1

use crate::page::{DEFAULT_PAGE_SIZE, PageId};

/// Storage engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Size of every page in bytes.
    pub page_size: usize,
    /// Number of pages the tree may allocate for nodes and payloads.
    pub max_pages: PageId,
    /// Maximum slots per node. Derived from the page size when `None`.
    pub branch_factor: Option<usize>,
    /// Number of committed units after which the journal is applied.
    pub journal_apply_threshold: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: Self::DEFAULT_MAX_PAGES,
            branch_factor: None,
            journal_apply_threshold: Self::DEFAULT_JOURNAL_APPLY_THRESHOLD,
        }
    }
}

impl StoreConfig {
    /// Default number of node and payload pages.
    pub const DEFAULT_MAX_PAGES: PageId = 65536;
    /// Default number of committed units before the journal is applied.
    pub const DEFAULT_JOURNAL_APPLY_THRESHOLD: usize = 8;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: usize = 512;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: usize = 65536;

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not hold a valid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let page_size = match lookup("PAGESTORE_PAGE_SIZE") {
            Some(value) => Self::parse_page_size(&value)?,
            None => defaults.page_size,
        };
        let max_pages = match lookup("PAGESTORE_MAX_PAGES") {
            Some(value) => parse_at_least_one("PAGESTORE_MAX_PAGES", &value)?,
            None => defaults.max_pages,
        };
        let branch_factor = match lookup("PAGESTORE_BRANCH_FACTOR") {
            Some(value) => Some(Self::parse_branch_factor(&value)?),
            None => defaults.branch_factor,
        };
        let journal_apply_threshold = match lookup("PAGESTORE_JOURNAL_APPLY_THRESHOLD") {
            Some(value) => parse_at_least_one("PAGESTORE_JOURNAL_APPLY_THRESHOLD", &value)?,
            None => defaults.journal_apply_threshold,
        };

        Ok(Self {
            page_size,
            max_pages,
            branch_factor,
            journal_apply_threshold,
        })
    }

    fn parse_page_size(value: &str) -> Result<usize, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: "PAGESTORE_PAGE_SIZE".to_string(),
            message: format!(
                "'{value}' is not a power of two in {}..={}",
                Self::MIN_PAGE_SIZE,
                Self::MAX_PAGE_SIZE
            ),
        };
        let size = value.trim().parse::<usize>().map_err(|_| invalid())?;
        if !size.is_power_of_two() || !(Self::MIN_PAGE_SIZE..=Self::MAX_PAGE_SIZE).contains(&size)
        {
            return Err(invalid());
        }
        Ok(size)
    }

    fn parse_branch_factor(value: &str) -> Result<usize, ConfigError> {
        match value.trim().parse::<usize>() {
            Ok(n) if n >= 4 => Ok(n),
            _ => Err(ConfigError::InvalidValue {
                name: "PAGESTORE_BRANCH_FACTOR".to_string(),
                message: format!("'{value}' is not a number of at least 4"),
            }),
        }
    }
}

fn parse_at_least_one<N>(name: &str, value: &str) -> Result<N, ConfigError>
where
    N: std::str::FromStr + PartialOrd + From<u8>,
{
    match value.trim().parse::<N>() {
        Ok(n) if n >= N::from(1) => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a positive number"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = StoreConfig::from_lookup(lookup(&[])).expect("defaults");
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.max_pages, 65536);
        assert_eq!(config.branch_factor, None);
        assert_eq!(config.journal_apply_threshold, 8);
    }

    #[test]
    fn test_values_from_variables() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("PAGESTORE_PAGE_SIZE", "1024"),
            ("PAGESTORE_MAX_PAGES", "300"),
            ("PAGESTORE_BRANCH_FACTOR", "6"),
            ("PAGESTORE_JOURNAL_APPLY_THRESHOLD", "1"),
        ]))
        .expect("config");

        assert_eq!(config.page_size, 1024);
        assert_eq!(config.max_pages, 300);
        assert_eq!(config.branch_factor, Some(6));
        assert_eq!(config.journal_apply_threshold, 1);
    }

    #[test]
    fn test_page_size_must_be_power_of_two() {
        let result = StoreConfig::from_lookup(lookup(&[("PAGESTORE_PAGE_SIZE", "1000")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "PAGESTORE_PAGE_SIZE"
        ));

        assert!(StoreConfig::from_lookup(lookup(&[("PAGESTORE_PAGE_SIZE", "256")])).is_err());
        assert!(StoreConfig::from_lookup(lookup(&[("PAGESTORE_PAGE_SIZE", "131072")])).is_err());
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(StoreConfig::from_lookup(lookup(&[("PAGESTORE_MAX_PAGES", "0")])).is_err());
        assert!(
            StoreConfig::from_lookup(lookup(&[("PAGESTORE_JOURNAL_APPLY_THRESHOLD", "x")]))
                .is_err()
        );
        assert!(StoreConfig::from_lookup(lookup(&[("PAGESTORE_BRANCH_FACTOR", "3")])).is_err());
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}

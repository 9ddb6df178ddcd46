//! Engine configuration module.
//!
//! This module provides the options a record manager is opened with, and
//! loading of those options for the `arbor` binary from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `ARBOR_DATABASE_PATH`: Page file to open (required)
//! - `ARBOR_PAGE_SIZE`: Page size in bytes for new files (default: `4096`)
//! - `ARBOR_MAX_NODE_ENTRIES`: Fan-out bound for new tables (default: `32`)
//! - `ARBOR_CACHE_PAGES`: Durable page cache capacity (default: `1024`)
//!
//! # Invariants
//!
//! - A validated `page_size` is a power of two within the supported range
//! - A validated `max_node_entries` is within `2..=1024`

use std::path::PathBuf;

use crate::storage::btree::tree::{MAX_FANOUT, MIN_FANOUT};
use crate::storage::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, is_valid_page_size};

/// Options a record manager is opened with.
///
/// `page_size` only applies when the file is created; an existing file keeps
/// the page size it was formatted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordManagerOptions {
    /// Page size in bytes for a new file.
    pub page_size: usize,
    /// Fan-out bound given to tables created through this manager.
    pub max_node_entries: usize,
    /// Number of committed page images kept in memory.
    pub cache_pages: usize,
}

impl Default for RecordManagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_node_entries: RecordManagerOptions::DEFAULT_MAX_NODE_ENTRIES,
            cache_pages: RecordManagerOptions::DEFAULT_CACHE_PAGES,
        }
    }
}

impl RecordManagerOptions {
    /// Default fan-out bound.
    pub const DEFAULT_MAX_NODE_ENTRIES: usize = 32;
    /// Default page cache capacity.
    pub const DEFAULT_CACHE_PAGES: usize = 1024;

    /// Check every option is usable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first option out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_page_size(self.page_size) {
            return Err(ConfigError::InvalidValue {
                name: "page_size".to_string(),
                message: format!(
                    "{} is not a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                    self.page_size
                ),
            });
        }
        if !(MIN_FANOUT..=MAX_FANOUT).contains(&self.max_node_entries) {
            return Err(ConfigError::InvalidValue {
                name: "max_node_entries".to_string(),
                message: format!(
                    "{} is outside {MIN_FANOUT}..={MAX_FANOUT}",
                    self.max_node_entries
                ),
            });
        }
        Ok(())
    }
}

/// Configuration of the `arbor` binary.
///
/// # Pre-conditions
///
/// When constructed via `from_env()`:
/// - `ARBOR_DATABASE_PATH` must be set
/// - All values must be valid for their respective types
///
/// # Post-conditions
///
/// - `options` has passed `validate()`
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Page file to open. The log lives next to it with a `.log` suffix.
    pub database_path: PathBuf,
    /// Options to open it with.
    pub options: RecordManagerOptions,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ARBOR_DATABASE_PATH` is not set or is empty
    /// - a numeric variable is set but does not parse
    /// - the resulting options fail validation
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_path = Self::load_database_path(&lookup)?;
        let defaults = RecordManagerOptions::default();
        let options = RecordManagerOptions {
            page_size: Self::load_number(&lookup, "ARBOR_PAGE_SIZE", defaults.page_size)?,
            max_node_entries: Self::load_number(
                &lookup,
                "ARBOR_MAX_NODE_ENTRIES",
                defaults.max_node_entries,
            )?,
            cache_pages: Self::load_number(&lookup, "ARBOR_CACHE_PAGES", defaults.cache_pages)?,
        };
        options.validate()?;

        Ok(Self {
            database_path,
            options,
        })
    }

    /// Load the database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set or is empty.
    fn load_database_path(
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<PathBuf, ConfigError> {
        let path = lookup("ARBOR_DATABASE_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("ARBOR_DATABASE_PATH".to_string()))?;

        if path.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "ARBOR_DATABASE_PATH".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(PathBuf::from(path))
    }

    /// Load a numeric variable, returning `default` if not set.
    fn load_number(
        lookup: &impl Fn(&str) -> Option<String>,
        name: &str,
        default: usize,
    ) -> Result<usize, ConfigError> {
        match lookup(name) {
            Some(value) => value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a non-negative integer"),
            }),
            None => Ok(default),
        }
    }
}

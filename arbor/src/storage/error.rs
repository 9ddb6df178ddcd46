//! The error type surfaced by the record manager and its tables.
//!
//! Every module has its own error enum; they all funnel into `StoreError` at
//! the page store boundary. "Not found" is never an error: lookups return
//! `Option`.

use crate::storage::btree::NodeError;
use crate::storage::file::FileError;
use crate::storage::io::StorageError;
use crate::storage::page::{PageError, PageId};
use crate::storage::recovery::RecoveryError;
use crate::storage::serializer::SerializationError;
use crate::storage::snapshot::Version;
use crate::storage::superblock::SuperblockError;
use crate::storage::wal::WalError;

/// Coarse classification of a `StoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The underlying file or log could not be read, written or synced.
    StorageFailure,
    /// The manager, table or browser has been closed or dropped.
    IllegalState,
    /// On-disk data failed validation. Fatal for the file.
    CorruptionDetected,
    /// The caller passed an unusable argument or configuration.
    InvalidArgument,
    /// An engine invariant was broken.
    Internal,
}

/// Errors returned by record manager, table and browser operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O failure from a block device.
    Storage(StorageError),
    /// Operation on a closed manager, dropped table or closed browser.
    IllegalState(String),
    /// Page or log contents failed validation.
    Corruption(String),
    /// A key or value could not be encoded or decoded.
    Serialization(SerializationError),
    /// Encoded key exceeds what a node can hold.
    KeyTooLarge { size: usize, max: usize },
    /// Options or arguments outside their valid range.
    InvalidConfiguration(String),
    /// A table was reopened with a different schema than it was created with.
    SchemaMismatch {
        table: String,
        expected: String,
        actual: String,
    },
    /// A snapshot reader found no page image valid at its version.
    SnapshotViolation { page_id: PageId, version: Version },
}

impl StoreError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(StorageError::Detached) | Self::IllegalState(_) => {
                ErrorKind::IllegalState
            }
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::Corruption(_) => ErrorKind::CorruptionDetected,
            Self::Serialization(_)
            | Self::KeyTooLarge { .. }
            | Self::InvalidConfiguration(_)
            | Self::SchemaMismatch { .. } => ErrorKind::InvalidArgument,
            Self::SnapshotViolation { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn closed() -> Self {
        Self::IllegalState("record manager is closed".to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage failure: {e}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption detected: {msg}"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::KeyTooLarge { size, max } => {
                write!(f, "key of {size} bytes exceeds the {max}-byte limit")
            }
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::SchemaMismatch {
                table,
                expected,
                actual,
            } => write!(
                f,
                "table {table:?} was created with schema {expected}, opened with {actual}"
            ),
            Self::SnapshotViolation { page_id, version } => write!(
                f,
                "no image of page {page_id} is valid at snapshot version {version}"
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<PageError> for StoreError {
    fn from(e: PageError) -> Self {
        Self::Corruption(e.to_string())
    }
}

impl From<SuperblockError> for StoreError {
    fn from(e: SuperblockError) -> Self {
        Self::Corruption(e.to_string())
    }
}

impl From<FileError> for StoreError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Storage(e) => Self::Storage(e),
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl From<WalError> for StoreError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Storage(e) => Self::Storage(e),
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl From<RecoveryError> for StoreError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Wal(e) => e.into(),
            RecoveryError::File(e) => e.into(),
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl From<NodeError> for StoreError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::KeyTooLarge { size, max } => Self::KeyTooLarge { size, max },
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl From<SerializationError> for StoreError {
    fn from(e: SerializationError) -> Self {
        Self::Serialization(e)
    }
}

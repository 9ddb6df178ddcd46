//! Embedded B-tree storage engine.
//!
//! A page file of fixed-size pages holds any number of named, ordered
//! tables. A separate log file makes commits atomic, and snapshot versions
//! let browsers read a stable view while writers keep going.
//!
//! # File Format
//!
//! - Page 0: Superblock (page size, page count, free list, catalog root)
//! - Free-list trunk pages chaining released page ids
//! - Table header, B-tree node and overflow pages
//!
//! The log (`<path>.log`) holds before and after page images of the
//! transaction being committed and is empty between commits.
//!
//! # Usage
//!
//! ```ignore
//! use arbor::config::RecordManagerOptions;
//! use arbor::storage::{NaturalOrder, RecordManager, StringSerializer, TableSchema, U64Serializer};
//!
//! let manager = RecordManager::open(path, RecordManagerOptions::default())?;
//! let users = manager.table(
//!     "users",
//!     TableSchema::new(U64Serializer, StringSerializer, NaturalOrder),
//! )?;
//! users.insert(&7, &"ada".to_string(), false)?;
//! manager.commit()?;
//!
//! let mut browser = users.browse()?;
//! while let Some(tuple) = browser.get_next()? {
//!     println!("{} = {}", tuple.key, tuple.value);
//! }
//! ```

pub mod allocator;
pub mod btree;
pub mod catalog;
pub mod error;
pub mod file;
pub mod io;
pub mod manager;
pub mod overflow;
pub mod page;
pub mod page_cache;
pub mod recovery;
pub mod serializer;
pub mod snapshot;
pub mod store;
pub mod superblock;
pub mod transaction;
pub mod wal;

pub use btree::{BTree, Tuple, TupleBrowser};
pub use error::{ErrorKind, StoreError};
pub use io::{BlockDevice, FileDevice, StorageError};
pub use manager::{RecordManager, TableInfo};
pub use recovery::RecoveryResult;
pub use serializer::{
    BytesSerializer, Comparator, I64Serializer, NaturalOrder, ReverseOrder, SerializationError,
    Serializer, StringSerializer, TableSchema, U64Serializer,
};
pub use snapshot::Snapshot;
pub use store::StoreStats;

//! The record manager: the entry point for opening a page file and the
//! named tables inside it.
//!
//! All tables of one manager share a single pending transaction. Every
//! table operation is visible to later operations immediately; `commit`
//! makes everything since the last commit durable at once and `rollback`
//! discards it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RecordManagerOptions;
use crate::storage::btree::BTree;
use crate::storage::btree::tree;
use crate::storage::catalog;
use crate::storage::error::StoreError;
use crate::storage::io::{BlockDevice, FileDevice};
use crate::storage::recovery::RecoveryResult;
use crate::storage::serializer::TableSchema;
use crate::storage::store::{PageStore, StoreStats};
use crate::storage::transaction::PageSpace;

/// Path of the log kept beside the page file at `path`.
#[must_use]
pub fn log_path(path: &Path) -> PathBuf {
    let mut log = OsString::from(path.as_os_str());
    log.push(".log");
    PathBuf::from(log)
}

/// Schema-independent description of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub descriptor: String,
    pub size: u64,
    pub height: u32,
    pub max_entries: usize,
}

/// An open page file with its transaction log.
///
/// Dropping a manager without calling `close` loses the pending transaction,
/// exactly as a crash would; the next open recovers to the last commit.
pub struct RecordManager {
    store: Arc<PageStore>,
    options: RecordManagerOptions,
    recovery: RecoveryResult,
}

impl RecordManager {
    /// Open the page file at `path`, creating it if needed. The log lives at
    /// `path` with `.log` appended.
    ///
    /// # Post-conditions
    /// - Any committed transaction found in the log has been applied
    pub fn open(path: &Path, options: RecordManagerOptions) -> Result<Self, StoreError> {
        let data = FileDevice::open_or_create(path)?;
        let log = FileDevice::open_or_create(&log_path(path))?;
        tracing::info!("Opening record manager at {}", path.display());
        Self::open_with_devices(Arc::new(data), Arc::new(log), options)
    }

    /// Open over arbitrary block devices.
    pub fn open_with_devices(
        data: Arc<dyn BlockDevice>,
        log: Arc<dyn BlockDevice>,
        options: RecordManagerOptions,
    ) -> Result<Self, StoreError> {
        options
            .validate()
            .map_err(|e| StoreError::InvalidConfiguration(e.to_string()))?;
        let (store, recovery) = PageStore::open(data, log, &options)?;
        let superblock = store.superblock()?;
        tracing::info!(
            "Opened page store: {} byte pages, {} pages, {} free",
            store.page_size(),
            superblock.total_page_count,
            superblock.free_page_count
        );
        Ok(Self {
            store: Arc::new(store),
            options,
            recovery,
        })
    }

    /// Open the table called `name`, creating it when it does not exist.
    ///
    /// New tables take their fan-out bound from the manager's options.
    ///
    /// # Errors
    ///
    /// `SchemaMismatch` when the table exists with a different descriptor.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn table<K, V>(
        &self,
        name: &str,
        schema: TableSchema<K, V>,
    ) -> Result<BTree<K, V>, StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "table name must not be empty".to_string(),
            ));
        }
        let descriptor = schema.descriptor();
        let max_entries = self.options.max_node_entries;
        let (header_id, table_id, created) = self.store.mutate(|action| {
            let catalog_header = action.superblock().catalog_header;
            if let Some(header_id) = catalog::lookup(action, catalog_header, name)? {
                let header = tree::read_header(action, header_id)?;
                if header.descriptor != descriptor {
                    return Err(StoreError::SchemaMismatch {
                        table: name.to_string(),
                        expected: header.descriptor,
                        actual: descriptor.clone(),
                    });
                }
                return Ok((header_id, header.table_id, false));
            }
            let table_id = self.store.issue_table_id(action.superblock().next_table_id);
            let header_id = tree::create(action, name, &descriptor, max_entries, table_id)?;
            catalog::register(action, name, header_id)?;
            Ok((header_id, table_id, true))
        })?;

        if created {
            tracing::debug!("Created table {} ({})", name, descriptor);
        } else {
            tracing::debug!("Opened table {}", name);
        }
        Ok(BTree::new(
            Arc::clone(&self.store),
            header_id,
            table_id,
            name.to_string(),
            schema,
        ))
    }

    /// Delete the table called `name` and free its pages. Returns whether it
    /// existed. Handles to it fail from now on.
    pub fn drop_table(&self, name: &str) -> Result<bool, StoreError> {
        let freed = self.store.mutate(|action| {
            let Some(header_id) = catalog::unregister(action, name)? else {
                return Ok(None);
            };
            tree::destroy(action, header_id).map(Some)
        })?;
        match freed {
            Some(pages) => {
                tracing::debug!("Dropped table {} ({} pages freed)", name, pages);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Names of every table, sorted by their bytes.
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let mut snapshot = self.store.snapshot()?;
        let superblock = catalog::superblock(&mut snapshot)?;
        catalog::names(&mut snapshot, superblock.catalog_header)
    }

    /// Describe the table called `name` without knowing its schema.
    pub fn table_info(&self, name: &str) -> Result<Option<TableInfo>, StoreError> {
        let mut snapshot = self.store.snapshot()?;
        let superblock = catalog::superblock(&mut snapshot)?;
        let Some(header_id) = catalog::lookup(&mut snapshot, superblock.catalog_header, name)?
        else {
            return Ok(None);
        };
        let header = tree::read_header(&mut snapshot, header_id)?;
        Ok(Some(TableInfo {
            name: header.name,
            descriptor: header.descriptor,
            size: header.entry_count,
            height: header.height,
            max_entries: header.max_entries as usize,
        }))
    }

    /// Make every change since the last commit durable.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.store.commit().map(|_| ())
    }

    /// Discard every change since the last commit.
    pub fn rollback(&self) -> Result<(), StoreError> {
        self.store.rollback().map(|_| ())
    }

    /// Commit pending changes and release the files.
    ///
    /// The files are released even when the commit fails; that error is
    /// returned. Changes whose log records were synced are redone by the
    /// next open, the rest are lost. A second `close` fails with
    /// `IllegalState`.
    pub fn close(&self) -> Result<(), StoreError> {
        self.store.ensure_open()?;
        let committed = self.store.commit();
        let released = self.store.shutdown();
        committed?;
        if !released {
            return Err(StoreError::closed());
        }
        tracing::info!("Closed record manager");
        Ok(())
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    /// Counters describing the store.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.store.stats()
    }

    /// What recovery did when this manager was opened.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    /// Options the manager was opened with.
    #[must_use]
    pub const fn options(&self) -> &RecordManagerOptions {
        &self.options
    }

    /// Page size of the open file, which may differ from the options for a
    /// file created earlier.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }
}

impl Drop for RecordManager {
    fn drop(&mut self) {
        if self.store.shutdown() {
            tracing::debug!("Record manager dropped without close; pending changes discarded");
        }
    }
}

impl std::fmt::Debug for RecordManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordManager")
            .field("page_size", &self.store.page_size())
            .field("closed", &self.store.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::storage::error::ErrorKind;
    use crate::storage::serializer::{NaturalOrder, ReverseOrder, StringSerializer, U64Serializer};
    use crate::testing::{open_in, small_options};

    fn schema() -> TableSchema<u64, String> {
        TableSchema::new(U64Serializer, StringSerializer, NaturalOrder)
    }

    #[test]
    fn test_log_path_appends_suffix() {
        assert_eq!(
            log_path(Path::new("/data/users.db")),
            PathBuf::from("/data/users.db.log")
        );
    }

    #[test]
    fn test_table_created_then_reopened() {
        let dir = tempdir().expect("create temp dir");
        {
            let manager = open_in(dir.path(), small_options()).unwrap();
            let users = manager.table("users", schema()).unwrap();
            users.insert(&1, &"ada".to_string(), false).unwrap();
            manager.close().unwrap();
        }

        let manager = open_in(dir.path(), small_options()).unwrap();
        let users = manager.table("users", schema()).unwrap();
        assert_eq!(users.find(&1).unwrap(), Some("ada".to_string()));
        assert_eq!(manager.table_names().unwrap(), vec!["users"]);

        let info = manager.table_info("users").unwrap().unwrap();
        assert_eq!(info.size, 1);
        assert_eq!(info.height, 1);
        assert_eq!(info.max_entries, 4);
        assert_eq!(info.descriptor, "key=u64;value=string;order=natural");
        assert_eq!(manager.table_info("orders").unwrap(), None);
    }

    #[test]
    fn test_reopen_with_other_schema_fails() {
        let dir = tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), small_options()).unwrap();
        manager.table("users", schema()).unwrap();

        let result = manager.table(
            "users",
            TableSchema::new(U64Serializer, StringSerializer, ReverseOrder),
        );
        assert!(matches!(result, Err(StoreError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_dropped_table_handle_fails() {
        let dir = tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), small_options()).unwrap();
        let users = manager.table("users", schema()).unwrap();
        users.insert(&1, &"ada".to_string(), false).unwrap();

        assert!(manager.drop_table("users").unwrap());
        assert!(!manager.drop_table("users").unwrap());
        assert_eq!(users.find(&1).unwrap_err().kind(), ErrorKind::IllegalState);

        // A new table with the same name does not revive the old handle.
        let fresh = manager.table("users", schema()).unwrap();
        assert_eq!(fresh.size().unwrap(), 0);
        assert_eq!(users.size().unwrap_err().kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn test_recreated_table_does_not_revive_old_handle() {
        let dir = tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), small_options()).unwrap();
        let users = manager.table("users", schema()).unwrap();
        users.insert(&1, &"ada".to_string(), false).unwrap();
        manager.commit().unwrap();

        assert!(manager.drop_table("users").unwrap());
        manager.commit().unwrap();
        // The freed header page is handed straight back to the new table.
        let reversed = TableSchema::new(U64Serializer, StringSerializer, ReverseOrder);
        let fresh = manager.table("users", reversed).unwrap();
        fresh.insert(&2, &"grace".to_string(), false).unwrap();

        assert_eq!(users.size().unwrap_err().kind(), ErrorKind::IllegalState);
        assert_eq!(
            users.insert(&3, &"alan".to_string(), false).unwrap_err().kind(),
            ErrorKind::IllegalState
        );
        assert_eq!(fresh.size().unwrap(), 1);
    }

    #[test]
    fn test_table_created_after_rollback_gets_new_id() {
        let dir = tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), small_options()).unwrap();
        let first = manager.table("users", schema()).unwrap();
        manager.rollback().unwrap();

        let second = manager.table("users", schema()).unwrap();
        second.insert(&1, &"ada".to_string(), false).unwrap();
        assert_eq!(first.size().unwrap_err().kind(), ErrorKind::IllegalState);
        assert_eq!(second.size().unwrap(), 1);
    }

    #[test]
    fn test_rollback_forgets_created_table() {
        let dir = tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), small_options()).unwrap();
        let users = manager.table("users", schema()).unwrap();
        manager.rollback().unwrap();

        assert!(manager.table_names().unwrap().is_empty());
        assert_eq!(users.size().unwrap_err().kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn test_close_twice_is_illegal_state() {
        let dir = tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), small_options()).unwrap();
        manager.close().unwrap();
        assert!(manager.is_closed());
        assert_eq!(manager.close().unwrap_err().kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let dir = tempdir().expect("create temp dir");
        let options = RecordManagerOptions {
            max_node_entries: 1,
            ..small_options()
        };
        let result = open_in(dir.path(), options);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}

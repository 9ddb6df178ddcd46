//! Typed handles to named tables.

use std::sync::Arc;

use crate::storage::btree::browser::TupleBrowser;
use crate::storage::btree::tree::{self, TableHeader};
use crate::storage::catalog;
use crate::storage::error::StoreError;
use crate::storage::page::PageId;
use crate::storage::serializer::TableSchema;
use crate::storage::store::PageStore;
use crate::storage::transaction::PageSource;

/// An ordered table of `K` to `V`.
///
/// Reads run against a snapshot pinned for the duration of the call;
/// writes run as one write action in the manager's pending transaction.
pub struct BTree<K, V> {
    store: Arc<PageStore>,
    header_id: PageId,
    table_id: u64,
    name: String,
    schema: TableSchema<K, V>,
}

impl<K, V> Clone for BTree<K, V> {
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            header_id: self.header_id,
            table_id: self.table_id,
            name: self.name.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl<K, V> BTree<K, V> {
    pub(crate) const fn new(
        store: Arc<PageStore>,
        header_id: PageId,
        table_id: u64,
        name: String,
        schema: TableSchema<K, V>,
    ) -> Self {
        Self {
            store,
            header_id,
            table_id,
            name,
            schema,
        }
    }

    /// The table's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up `key`.
    pub fn find(&self, key: &K) -> Result<Option<V>, StoreError> {
        let key = self.schema.encode_key(key)?;
        let mut snapshot = self.store.snapshot()?;
        let header = self.header(&mut snapshot)?;
        tree::find(&mut snapshot, &header, &self.schema, &key)?
            .map(|value| self.schema.decode_value(&value))
            .transpose()
    }

    /// Insert `key`, returning the value it held before.
    ///
    /// When the key exists and `replace` is false its value is kept and
    /// returned; nothing is written.
    pub fn insert(&self, key: &K, value: &V, replace: bool) -> Result<Option<V>, StoreError> {
        let key = self.schema.encode_key(key)?;
        let value = self.schema.encode_value(value)?;
        let previous = self.store.mutate(|action| {
            self.header(action)?;
            tree::insert(action, self.header_id, &self.schema, &key, &value, replace)
        })?;
        previous
            .map(|value| self.schema.decode_value(&value))
            .transpose()
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        let key = self.schema.encode_key(key)?;
        let removed = self.store.mutate(|action| {
            self.header(action)?;
            tree::remove(action, self.header_id, &self.schema, &key)
        })?;
        removed
            .map(|value| self.schema.decode_value(&value))
            .transpose()
    }

    /// Number of entries.
    pub fn size(&self) -> Result<u64, StoreError> {
        let mut snapshot = self.store.snapshot()?;
        Ok(self.header(&mut snapshot)?.entry_count)
    }

    /// A browser positioned before the first entry.
    pub fn browse(&self) -> Result<TupleBrowser<K, V>, StoreError> {
        let mut snapshot = self.store.snapshot()?;
        let header = self.header(&mut snapshot)?;
        let (_, leaf) = tree::leftmost_leaf(&mut snapshot, &header)?;
        Ok(TupleBrowser::new(snapshot, self.schema.clone(), leaf, 0))
    }

    /// A browser whose first `get_next` returns the smallest key not less
    /// than `start`.
    pub fn browse_from(&self, start: &K) -> Result<TupleBrowser<K, V>, StoreError> {
        let start = self.schema.encode_key(start)?;
        let mut snapshot = self.store.snapshot()?;
        let header = self.header(&mut snapshot)?;
        let (_, leaf, index) = tree::seek(&mut snapshot, &header, &self.schema, &start)?;
        Ok(TupleBrowser::new(snapshot, self.schema.clone(), leaf, index))
    }

    /// Fan-out bound: the most entries a node holds before it splits.
    pub fn page_size(&self) -> Result<usize, StoreError> {
        let mut snapshot = self.store.snapshot()?;
        Ok(self.header(&mut snapshot)?.max_entries as usize)
    }

    /// Change the fan-out bound. Only allowed while the table is empty.
    pub fn set_page_size(&self, max_entries: usize) -> Result<(), StoreError> {
        self.store.mutate(|action| {
            self.header(action)?;
            tree::set_max_entries(action, self.header_id, max_entries)
        })
    }

    /// The header, after checking the catalog still maps this table's name
    /// to it and the page still belongs to this table rather than a newer
    /// one created in its place.
    fn header(&self, source: &mut impl PageSource) -> Result<TableHeader, StoreError> {
        let superblock = catalog::superblock(source)?;
        let gone = || StoreError::IllegalState(format!("table {} no longer exists", self.name));
        if catalog::lookup(source, superblock.catalog_header, &self.name)? != Some(self.header_id) {
            return Err(gone());
        }
        let header = tree::read_header(source, self.header_id)?;
        if header.table_id != self.table_id {
            return Err(gone());
        }
        Ok(header)
    }
}

impl<K, V> std::fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("name", &self.name)
            .field("header", &self.header_id)
            .field("table_id", &self.table_id)
            .finish_non_exhaustive()
    }
}

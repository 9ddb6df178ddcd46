//! Bidirectional cursors over a pinned snapshot of one table.
//!
//! A browser sits *between* entries. `get_next` returns the entry after the
//! position and steps past it; `get_previous` returns the entry before it
//! and steps back. Running off either end leaves the position there, so
//! reversing direction returns the boundary entry again.
//!
//! Every page the browser touches is read at its snapshot's version, so
//! writers may split, empty or reuse pages underneath it freely.

use crate::storage::btree::node::{LeafEntry, LeafNode};
use crate::storage::btree::tree;
use crate::storage::error::StoreError;
use crate::storage::page::NO_PAGE;
use crate::storage::serializer::TableSchema;
use crate::storage::snapshot::Snapshot;

/// A key and value read from a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple<K, V> {
    pub key: K,
    pub value: V,
}

/// A cursor bound to one snapshot version.
///
/// # Invariants
/// - `index <= leaf.entries.len()`
/// - Entries present when the browser opened are each returned once per
///   pass, in order
pub struct TupleBrowser<K, V> {
    snapshot: Option<Snapshot>,
    schema: TableSchema<K, V>,
    leaf: LeafNode,
    index: usize,
}

impl<K, V> TupleBrowser<K, V> {
    pub(crate) const fn new(
        snapshot: Snapshot,
        schema: TableSchema<K, V>,
        leaf: LeafNode,
        index: usize,
    ) -> Self {
        Self {
            snapshot: Some(snapshot),
            schema,
            leaf,
            index,
        }
    }

    /// Return the entry after the position and move past it.
    pub fn get_next(&mut self) -> Result<Option<Tuple<K, V>>, StoreError> {
        let snapshot = open(&mut self.snapshot)?;
        loop {
            if let Some(entry) = self.leaf.entries.get(self.index) {
                let tuple = decode(snapshot, &self.schema, entry)?;
                self.index += 1;
                return Ok(Some(tuple));
            }
            if self.leaf.next == NO_PAGE {
                return Ok(None);
            }
            self.leaf = tree::read_leaf(snapshot, self.leaf.next)?;
            self.index = 0;
        }
    }

    /// Return the entry before the position and move before it.
    pub fn get_previous(&mut self) -> Result<Option<Tuple<K, V>>, StoreError> {
        let snapshot = open(&mut self.snapshot)?;
        loop {
            if let Some(i) = self.index.checked_sub(1) {
                let tuple = decode(snapshot, &self.schema, &self.leaf.entries[i])?;
                self.index = i;
                return Ok(Some(tuple));
            }
            if self.leaf.prev == NO_PAGE {
                return Ok(None);
            }
            self.leaf = tree::read_leaf(snapshot, self.leaf.prev)?;
            self.index = self.leaf.entries.len();
        }
    }

    /// Release the snapshot. Later calls fail with `IllegalState`.
    pub fn close(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            tracing::trace!("Closed browser at version {}", snapshot.version());
        }
        self.leaf = LeafNode::default();
        self.index = 0;
    }

    /// Whether `close` has been called.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.snapshot.is_none()
    }
}

fn open(snapshot: &mut Option<Snapshot>) -> Result<&mut Snapshot, StoreError> {
    let snapshot = snapshot
        .as_mut()
        .ok_or_else(|| StoreError::IllegalState("browser is closed".to_string()))?;
    snapshot.store().ensure_open()?;
    Ok(snapshot)
}

fn decode<K, V>(
    snapshot: &mut Snapshot,
    schema: &TableSchema<K, V>,
    entry: &LeafEntry,
) -> Result<Tuple<K, V>, StoreError> {
    let value = tree::resolve_value(snapshot, &entry.value)?;
    Ok(Tuple {
        key: schema.decode_key(&entry.key)?,
        value: schema.decode_value(&value)?,
    })
}

impl<K, V> Iterator for TupleBrowser<K, V> {
    type Item = Result<Tuple<K, V>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().transpose()
    }
}

impl<K, V> std::fmt::Debug for TupleBrowser<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBrowser")
            .field("snapshot", &self.snapshot)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

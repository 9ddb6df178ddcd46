//! Write actions and the pending transaction.
//!
//! Every mutating table operation runs as one `WriteAction`: it reads pages
//! through the live state, builds new page images privately, and is either
//! published into the pending `Transaction` as a whole or discarded. Readers
//! never observe half of an action.
//!
//! The pending transaction accumulates published images until `commit`
//! freezes it and writes it through the log.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::error::StoreError;
use crate::storage::page::{Page, PageId, PageImage};
use crate::storage::store::PageStore;
use crate::storage::superblock::Superblock;
use crate::storage::wal::TxnId;

/// Read access to page images.
pub trait PageSource {
    /// Fetch the image of `page_id` as this source sees it.
    fn page(&mut self, page_id: PageId) -> Result<PageImage, StoreError>;
}

/// Read-write access to pages and the superblock within one write action.
pub trait PageSpace: PageSource {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Superblock as of this action.
    fn superblock(&self) -> &Superblock;

    /// Superblock for modification. Marks it for publication.
    fn superblock_mut(&mut self) -> &mut Superblock;

    /// Seal `page` and stage it as the new image of `page_id`.
    fn stage(&mut self, page_id: PageId, page: Page);

    /// Hand `page_id` to deferred reclamation once the action publishes.
    fn free(&mut self, page_id: PageId);
}

/// Images published since the last commit.
#[derive(Debug, Default)]
pub struct Transaction {
    pub id: TxnId,
    pub pages: BTreeMap<PageId, PageImage>,
}

impl Transaction {
    #[must_use]
    pub const fn new(id: TxnId) -> Self {
        Self {
            id,
            pages: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// A set of page changes that becomes visible all at once.
///
/// # Invariants
///
/// - Pages staged here are invisible to every other reader until publish
/// - Page ids at or above `base_total` did not exist when the action began,
///   so there is no older image of them to retain
pub struct WriteAction<'a> {
    store: &'a PageStore,
    superblock: Superblock,
    superblock_dirty: bool,
    base_total: u64,
    dirty: BTreeMap<PageId, PageImage>,
    freed: Vec<PageId>,
}

/// The contents of a finished action, ready to publish.
pub struct StagedChanges {
    pub superblock: Option<Superblock>,
    pub base_total: u64,
    pub pages: BTreeMap<PageId, PageImage>,
    pub freed: Vec<PageId>,
}

impl StagedChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.superblock.is_none() && self.pages.is_empty() && self.freed.is_empty()
    }
}

impl<'a> WriteAction<'a> {
    pub(crate) const fn new(store: &'a PageStore, superblock: Superblock) -> Self {
        Self {
            store,
            superblock,
            superblock_dirty: false,
            base_total: superblock.total_page_count,
            dirty: BTreeMap::new(),
            freed: Vec::new(),
        }
    }

    /// Number of pages staged so far.
    #[must_use]
    pub fn staged_pages(&self) -> usize {
        self.dirty.len()
    }

    pub(crate) fn into_changes(self) -> StagedChanges {
        StagedChanges {
            superblock: self.superblock_dirty.then_some(self.superblock),
            base_total: self.base_total,
            pages: self.dirty,
            freed: self.freed,
        }
    }
}

impl PageSource for WriteAction<'_> {
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn page(&mut self, page_id: PageId) -> Result<PageImage, StoreError> {
        match self.dirty.get(&page_id) {
            Some(image) => Ok(Arc::clone(image)),
            None => self.store.read_latest(page_id),
        }
    }
}

impl PageSpace for WriteAction<'_> {
    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        self.superblock_dirty = true;
        &mut self.superblock
    }

    fn stage(&mut self, page_id: PageId, mut page: Page) {
        page.seal();
        self.dirty.insert(page_id, page.into_image());
    }

    fn free(&mut self, page_id: PageId) {
        self.freed.push(page_id);
    }
}

//! Snapshot versioning for concurrent readers.
//!
//! Every published write action (and every rollback) advances a version
//! counter. A snapshot pins the version that was current when it opened;
//! while it is pinned, any page image a writer supersedes is kept as a
//! *shadow* so the snapshot keeps resolving every page exactly as it was.
//!
//! # Resolution
//!
//! Shadows of a page are keyed by the version that superseded them and
//! remember the version their image became live (`valid_from`). A reader at
//! version `V` takes the first shadow superseded after `V`; if there is
//! none, the live image is the one it wants.
//!
//! # Invariants
//!
//! - Every pin is `<= current`
//! - A shadow `(superseded_at, valid_from)` is retained while some pin `v`
//!   satisfies `valid_from <= v < superseded_at`
//! - A freed page is not reused while a pin older than its free is open

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::storage::error::StoreError;
use crate::storage::page::{PageId, PageImage};
use crate::storage::store::PageStore;
use crate::storage::transaction::PageSource;
use crate::storage::wal::TxnId;

/// A point in the sequence of published states.
pub type Version = u64;

struct Shadow {
    valid_from: Version,
    image: PageImage,
}

/// How a page resolves for a reader.
pub enum Resolved {
    /// The reader needs a retained older image.
    Shadow(PageImage),
    /// The live image is the one the reader needs.
    Live,
}

/// Version counter, open pins and retained page images.
#[derive(Default)]
pub struct VersionTable {
    current: Version,
    /// Open snapshot count per pinned version.
    pins: BTreeMap<Version, usize>,
    /// Retained images per page, keyed by the version that superseded them.
    shadows: HashMap<PageId, BTreeMap<Version, Shadow>>,
    /// Version at which each page's live image was installed, tracked only
    /// while snapshots are open.
    written_at: HashMap<PageId, Version>,
}

impl VersionTable {
    /// Latest published version.
    #[must_use]
    pub const fn current(&self) -> Version {
        self.current
    }

    /// Oldest pinned version, if any snapshot is open.
    #[must_use]
    pub fn oldest_pin(&self) -> Option<Version> {
        self.pins.keys().next().copied()
    }

    /// Number of open snapshots.
    #[must_use]
    pub fn open_snapshots(&self) -> usize {
        self.pins.values().sum()
    }

    /// Number of retained shadow images.
    #[must_use]
    pub fn shadow_count(&self) -> usize {
        self.shadows.values().map(BTreeMap::len).sum()
    }

    /// Pin the current version.
    pub fn pin(&mut self) -> Version {
        *self.pins.entry(self.current).or_insert(0) += 1;
        self.current
    }

    /// Release one pin of `version` and drop shadows no pin needs any more.
    pub fn unpin(&mut self, version: Version) {
        let Some(count) = self.pins.get_mut(&version) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.pins.remove(&version);

        let Some(oldest) = self.oldest_pin() else {
            self.shadows.clear();
            self.written_at.clear();
            return;
        };

        let pins = &self.pins;
        self.shadows.retain(|_, versions| {
            versions.retain(|&superseded_at, shadow| {
                pins.range(shadow.valid_from..superseded_at).next().is_some()
            });
            !versions.is_empty()
        });
        self.written_at.retain(|_, &mut written| written > oldest);
    }

    /// Whether superseding the live image of `page_id` now would strand an
    /// open snapshot.
    #[must_use]
    pub fn needs_shadow(&self, page_id: PageId) -> bool {
        let valid_from = self.written_at.get(&page_id).copied().unwrap_or(0);
        self.pins.range(valid_from..).next().is_some()
    }

    /// Keep the image being superseded at `superseded_at`.
    pub fn retain_shadow(&mut self, page_id: PageId, superseded_at: Version, image: PageImage) {
        let valid_from = self.written_at.get(&page_id).copied().unwrap_or(0);
        self.shadows
            .entry(page_id)
            .or_default()
            .insert(superseded_at, Shadow { valid_from, image });
    }

    /// Record that a new live image of `page_id` is installed at `version`.
    pub fn record_write(&mut self, page_id: PageId, version: Version) {
        if !self.pins.is_empty() {
            self.written_at.insert(page_id, version);
        }
    }

    /// Make `version` the current one.
    pub fn advance_to(&mut self, version: Version) {
        debug_assert!(version > self.current);
        self.current = version;
    }

    /// Resolve `page_id` for a reader pinned at `version`.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn resolve(&self, page_id: PageId, version: Version) -> Result<Resolved, StoreError> {
        let shadow = self
            .shadows
            .get(&page_id)
            .and_then(|versions| versions.range(version + 1..).next());

        match shadow {
            Some((_, shadow)) if shadow.valid_from <= version => {
                Ok(Resolved::Shadow(Arc::clone(&shadow.image)))
            }
            Some(_) => Err(violation(page_id, version)),
            None => {
                let written = self.written_at.get(&page_id).copied().unwrap_or(0);
                if written > version {
                    Err(violation(page_id, version))
                } else {
                    Ok(Resolved::Live)
                }
            }
        }
    }
}

fn violation(page_id: PageId, version: Version) -> StoreError {
    tracing::error!(
        "Snapshot violation: page {} has no image valid at version {}",
        page_id,
        version
    );
    StoreError::SnapshotViolation { page_id, version }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredFree {
    page_id: PageId,
    freed_at: Version,
    /// Transaction whose pending state made the page unreachable.
    origin: TxnId,
}

/// Pages freed by published writes that may still be reachable from an
/// open snapshot.
///
/// A page moves to the free list only once every snapshot older than the
/// write that freed it has closed. Pages pushed onto the free list are
/// remembered until the transaction holding that push commits, so a
/// rollback can put them back in the queue.
#[derive(Debug, Default)]
pub struct DeferredFrees {
    waiting: Vec<DeferredFree>,
    reclaimed: Vec<(TxnId, DeferredFree)>,
}

/// A batch of frees taken for reclamation.
#[derive(Debug, Default)]
pub struct ReclaimBatch {
    entries: Vec<DeferredFree>,
}

impl ReclaimBatch {
    /// Page ids in the batch.
    pub fn page_ids(&self) -> impl Iterator<Item = PageId> + '_ {
        self.entries.iter().map(|entry| entry.page_id)
    }

    /// Number of pages in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DeferredFrees {
    /// Queue a page freed at `freed_at` by transaction `origin`.
    pub fn push(&mut self, page_id: PageId, freed_at: Version, origin: TxnId) {
        self.waiting.push(DeferredFree {
            page_id,
            freed_at,
            origin,
        });
    }

    /// Number of pages waiting for their snapshots to close.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Take every page no open snapshot can reach.
    pub fn take_reclaimable(&mut self, oldest_pin: Option<Version>) -> ReclaimBatch {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting)
            .into_iter()
            .partition(|entry| oldest_pin.is_none_or(|oldest| oldest >= entry.freed_at));
        self.waiting = waiting;
        ReclaimBatch { entries: ready }
    }

    /// Put back a batch whose reclamation failed.
    pub fn restore(&mut self, batch: ReclaimBatch) {
        self.waiting.extend(batch.entries);
    }

    /// Remember that `txn` pushed the batch onto the free list.
    pub fn mark_reclaimed(&mut self, txn: TxnId, batch: ReclaimBatch) {
        self.reclaimed
            .extend(batch.entries.into_iter().map(|entry| (txn, entry)));
    }

    /// Forget frees and reclamations made by a rolled-back transaction.
    ///
    /// Pages it freed are reachable again; pages it reclaimed on behalf of
    /// earlier transactions go back to waiting.
    pub fn rollback(&mut self, txn: TxnId) {
        self.waiting.retain(|entry| entry.origin != txn);
        let (undone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reclaimed)
            .into_iter()
            .partition(|(reclaimed_by, _)| *reclaimed_by == txn);
        self.reclaimed = kept;
        self.waiting.extend(
            undone
                .into_iter()
                .map(|(_, entry)| entry)
                .filter(|entry| entry.origin != txn),
        );
    }

    /// The free-list pushes made by `txn` are durable.
    pub fn settle(&mut self, txn: TxnId) {
        self.reclaimed.retain(|(reclaimed_by, _)| *reclaimed_by != txn);
    }

    /// A failed commit of `from` was merged back into `to`.
    pub fn reassign(&mut self, from: TxnId, to: TxnId) {
        for entry in &mut self.waiting {
            if entry.origin == from {
                entry.origin = to;
            }
        }
        for (reclaimed_by, entry) in &mut self.reclaimed {
            if *reclaimed_by == from {
                *reclaimed_by = to;
            }
            if entry.origin == from {
                entry.origin = to;
            }
        }
    }
}

/// A pinned, read-only view of the store at one version.
///
/// Dropping the snapshot releases the pin.
pub struct Snapshot {
    store: Arc<PageStore>,
    version: Version,
}

impl Snapshot {
    pub(crate) const fn new(store: Arc<PageStore>, version: Version) -> Self {
        Self { store, version }
    }

    /// The pinned version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The store this snapshot reads from.
    #[must_use]
    pub const fn store(&self) -> &Arc<PageStore> {
        &self.store
    }
}

impl PageSource for Snapshot {
    fn page(&mut self, page_id: PageId) -> Result<PageImage, StoreError> {
        self.store.read_at(self.version, page_id)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.store.release_snapshot(self.version);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

//! The page store: the live page state shared by writers and snapshot readers.
//!
//! # Layers
//!
//! A page resolves through these layers, first match wins:
//!
//! 1. a shadow retained for the reader's snapshot version
//! 2. the pending transaction (published, not yet committed)
//! 3. the transaction being flushed by a commit in progress
//! 4. the durable image (page cache, then the page file)
//!
//! # Locking
//!
//! Locks are always taken in the order commit lock, writer mutex, live
//! state. Writers are serialized by the writer mutex; readers hold the live
//! read lock only while resolving a single page.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::RecordManagerOptions;
use crate::storage::allocator;
use crate::storage::error::StoreError;
use crate::storage::file::{FileError, PageFile};
use crate::storage::io::BlockDevice;
use crate::storage::page::{PageId, PageImage, is_valid_page_size};
use crate::storage::page_cache::{CacheStats, PageCache};
use crate::storage::recovery::{self, RecoveryResult};
use crate::storage::snapshot::{DeferredFrees, Resolved, Snapshot, Version, VersionTable};
use crate::storage::superblock::Superblock;
use crate::storage::transaction::{StagedChanges, Transaction, WriteAction};
use crate::storage::wal::{LogRecordPayload, TransactionLog, TxnId};

/// State every reader resolves pages against.
struct LiveState {
    versions: VersionTable,
    superblock: Superblock,
    pending: Transaction,
    flushing: Option<Arc<BTreeMap<PageId, PageImage>>>,
}

/// State owned by the single active writer.
struct WriterState {
    deferred: DeferredFrees,
    next_txn_id: TxnId,
}

/// A transaction whose log records are synced but whose pages are not all
/// in the page file yet.
struct Unfinished {
    txn_id: TxnId,
    pages: Arc<BTreeMap<PageId, PageImage>>,
}

/// Counters describing the store at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub version: Version,
    pub open_snapshots: usize,
    pub shadow_pages: usize,
    pub deferred_frees: usize,
    pub pending_pages: usize,
    pub total_pages: u64,
    pub free_pages: u64,
    pub cache: CacheStats,
}

/// Shared page state plus the durable file and its log.
pub struct PageStore {
    file: PageFile,
    log: Mutex<TransactionLog>,
    cache: PageCache,
    live: RwLock<LiveState>,
    writer: Mutex<WriterState>,
    /// Serializes commits; holds a committed transaction whose page writes
    /// have not all succeeded.
    commit_lock: Mutex<Option<Unfinished>>,
    /// Lowest table id not yet handed out; survives rollbacks.
    next_table_id: AtomicU64,
    closed: AtomicBool,
}

impl PageStore {
    /// Open the store over a page device and a log device, recovering any
    /// logged transactions first. An empty page device is formatted.
    ///
    /// # Post-conditions
    /// - The page file reflects exactly the committed transactions
    /// - The log is empty
    pub fn open(
        data: Arc<dyn BlockDevice>,
        log_device: Arc<dyn BlockDevice>,
        options: &RecordManagerOptions,
    ) -> Result<(Self, RecoveryResult), StoreError> {
        let mut log = TransactionLog::open(log_device)?;
        let scan = log.scan()?;
        let fresh = data.is_empty()? && scan.records.is_empty();

        let page_size = match recovery::logged_page_size(&scan) {
            Some(page_size) => page_size,
            None => PageFile::probe_page_size(data.as_ref())?.unwrap_or(options.page_size),
        };
        if !is_valid_page_size(page_size) {
            return Err(StoreError::Corruption(format!(
                "invalid page size {page_size} recorded in file"
            )));
        }
        if !fresh && page_size != options.page_size {
            tracing::warn!(
                "Ignoring page size option {}: file uses {} byte pages",
                options.page_size,
                page_size
            );
        }

        let file = PageFile::new(data, page_size);
        let recovery = recovery::recover(&file, &mut log, scan)?;
        if !recovery.is_clean() {
            tracing::info!(
                "Recovered {} transactions ({} pages redone, {} discarded)",
                recovery.transactions_replayed,
                recovery.pages_redone,
                recovery.transactions_discarded
            );
        }

        let superblock = if fresh {
            let superblock = file.format()?;
            tracing::info!("Created page file with {} byte pages", page_size);
            superblock
        } else {
            file.read_superblock()?
        };
        file.truncate_pages(superblock.total_page_count)?;

        let store = Self {
            file,
            log: Mutex::new(log),
            cache: PageCache::new(options.cache_pages),
            live: RwLock::new(LiveState {
                versions: VersionTable::default(),
                superblock,
                pending: Transaction::new(1),
                flushing: None,
            }),
            writer: Mutex::new(WriterState {
                deferred: DeferredFrees::default(),
                next_txn_id: 2,
            }),
            commit_lock: Mutex::new(None),
            next_table_id: AtomicU64::new(superblock.next_table_id),
            closed: AtomicBool::new(false),
        };
        Ok((store, recovery))
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.file.page_size()
    }

    /// Superblock of the latest published state.
    pub fn superblock(&self) -> Result<Superblock, StoreError> {
        self.ensure_open()?;
        Ok(self.live().superblock)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::closed());
        }
        Ok(())
    }

    /// Hand out a table id that no table of this store has had, including
    /// tables whose creation was rolled back.
    pub fn issue_table_id(&self, recorded: u64) -> u64 {
        let update = self
            .next_table_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                Some(next.max(recorded) + 1)
            });
        let (Ok(previous) | Err(previous)) = update;
        previous.max(recorded)
    }

    /// Pin the current version for a consistent read-only view.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn snapshot(self: &Arc<Self>) -> Result<Snapshot, StoreError> {
        self.ensure_open()?;
        let version = self.live_mut().versions.pin();
        tracing::trace!("Pinned snapshot at version {}", version);
        Ok(Snapshot::new(Arc::clone(self), version))
    }

    pub(crate) fn release_snapshot(&self, version: Version) {
        self.live_mut().versions.unpin(version);
        tracing::trace!("Released snapshot at version {}", version);
    }

    /// Resolve a page as a snapshot pinned at `version` sees it.
    pub fn read_at(&self, version: Version, page_id: PageId) -> Result<PageImage, StoreError> {
        self.ensure_open()?;
        let live = self.live();
        match live.versions.resolve(page_id, version)? {
            Resolved::Shadow(image) => Ok(image),
            Resolved::Live => self.latest_in(&live, page_id),
        }
    }

    /// Resolve the newest published image of a page.
    pub fn read_latest(&self, page_id: PageId) -> Result<PageImage, StoreError> {
        self.ensure_open()?;
        let live = self.live();
        self.latest_in(&live, page_id)
    }

    /// Run `f` as one write action and publish its changes atomically.
    ///
    /// When `f` fails nothing it staged becomes visible.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(&mut WriteAction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open()?;
        let mut writer = self.writer();
        self.reclaim(&mut writer)?;

        let superblock = self.live().superblock;
        let mut action = WriteAction::new(self, superblock);
        let value = f(&mut action)?;
        self.publish(&mut writer, action.into_changes())?;
        Ok(value)
    }

    /// Make the pending transaction durable.
    ///
    /// Returns the number of pages written, including those of an earlier
    /// commit whose page writes are finished here.
    ///
    /// # Post-conditions
    /// - On success every published change is in the synced page file
    /// - A failure before the log sync leaves the changes pending again
    /// - A failure after the log sync leaves the transaction committed; its
    ///   page writes are retried by the next commit or by recovery
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn commit(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let mut unfinished = self.commit_guard();
        let mut written = 0;
        if let Some(txn) = unfinished.take() {
            if let Err(e) = self.finish(&txn) {
                *unfinished = Some(txn);
                return Err(e);
            }
            tracing::debug!("Finished writing transaction {}", txn.txn_id);
            written += txn.pages.len();
        }

        let (txn_id, pages) = {
            let mut writer = self.writer();
            self.reclaim(&mut writer)?;

            let mut live = self.live_mut();
            if live.pending.is_empty() {
                return Ok(written);
            }
            let next = Transaction::new(writer.next_txn_id);
            writer.next_txn_id += 1;
            let frozen = std::mem::replace(&mut live.pending, next);
            let pages = Arc::new(frozen.pages);
            live.flushing = Some(Arc::clone(&pages));
            (frozen.id, pages)
        };

        if let Err(e) = self.write_log(txn_id, &pages) {
            self.restore_pending(txn_id, &pages);
            tracing::error!("Commit of transaction {} failed: {}", txn_id, e);
            return Err(e);
        }
        self.writer().deferred.settle(txn_id);

        let txn = Unfinished { txn_id, pages };
        if let Err(e) = self.finish(&txn) {
            tracing::error!(
                "Transaction {} is committed but its page writes failed: {}",
                txn_id,
                e
            );
            *unfinished = Some(txn);
            return Err(e);
        }
        tracing::debug!("Committed transaction {} ({} pages)", txn_id, txn.pages.len());
        Ok(written + txn.pages.len())
    }

    /// Discard the pending transaction.
    ///
    /// Returns the number of page images discarded. Open snapshots keep the
    /// view they were pinned at. A committed transaction whose page writes
    /// are unfinished is kept.
    pub fn rollback(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let _commit = self.commit_guard();
        let mut writer = self.writer();

        let mut live = self.live_mut();
        let committed = Superblock::from_page(&*self.committed_in(&live, 0)?)?;
        let txn_id = live.pending.id;
        let discarded = std::mem::take(&mut live.pending.pages);
        let count = discarded.len();
        if count > 0 {
            let version = live.versions.current() + 1;
            for (page_id, image) in discarded {
                if live.versions.needs_shadow(page_id) {
                    live.versions.retain_shadow(page_id, version, image);
                }
                live.versions.record_write(page_id, version);
            }
            live.versions.advance_to(version);
            live.superblock = committed;
        }
        drop(live);

        writer.deferred.rollback(txn_id);
        tracing::debug!("Rolled back transaction {} ({} pages)", txn_id, count);
        Ok(count)
    }

    /// Detach both devices. Returns `false` if the store was already closed.
    ///
    /// A committed transaction with unfinished page writes stays in the log
    /// and is redone by the next open.
    pub fn shutdown(&self) -> bool {
        let _commit = self.commit_guard();
        self.shutdown_locked()
    }

    fn shutdown_locked(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.file.detach();
        self.lock_log().detach();
        self.cache.clear();
        true
    }

    /// Current counters.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.ensure_open()?;
        let writer = self.writer();
        let live = self.live();
        Ok(StoreStats {
            version: live.versions.current(),
            open_snapshots: live.versions.open_snapshots(),
            shadow_pages: live.versions.shadow_count(),
            deferred_frees: writer.deferred.waiting(),
            pending_pages: live.pending.pages.len(),
            total_pages: live.superblock.total_page_count,
            free_pages: live.superblock.free_page_count,
            cache: self.cache.stats(),
        })
    }

    /// Install a finished action's changes as a new version.
    fn publish(
        &self,
        writer: &mut WriterState,
        changes: StagedChanges,
    ) -> Result<Version, StoreError> {
        let mut live = self.live_mut();
        if changes.is_empty() {
            return Ok(live.versions.current());
        }

        let StagedChanges {
            superblock,
            base_total,
            mut pages,
            freed,
        } = changes;
        if let Some(superblock) = superblock {
            pages.insert(0, superblock.to_page().into_image());
        }

        let version = live.versions.current() + 1;
        let mut retained = Vec::new();
        for &page_id in pages.keys() {
            if page_id < base_total && live.versions.needs_shadow(page_id) {
                retained.push((page_id, self.latest_in(&live, page_id)?));
            }
        }

        for (page_id, image) in retained {
            live.versions.retain_shadow(page_id, version, image);
        }
        for (page_id, image) in pages {
            live.versions.record_write(page_id, version);
            live.pending.pages.insert(page_id, image);
        }
        if let Some(superblock) = superblock {
            live.superblock = superblock;
        }
        live.versions.advance_to(version);

        let origin = live.pending.id;
        drop(live);
        for page_id in freed {
            writer.deferred.push(page_id, version, origin);
        }
        Ok(version)
    }

    /// Push deferred frees no snapshot can reach onto the free list.
    fn reclaim(&self, writer: &mut WriterState) -> Result<(), StoreError> {
        let (oldest, txn_id, superblock) = {
            let live = self.live();
            (live.versions.oldest_pin(), live.pending.id, live.superblock)
        };
        let batch = writer.deferred.take_reclaimable(oldest);
        if batch.is_empty() {
            return Ok(());
        }

        let mut action = WriteAction::new(self, superblock);
        let result = batch
            .page_ids()
            .try_for_each(|page_id| allocator::release(&mut action, page_id))
            .and_then(|()| self.publish(writer, action.into_changes()));

        match result {
            Ok(_) => {
                tracing::debug!("Reclaimed {} deferred pages", batch.len());
                writer.deferred.mark_reclaimed(txn_id, batch);
                Ok(())
            }
            Err(e) => {
                writer.deferred.restore(batch);
                Err(e)
            }
        }
    }

    /// Append and sync the log records of one frozen transaction.
    ///
    /// Once this returns `Ok` the transaction is committed. On failure the
    /// partial records are discarded; if even that fails the store shuts
    /// down so the next open settles the log.
    fn write_log(
        &self,
        txn_id: TxnId,
        pages: &BTreeMap<PageId, PageImage>,
    ) -> Result<(), StoreError> {
        let mut log = self.lock_log();
        // Leftovers of a commit whose truncation failed.
        if log.head() > 0 {
            log.truncate()?;
        }

        let result = self.append_transaction(&mut log, txn_id, pages);
        if result.is_err() && log.head() > 0 {
            if let Err(e) = log.truncate() {
                tracing::error!(
                    "Cannot discard the log of failed transaction {}: {}",
                    txn_id,
                    e
                );
                drop(log);
                self.shutdown_locked();
            }
        }
        result
    }

    fn append_transaction(
        &self,
        log: &mut TransactionLog,
        txn_id: TxnId,
        pages: &BTreeMap<PageId, PageImage>,
    ) -> Result<(), StoreError> {
        log.append(txn_id, LogRecordPayload::Begin)?;
        for (&page_id, image) in pages {
            let before = self.durable_before_image(page_id)?;
            log.append(
                txn_id,
                LogRecordPayload::PageImage {
                    page_id,
                    before: before.map(|image| image.as_bytes().to_vec()),
                    after: image.as_bytes().to_vec(),
                },
            )?;
        }
        let page_count = u32::try_from(pages.len())
            .map_err(|_| StoreError::InvalidConfiguration("transaction too large".to_string()))?;
        log.append(txn_id, LogRecordPayload::Commit { page_count })?;
        log.sync()?;
        Ok(())
    }

    /// Write a committed transaction's pages in place and retire its log.
    ///
    /// Safe to repeat: every write is a full after image.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn finish(&self, txn: &Unfinished) -> Result<(), StoreError> {
        for (&page_id, image) in &*txn.pages {
            self.file.write_page(page_id, image)?;
        }
        self.file.sync()?;

        {
            let mut live = self.live_mut();
            for (&page_id, image) in &*txn.pages {
                self.cache.insert(page_id, Arc::clone(image));
            }
            live.flushing = None;
        }

        if let Err(e) = self.lock_log().truncate() {
            // Retried before the next transaction is appended.
            tracing::warn!("Log truncation after commit {} failed: {}", txn.txn_id, e);
        }
        Ok(())
    }

    /// Put the pages of a transaction that never committed back under the
    /// pending one.
    fn restore_pending(&self, txn_id: TxnId, pages: &BTreeMap<PageId, PageImage>) {
        let mut writer = self.writer();
        let mut live = self.live_mut();
        let mut merged = pages.clone();
        merged.append(&mut live.pending.pages);
        live.pending.pages = merged;
        live.flushing = None;
        let pending_id = live.pending.id;
        writer.deferred.reassign(txn_id, pending_id);
    }

    /// Durable image of a page for undo logging, without populating the cache.
    fn durable_before_image(&self, page_id: PageId) -> Result<Option<PageImage>, StoreError> {
        if let Some(image) = self.cache.get(page_id) {
            return Ok(Some(image));
        }
        match self.file.read_image_if_present(page_id) {
            Ok(image) => Ok(image),
            Err(FileError::CorruptPage { page_id, source }) => {
                tracing::debug!("No usable before image for page {}: {}", page_id, source);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn latest_in(&self, live: &LiveState, page_id: PageId) -> Result<PageImage, StoreError> {
        if let Some(image) = live.pending.pages.get(&page_id) {
            return Ok(Arc::clone(image));
        }
        self.committed_in(live, page_id)
    }

    /// Newest committed image: a transaction still being written wins over
    /// the page file.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn committed_in(&self, live: &LiveState, page_id: PageId) -> Result<PageImage, StoreError> {
        if let Some(image) = live.flushing.as_ref().and_then(|pages| pages.get(&page_id)) {
            return Ok(Arc::clone(image));
        }
        self.read_durable(page_id)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn read_durable(&self, page_id: PageId) -> Result<PageImage, StoreError> {
        if let Some(image) = self.cache.get(page_id) {
            return Ok(image);
        }
        let image = self.file.read_page(page_id)?.into_image();
        self.cache.insert(page_id, Arc::clone(&image));
        Ok(image)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn live(&self) -> RwLockReadGuard<'_, LiveState> {
        self.live.read().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn live_mut(&self) -> RwLockWriteGuard<'_, LiveState> {
        self.live.write().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn commit_guard(&self) -> MutexGuard<'_, Option<Unfinished>> {
        self.commit_lock.lock().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_log(&self) -> MutexGuard<'_, TransactionLog> {
        self.log.lock().expect("lock poisoned")
    }
}

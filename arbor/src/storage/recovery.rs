//! Crash recovery for the page file.
//!
//! Recovery runs before anything reads the page file. It replays the
//! transaction log so the file holds exactly the committed transactions.
//!
//! # Recovery Process
//!
//! 1. Scan the log, dropping a torn final record
//! 2. Validate the record stream and group records by transaction
//! 3. In log order: redo each committed transaction from its after images,
//!    undo each incomplete one from its before images
//! 4. Sync the page file, then truncate the log
//!
//! A transaction's pages are only written to the page file after its commit
//! record is durable, so undo normally rewrites images the file already
//! holds. It is kept so a page file that got ahead of the log is still
//! brought back to a committed state.

use std::collections::HashMap;

use crate::storage::file::{FileError, PageFile};
use crate::storage::page::{Page, PageId};
use crate::storage::wal::{LogRecordPayload, LogScan, Lsn, TornTail, TransactionLog, TxnId, WalError};

/// Result of a recovery operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of log records scanned.
    pub records_scanned: usize,

    /// Number of committed transactions replayed.
    pub transactions_replayed: usize,

    /// Number of uncommitted transactions discarded.
    pub transactions_discarded: usize,

    /// Page images written from after images.
    pub pages_redone: usize,

    /// Page images written from before images.
    pub pages_undone: usize,

    /// Highest LSN seen during recovery.
    pub recovered_lsn: Lsn,

    /// Bytes dropped from the end of the log.
    pub torn_tail: Option<TornTail>,
}

impl RecoveryResult {
    /// Whether recovery found anything to do.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.records_scanned == 0 && self.torn_tail.is_none()
    }
}

struct LoggedImage {
    page_id: PageId,
    before: Option<Vec<u8>>,
    after: Vec<u8>,
}

/// Records of one transaction, in log order.
struct PendingTransaction {
    txn_id: TxnId,
    images: Vec<LoggedImage>,
    committed: bool,
}

/// Page size implied by the log, taken from the first logged page image.
#[must_use]
pub fn logged_page_size(scan: &LogScan) -> Option<usize> {
    scan.records.iter().find_map(|record| match &record.payload {
        LogRecordPayload::PageImage { after, .. } => Some(after.len()),
        _ => None,
    })
}

/// Perform crash recovery on the page file.
///
/// # Pre-conditions
/// - `scan` was read from `log` and nothing has been appended since
///
/// # Post-conditions
/// - Every committed transaction in the log is on disk and synced
/// - The log is empty
pub fn recover(
    file: &PageFile,
    log: &mut TransactionLog,
    scan: LogScan,
) -> Result<RecoveryResult, RecoveryError> {
    let mut result = RecoveryResult {
        records_scanned: scan.records.len(),
        torn_tail: scan.torn_tail,
        ..RecoveryResult::default()
    };

    if let Some(tail) = scan.torn_tail {
        tracing::warn!(
            "Dropping torn log tail: {} bytes at offset {}",
            tail.len,
            tail.offset
        );
    }

    let transactions = group_transactions(&scan, file.page_size(), &mut result.recovered_lsn)?;

    for txn in &transactions {
        if txn.committed {
            for image in &txn.images {
                file.write_page(image.page_id, &Page::from_bytes(image.after.clone()))?;
            }
            result.transactions_replayed += 1;
            result.pages_redone += txn.images.len();
        } else {
            for image in txn.images.iter().rev() {
                if let Some(before) = &image.before {
                    file.write_page(image.page_id, &Page::from_bytes(before.clone()))?;
                    result.pages_undone += 1;
                }
            }
            result.transactions_discarded += 1;
        }
        tracing::debug!(
            "Recovered txn {}: {} pages, committed={}",
            txn.txn_id,
            txn.images.len(),
            txn.committed
        );
    }

    if !transactions.is_empty() {
        file.sync()?;
    }
    if !result.is_clean() {
        log.truncate()?;
    }
    log.resume_after(result.recovered_lsn);

    Ok(result)
}

/// Validate the record stream and group it by transaction, in `Begin` order.
fn group_transactions(
    scan: &LogScan,
    page_size: usize,
    highest_lsn: &mut Lsn,
) -> Result<Vec<PendingTransaction>, RecoveryError> {
    let mut transactions: Vec<PendingTransaction> = Vec::new();
    let mut index: HashMap<TxnId, usize> = HashMap::new();
    let mut previous_lsn: Option<Lsn> = None;

    for record in &scan.records {
        if let Some(previous) = previous_lsn.filter(|&previous| record.lsn <= previous) {
            return Err(RecoveryError::NonIncreasingLsn {
                previous,
                lsn: record.lsn,
            });
        }
        previous_lsn = Some(record.lsn);
        *highest_lsn = (*highest_lsn).max(record.lsn);

        match &record.payload {
            LogRecordPayload::Begin => {
                if index.contains_key(&record.txn_id) {
                    return Err(RecoveryError::DuplicateBegin(record.txn_id));
                }
                index.insert(record.txn_id, transactions.len());
                transactions.push(PendingTransaction {
                    txn_id: record.txn_id,
                    images: Vec::new(),
                    committed: false,
                });
            }
            LogRecordPayload::PageImage {
                page_id,
                before,
                after,
            } => {
                let txn = open_transaction(&mut transactions, &index, record.txn_id, record.lsn)?;
                let sizes_ok = after.len() == page_size
                    && before.as_ref().is_none_or(|b| b.len() == page_size);
                if !sizes_ok {
                    return Err(RecoveryError::ImageSizeMismatch {
                        page_id: *page_id,
                        expected: page_size,
                    });
                }
                txn.images.push(LoggedImage {
                    page_id: *page_id,
                    before: before.clone(),
                    after: after.clone(),
                });
            }
            LogRecordPayload::Commit { page_count } => {
                let Some(&position) = index.get(&record.txn_id) else {
                    return Err(RecoveryError::OrphanCommit(record.txn_id));
                };
                let txn = &mut transactions[position];
                if txn.committed {
                    return Err(RecoveryError::DuplicateCommit(record.txn_id));
                }
                if *page_count as usize != txn.images.len() {
                    return Err(RecoveryError::PageCountMismatch {
                        txn_id: record.txn_id,
                        expected: *page_count,
                        actual: txn.images.len(),
                    });
                }
                txn.committed = true;
            }
        }
    }

    Ok(transactions)
}

fn open_transaction<'a>(
    transactions: &'a mut [PendingTransaction],
    index: &HashMap<TxnId, usize>,
    txn_id: TxnId,
    lsn: Lsn,
) -> Result<&'a mut PendingTransaction, RecoveryError> {
    let position = index
        .get(&txn_id)
        .copied()
        .ok_or(RecoveryError::MissingBegin { txn_id, lsn })?;
    let txn = &mut transactions[position];
    if txn.committed {
        return Err(RecoveryError::RecordAfterCommit { txn_id, lsn });
    }
    Ok(txn)
}

/// Errors that can occur during recovery.
#[derive(Debug)]
pub enum RecoveryError {
    /// Page file I/O error.
    File(FileError),
    /// Log error.
    Wal(WalError),
    /// Found commit without begin.
    OrphanCommit(TxnId),
    /// Found a second commit for one transaction.
    DuplicateCommit(TxnId),
    /// Found a second begin for one transaction.
    DuplicateBegin(TxnId),
    /// A page image with no preceding begin.
    MissingBegin { txn_id: TxnId, lsn: Lsn },
    /// A record for a transaction that had already committed.
    RecordAfterCommit { txn_id: TxnId, lsn: Lsn },
    /// The commit record disagrees with the images that precede it.
    PageCountMismatch {
        txn_id: TxnId,
        expected: u32,
        actual: usize,
    },
    /// LSNs must strictly increase through the log.
    NonIncreasingLsn { previous: Lsn, lsn: Lsn },
    /// A logged image does not match the file's page size.
    ImageSizeMismatch { page_id: PageId, expected: usize },
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(e) => write!(f, "recovery file error: {e}"),
            Self::Wal(e) => write!(f, "recovery WAL error: {e}"),
            Self::OrphanCommit(txn_id) => {
                write!(f, "recovery found commit without begin for txn {txn_id}")
            }
            Self::DuplicateCommit(txn_id) => {
                write!(f, "recovery found a second commit for txn {txn_id}")
            }
            Self::DuplicateBegin(txn_id) => {
                write!(f, "recovery found a second begin for txn {txn_id}")
            }
            Self::MissingBegin { txn_id, lsn } => {
                write!(f, "record {lsn} belongs to txn {txn_id}, which never began")
            }
            Self::RecordAfterCommit { txn_id, lsn } => {
                write!(f, "record {lsn} follows the commit of txn {txn_id}")
            }
            Self::PageCountMismatch {
                txn_id,
                expected,
                actual,
            } => write!(
                f,
                "txn {txn_id} commit declares {expected} pages but logged {actual}"
            ),
            Self::NonIncreasingLsn { previous, lsn } => {
                write!(f, "LSN {lsn} follows LSN {previous}")
            }
            Self::ImageSizeMismatch { page_id, expected } => write!(
                f,
                "logged image of page {page_id} is not {expected} bytes"
            ),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            Self::Wal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for RecoveryError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<WalError> for RecoveryError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

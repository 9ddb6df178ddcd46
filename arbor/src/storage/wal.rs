//! Write-ahead transaction log.
//!
//! The log lives in its own file next to the page file. A commit appends one
//! `Begin` record, one `PageImage` record per page in the transaction and a
//! `Commit` record, syncs the log, and only then lets the pages reach the
//! page file. Once the page file is synced the log is truncated, so on a
//! clean shutdown the log file is empty.
//!
//! # Log Record Format
//!
//! Each record has the following layout:
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, includes header+payload) |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | transaction_id (8 bytes)                         |
//! | 13-20    | lsn (8 bytes) - Log Sequence Number              |
//! | 21-N     | payload (variable, depends on type)              |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```
//!
//! `PageImage` payload: `page_id u64 | before_len u32 | before | after_len
//! u32 | after`. A `before_len` of 0 means the page did not exist on disk.
//! `Commit` payload: `page_count u32`.

// record_length fits in u32, page images are bounded by MAX_PAGE_SIZE
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::storage::io::{BlockDevice, StorageError};
use crate::storage::page::PageId;

/// Log record header size (before payload).
/// `record_length` (4) + `record_type` (1) + `txn_id` (8) + lsn (8) = 21 bytes
const RECORD_HEADER_SIZE: usize = 21;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// Smallest possible record.
const MIN_RECORD_SIZE: usize = RECORD_HEADER_SIZE + CHECKSUM_SIZE;

/// Log Sequence Number - monotonically increasing identifier for log records.
pub type Lsn = u64;

/// Transaction identifier.
pub type TxnId = u64;

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Transaction begin marker.
    Begin = 0x01,
    /// Before and after image of one page.
    PageImage = 0x02,
    /// Transaction commit marker.
    Commit = 0x03,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Begin),
            0x02 => Ok(Self::PageImage),
            0x03 => Ok(Self::Commit),
            _ => Err(value),
        }
    }
}

/// Payload for different log record types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordPayload {
    /// Begin transaction - no additional data.
    Begin,
    /// Full page images for redo and undo.
    PageImage {
        page_id: PageId,
        /// Durable image before the transaction, `None` for a page past the
        /// end of the file.
        before: Option<Vec<u8>>,
        after: Vec<u8>,
    },
    /// Commit transaction, carrying the number of page images it logged.
    Commit { page_count: u32 },
}

impl LogRecordPayload {
    /// Get the record type for this payload.
    #[must_use]
    pub const fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin => LogRecordType::Begin,
            Self::PageImage { .. } => LogRecordType::PageImage,
            Self::Commit { .. } => LogRecordType::Commit,
        }
    }

    /// Calculate the serialized size of this payload.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        match self {
            Self::Begin => 0,
            Self::PageImage { before, after, .. } => {
                8 + 4 + before.as_ref().map_or(0, Vec::len) + 4 + after.len()
            }
            Self::Commit { .. } => 4,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Begin => {}
            Self::PageImage {
                page_id,
                before,
                after,
            } => {
                buf.extend_from_slice(&page_id.to_le_bytes());
                let before = before.as_deref().unwrap_or_default();
                buf.extend_from_slice(&(before.len() as u32).to_le_bytes());
                buf.extend_from_slice(before);
                buf.extend_from_slice(&(after.len() as u32).to_le_bytes());
                buf.extend_from_slice(after);
            }
            Self::Commit { page_count } => buf.extend_from_slice(&page_count.to_le_bytes()),
        }
    }

    /// Deserialize a payload from bytes.
    pub fn from_bytes(record_type: LogRecordType, bytes: &[u8]) -> Result<Self, WalError> {
        let mut reader = PayloadReader { bytes, pos: 0 };
        let payload = match record_type {
            LogRecordType::Begin => Self::Begin,
            LogRecordType::PageImage => {
                let page_id = reader.u64()?;
                let before_len = reader.u32()? as usize;
                let before = (before_len > 0)
                    .then(|| reader.take(before_len).map(<[u8]>::to_vec))
                    .transpose()?;
                let after_len = reader.u32()? as usize;
                let after = reader.take(after_len)?.to_vec();
                Self::PageImage {
                    page_id,
                    before,
                    after,
                }
            }
            LogRecordType::Commit => Self::Commit {
                page_count: reader.u32()?,
            },
        };
        if reader.pos != bytes.len() {
            return Err(WalError::CorruptRecord("trailing payload bytes"));
        }
        Ok(payload)
    }
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], WalError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(WalError::CorruptRecord("payload shorter than its fields"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, WalError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, WalError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// A complete log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Transaction ID that wrote this record.
    pub txn_id: TxnId,
    /// Log Sequence Number.
    pub lsn: Lsn,
    /// The record payload.
    pub payload: LogRecordPayload,
}

impl LogRecord {
    /// Create a new log record.
    #[must_use]
    pub const fn new(txn_id: TxnId, lsn: Lsn, payload: LogRecordPayload) -> Self {
        Self {
            txn_id,
            lsn,
            payload,
        }
    }

    /// Calculate the total serialized size of this record.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.serialized_size() + CHECKSUM_SIZE
    }

    /// Serialize this record to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_len = self.serialized_size();
        let mut bytes = Vec::with_capacity(total_len);

        bytes.extend_from_slice(&(total_len as u32).to_le_bytes());
        bytes.push(self.payload.record_type() as u8);
        bytes.extend_from_slice(&self.txn_id.to_le_bytes());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        self.payload.write_to(&mut bytes);

        // CRC32 checksum - computed over everything before it
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        bytes
    }

    /// Deserialize a record from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalError> {
        if bytes.len() < MIN_RECORD_SIZE {
            return Err(WalError::Truncated {
                needed: MIN_RECORD_SIZE,
                available: bytes.len(),
            });
        }

        let record_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if record_len < MIN_RECORD_SIZE {
            return Err(WalError::CorruptRecord("record length below minimum"));
        }
        if record_len > bytes.len() {
            return Err(WalError::Truncated {
                needed: record_len,
                available: bytes.len(),
            });
        }

        let stored_checksum = u32::from_le_bytes([
            bytes[record_len - 4],
            bytes[record_len - 3],
            bytes[record_len - 2],
            bytes[record_len - 1],
        ]);
        let computed_checksum = crc32fast::hash(&bytes[..record_len - CHECKSUM_SIZE]);
        if stored_checksum != computed_checksum {
            return Err(WalError::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        let record_type = LogRecordType::try_from(bytes[4]).map_err(WalError::InvalidRecordType)?;

        let mut txn_id = [0u8; 8];
        txn_id.copy_from_slice(&bytes[5..13]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&bytes[13..21]);

        let payload_bytes = &bytes[RECORD_HEADER_SIZE..record_len - CHECKSUM_SIZE];
        let payload = LogRecordPayload::from_bytes(record_type, payload_bytes)?;

        Ok((
            Self {
                txn_id: u64::from_le_bytes(txn_id),
                lsn: u64::from_le_bytes(lsn),
                payload,
            },
            record_len,
        ))
    }
}

/// Why the scan stopped before the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TornTail {
    /// Offset of the discarded bytes.
    pub offset: u64,
    /// Number of bytes discarded.
    pub len: u64,
}

/// Result of reading the whole log.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Intact records in log order.
    pub records: Vec<LogRecord>,
    /// Set when the final record was incomplete or failed its checksum.
    pub torn_tail: Option<TornTail>,
}

/// Append-only transaction log over a block device.
pub struct TransactionLog {
    device: Option<Arc<dyn BlockDevice>>,
    /// Next write position.
    head: u64,
    /// Next LSN to assign.
    next_lsn: Lsn,
}

impl TransactionLog {
    /// Attach to a log device, appending after whatever it already holds.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self, WalError> {
        let head = device.len()?;
        Ok(Self {
            device: Some(device),
            head,
            next_lsn: 1,
        })
    }

    /// Get the current head position.
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Get the next LSN that will be assigned.
    #[must_use]
    pub const fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Continue numbering after records found by recovery.
    pub fn resume_after(&mut self, last_lsn: Lsn) {
        self.next_lsn = self.next_lsn.max(last_lsn + 1);
    }

    /// Append a log record.
    ///
    /// Returns the LSN assigned to this record. The record is not durable
    /// until `sync` returns.
    pub fn append(&mut self, txn_id: TxnId, payload: LogRecordPayload) -> Result<Lsn, WalError> {
        let lsn = self.next_lsn;
        let bytes = LogRecord::new(txn_id, lsn, payload).to_bytes();

        self.device()?.write_at(self.head, &bytes)?;

        self.head += bytes.len() as u64;
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Sync the log to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        self.device()?.sync()?;
        Ok(())
    }

    /// Read every intact record from the start of the log.
    ///
    /// An incomplete final record, or a final record whose checksum fails,
    /// is a torn tail: it is reported and skipped. The same failure in the
    /// middle of the log is an error.
    pub fn scan(&self) -> Result<LogScan, WalError> {
        let device = self.device()?;
        let len = device.len()?;
        let mut bytes = vec![0u8; len as usize];
        device.read_at(0, &mut bytes)?;

        let mut scan = LogScan::default();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let rest = &bytes[offset..];
            match LogRecord::from_bytes(rest) {
                Ok((record, consumed)) => {
                    scan.records.push(record);
                    offset += consumed;
                }
                Err(WalError::Truncated { .. }) => {
                    scan.torn_tail = Some(torn(offset, rest.len()));
                    break;
                }
                Err(WalError::ChecksumMismatch { .. })
                    if declared_len(rest) == Some(rest.len()) =>
                {
                    scan.torn_tail = Some(torn(offset, rest.len()));
                    break;
                }
                Err(WalError::CorruptRecord(_)) if rest.iter().all(|&b| b == 0) => {
                    scan.torn_tail = Some(torn(offset, rest.len()));
                    break;
                }
                Err(e) => {
                    return Err(WalError::AtOffset {
                        offset: offset as u64,
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(scan)
    }

    /// Discard every record.
    ///
    /// # Post-conditions
    /// - The log device is empty and synced
    pub fn truncate(&mut self) -> Result<(), WalError> {
        let device = self.device()?;
        device.set_len(0)?;
        device.sync()?;
        self.head = 0;
        Ok(())
    }

    /// Release the device. Every later call fails with `Detached`.
    pub fn detach(&mut self) {
        self.device = None;
    }

    fn device(&self) -> Result<&Arc<dyn BlockDevice>, WalError> {
        self.device
            .as_ref()
            .ok_or(WalError::Storage(StorageError::Detached))
    }
}

fn declared_len(bytes: &[u8]) -> Option<usize> {
    let prefix = bytes.get(0..4)?;
    Some(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize)
}

const fn torn(offset: usize, len: usize) -> TornTail {
    TornTail {
        offset: offset as u64,
        len: len as u64,
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug)]
pub enum WalError {
    /// Device error.
    Storage(StorageError),
    /// Fewer bytes than the record needs.
    Truncated { needed: usize, available: usize },
    /// Corrupt log record.
    CorruptRecord(&'static str),
    /// Invalid record type byte.
    InvalidRecordType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A record in the middle of the log failed validation.
    AtOffset { offset: u64, source: Box<WalError> },
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "WAL storage error: {e}"),
            Self::Truncated { needed, available } => {
                write!(f, "WAL record truncated: needed {needed} bytes, found {available}")
            }
            Self::CorruptRecord(reason) => write!(f, "corrupt WAL record: {reason}"),
            Self::InvalidRecordType(t) => write!(f, "invalid WAL record type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "WAL checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
            Self::AtOffset { offset, source } => {
                write!(f, "WAL record at offset {offset}: {source}")
            }
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::AtOffset { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<StorageError> for WalError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

//! Page file I/O operations.
//!
//! `PageFile` maps page ids to byte offsets on a `BlockDevice` and verifies
//! page checksums on every read. It knows nothing about transactions: the
//! store decides which images are written and when the file is synced.
//!
//! The device sits behind a detachable slot so that closing a record manager
//! releases the file while cursors or snapshots may still hold the store.

// Page sizes are bounded by MAX_PAGE_SIZE and fit in u32.
#![allow(clippy::cast_possible_truncation)]

use std::sync::{Arc, RwLock};

use crate::storage::io::{BlockDevice, StorageError};
use crate::storage::page::{Page, PageError, PageId, PageImage};
use crate::storage::superblock::{PREFIX_LEN, Superblock, SuperblockError};

/// A page-granular view of a block device.
pub struct PageFile {
    device: RwLock<Option<Arc<dyn BlockDevice>>>,
    page_size: usize,
}

impl PageFile {
    /// Wrap a device whose page size is already known.
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>, page_size: usize) -> Self {
        Self {
            device: RwLock::new(Some(device)),
            page_size,
        }
    }

    /// Read the page size recorded in an existing file's superblock.
    ///
    /// Returns `Ok(None)` for an empty device.
    pub fn probe_page_size(device: &dyn BlockDevice) -> Result<Option<usize>, FileError> {
        if device.is_empty()? {
            return Ok(None);
        }
        let mut prefix = [0u8; PREFIX_LEN];
        device.read_at(0, &mut prefix)?;
        let superblock = Superblock::from_prefix(&prefix)?;
        Ok(Some(superblock.page_size()))
    }

    /// Initialize an empty device with a fresh superblock.
    ///
    /// # Post-conditions
    /// - Page 0 holds a sealed superblock
    /// - The device has been synced
    pub fn format(&self) -> Result<Superblock, FileError> {
        let superblock = Superblock::new(self.page_size as u32);
        self.write_page(0, &superblock.to_page())?;
        self.sync()?;
        Ok(superblock)
    }

    /// Read and validate the superblock from page 0.
    pub fn read_superblock(&self) -> Result<Superblock, FileError> {
        let page = self.read_page(0)?;
        Ok(Superblock::from_page(&page)?)
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages physically present in the file.
    pub fn page_count(&self) -> Result<u64, FileError> {
        Ok(self.device()?.len()? / self.page_size as u64)
    }

    /// Read a page and verify its checksum.
    pub fn read_page(&self, page_id: PageId) -> Result<Page, FileError> {
        let device = self.device()?;
        let mut page = Page::new(self.page_size);
        device.read_at(self.offset(page_id), page.as_bytes_mut())?;
        page.verify_checksum()
            .map_err(|source| FileError::CorruptPage { page_id, source })?;
        Ok(page)
    }

    /// Read a page as a shareable image, or `None` when the page lies past
    /// the physical end of the file.
    pub fn read_image_if_present(&self, page_id: PageId) -> Result<Option<PageImage>, FileError> {
        if page_id >= self.page_count()? {
            return Ok(None);
        }
        Ok(Some(self.read_page(page_id)?.into_image()))
    }

    /// Write a page image at its slot, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), FileError> {
        if page.size() != self.page_size {
            return Err(FileError::PageSizeMismatch {
                page_id,
                expected: self.page_size,
                actual: page.size(),
            });
        }
        self.device()?.write_at(self.offset(page_id), page.as_bytes())?;
        Ok(())
    }

    /// Drop pages past `page_count` from the end of the file.
    pub fn truncate_pages(&self, page_count: u64) -> Result<(), FileError> {
        let device = self.device()?;
        let len = page_count * self.page_size as u64;
        if device.len()? > len {
            device.set_len(len)?;
        }
        Ok(())
    }

    /// Sync all pending writes to the device.
    pub fn sync(&self) -> Result<(), FileError> {
        self.device()?.sync()?;
        Ok(())
    }

    /// Release the device. Every later call fails with `Detached`.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn detach(&self) {
        self.device.write().expect("lock poisoned").take();
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn device(&self) -> Result<Arc<dyn BlockDevice>, FileError> {
        self.device
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(Arc::clone)
            .ok_or(FileError::Storage(StorageError::Detached))
    }

    const fn offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// Device error.
    Storage(StorageError),
    /// Superblock error.
    Superblock(SuperblockError),
    /// A page failed checksum or header validation.
    CorruptPage { page_id: PageId, source: PageError },
    /// A page image of the wrong size was handed to `write_page`.
    PageSizeMismatch {
        page_id: PageId,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::CorruptPage { page_id, source } => {
                write!(f, "page {page_id} is corrupt: {source}")
            }
            Self::PageSizeMismatch {
                page_id,
                expected,
                actual,
            } => write!(
                f,
                "page {page_id} has {actual} bytes, file uses {expected}-byte pages"
            ),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::CorruptPage { source, .. } => Some(source),
            Self::PageSizeMismatch { .. } => None,
        }
    }
}

impl From<StorageError> for FileError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<SuperblockError> for FileError {
    fn from(e: SuperblockError) -> Self {
        Self::Superblock(e)
    }
}

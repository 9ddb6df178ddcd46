//! Page types and constants for the storage engine.
//!
//! Pages are the unit of I/O, staging and snapshot shadowing. The page size
//! is fixed when a store is created and recorded in the superblock.

use std::sync::Arc;

/// Smallest supported page size in bytes.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size in bytes.
pub const MAX_PAGE_SIZE: usize = 65_536;

/// Page size used when the caller does not pick one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// Sentinel used in page links. Page 0 is always the superblock, so it can
/// never be the target of a link.
pub const NO_PAGE: PageId = 0;

/// An immutable, shareable page image.
///
/// Staged pages, cached pages and snapshot shadows all hand out the same
/// allocation; cloning an image is a reference count bump.
pub type PageImage = Arc<Page>;

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Superblock (page 0 only)
    Superblock = 0x01,
    /// Free-list trunk page
    FreeList = 0x02,
    /// B-tree internal node
    BTreeInternal = 0x03,
    /// B-tree leaf node
    BTreeLeaf = 0x04,
    /// Overflow page for large values
    Overflow = 0x05,
    /// Per-table header (root, entry count, fan-out)
    TableHeader = 0x06,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Superblock),
            0x02 => Ok(Self::FreeList),
            0x03 => Ok(Self::BTreeInternal),
            0x04 => Ok(Self::BTreeLeaf),
            0x05 => Ok(Self::Overflow),
            0x06 => Ok(Self::TableHeader),
            _ => Err(value),
        }
    }
}

/// Common page header present at the start of every page.
///
/// Layout:
/// - `page_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 6-7 reserved
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let page_type = PageType::try_from(bytes[0]).map_err(PageError::InvalidPageType)?;
        let flags = bytes[1];
        let checksum = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        Ok(Self {
            page_type,
            flags,
            checksum,
        })
    }
}

/// Check that a page size is usable: a power of two within the supported range.
#[must_use]
pub const fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && page_size >= MIN_PAGE_SIZE && page_size <= MAX_PAGE_SIZE
}

/// A raw page buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page of the given size.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Create a zeroed page whose header carries the given type.
    #[must_use]
    pub fn with_type(page_size: usize, page_type: PageType) -> Self {
        let mut page = Self::new(page_size);
        page.write_u8(0, page_type as u8);
        page
    }

    /// Create a page from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes.into_boxed_slice(),
        }
    }

    /// Size of this page in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Decode the page type from the header byte.
    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageType::try_from(self.data[0]).map_err(PageError::InvalidPageType)
    }

    /// Fail unless the page carries the expected type.
    pub fn expect_type(&self, expected: PageType) -> Result<(), PageError> {
        let actual = self.page_type()?;
        if actual == expected {
            Ok(())
        } else {
            Err(PageError::UnexpectedType { expected, actual })
        }
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    /// Assumes checksum is stored at bytes 2-5 of the header.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[0..2]); // page_type + flags
        hasher.update(&[0u8; 4]); // zero out checksum field
        hasher.update(&self.data[6..]); // rest of page
        hasher.finalize()
    }

    /// Stamp the checksum into the header. Called once a page image is final.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(2, checksum);
    }

    /// Verify the stored checksum against the page contents.
    pub fn verify_checksum(&self) -> Result<(), PageError> {
        let expected = self.read_u32(2);
        let actual = self.compute_checksum();
        if expected == actual {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch { expected, actual })
        }
    }

    /// Freeze the page into a shareable image.
    #[must_use]
    pub fn into_image(self) -> PageImage {
        Arc::new(self)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("first_16_bytes", &&self.data[..16.min(self.data.len())])
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// The page holds a different kind of data than the caller expected.
    UnexpectedType { expected: PageType, actual: PageType },
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::UnexpectedType { expected, actual } => {
                write!(f, "expected {expected:?} page, found {actual:?}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}

//! Superblock structure and serialization.
//!
//! The superblock occupies page 0 and records the page size, the page
//! allocation state and the location of the table catalog. It carries the
//! standard page header so its checksum is verified like any other page.

// Page sizes are bounded by MAX_PAGE_SIZE and fit in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{NO_PAGE, Page, PageHeader, PageId, PageType, is_valid_page_size};

/// Magic number identifying an arbor page file: "ARBORPGS"
pub const MAGIC: [u8; 8] = *b"ARBORPGS";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes at the start of the file that are enough to decode the superblock
/// fields needed before the page size is known.
pub const PREFIX_LEN: usize = offsets::END;

/// Superblock field offsets.
mod offsets {
    use super::PageHeader;

    pub const MAGIC: usize = PageHeader::SIZE;
    pub const FORMAT_VERSION: usize = 16;
    pub const PAGE_SIZE: usize = 20;
    pub const TOTAL_PAGE_COUNT: usize = 24;
    pub const FREE_LIST_HEAD: usize = 32;
    pub const FREE_PAGE_COUNT: usize = 40;
    pub const CATALOG_HEADER: usize = 48;
    pub const NEXT_TABLE_ID: usize = 56;
    pub const END: usize = 64;
}

/// File-level metadata stored in page 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes, fixed at creation.
    pub page_size: u32,
    /// Number of pages the file logically holds, superblock included.
    pub total_page_count: u64,
    /// First free-list trunk page, or `NO_PAGE`.
    pub free_list_head: PageId,
    /// Pages on the free list, trunk pages included.
    pub free_page_count: u64,
    /// Header page of the table catalog, or `NO_PAGE` before the first table.
    pub catalog_header: PageId,
    /// Id the next created table receives. Ids are never reused.
    pub next_table_id: u64,
}

impl Superblock {
    /// Create a superblock for a fresh file.
    #[must_use]
    pub const fn new(page_size: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size,
            total_page_count: 1,
            free_list_head: NO_PAGE,
            free_page_count: 0,
            catalog_header: NO_PAGE,
            next_table_id: 1,
        }
    }

    /// Page size as `usize`.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size as usize
    }

    /// Serialize the superblock into a sealed page.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::with_type(self.page_size(), PageType::Superblock);

        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::TOTAL_PAGE_COUNT, self.total_page_count);
        page.write_u64(offsets::FREE_LIST_HEAD, self.free_list_head);
        page.write_u64(offsets::FREE_PAGE_COUNT, self.free_page_count);
        page.write_u64(offsets::CATALOG_HEADER, self.catalog_header);
        page.write_u64(offsets::NEXT_TABLE_ID, self.next_table_id);
        page.seal();

        page
    }

    /// Decode the superblock fields from the first bytes of the file.
    ///
    /// Only the fields are validated here; the page checksum is checked once
    /// the full page has been read with the decoded page size.
    pub fn from_prefix(bytes: &[u8]) -> Result<Self, SuperblockError> {
        if bytes.len() < PREFIX_LEN {
            return Err(SuperblockError::Truncated(bytes.len()));
        }
        let read_u32 = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let read_u64 = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[offsets::MAGIC..offsets::MAGIC + 8]);
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let format_version = read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = read_u32(offsets::PAGE_SIZE);
        if !is_valid_page_size(page_size as usize) {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        Ok(Self {
            format_version,
            page_size,
            total_page_count: read_u64(offsets::TOTAL_PAGE_COUNT),
            free_list_head: read_u64(offsets::FREE_LIST_HEAD),
            free_page_count: read_u64(offsets::FREE_PAGE_COUNT),
            catalog_header: read_u64(offsets::CATALOG_HEADER),
            next_table_id: read_u64(offsets::NEXT_TABLE_ID),
        })
    }

    /// Deserialize a superblock from a full page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        let superblock = Self::from_prefix(page.read_bytes(0, PREFIX_LEN))?;
        if superblock.page_size() != page.size() {
            return Err(SuperblockError::InvalidPageSize(superblock.page_size));
        }
        Ok(superblock)
    }
}

/// Errors that can occur when reading a superblock.
#[derive(Debug)]
pub enum SuperblockError {
    /// Fewer bytes than the superblock fields occupy.
    Truncated(usize),
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "superblock truncated to {len} bytes"),
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
        }
    }
}

impl std::error::Error for SuperblockError {}

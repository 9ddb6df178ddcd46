//! Overflow page chains for values too large to sit inline in a leaf.
//!
//! # Overflow Page Format
//!
//! ```text
//! +----------------+----------------+----------------+------------------+
//! | Page Header    | Next Page ID   | Data Length    | Data...          |
//! | (8 bytes)      | (8 bytes)      | (4 bytes)      | (variable)       |
//! +----------------+----------------+----------------+------------------+
//! ```
//!
//! # Overflow Reference Format
//!
//! The leaf entry stores an overflow reference in place of the value:
//!
//! ```text
//! +----------------+----------------+
//! | First Page ID  | Total Length   |
//! | (8 bytes)      | (4 bytes)      |
//! +----------------+----------------+
//! ```

// Chunk lengths are bounded by the page size and fit in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::allocator;
use crate::storage::error::StoreError;
use crate::storage::page::{NO_PAGE, Page, PageHeader, PageId, PageType};
use crate::storage::transaction::{PageSource, PageSpace};

const NEXT_OFFSET: usize = PageHeader::SIZE;
const LENGTH_OFFSET: usize = NEXT_OFFSET + 8;
const DATA_OFFSET: usize = LENGTH_OFFSET + 4;

/// Size of an overflow reference stored in leaf nodes.
pub const OVERFLOW_REF_SIZE: usize = 12;

/// Maximum data per overflow page.
#[must_use]
pub const fn data_per_page(page_size: usize) -> usize {
    page_size - DATA_OFFSET
}

/// An overflow reference stored in a B-tree leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowRef {
    /// First page of the overflow chain.
    pub first_page: PageId,
    /// Total length of the value.
    pub total_length: u32,
}

impl OverflowRef {
    /// Create a new overflow reference.
    #[must_use]
    pub const fn new(first_page: PageId, total_length: u32) -> Self {
        Self {
            first_page,
            total_length,
        }
    }

    /// Serialize the overflow reference to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; OVERFLOW_REF_SIZE] {
        let mut buf = [0u8; OVERFLOW_REF_SIZE];
        buf[0..8].copy_from_slice(&self.first_page.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_length.to_le_bytes());
        buf
    }

    /// Deserialize an overflow reference from bytes.
    ///
    /// Returns `None` if the slice has the wrong length.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OVERFLOW_REF_SIZE {
            return None;
        }
        let mut page = [0u8; 8];
        page.copy_from_slice(&bytes[0..8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[8..12]);
        Some(Self {
            first_page: u64::from_le_bytes(page),
            total_length: u32::from_le_bytes(length),
        })
    }
}

/// Write a large value to a freshly allocated chain of overflow pages.
pub fn write_value(space: &mut impl PageSpace, value: &[u8]) -> Result<OverflowRef, StoreError> {
    let total_length = u32::try_from(value.len()).map_err(|_| {
        StoreError::InvalidConfiguration(format!(
            "value of {} bytes exceeds the 4 GiB limit",
            value.len()
        ))
    })?;

    let page_size = space.page_size();
    let chunks: Vec<&[u8]> = value.chunks(data_per_page(page_size)).collect();
    let mut ids = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        ids.push(allocator::allocate(space)?);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = Page::with_type(page_size, PageType::Overflow);
        page.write_u64(NEXT_OFFSET, ids.get(i + 1).copied().unwrap_or(NO_PAGE));
        page.write_u32(LENGTH_OFFSET, chunk.len() as u32);
        page.write_bytes(DATA_OFFSET, chunk);
        space.stage(ids[i], page);
    }

    Ok(OverflowRef::new(
        ids.first().copied().unwrap_or(NO_PAGE),
        total_length,
    ))
}

/// Read a large value by following its overflow chain.
pub fn read_value(
    source: &mut impl PageSource,
    overflow_ref: &OverflowRef,
) -> Result<Vec<u8>, StoreError> {
    let expected = overflow_ref.total_length as usize;
    let mut result = Vec::with_capacity(expected);
    let mut current = overflow_ref.first_page;

    while current != NO_PAGE {
        let page = source.page(current)?;
        page.expect_type(PageType::Overflow)?;

        let length = page.read_u32(LENGTH_OFFSET) as usize;
        if length > data_per_page(page.size()) || result.len() + length > expected {
            return Err(overflow_corrupt(current, "chunk length out of range"));
        }
        result.extend_from_slice(page.read_bytes(DATA_OFFSET, length));
        current = page.read_u64(NEXT_OFFSET);
    }

    if result.len() != expected {
        return Err(StoreError::Corruption(format!(
            "overflow length mismatch: expected {expected}, got {}",
            result.len()
        )));
    }
    Ok(result)
}

/// Free every page of an overflow chain.
///
/// Returns the number of pages handed to deferred reclamation.
pub fn free_value(
    space: &mut impl PageSpace,
    overflow_ref: &OverflowRef,
) -> Result<u64, StoreError> {
    let mut current = overflow_ref.first_page;
    let mut freed = 0u64;

    while current != NO_PAGE {
        let page = space.page(current)?;
        page.expect_type(PageType::Overflow)?;
        let next = page.read_u64(NEXT_OFFSET);
        space.free(current);
        freed += 1;
        current = next;
    }

    Ok(freed)
}

fn overflow_corrupt(page_id: PageId, reason: &str) -> StoreError {
    StoreError::Corruption(format!("overflow page {page_id}: {reason}"))
}

//! Page allocator backed by an on-disk free list.
//!
//! Free pages are tracked in a chain of trunk pages rooted at
//! `Superblock::free_list_head`. Each trunk lists the ids of free pages; a
//! trunk whose list is empty is itself handed out by the next allocation.
//!
//! Trunk layout (after the 8-byte page header):
//! - `next`: u64, the following trunk or `NO_PAGE`
//! - `count`: u32, number of ids stored in this trunk
//! - `ids`: `count` × u64
//!
//! The allocator works against a `PageSpace`, so all of its reads and
//! writes go through the same staged write action as the B-tree change that
//! triggered them.

// Trunk capacity is bounded by the page size and fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::error::StoreError;
use crate::storage::page::{NO_PAGE, Page, PageHeader, PageId, PageType};
use crate::storage::transaction::PageSpace;

const NEXT_OFFSET: usize = PageHeader::SIZE;
const COUNT_OFFSET: usize = NEXT_OFFSET + 8;
const IDS_OFFSET: usize = COUNT_OFFSET + 4;

/// Number of page ids a single trunk page can hold.
#[must_use]
pub const fn trunk_capacity(page_size: usize) -> usize {
    (page_size - IDS_OFFSET) / 8
}

/// Hand out a page id, reusing a free page when one exists.
///
/// The returned page's contents are unspecified; the caller stages a fresh
/// image for it.
///
/// # Post-conditions
/// - The id is not on the free list
/// - `free_page_count` dropped by one, or `total_page_count` grew by one
pub fn allocate(space: &mut impl PageSpace) -> Result<PageId, StoreError> {
    let head = space.superblock().free_list_head;
    if head == NO_PAGE {
        let superblock = space.superblock_mut();
        let page_id = superblock.total_page_count;
        superblock.total_page_count += 1;
        return Ok(page_id);
    }

    let trunk = space.page(head)?;
    trunk.expect_type(PageType::FreeList)?;
    let count = trunk.read_u32(COUNT_OFFSET) as usize;

    let page_id = if count == 0 {
        space.superblock_mut().free_list_head = trunk.read_u64(NEXT_OFFSET);
        head
    } else {
        let page_id = trunk.read_u64(IDS_OFFSET + (count - 1) * 8);
        let mut updated = Page::clone(&trunk);
        updated.write_u32(COUNT_OFFSET, (count - 1) as u32);
        updated.write_u64(IDS_OFFSET + (count - 1) * 8, 0);
        space.stage(head, updated);
        page_id
    };

    let superblock = space.superblock_mut();
    superblock.free_page_count = superblock.free_page_count.saturating_sub(1);
    Ok(page_id)
}

/// Return a page to the free list.
///
/// # Pre-conditions
/// - No live structure and no open snapshot reaches `page_id`
pub fn release(space: &mut impl PageSpace, page_id: PageId) -> Result<(), StoreError> {
    let head = space.superblock().free_list_head;
    let capacity = trunk_capacity(space.page_size());

    if head != NO_PAGE {
        let trunk = space.page(head)?;
        trunk.expect_type(PageType::FreeList)?;
        let count = trunk.read_u32(COUNT_OFFSET) as usize;
        if count < capacity {
            let mut updated = Page::clone(&trunk);
            updated.write_u64(IDS_OFFSET + count * 8, page_id);
            updated.write_u32(COUNT_OFFSET, (count + 1) as u32);
            space.stage(head, updated);
            space.superblock_mut().free_page_count += 1;
            return Ok(());
        }
    }

    // The head trunk is full (or missing): the freed page becomes the new head.
    let mut trunk = Page::with_type(space.page_size(), PageType::FreeList);
    trunk.write_u64(NEXT_OFFSET, head);
    trunk.write_u32(COUNT_OFFSET, 0);
    space.stage(page_id, trunk);

    let superblock = space.superblock_mut();
    superblock.free_list_head = page_id;
    superblock.free_page_count += 1;
    Ok(())
}

/// Collect every page id on the free list, trunk pages included.
pub fn free_pages(space: &mut impl PageSpace) -> Result<Vec<PageId>, StoreError> {
    let mut pages = Vec::new();
    let mut trunk_id = space.superblock().free_list_head;
    while trunk_id != NO_PAGE {
        let trunk = space.page(trunk_id)?;
        trunk.expect_type(PageType::FreeList)?;
        pages.push(trunk_id);
        let count = trunk.read_u32(COUNT_OFFSET) as usize;
        pages.extend((0..count).map(|i| trunk.read_u64(IDS_OFFSET + i * 8)));
        trunk_id = trunk.read_u64(NEXT_OFFSET);
        if pages.len() as u64 > space.superblock().total_page_count {
            return Err(StoreError::Corruption(
                "free list is longer than the file".to_string(),
            ));
        }
    }
    Ok(pages)
}

//! Page-level B-tree algorithms.
//!
//! A tree is identified by its table header page, which records the root,
//! the entry count, the fan-out bound, the height and a table id that is
//! never reused, so a recycled header page is told apart from the old one. Every function works
//! against a `PageSource` (reads) or `PageSpace` (writes) so the same code
//! serves snapshot readers and write actions.
//!
//! # Table Header Format
//!
//! ```text
//! +-------------+---------+-------------+-------------+----------+
//! | Page Header | Root    | Entry Count | Max Entries | Height   |
//! | (8 bytes)   | (8)     | (8)         | (4)         | (4)      |
//! +-------------+---------+-------------+-------------+----------+
//! | Table Id    | Name Len | Descriptor Len | Name | Descriptor   |
//! | (8)         | (2)      | (2)            |      |              |
//! +-------------+----------+----------------+------+--------------+
//! ```

// Name and descriptor lengths are bounded by the page size.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::allocator;
use crate::storage::btree::node::{
    self, InternalNode, LeafEntry, LeafNode, LeafValue, NodeError, NodeLimits,
};
use crate::storage::error::StoreError;
use crate::storage::overflow;
use crate::storage::page::{NO_PAGE, Page, PageHeader, PageId, PageType};
use crate::storage::serializer::KeyOrder;
use crate::storage::transaction::{PageSource, PageSpace};

/// Smallest accepted fan-out bound.
pub const MIN_FANOUT: usize = 2;

/// Largest accepted fan-out bound.
pub const MAX_FANOUT: usize = 1024;

const ROOT_OFFSET: usize = PageHeader::SIZE;
const ENTRY_COUNT_OFFSET: usize = ROOT_OFFSET + 8;
const MAX_ENTRIES_OFFSET: usize = ENTRY_COUNT_OFFSET + 8;
const HEIGHT_OFFSET: usize = MAX_ENTRIES_OFFSET + 4;
const TABLE_ID_OFFSET: usize = HEIGHT_OFFSET + 4;
const NAME_LEN_OFFSET: usize = TABLE_ID_OFFSET + 8;
const DESCRIPTOR_LEN_OFFSET: usize = NAME_LEN_OFFSET + 2;
const STRINGS_OFFSET: usize = DESCRIPTOR_LEN_OFFSET + 2;

/// Persistent description of one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    pub root: PageId,
    pub entry_count: u64,
    pub max_entries: u32,
    pub height: u32,
    pub table_id: u64,
    pub name: String,
    pub descriptor: String,
}

impl TableHeader {
    fn encoded_len(&self) -> usize {
        STRINGS_OFFSET + self.name.len() + self.descriptor.len()
    }

    /// Encode into a fresh, unsealed page.
    #[must_use]
    pub fn to_page(&self, page_size: usize) -> Page {
        let mut page = Page::with_type(page_size, PageType::TableHeader);
        page.write_u64(ROOT_OFFSET, self.root);
        page.write_u64(ENTRY_COUNT_OFFSET, self.entry_count);
        page.write_u32(MAX_ENTRIES_OFFSET, self.max_entries);
        page.write_u32(HEIGHT_OFFSET, self.height);
        page.write_u64(TABLE_ID_OFFSET, self.table_id);
        page.write_u16(NAME_LEN_OFFSET, self.name.len() as u16);
        page.write_u16(DESCRIPTOR_LEN_OFFSET, self.descriptor.len() as u16);
        page.write_bytes(STRINGS_OFFSET, self.name.as_bytes());
        page.write_bytes(STRINGS_OFFSET + self.name.len(), self.descriptor.as_bytes());
        page
    }

    /// Decode and validate a table header page.
    pub fn from_page(page_id: PageId, page: &Page) -> Result<Self, StoreError> {
        page.expect_type(PageType::TableHeader)?;
        let name_len = page.read_u16(NAME_LEN_OFFSET) as usize;
        let descriptor_len = page.read_u16(DESCRIPTOR_LEN_OFFSET) as usize;
        if STRINGS_OFFSET + name_len + descriptor_len > page.size() {
            return Err(header_corrupt(page_id, "name runs past the page"));
        }

        let text = |offset, len| {
            String::from_utf8(page.read_bytes(offset, len).to_vec())
                .map_err(|_| header_corrupt(page_id, "name is not UTF-8"))
        };
        let header = Self {
            root: page.read_u64(ROOT_OFFSET),
            entry_count: page.read_u64(ENTRY_COUNT_OFFSET),
            max_entries: page.read_u32(MAX_ENTRIES_OFFSET),
            height: page.read_u32(HEIGHT_OFFSET),
            table_id: page.read_u64(TABLE_ID_OFFSET),
            name: text(STRINGS_OFFSET, name_len)?,
            descriptor: text(STRINGS_OFFSET + name_len, descriptor_len)?,
        };

        if header.root == NO_PAGE || header.height == 0 {
            return Err(header_corrupt(page_id, "missing root"));
        }
        if !(MIN_FANOUT..=MAX_FANOUT).contains(&(header.max_entries as usize)) {
            return Err(header_corrupt(page_id, "fan-out out of range"));
        }
        Ok(header)
    }

    #[must_use]
    pub const fn limits(&self, page_size: usize) -> NodeLimits {
        NodeLimits::new(page_size, self.max_entries as usize)
    }
}

fn header_corrupt(page_id: PageId, reason: &str) -> StoreError {
    StoreError::Corruption(format!("table header {page_id}: {reason}"))
}

/// Reject fan-out bounds outside `MIN_FANOUT..=MAX_FANOUT`.
pub fn validate_fanout(max_entries: usize) -> Result<(), StoreError> {
    if (MIN_FANOUT..=MAX_FANOUT).contains(&max_entries) {
        Ok(())
    } else {
        Err(StoreError::InvalidConfiguration(format!(
            "fan-out {max_entries} outside {MIN_FANOUT}..={MAX_FANOUT}"
        )))
    }
}

/// Create an empty tree: a header page and a single empty leaf.
///
/// # Post-conditions
/// - The returned header page is staged with height 1 and no entries
/// - The superblock's next table id is past `table_id`
pub fn create(
    space: &mut impl PageSpace,
    name: &str,
    descriptor: &str,
    max_entries: usize,
    table_id: u64,
) -> Result<PageId, StoreError> {
    validate_fanout(max_entries)?;
    let page_size = space.page_size();
    let mut header = TableHeader {
        root: NO_PAGE,
        entry_count: 0,
        max_entries: max_entries as u32,
        height: 1,
        table_id,
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    };
    if header.encoded_len() > page_size {
        return Err(StoreError::InvalidConfiguration(format!(
            "table name and schema of {} bytes do not fit a {page_size} byte page",
            header.encoded_len()
        )));
    }

    let superblock = space.superblock_mut();
    superblock.next_table_id = superblock.next_table_id.max(table_id + 1);
    let header_id = allocator::allocate(space)?;
    header.root = allocator::allocate(space)?;
    space.stage(header.root, LeafNode::default().to_page(page_size));
    space.stage(header_id, header.to_page(page_size));
    Ok(header_id)
}

/// Read a tree's header page.
pub fn read_header(
    source: &mut impl PageSource,
    header_id: PageId,
) -> Result<TableHeader, StoreError> {
    let page = source.page(header_id)?;
    TableHeader::from_page(header_id, &page)
}

fn write_header(space: &mut impl PageSpace, header_id: PageId, header: &TableHeader) {
    let page = header.to_page(space.page_size());
    space.stage(header_id, page);
}

/// One internal node on the way down, with the child taken.
struct PathStep {
    page_id: PageId,
    node: InternalNode,
    child_index: usize,
}

/// Walk from the root to the leaf that holds `key`.
fn descend(
    source: &mut impl PageSource,
    header: &TableHeader,
    order: &impl KeyOrder,
    key: &[u8],
) -> Result<(Vec<PathStep>, PageId, LeafNode), StoreError> {
    let mut path = Vec::with_capacity(header.height as usize);
    let mut page_id = header.root;
    for _ in 1..header.height {
        let node = InternalNode::from_page(&*source.page(page_id)?)?;
        let child_index = node.find_child_index(order, key)?;
        let child = node.children[child_index];
        path.push(PathStep {
            page_id,
            node,
            child_index,
        });
        page_id = child;
    }
    let leaf = LeafNode::from_page(&*source.page(page_id)?)?;
    Ok((path, page_id, leaf))
}

/// Look up the value stored under `key`.
pub fn find(
    source: &mut impl PageSource,
    header: &TableHeader,
    order: &impl KeyOrder,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StoreError> {
    let (_, _, leaf) = descend(source, header, order, key)?;
    match leaf.search(order, key)? {
        Ok(i) => Ok(Some(resolve_value(source, &leaf.entries[i].value)?)),
        Err(_) => Ok(None),
    }
}

/// Insert `key`, returning the value it previously held.
///
/// An existing key keeps its value unless `replace` is set; either way the
/// previous value is returned. Nothing is staged when the key exists and
/// `replace` is false.
pub fn insert(
    space: &mut impl PageSpace,
    header_id: PageId,
    order: &impl KeyOrder,
    key: &[u8],
    value: &[u8],
    replace: bool,
) -> Result<Option<Vec<u8>>, StoreError> {
    let page_size = space.page_size();
    let max = node::max_key_size(page_size);
    if key.len() > max {
        return Err(NodeError::KeyTooLarge {
            size: key.len(),
            max,
        }
        .into());
    }

    let original = read_header(space, header_id)?;
    let mut header = original.clone();
    let (path, leaf_id, mut leaf) = descend(space, &header, order, key)?;

    let previous = match leaf.search(order, key)? {
        Ok(i) => {
            let old = resolve_value(space, &leaf.entries[i].value)?;
            if !replace {
                return Ok(Some(old));
            }
            if let LeafValue::Overflow(chain) = &leaf.entries[i].value {
                overflow::free_value(space, chain)?;
            }
            leaf.entries[i].value = store_value(space, key.len(), value)?;
            Some(old)
        }
        Err(i) => {
            let value = store_value(space, key.len(), value)?;
            leaf.entries.insert(
                i,
                LeafEntry {
                    key: key.to_vec(),
                    value,
                },
            );
            header.entry_count += 1;
            None
        }
    };

    let limits = header.limits(page_size);
    if leaf.overflows(limits) {
        let (separator, right_id) = split_leaf(space, leaf_id, &mut leaf)?;
        promote(space, &mut header, path, separator, right_id, limits)?;
    } else {
        space.stage(leaf_id, leaf.to_page(page_size));
    }

    if header != original {
        write_header(space, header_id, &header);
    }
    Ok(previous)
}

fn store_value(
    space: &mut impl PageSpace,
    key_len: usize,
    value: &[u8],
) -> Result<LeafValue, StoreError> {
    if value.len() <= node::max_inline_value(space.page_size(), key_len) {
        Ok(LeafValue::Inline(value.to_vec()))
    } else {
        Ok(LeafValue::Overflow(overflow::write_value(space, value)?))
    }
}

/// Split an overfull leaf, staging both halves and relinking the chain.
///
/// Returns the separator (the right half's first key) and the new page.
fn split_leaf(
    space: &mut impl PageSpace,
    leaf_id: PageId,
    leaf: &mut LeafNode,
) -> Result<(Vec<u8>, PageId), StoreError> {
    let page_size = space.page_size();
    let mut right = leaf.split();
    let separator = right
        .entries
        .first()
        .map(|entry| entry.key.clone())
        .ok_or_else(|| StoreError::Corruption(format!("leaf {leaf_id} split with one entry")))?;

    let right_id = allocator::allocate(space)?;
    right.prev = leaf_id;
    right.next = leaf.next;
    if leaf.next != NO_PAGE {
        let mut next = LeafNode::from_page(&*space.page(leaf.next)?)?;
        next.prev = right_id;
        space.stage(leaf.next, next.to_page(page_size));
    }
    leaf.next = right_id;

    space.stage(leaf_id, leaf.to_page(page_size));
    space.stage(right_id, right.to_page(page_size));
    Ok((separator, right_id))
}

/// Push a separator up the recorded path, splitting internal nodes as they
/// overflow and growing a new root when the old one splits.
fn promote(
    space: &mut impl PageSpace,
    header: &mut TableHeader,
    mut path: Vec<PathStep>,
    mut separator: Vec<u8>,
    mut right_id: PageId,
    limits: NodeLimits,
) -> Result<(), StoreError> {
    let page_size = space.page_size();
    while let Some(PathStep {
        page_id,
        mut node,
        child_index,
    }) = path.pop()
    {
        node.insert_child(child_index, separator, right_id);
        if !node.overflows(limits) {
            space.stage(page_id, node.to_page(page_size));
            return Ok(());
        }

        let (median, right) = node.split();
        let new_right = allocator::allocate(space)?;
        space.stage(page_id, node.to_page(page_size));
        space.stage(new_right, right.to_page(page_size));
        separator = median;
        right_id = new_right;
    }

    let root_id = allocator::allocate(space)?;
    let root = InternalNode::new_root(header.root, separator, right_id);
    space.stage(root_id, root.to_page(page_size));
    header.root = root_id;
    header.height += 1;
    Ok(())
}

/// Remove `key`, returning its value. Underfull leaves are left in place.
pub fn remove(
    space: &mut impl PageSpace,
    header_id: PageId,
    order: &impl KeyOrder,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StoreError> {
    let mut header = read_header(space, header_id)?;
    let (_, leaf_id, mut leaf) = descend(space, &header, order, key)?;
    let Ok(i) = leaf.search(order, key)? else {
        return Ok(None);
    };

    let entry = leaf.entries.remove(i);
    let old = resolve_value(space, &entry.value)?;
    if let LeafValue::Overflow(chain) = &entry.value {
        overflow::free_value(space, chain)?;
    }
    let page = leaf.to_page(space.page_size());
    space.stage(leaf_id, page);

    header.entry_count = header
        .entry_count
        .checked_sub(1)
        .ok_or_else(|| header_corrupt(header_id, "entry count underflow"))?;
    write_header(space, header_id, &header);
    Ok(Some(old))
}

/// Free every page of a tree, overflow chains and header included.
///
/// Returns the number of pages freed.
pub fn destroy(space: &mut impl PageSpace, header_id: PageId) -> Result<u64, StoreError> {
    let header = read_header(space, header_id)?;
    let mut freed = 0;
    let mut level = vec![header.root];

    for depth in 1..=header.height {
        let mut below = Vec::new();
        for page_id in level {
            let page = space.page(page_id)?;
            if depth < header.height {
                below.extend(InternalNode::from_page(&page)?.children);
            } else {
                for entry in LeafNode::from_page(&page)?.entries {
                    if let LeafValue::Overflow(chain) = entry.value {
                        freed += overflow::free_value(space, &chain)?;
                    }
                }
            }
            space.free(page_id);
            freed += 1;
        }
        level = below;
    }

    space.free(header_id);
    Ok(freed + 1)
}

/// Change the fan-out bound of an empty, single-leaf tree.
pub fn set_max_entries(
    space: &mut impl PageSpace,
    header_id: PageId,
    max_entries: usize,
) -> Result<(), StoreError> {
    validate_fanout(max_entries)?;
    let mut header = read_header(space, header_id)?;
    if header.max_entries as usize == max_entries {
        return Ok(());
    }
    if header.entry_count != 0 || header.height != 1 {
        return Err(StoreError::IllegalState(format!(
            "fan-out of table {} can only change while it is empty",
            header.name
        )));
    }
    header.max_entries = max_entries as u32;
    write_header(space, header_id, &header);
    Ok(())
}

/// Read a leaf page.
pub fn read_leaf(source: &mut impl PageSource, page_id: PageId) -> Result<LeafNode, StoreError> {
    Ok(LeafNode::from_page(&*source.page(page_id)?)?)
}

/// The first leaf in key order.
pub fn leftmost_leaf(
    source: &mut impl PageSource,
    header: &TableHeader,
) -> Result<(PageId, LeafNode), StoreError> {
    let mut page_id = header.root;
    for _ in 1..header.height {
        let node = InternalNode::from_page(&*source.page(page_id)?)?;
        page_id = node.children[0];
    }
    Ok((page_id, read_leaf(source, page_id)?))
}

/// The leaf where `key` belongs, with the index of the first entry not
/// less than `key`. The index may equal the entry count.
pub fn seek(
    source: &mut impl PageSource,
    header: &TableHeader,
    order: &impl KeyOrder,
    key: &[u8],
) -> Result<(PageId, LeafNode, usize), StoreError> {
    let (_, page_id, leaf) = descend(source, header, order, key)?;
    let (Ok(index) | Err(index)) = leaf.search(order, key)?;
    Ok((page_id, leaf, index))
}

/// Materialize a leaf value, following its overflow chain if needed.
pub fn resolve_value(
    source: &mut impl PageSource,
    value: &LeafValue,
) -> Result<Vec<u8>, StoreError> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.clone()),
        LeafValue::Overflow(chain) => overflow::read_value(source, chain),
    }
}

/// Every entry of the tree in order, values resolved.
pub fn entries(
    source: &mut impl PageSource,
    header: &TableHeader,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    let (_, mut leaf) = leftmost_leaf(source, header)?;
    let mut out = Vec::new();
    loop {
        for entry in &leaf.entries {
            out.push((entry.key.clone(), resolve_value(source, &entry.value)?));
        }
        if leaf.next == NO_PAGE {
            return Ok(out);
        }
        leaf = read_leaf(source, leaf.next)?;
    }
}

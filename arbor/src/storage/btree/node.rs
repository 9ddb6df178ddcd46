//! B-tree node types and serialization.
//!
//! Keys are variable-length byte strings ordered by the table's `KeyOrder`.
//!
//! # Node Layout
//!
//! After the 8-byte page header every node carries:
//! - `count`: u16, entries in a leaf or keys in an internal node
//! - `prev`: u64, previous leaf (`NO_PAGE` for internal nodes)
//! - `next`: u64, next leaf (`NO_PAGE` for internal nodes)
//!
//! Leaf entries follow as `key_len u16 | kind u8 | value_len u32 | key |
//! value`, where an overflow entry stores a 12-byte overflow reference as its
//! value. Internal nodes store the first child, then `key_len u16 | key |
//! child u64` per key.
//!
//! # Bounds
//!
//! A single entry may use at most a quarter of the node's data space. Keys
//! are limited so that a key plus an overflow reference fits that budget;
//! values that do not fit inline move to an overflow chain.

// Entry counts and lengths are bounded by the page size.
#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::error::StoreError;
use crate::storage::overflow::{OVERFLOW_REF_SIZE, OverflowRef};
use crate::storage::page::{NO_PAGE, Page, PageError, PageHeader, PageId, PageType};
use crate::storage::serializer::KeyOrder;

const COUNT_OFFSET: usize = PageHeader::SIZE;
const PREV_OFFSET: usize = COUNT_OFFSET + 2;
const NEXT_OFFSET: usize = PREV_OFFSET + 8;

/// Offset where node entries start.
pub const DATA_OFFSET: usize = NEXT_OFFSET + 8;

/// `key_len` + `kind` + `value_len`.
const LEAF_ENTRY_OVERHEAD: usize = 2 + 1 + 4;

/// `key_len` + `child`.
const INTERNAL_ENTRY_OVERHEAD: usize = 2 + 8;

const KIND_INLINE: u8 = 0;
const KIND_OVERFLOW: u8 = 1;

/// Bytes available for entries in a node.
#[must_use]
pub const fn capacity(page_size: usize) -> usize {
    page_size - DATA_OFFSET
}

/// Most bytes a single entry may occupy.
#[must_use]
pub const fn entry_budget(page_size: usize) -> usize {
    capacity(page_size) / 4
}

/// Longest encoded key a table on `page_size` pages accepts.
#[must_use]
pub const fn max_key_size(page_size: usize) -> usize {
    entry_budget(page_size) - LEAF_ENTRY_OVERHEAD - OVERFLOW_REF_SIZE
}

/// Longest value stored inline next to `key_len` bytes of key.
#[must_use]
pub const fn max_inline_value(page_size: usize, key_len: usize) -> usize {
    entry_budget(page_size) - LEAF_ENTRY_OVERHEAD - key_len
}

/// Split thresholds for one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    pub capacity: usize,
    pub max_entries: usize,
}

impl NodeLimits {
    #[must_use]
    pub const fn new(page_size: usize, max_entries: usize) -> Self {
        Self {
            capacity: capacity(page_size),
            max_entries,
        }
    }
}

/// Where a leaf entry's value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Inline(Vec<u8>),
    Overflow(OverflowRef),
}

impl LeafValue {
    fn stored_len(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Overflow(_) => OVERFLOW_REF_SIZE,
        }
    }
}

/// A key and its value in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: LeafValue,
}

impl LeafEntry {
    fn encoded_len(&self) -> usize {
        LEAF_ENTRY_OVERHEAD + self.key.len() + self.value.stored_len()
    }
}

/// A leaf node. Leaves form a doubly-linked list in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    pub prev: PageId,
    pub next: PageId,
    pub entries: Vec<LeafEntry>,
}

/// An internal node.
///
/// Stores N keys and N+1 children.
/// `children[i]` holds keys < `keys[i]`
/// `children[i+1]` holds keys >= `keys[i]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

/// A decoded node page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    /// Decode a node page of either kind.
    pub fn from_page(page: &Page) -> Result<Self, NodeError> {
        match page.page_type()? {
            PageType::BTreeLeaf => Ok(Self::Leaf(LeafNode::decode(page)?)),
            PageType::BTreeInternal => Ok(Self::Internal(InternalNode::decode(page)?)),
            other => Err(NodeError::NotANode(other)),
        }
    }
}

/// Bounds-checked sequential reader over a node page.
struct Cursor<'a> {
    page: &'a Page,
    offset: usize,
}

impl<'a> Cursor<'a> {
    const fn new(page: &'a Page) -> Self {
        Self {
            page,
            offset: DATA_OFFSET,
        }
    }

    fn ensure(&self, len: usize) -> Result<(), NodeError> {
        if self.offset + len > self.page.size() {
            return Err(NodeError::EntryOutOfBounds {
                offset: self.offset,
                len,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, NodeError> {
        self.ensure(1)?;
        let value = self.page.read_u8(self.offset);
        self.offset += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, NodeError> {
        self.ensure(2)?;
        let value = self.page.read_u16(self.offset);
        self.offset += 2;
        Ok(value)
    }

    fn u32(&mut self) -> Result<u32, NodeError> {
        self.ensure(4)?;
        let value = self.page.read_u32(self.offset);
        self.offset += 4;
        Ok(value)
    }

    fn u64(&mut self) -> Result<u64, NodeError> {
        self.ensure(8)?;
        let value = self.page.read_u64(self.offset);
        self.offset += 8;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        self.ensure(len)?;
        let value = self.page.read_bytes(self.offset, len);
        self.offset += len;
        Ok(value)
    }
}

impl LeafNode {
    fn decode(page: &Page) -> Result<Self, NodeError> {
        let count = page.read_u16(COUNT_OFFSET) as usize;
        let mut cursor = Cursor::new(page);
        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let key_len = cursor.u16()? as usize;
            let kind = cursor.u8()?;
            let value_len = cursor.u32()? as usize;
            let key = cursor.bytes(key_len)?.to_vec();
            let raw = cursor.bytes(value_len)?;
            let value = match kind {
                KIND_INLINE => LeafValue::Inline(raw.to_vec()),
                KIND_OVERFLOW => LeafValue::Overflow(
                    OverflowRef::from_bytes(raw).ok_or(NodeError::InvalidOverflowRef)?,
                ),
                other => return Err(NodeError::InvalidValueKind(other)),
            };
            entries.push(LeafEntry { key, value });
        }

        Ok(Self {
            prev: page.read_u64(PREV_OFFSET),
            next: page.read_u64(NEXT_OFFSET),
            entries,
        })
    }

    /// Decode a page that must be a leaf.
    pub fn from_page(page: &Page) -> Result<Self, NodeError> {
        page.expect_type(PageType::BTreeLeaf)?;
        Self::decode(page)
    }

    /// Encode into a fresh, unsealed page.
    #[must_use]
    pub fn to_page(&self, page_size: usize) -> Page {
        let mut page = Page::with_type(page_size, PageType::BTreeLeaf);
        page.write_u16(COUNT_OFFSET, self.entries.len() as u16);
        page.write_u64(PREV_OFFSET, self.prev);
        page.write_u64(NEXT_OFFSET, self.next);

        let mut offset = DATA_OFFSET;
        for entry in &self.entries {
            page.write_u16(offset, entry.key.len() as u16);
            offset += 2;
            let (kind, stored) = match &entry.value {
                LeafValue::Inline(bytes) => (KIND_INLINE, bytes.clone()),
                LeafValue::Overflow(overflow) => (KIND_OVERFLOW, overflow.to_bytes().to_vec()),
            };
            page.write_u8(offset, kind);
            offset += 1;
            page.write_u32(offset, stored.len() as u32);
            offset += 4;
            page.write_bytes(offset, &entry.key);
            offset += entry.key.len();
            page.write_bytes(offset, &stored);
            offset += stored.len();
        }
        page
    }

    /// Bytes the entries occupy when encoded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.entries.iter().map(LeafEntry::encoded_len).sum()
    }

    /// Locate `key`: `Ok(index)` when present, `Err(index)` for the
    /// insertion point.
    pub fn search(
        &self,
        order: &impl KeyOrder,
        key: &[u8],
    ) -> Result<Result<usize, usize>, StoreError> {
        binary_search(self.entries.len(), |i| &self.entries[i].key, order, key)
    }

    /// Whether the leaf breaks either split threshold.
    #[must_use]
    pub fn overflows(&self, limits: NodeLimits) -> bool {
        self.entries.len() > limits.max_entries || self.encoded_len() > limits.capacity
    }

    /// Move the upper part of the entries into a new right sibling.
    ///
    /// The split point balances encoded bytes, keeping at least one entry on
    /// each side. Links are left for the caller to fix up.
    #[must_use]
    pub fn split(&mut self) -> Self {
        let lengths: Vec<usize> = self.entries.iter().map(LeafEntry::encoded_len).collect();
        let at = balanced_split(&lengths);
        Self {
            prev: NO_PAGE,
            next: NO_PAGE,
            entries: self.entries.split_off(at),
        }
    }
}

impl InternalNode {
    /// A new root above two children.
    #[must_use]
    pub fn new_root(left: PageId, key: Vec<u8>, right: PageId) -> Self {
        Self {
            keys: vec![key],
            children: vec![left, right],
        }
    }

    fn decode(page: &Page) -> Result<Self, NodeError> {
        let count = page.read_u16(COUNT_OFFSET) as usize;
        let mut cursor = Cursor::new(page);
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);

        children.push(cursor.u64()?);
        for _ in 0..count {
            let key_len = cursor.u16()? as usize;
            keys.push(cursor.bytes(key_len)?.to_vec());
            children.push(cursor.u64()?);
        }

        if children.contains(&NO_PAGE) {
            return Err(NodeError::MissingChild);
        }
        Ok(Self { keys, children })
    }

    /// Decode a page that must be an internal node.
    pub fn from_page(page: &Page) -> Result<Self, NodeError> {
        page.expect_type(PageType::BTreeInternal)?;
        Self::decode(page)
    }

    /// Encode into a fresh, unsealed page.
    #[must_use]
    pub fn to_page(&self, page_size: usize) -> Page {
        let mut page = Page::with_type(page_size, PageType::BTreeInternal);
        page.write_u16(COUNT_OFFSET, self.keys.len() as u16);
        page.write_u64(PREV_OFFSET, NO_PAGE);
        page.write_u64(NEXT_OFFSET, NO_PAGE);

        let mut offset = DATA_OFFSET;
        page.write_u64(offset, self.children[0]);
        offset += 8;
        for (key, &child) in self.keys.iter().zip(&self.children[1..]) {
            page.write_u16(offset, key.len() as u16);
            offset += 2;
            page.write_bytes(offset, key);
            offset += key.len();
            page.write_u64(offset, child);
            offset += 8;
        }
        page
    }

    /// Bytes the keys and children occupy when encoded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        8 + self
            .keys
            .iter()
            .map(|key| INTERNAL_ENTRY_OVERHEAD + key.len())
            .sum::<usize>()
    }

    /// Index of the child that holds `key`. Equal keys go right.
    pub fn find_child_index(&self, order: &impl KeyOrder, key: &[u8]) -> Result<usize, StoreError> {
        Ok(match binary_search(self.keys.len(), |i| &self.keys[i], order, key)? {
            Ok(i) => i + 1,
            Err(i) => i,
        })
    }

    /// Insert a separator and the child to its right after `child_index`.
    pub fn insert_child(&mut self, child_index: usize, key: Vec<u8>, right: PageId) {
        self.keys.insert(child_index, key);
        self.children.insert(child_index + 1, right);
    }

    /// Whether the node breaks either split threshold.
    #[must_use]
    pub fn overflows(&self, limits: NodeLimits) -> bool {
        self.keys.len() > limits.max_entries || self.encoded_len() > limits.capacity
    }

    /// Split around the median key, returning it and the new right node.
    ///
    /// The median balances encoded bytes and leaves at least one key on
    /// each side.
    #[must_use]
    pub fn split(&mut self) -> (Vec<u8>, Self) {
        let lengths: Vec<usize> = self
            .keys
            .iter()
            .map(|key| INTERNAL_ENTRY_OVERHEAD + key.len())
            .collect();
        let mid = (balanced_split(&lengths) - 1).clamp(1, self.keys.len().saturating_sub(2).max(1));

        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let median = self.keys.pop().unwrap_or_default();

        (
            median,
            Self {
                keys: right_keys,
                children: right_children,
            },
        )
    }
}

/// First index whose prefix holds at least half the bytes, kept inside
/// `1..len` so neither side is empty.
fn balanced_split(lengths: &[usize]) -> usize {
    let total: usize = lengths.iter().sum();
    let mut running = 0;
    let mut at = lengths.len();
    for (i, len) in lengths.iter().enumerate() {
        running += len;
        if running * 2 >= total {
            at = i + 1;
            break;
        }
    }
    at.clamp(1, lengths.len().saturating_sub(1).max(1))
}

fn binary_search<'a>(
    len: usize,
    key_at: impl Fn(usize) -> &'a [u8],
    order: &impl KeyOrder,
    key: &[u8],
) -> Result<Result<usize, usize>, StoreError> {
    let mut low = 0;
    let mut high = len;
    while low < high {
        let mid = low + (high - low) / 2;
        match order.compare_encoded(key_at(mid), key)? {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(low))
}

/// Errors decoding or building nodes.
#[derive(Debug)]
pub enum NodeError {
    /// The page header is unreadable or has the wrong type.
    Page(PageError),
    /// A page of another kind sits where a node was expected.
    NotANode(PageType),
    /// An entry runs past the end of the page.
    EntryOutOfBounds { offset: usize, len: usize },
    /// A leaf entry has an unknown value kind.
    InvalidValueKind(u8),
    /// An overflow entry's reference has the wrong size.
    InvalidOverflowRef,
    /// An internal node points at page 0.
    MissingChild,
    /// The encoded key is longer than a node entry allows.
    KeyTooLarge { size: usize, max: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page(e) => write!(f, "node page: {e}"),
            Self::NotANode(page_type) => write!(f, "expected a node page, found {page_type:?}"),
            Self::EntryOutOfBounds { offset, len } => {
                write!(f, "entry of {len} bytes at offset {offset} runs past the page")
            }
            Self::InvalidValueKind(kind) => write!(f, "invalid value kind {kind}"),
            Self::InvalidOverflowRef => write!(f, "invalid overflow reference"),
            Self::MissingChild => write!(f, "internal node has a null child"),
            Self::KeyTooLarge { size, max } => {
                write!(f, "key too large: {size} bytes (max {max})")
            }
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PageError> for NodeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

//! The table catalog: a byte-ordered tree from table name to header page.
//!
//! The catalog is created lazily with the first table and rooted from
//! `Superblock::catalog_header`.

use crate::storage::btree::tree;
use crate::storage::error::StoreError;
use crate::storage::page::{NO_PAGE, PageId};
use crate::storage::serializer::ByteOrder;
use crate::storage::superblock::Superblock;
use crate::storage::transaction::{PageSource, PageSpace};

const CATALOG_NAME: &str = "catalog";
const CATALOG_DESCRIPTOR: &str = "key=bytes;value=page-id;order=bytes";
const CATALOG_FANOUT: usize = 64;

/// Decode the superblock as `source` sees it.
pub fn superblock(source: &mut impl PageSource) -> Result<Superblock, StoreError> {
    let page = source.page(0)?;
    Ok(Superblock::from_page(&page)?)
}

/// Header page of the table called `name`.
pub fn lookup(
    source: &mut impl PageSource,
    catalog_header: PageId,
    name: &str,
) -> Result<Option<PageId>, StoreError> {
    if catalog_header == NO_PAGE {
        return Ok(None);
    }
    let header = tree::read_header(source, catalog_header)?;
    tree::find(source, &header, &ByteOrder, name.as_bytes())?
        .map(|bytes| decode_page_id(name, &bytes))
        .transpose()
}

/// Record `name` as the table rooted at `header_id`.
pub fn register(space: &mut impl PageSpace, name: &str, header_id: PageId) -> Result<(), StoreError> {
    let mut catalog = space.superblock().catalog_header;
    if catalog == NO_PAGE {
        let table_id = space.superblock().next_table_id;
        catalog = tree::create(space, CATALOG_NAME, CATALOG_DESCRIPTOR, CATALOG_FANOUT, table_id)?;
        space.superblock_mut().catalog_header = catalog;
    }
    tree::insert(
        space,
        catalog,
        &ByteOrder,
        name.as_bytes(),
        &header_id.to_le_bytes(),
        true,
    )?;
    Ok(())
}

/// Remove `name`, returning the header page it pointed at.
pub fn unregister(space: &mut impl PageSpace, name: &str) -> Result<Option<PageId>, StoreError> {
    let catalog = space.superblock().catalog_header;
    if catalog == NO_PAGE {
        return Ok(None);
    }
    tree::remove(space, catalog, &ByteOrder, name.as_bytes())?
        .map(|bytes| decode_page_id(name, &bytes))
        .transpose()
}

/// Every table name in byte order.
pub fn names(source: &mut impl PageSource, catalog_header: PageId) -> Result<Vec<String>, StoreError> {
    if catalog_header == NO_PAGE {
        return Ok(Vec::new());
    }
    let header = tree::read_header(source, catalog_header)?;
    tree::entries(source, &header)?
        .into_iter()
        .map(|(key, _)| {
            String::from_utf8(key)
                .map_err(|_| StoreError::Corruption("catalog name is not UTF-8".to_string()))
        })
        .collect()
}

fn decode_page_id(name: &str, bytes: &[u8]) -> Result<PageId, StoreError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        StoreError::Corruption(format!("catalog entry for {name} is {} bytes", bytes.len()))
    })?;
    Ok(PageId::from_le_bytes(raw))
}

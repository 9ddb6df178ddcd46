//! Test helpers shared by unit and scenario tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::RecordManagerOptions;
use crate::simulation::SimulatedDevice;
use crate::storage::error::StoreError;
use crate::storage::manager::RecordManager;
use crate::storage::page::{Page, PageId, PageImage};
use crate::storage::superblock::Superblock;
use crate::storage::transaction::{PageSource, PageSpace};

/// An in-memory `PageSpace` for exercising page-level algorithms without a
/// store underneath.
pub struct MemorySpace {
    pub superblock: Superblock,
    pub pages: HashMap<PageId, PageImage>,
    pub freed: Vec<PageId>,
}

impl MemorySpace {
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(page_size: usize) -> Self {
        Self {
            superblock: Superblock::new(page_size as u32),
            pages: HashMap::new(),
            freed: Vec::new(),
        }
    }
}

impl PageSource for MemorySpace {
    fn page(&mut self, page_id: PageId) -> Result<PageImage, StoreError> {
        self.pages
            .get(&page_id)
            .cloned()
            .ok_or_else(|| StoreError::Corruption(format!("missing page {page_id}")))
    }
}

impl PageSpace for MemorySpace {
    fn page_size(&self) -> usize {
        self.superblock.page_size()
    }

    fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    fn stage(&mut self, page_id: PageId, mut page: Page) {
        page.seal();
        self.pages.insert(page_id, page.into_image());
    }

    fn free(&mut self, page_id: PageId) {
        self.freed.push(page_id);
    }
}

/// Small pages and a tiny fan-out so a few hundred keys build a deep tree.
pub fn small_options() -> RecordManagerOptions {
    RecordManagerOptions {
        page_size: 512,
        max_node_entries: 4,
        cache_pages: 16,
    }
}

/// Open a record manager on a file inside `dir`.
pub fn open_in(dir: &Path, options: RecordManagerOptions) -> Result<RecordManager, StoreError> {
    RecordManager::open(&dir.join("test.db"), options)
}

/// A pair of simulated devices standing in for the page file and its log.
#[derive(Clone)]
pub struct SimulatedFiles {
    pub data: SimulatedDevice,
    pub log: SimulatedDevice,
}

impl SimulatedFiles {
    pub fn new(seed: u64) -> Self {
        Self {
            data: SimulatedDevice::new(seed),
            log: SimulatedDevice::new(seed.wrapping_add(1)),
        }
    }

    /// Open a record manager over clones of both devices.
    pub fn open(&self, options: RecordManagerOptions) -> Result<RecordManager, StoreError> {
        RecordManager::open_with_devices(
            Arc::new(self.data.clone()),
            Arc::new(self.log.clone()),
            options,
        )
    }

    /// Crash both devices, each keeping a random prefix of its unsynced writes.
    pub fn crash(&self) {
        self.data.crash();
        self.log.crash();
    }
}

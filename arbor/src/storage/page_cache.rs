//! Bounded cache of durable page images.
//!
//! The cache only ever holds images that match what is on disk: staged and
//! shadowed pages live in the store's version state, never here. Entries are
//! shared `PageImage`s so a hit is a reference count bump.
//!
//! # Design
//!
//! - CLOCK (second chance) eviction over a ring of page ids
//! - A capacity of 0 disables caching entirely
//! - Thread-safe: uses a Mutex for internal synchronization
//!
//! # Invariants
//!
//! - `entries.len() == ring.len() <= capacity`

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::storage::page::{PageId, PageImage};

struct CacheState {
    /// Cached image plus its CLOCK reference bit.
    entries: HashMap<PageId, (PageImage, bool)>,
    /// Eviction order; the front is the clock hand.
    ring: VecDeque<PageId>,
    hits: u64,
    misses: u64,
}

/// Cache hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
}

/// A CLOCK-evicting cache of durable page images.
pub struct PageCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl PageCache {
    /// Create a cache holding at most `capacity` pages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::with_capacity(capacity.min(4096)),
                ring: VecDeque::with_capacity(capacity.min(4096)),
                hits: 0,
                misses: 0,
            }),
            capacity,
        }
    }

    /// Look up a page, marking it recently used on a hit.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn get(&self, page_id: PageId) -> Option<PageImage> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = self.state.lock().expect("lock poisoned");
        let hit = state.entries.get_mut(&page_id).map(|(image, referenced)| {
            *referenced = true;
            PageImage::clone(image)
        });
        if hit.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        hit
    }

    /// Insert or replace the durable image of a page.
    ///
    /// # Post-conditions
    /// - The cache holds at most `capacity` entries
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn insert(&self, page_id: PageId, image: PageImage) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(entry) = state.entries.get_mut(&page_id) {
            *entry = (image, true);
            return;
        }

        while state.entries.len() >= self.capacity {
            let Some(candidate) = state.ring.pop_front() else {
                break;
            };
            let second_chance = state
                .entries
                .get_mut(&candidate)
                .is_some_and(|(_, referenced)| std::mem::replace(referenced, false));
            if second_chance {
                state.ring.push_back(candidate);
            } else {
                state.entries.remove(&candidate);
            }
        }

        state.entries.insert(page_id, (image, false));
        state.ring.push_back(page_id);
    }

    /// Drop every cached page.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.clear();
        state.ring.clear();
    }

    /// Current counters.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("lock poisoned");
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            resident: state.entries.len(),
        }
    }

    /// Maximum number of resident pages.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Common helpers for end-to-end tests.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tempfile::TempDir;

use crate::config::RecordManagerOptions;
use crate::storage::{
    BTree, NaturalOrder, RecordManager, StoreError, StringSerializer, TableSchema, TupleBrowser,
    U64Serializer,
};
use crate::testing::open_in;

/// A record manager on a temporary directory that lives as long as it does.
pub struct TestManager {
    pub manager: RecordManager,
    pub dir: TempDir,
    options: RecordManagerOptions,
}

impl TestManager {
    /// Open a fresh manager with `options`.
    #[must_use]
    pub fn new(options: RecordManagerOptions) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = open_in(dir.path(), options).expect("open record manager");
        Self {
            manager,
            dir,
            options,
        }
    }

    /// Close the manager and open the same files again.
    pub fn reopen(&mut self) {
        self.manager.close().expect("close record manager");
        self.manager = open_in(self.dir.path(), self.options).expect("reopen record manager");
    }
}

/// Schema of the `u64 -> u64` tables most scenarios use.
#[must_use]
pub fn numbers() -> TableSchema<u64, u64> {
    TableSchema::new(U64Serializer, U64Serializer, NaturalOrder)
}

/// Schema of `u64 -> String` tables.
#[must_use]
pub fn labels() -> TableSchema<u64, String> {
    TableSchema::new(U64Serializer, StringSerializer, NaturalOrder)
}

/// Insert every key with `value_of(key)`, without replacing.
pub fn fill(table: &BTree<u64, u64>, keys: impl IntoIterator<Item = u64>) {
    for key in keys {
        table
            .insert(&key, &value_of(key), false)
            .expect("insert key");
    }
}

/// The value `fill` stores under `key`.
#[must_use]
pub const fn value_of(key: u64) -> u64 {
    key * 2 + 1
}

/// `0..n` in a seeded random order.
#[must_use]
pub fn shuffled(n: u64, seed: u64) -> Vec<u64> {
    let mut keys: Vec<u64> = (0..n).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));
    keys
}

/// Drain a browser forwards, returning the keys.
pub fn keys_forward<V>(browser: &mut TupleBrowser<u64, V>) -> Result<Vec<u64>, StoreError> {
    let mut keys = Vec::new();
    while let Some(tuple) = browser.get_next()? {
        keys.push(tuple.key);
    }
    Ok(keys)
}

/// Drain a browser backwards, returning the keys.
pub fn keys_backward<V>(browser: &mut TupleBrowser<u64, V>) -> Result<Vec<u64>, StoreError> {
    let mut keys = Vec::new();
    while let Some(tuple) = browser.get_previous()? {
        keys.push(tuple.key);
    }
    Ok(keys)
}

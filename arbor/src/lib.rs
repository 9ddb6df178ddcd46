// Life of an operation:
// 1. A table call encodes its key and value with the table's schema
// 2. Reads pin a snapshot version and resolve pages through it
// 3. Writes run as one write action:
//     - Read pages through the pending transaction
//     - Build new node images, splitting as needed
//     - Publish them atomically as a new version
// 4. Commit logs before and after images, syncs the log, then writes the
//    pages in place and syncs the page file
//
// System components:
//  - Page store with snapshot versions
//  - Transaction log and recovery
//  - B-tree tables, catalog and browsers

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods))]

pub mod config;
pub mod simulation;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{EngineConfig, RecordManagerOptions};
pub use storage::{RecordManager, StoreError, TableSchema};

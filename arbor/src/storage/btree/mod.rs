//! Ordered tables stored as B-trees.
//!
//! # Structure
//!
//! - Internal nodes: separator keys and child page ids
//! - Leaf nodes: key-value entries, doubly-linked for browsing in both
//!   directions
//! - A table header page per tree with its root, height, size and schema
//!
//! Nodes split when they exceed either the table's fan-out bound or the
//! page. Removal never merges; empty leaves stay linked and are skipped.

mod browser;
pub mod node;
mod table;
pub mod tree;

pub use browser::{Tuple, TupleBrowser};
pub use node::{NodeError, max_key_size};
pub use table::BTree;

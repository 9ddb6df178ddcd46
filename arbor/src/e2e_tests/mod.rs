//! End-to-end tests at the record manager level.
//!
//! Each test file covers a specific scenario, using seeded random inputs
//! so every run exercises the same operations.

#![cfg(test)]

mod helpers;

mod test_browse_order;
mod test_closed_manager;
mod test_crash_recovery;
mod test_find_round_trip;
mod test_large_values;
mod test_page_reclamation;
mod test_replace_semantics;
mod test_size_accounting;
mod test_snapshot_isolation;

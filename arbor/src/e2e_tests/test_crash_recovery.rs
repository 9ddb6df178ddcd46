//! Test that a crash keeps exactly the committed transactions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::{fill, numbers, value_of};
use crate::storage::ErrorKind;
use crate::testing::{SimulatedFiles, small_options};

#[test]
fn test_uncommitted_changes_lost_on_crash() {
    let files = SimulatedFiles::new(31);
    {
        let manager = files.open(small_options()).unwrap();
        let table = manager.table("numbers", numbers()).unwrap();
        fill(&table, 0..200);
        manager.commit().unwrap();

        fill(&table, 200..400);
        table.remove(&5).unwrap();
        // Dropped without close.
    }
    files.crash();

    let manager = files.open(small_options()).unwrap();
    let table = manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.size().unwrap(), 200);
    assert_eq!(table.find(&5).unwrap(), Some(value_of(5)));
    assert_eq!(table.find(&250).unwrap(), None);
}

#[test]
fn test_uncommitted_table_lost_on_crash() {
    let files = SimulatedFiles::new(32);
    {
        let manager = files.open(small_options()).unwrap();
        manager.table("kept", numbers()).unwrap();
        manager.commit().unwrap();
        manager.table("lost", numbers()).unwrap();
    }
    files.crash();

    let manager = files.open(small_options()).unwrap();
    assert_eq!(manager.table_names().unwrap(), vec!["kept"]);
}

#[test]
fn test_failed_commit_is_all_or_nothing() {
    let mut rng = StdRng::seed_from_u64(33);
    for round in 0..12u64 {
        let files = SimulatedFiles::new(round);
        {
            let manager = files.open(small_options()).unwrap();
            let table = manager.table("numbers", numbers()).unwrap();
            fill(&table, 0..100);
            manager.commit().unwrap();

            fill(&table, 100..300);
            // Fail somewhere in the log append or the in-place page writes.
            if round % 2 == 0 {
                files.log.fail_writes_after(rng.random_range(0..8));
            } else {
                files.data.fail_writes_after(rng.random_range(0..40));
            }
            assert!(manager.commit().is_err(), "round {round}");
        }
        files.crash();
        files.log.clear_faults();
        files.data.clear_faults();

        let manager = files.open(small_options()).unwrap();
        let table = manager.table("numbers", numbers()).unwrap();
        let size = table.size().unwrap();
        assert!(size == 100 || size == 300, "round {round}: size {size}");
        let keys: Vec<u64> = table
            .browse()
            .unwrap()
            .map(|tuple| tuple.unwrap().key)
            .collect();
        assert_eq!(keys, (0..size).collect::<Vec<_>>(), "round {round}");
    }
}

#[test]
fn test_failed_commit_can_be_retried() {
    let files = SimulatedFiles::new(34);
    let manager = files.open(small_options()).unwrap();
    let table = manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..50);

    files.log.fail_writes_after(0);
    let err = manager.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageFailure);
    assert_eq!(table.size().unwrap(), 50);

    files.log.clear_faults();
    manager.commit().unwrap();
    drop(table);
    drop(manager);
    files.crash();

    let manager = files.open(small_options()).unwrap();
    let table = manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.size().unwrap(), 50);
    assert!(manager.recovery().is_clean());
}

#[test]
fn test_committed_log_is_replayed() {
    let files = SimulatedFiles::new(35);
    {
        let manager = files.open(small_options()).unwrap();
        let table = manager.table("numbers", numbers()).unwrap();
        fill(&table, 0..80);
        // The log reaches the device and is synced; every page write fails.
        files.data.fail_writes_after(0);
        assert!(manager.commit().is_err());
    }
    files.crash();
    files.data.clear_faults();

    let manager = files.open(small_options()).unwrap();
    assert_eq!(manager.recovery().transactions_replayed, 1);
    let table = manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.size().unwrap(), 80);
    assert_eq!(table.find(&79).unwrap(), Some(value_of(79)));
}

#[test]
fn test_rollback_after_failed_page_writes_keeps_commit() {
    let files = SimulatedFiles::new(36);
    {
        let manager = files.open(small_options()).unwrap();
        let table = manager.table("numbers", numbers()).unwrap();
        fill(&table, 0..100);
        manager.commit().unwrap();

        fill(&table, 100..300);
        // The log is synced, then the in-place writes stop part way.
        files.data.fail_writes_after(3);
        assert!(manager.commit().is_err());
        files.data.clear_faults();

        manager.rollback().unwrap();
        assert_eq!(table.size().unwrap(), 300);
        assert_eq!(table.find(&150).unwrap(), Some(value_of(150)));

        let other = manager.table("other", numbers()).unwrap();
        fill(&other, 0..10);
        manager.commit().unwrap();
    }
    files.crash();

    let manager = files.open(small_options()).unwrap();
    assert!(manager.recovery().is_clean());
    let table = manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.size().unwrap(), 300);
    let keys: Vec<u64> = table
        .browse()
        .unwrap()
        .map(|tuple| tuple.unwrap().key)
        .collect();
    assert_eq!(keys, (0..300).collect::<Vec<_>>());
    let other = manager.table("other", numbers()).unwrap();
    assert_eq!(other.size().unwrap(), 10);
}

#[test]
fn test_unfinished_commit_is_redone_after_crash() {
    let files = SimulatedFiles::new(37);
    {
        let manager = files.open(small_options()).unwrap();
        let table = manager.table("numbers", numbers()).unwrap();
        fill(&table, 0..100);
        manager.commit().unwrap();

        fill(&table, 100..300);
        files.data.fail_writes_after(3);
        assert!(manager.commit().is_err());
        files.data.clear_faults();
        manager.rollback().unwrap();
        // Dropped before any commit finishes the page writes.
    }
    files.crash();

    let manager = files.open(small_options()).unwrap();
    assert_eq!(manager.recovery().transactions_replayed, 1);
    let table = manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.size().unwrap(), 300);
    assert_eq!(table.find(&299).unwrap(), Some(value_of(299)));
}

//! Test that freed pages wait for the snapshots that can still read them and
//! are reused once those close.

use crate::e2e_tests::helpers::TestManager;
use crate::storage::{BTree, BytesSerializer, NaturalOrder, TableSchema, U64Serializer};
use crate::testing::small_options;

fn blobs(test: &TestManager) -> BTree<u64, Vec<u8>> {
    test.manager
        .table(
            "blobs",
            TableSchema::new(U64Serializer, BytesSerializer, NaturalOrder),
        )
        .unwrap()
}

fn blob(key: u64) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation)]
    let byte = key as u8;
    vec![byte; 2000]
}

#[test]
fn test_freed_pages_wait_for_open_browser() {
    let test = TestManager::new(small_options());
    let table = blobs(&test);
    for key in 0..20 {
        table.insert(&key, &blob(key), false).unwrap();
    }
    test.manager.commit().unwrap();
    let grown = test.manager.stats().unwrap().total_pages;

    let mut browser = table.browse().unwrap();
    for key in 0..20 {
        table.remove(&key).unwrap();
    }
    test.manager.commit().unwrap();

    let stats = test.manager.stats().unwrap();
    assert!(stats.deferred_frees > 0);
    assert_eq!(stats.free_pages, 0);

    // The browser still reads every overflow chain it was opened with.
    for key in 0..20 {
        let tuple = browser.get_next().unwrap().unwrap();
        assert_eq!(tuple.key, key);
        assert_eq!(tuple.value, blob(key));
    }
    assert!(browser.get_next().unwrap().is_none());
    browser.close();

    // The next write reclaims them; the same values fit in the same pages.
    for key in 0..20 {
        table.insert(&key, &blob(key), false).unwrap();
    }
    test.manager.commit().unwrap();
    let stats = test.manager.stats().unwrap();
    assert_eq!(stats.deferred_frees, 0);
    assert_eq!(stats.total_pages, grown);
}

#[test]
fn test_frees_without_snapshots_are_reclaimed_promptly() {
    let test = TestManager::new(small_options());
    let table = blobs(&test);
    table.insert(&1, &blob(1), false).unwrap();
    test.manager.commit().unwrap();

    table.remove(&1).unwrap();
    table.insert(&2, &[7; 10].to_vec(), false).unwrap();
    test.manager.commit().unwrap();

    let stats = test.manager.stats().unwrap();
    assert_eq!(stats.deferred_frees, 0);
    assert!(stats.free_pages > 0);
}

#[test]
fn test_dropped_table_pages_are_reused() {
    let mut test = TestManager::new(small_options());
    let table = blobs(&test);
    for key in 0..30 {
        table.insert(&key, &blob(key), false).unwrap();
    }
    test.manager.commit().unwrap();
    let grown = test.manager.stats().unwrap().total_pages;

    assert!(test.manager.drop_table("blobs").unwrap());
    test.manager.commit().unwrap();
    test.reopen();

    let stats = test.manager.stats().unwrap();
    assert!(stats.free_pages > 0);
    let table = blobs(&test);
    for key in 0..30 {
        table.insert(&key, &blob(key), false).unwrap();
    }
    test.manager.commit().unwrap();
    assert!(test.manager.stats().unwrap().total_pages <= grown + 2);
}

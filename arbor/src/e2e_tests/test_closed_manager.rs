//! Test that tables and browsers fail with `IllegalState` once their manager
//! is closed or dropped.

use crate::e2e_tests::helpers::{TestManager, fill, numbers};
use crate::storage::{ErrorKind, StoreError};
use crate::testing::small_options;

fn assert_illegal<T: std::fmt::Debug>(result: Result<T, StoreError>) {
    assert_eq!(result.unwrap_err().kind(), ErrorKind::IllegalState);
}

#[test]
fn test_operations_after_close_fail() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..20);
    let mut browser = table.browse().unwrap();
    assert_eq!(browser.get_next().unwrap().unwrap().key, 0);

    test.manager.close().unwrap();

    assert_illegal(table.find(&1));
    assert_illegal(table.insert(&100, &1, false));
    assert_illegal(table.remove(&1));
    assert_illegal(table.size());
    assert_illegal(table.browse());
    assert_illegal(table.browse_from(&3));
    assert_illegal(table.page_size());
    assert_illegal(table.set_page_size(8));
    assert_illegal(browser.get_next());
    assert_illegal(browser.get_previous());
    assert_illegal(test.manager.table("numbers", numbers()));
    assert_illegal(test.manager.table_names());
    assert_illegal(test.manager.drop_table("numbers"));
    assert_illegal(test.manager.commit());
    assert_illegal(test.manager.rollback());
    assert_illegal(test.manager.stats());
    assert_illegal(test.manager.close());
}

#[test]
fn test_operations_after_drop_fail() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let manager = crate::testing::open_in(dir.path(), small_options()).unwrap();
    let table = manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..5);
    drop(manager);

    assert_illegal(table.find(&1));
    assert_illegal(table.insert(&9, &9, true));
}

#[test]
fn test_closed_browser_fails_but_table_works() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..5);

    let mut browser = table.browse().unwrap();
    browser.close();
    browser.close();
    assert!(browser.is_closed());
    assert_illegal(browser.get_next());
    assert_illegal(browser.get_previous());
    assert!(browser.next().is_some_and(|result| result.is_err()));

    assert_eq!(table.size().unwrap(), 5);
    assert_eq!(test.manager.stats().unwrap().open_snapshots, 0);
}

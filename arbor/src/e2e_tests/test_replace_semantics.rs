//! Test insert with and without replace on existing keys.

use crate::e2e_tests::helpers::{TestManager, labels};
use crate::testing::small_options;

#[test]
fn test_insert_without_replace_keeps_existing() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("labels", labels()).unwrap();

    assert_eq!(table.insert(&7, &"first".to_string(), false).unwrap(), None);
    let existing = table.insert(&7, &"second".to_string(), false).unwrap();
    assert_eq!(existing, Some("first".to_string()));
    assert_eq!(table.find(&7).unwrap(), Some("first".to_string()));
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn test_insert_with_replace_overwrites() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("labels", labels()).unwrap();

    table.insert(&7, &"first".to_string(), false).unwrap();
    let previous = table.insert(&7, &"second".to_string(), true).unwrap();
    assert_eq!(previous, Some("first".to_string()));
    assert_eq!(table.find(&7).unwrap(), Some("second".to_string()));
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn test_rejected_insert_writes_nothing() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("labels", labels()).unwrap();
    table.insert(&7, &"first".to_string(), false).unwrap();
    test.manager.commit().unwrap();

    let before = test.manager.stats().unwrap();
    table.insert(&7, &"second".to_string(), false).unwrap();
    let after = test.manager.stats().unwrap();
    assert_eq!(after.pending_pages, 0);
    assert_eq!(after.version, before.version);
}

#[test]
fn test_replace_grows_value_across_splits() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("labels", labels()).unwrap();
    for key in 0..100 {
        table.insert(&key, &"x".to_string(), false).unwrap();
    }
    // Longer values force leaves that were full to split on replace.
    for key in 0..100 {
        let label = format!("label-{key}-{}", "y".repeat(20));
        assert_eq!(
            table.insert(&key, &label, true).unwrap(),
            Some("x".to_string())
        );
    }

    assert_eq!(table.size().unwrap(), 100);
    for key in 0..100 {
        let expected = format!("label-{key}-{}", "y".repeat(20));
        assert_eq!(table.find(&key).unwrap(), Some(expected));
    }
}

//! Test that browsers return entries in comparator order in both directions.

use crate::e2e_tests::helpers::{TestManager, fill, keys_backward, keys_forward, numbers, shuffled, value_of};
use crate::storage::{NaturalOrder, ReverseOrder, StringSerializer, TableSchema, U64Serializer};
use crate::testing::small_options;

#[test]
fn test_browse_returns_sorted_keys() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, shuffled(500, 11));

    let mut browser = table.browse().unwrap();
    let keys = keys_forward(&mut browser).unwrap();
    assert_eq!(keys, (0..500).collect::<Vec<_>>());
}

#[test]
fn test_browse_backwards_from_the_end() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, shuffled(300, 12));

    let mut browser = table.browse().unwrap();
    assert_eq!(keys_forward(&mut browser).unwrap().len(), 300);
    let keys = keys_backward(&mut browser).unwrap();
    assert_eq!(keys, (0..300).rev().collect::<Vec<_>>());
}

#[test]
fn test_browser_sits_between_entries() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, [10, 20, 30]);

    let mut browser = table.browse().unwrap();
    assert!(browser.get_previous().unwrap().is_none());
    assert_eq!(browser.get_next().unwrap().unwrap().key, 10);
    assert_eq!(browser.get_next().unwrap().unwrap().key, 20);
    // Reversing returns the entry just passed.
    let back = browser.get_previous().unwrap().unwrap();
    assert_eq!(back.key, 20);
    assert_eq!(back.value, value_of(20));
    assert_eq!(browser.get_next().unwrap().unwrap().key, 20);
    assert_eq!(browser.get_next().unwrap().unwrap().key, 30);
    assert!(browser.get_next().unwrap().is_none());
    assert!(browser.get_next().unwrap().is_none());
    assert_eq!(browser.get_previous().unwrap().unwrap().key, 30);
}

#[test]
fn test_browse_from_positions_before_first_not_less() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, (0..200).map(|k| k * 10));

    // Exact match.
    let mut browser = table.browse_from(&500).unwrap();
    assert_eq!(browser.get_next().unwrap().unwrap().key, 500);

    // Between keys: the next larger key comes first, the smaller one before.
    let mut browser = table.browse_from(&505).unwrap();
    assert_eq!(browser.get_next().unwrap().unwrap().key, 510);
    let mut browser = table.browse_from(&505).unwrap();
    assert_eq!(browser.get_previous().unwrap().unwrap().key, 500);

    // Past the end.
    let mut browser = table.browse_from(&5000).unwrap();
    assert!(browser.get_next().unwrap().is_none());
    assert_eq!(browser.get_previous().unwrap().unwrap().key, 1990);
}

#[test]
fn test_empty_table_browses_nothing() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();

    let mut browser = table.browse().unwrap();
    assert!(browser.get_next().unwrap().is_none());
    assert!(browser.get_previous().unwrap().is_none());
    let mut browser = table.browse_from(&7).unwrap();
    assert!(browser.get_next().unwrap().is_none());
}

#[test]
fn test_emptied_leaves_are_skipped() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..400);
    for key in 50..350 {
        table.remove(&key).unwrap();
    }

    let mut browser = table.browse().unwrap();
    let expected: Vec<u64> = (0..50).chain(350..400).collect();
    assert_eq!(keys_forward(&mut browser).unwrap(), expected);
    let backward: Vec<u64> = expected.iter().rev().copied().collect();
    assert_eq!(keys_backward(&mut browser).unwrap(), backward);

    let mut browser = table.browse_from(&100).unwrap();
    assert_eq!(browser.get_next().unwrap().unwrap().key, 350);
    let mut browser = table.browse_from(&100).unwrap();
    assert_eq!(browser.get_previous().unwrap().unwrap().key, 49);
}

#[test]
fn test_reverse_comparator_orders_descending() {
    let test = TestManager::new(small_options());
    let table = test
        .manager
        .table(
            "reversed",
            TableSchema::new(U64Serializer, U64Serializer, ReverseOrder),
        )
        .unwrap();
    fill(&table, shuffled(100, 13));

    let keys: Vec<u64> = table
        .browse()
        .unwrap()
        .map(|tuple| tuple.unwrap().key)
        .collect();
    assert_eq!(keys, (0..100).rev().collect::<Vec<_>>());
}

#[test]
fn test_string_keys_sort_by_bytes() {
    let test = TestManager::new(small_options());
    let table = test
        .manager
        .table(
            "names",
            TableSchema::new(StringSerializer, U64Serializer, NaturalOrder),
        )
        .unwrap();
    for (i, name) in ["mallory", "alice", "trent", "bob", "carol"].iter().enumerate() {
        table.insert(&(*name).to_string(), &(i as u64), false).unwrap();
    }

    let names: Vec<String> = table
        .browse()
        .unwrap()
        .map(|tuple| tuple.unwrap().key)
        .collect();
    assert_eq!(names, ["alice", "bob", "carol", "mallory", "trent"]);
}

//! Test that every inserted key can be found again, before and after commit.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::{TestManager, fill, labels, numbers, shuffled, value_of};
use crate::storage::{BytesSerializer, I64Serializer, NaturalOrder, TableSchema};
use crate::testing::small_options;

#[test]
fn test_find_every_inserted_key() {
    let mut test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, shuffled(1000, 21));

    for key in 0..1000 {
        assert_eq!(table.find(&key).unwrap(), Some(value_of(key)), "key {key}");
    }
    assert_eq!(table.find(&1000).unwrap(), None);

    test.reopen();
    let table = test.manager.table("numbers", numbers()).unwrap();
    for key in (0..1000).step_by(7) {
        assert_eq!(table.find(&key).unwrap(), Some(value_of(key)), "key {key}");
    }
}

#[test]
fn test_removed_key_is_gone() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("labels", labels()).unwrap();
    table.insert(&1, &"one".to_string(), false).unwrap();
    table.insert(&2, &"two".to_string(), false).unwrap();

    assert_eq!(table.remove(&1).unwrap(), Some("one".to_string()));
    assert_eq!(table.remove(&1).unwrap(), None);
    assert_eq!(table.find(&1).unwrap(), None);
    assert_eq!(table.find(&2).unwrap(), Some("two".to_string()));
}

#[test]
fn test_signed_keys_round_trip() {
    let test = TestManager::new(small_options());
    let table = test
        .manager
        .table(
            "signed",
            TableSchema::new(I64Serializer, BytesSerializer, NaturalOrder),
        )
        .unwrap();
    let mut rng = StdRng::seed_from_u64(22);
    let mut keys: Vec<i64> = (0..300).map(|_| rng.random_range(-1_000_000..1_000_000)).collect();
    keys.extend([i64::MIN, -1, 0, 1, i64::MAX]);
    for key in &keys {
        table.insert(key, &key.to_le_bytes().to_vec(), true).unwrap();
    }

    for key in &keys {
        assert_eq!(table.find(key).unwrap(), Some(key.to_le_bytes().to_vec()));
    }
    keys.sort_unstable();
    keys.dedup();
    let browsed: Vec<i64> = table
        .browse()
        .unwrap()
        .map(|tuple| tuple.unwrap().key)
        .collect();
    assert_eq!(browsed, keys);
}

#[test]
fn test_tables_are_independent() {
    let test = TestManager::new(small_options());
    let evens = test.manager.table("evens", numbers()).unwrap();
    let odds = test.manager.table("odds", numbers()).unwrap();
    fill(&evens, (0..200).map(|k| k * 2));
    fill(&odds, (0..200).map(|k| k * 2 + 1));

    assert_eq!(evens.find(&4).unwrap(), Some(value_of(4)));
    assert_eq!(evens.find(&5).unwrap(), None);
    assert_eq!(odds.find(&5).unwrap(), Some(value_of(5)));
    assert_eq!(odds.find(&4).unwrap(), None);
    assert_eq!(test.manager.table_names().unwrap(), vec!["evens", "odds"]);
}

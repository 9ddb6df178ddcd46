//! Test that `size` tracks a model map through random operations, commits,
//! rollbacks and reopens.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::{TestManager, keys_forward, numbers};
use crate::testing::small_options;

#[test]
fn test_size_matches_model() {
    let mut test = TestManager::new(small_options());
    let mut rng = StdRng::seed_from_u64(41);
    let mut model = BTreeMap::new();
    let mut committed = BTreeMap::new();

    for step in 0..3000u32 {
        let table = test.manager.table("numbers", numbers()).unwrap();
        let key = rng.random_range(0..400u64);
        match rng.random_range(0..10) {
            0..=4 => {
                let value = u64::from(step);
                let replace = rng.random_bool(0.5);
                let previous = table.insert(&key, &value, replace).unwrap();
                assert_eq!(previous, model.get(&key).copied(), "step {step}");
                if replace || previous.is_none() {
                    model.insert(key, value);
                }
            }
            5..=7 => {
                assert_eq!(table.remove(&key).unwrap(), model.remove(&key), "step {step}");
            }
            8 => {
                if rng.random_bool(0.8) {
                    test.manager.commit().unwrap();
                    committed.clone_from(&model);
                } else {
                    test.manager.rollback().unwrap();
                    model.clone_from(&committed);
                }
            }
            _ => {
                if rng.random_range(0..20) == 0 {
                    test.reopen();
                    committed.clone_from(&model);
                }
            }
        }
        if step % 50 == 0 {
            let table = test.manager.table("numbers", numbers()).unwrap();
            assert_eq!(table.size().unwrap(), model.len() as u64, "step {step}");
        }
    }

    let table = test.manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.size().unwrap(), model.len() as u64);
    let mut browser = table.browse().unwrap();
    assert_eq!(
        keys_forward(&mut browser).unwrap(),
        model.keys().copied().collect::<Vec<_>>()
    );
    for (key, value) in &model {
        assert_eq!(table.find(key).unwrap(), Some(*value));
    }
}

#[test]
fn test_fanout_changes_only_while_empty() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    assert_eq!(table.page_size().unwrap(), 4);

    table.set_page_size(16).unwrap();
    assert_eq!(table.page_size().unwrap(), 16);
    assert!(table.set_page_size(1).is_err());
    assert!(table.set_page_size(2000).is_err());

    table.insert(&1, &1, false).unwrap();
    let err = table.set_page_size(8).unwrap_err();
    assert_eq!(err.kind(), crate::storage::ErrorKind::IllegalState);
    assert_eq!(table.page_size().unwrap(), 16);

    // Emptying a single-leaf table allows it again.
    table.remove(&1).unwrap();
    table.set_page_size(8).unwrap();
    assert_eq!(table.size().unwrap(), 0);
}

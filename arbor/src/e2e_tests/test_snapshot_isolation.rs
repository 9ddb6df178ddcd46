//! Test that open browsers keep the view they were opened with while other
//! threads split, empty and reuse pages underneath them.

use std::sync::mpsc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RecordManagerOptions;
use crate::e2e_tests::helpers::{TestManager, fill, keys_forward, numbers, value_of};
use crate::testing::small_options;

fn fanout_four() -> RecordManagerOptions {
    RecordManagerOptions {
        max_node_entries: 4,
        ..RecordManagerOptions::default()
    }
}

#[test]
fn test_browser_ignores_concurrent_remove_and_insert() {
    let test = TestManager::new(fanout_four());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..1024);
    assert_eq!(table.page_size().unwrap(), 4);

    let mut browser = table.browse().unwrap();
    let (step_tx, step_rx) = mpsc::sync_channel::<()>(0);
    let keys = thread::scope(|s| {
        let (table, manager) = (&table, &test.manager);
        s.spawn(move || {
            for key in 10..20 {
                assert_eq!(table.remove(&key).unwrap(), Some(value_of(key)));
                step_tx.send(()).unwrap();
            }
            table.insert(&1024, &value_of(1024), false).unwrap();
            manager.commit().unwrap();
        });

        // Read a slice of the old view after every removal, while the next
        // one runs.
        let mut keys = Vec::new();
        while step_rx.recv().is_ok() {
            for _ in 0..50 {
                if let Some(tuple) = browser.get_next().unwrap() {
                    keys.push(tuple.key);
                }
            }
        }
        keys.extend(keys_forward(&mut browser).unwrap());
        keys
    });
    assert_eq!(keys, (0..1024).collect::<Vec<_>>());

    // A browser opened now sees the new state.
    let mut fresh = table.browse().unwrap();
    let expected: Vec<u64> = (0..10).chain(20..1025).collect();
    assert_eq!(keys_forward(&mut fresh).unwrap(), expected);
    assert_eq!(table.size().unwrap(), 1015);
}

#[test]
fn test_half_read_browser_finishes_old_view() {
    let test = TestManager::new(fanout_four());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..512);

    let mut browser = table.browse().unwrap();
    let mut seen = Vec::new();
    for _ in 0..256 {
        seen.push(browser.get_next().unwrap().unwrap().key);
    }

    // Remove the rest, then insert far more to split and reuse pages.
    for key in 256..512 {
        table.remove(&key).unwrap();
    }
    fill(&table, 10_000..12_000);
    test.manager.commit().unwrap();

    seen.extend(keys_forward(&mut browser).unwrap());
    assert_eq!(seen, (0..512).collect::<Vec<_>>());
    let stats = test.manager.stats().unwrap();
    assert!(stats.shadow_pages > 0);
    assert_eq!(stats.open_snapshots, 1);

    browser.close();
    let stats = test.manager.stats().unwrap();
    assert_eq!(stats.shadow_pages, 0);
    assert_eq!(stats.open_snapshots, 0);
}

#[test]
fn test_browser_survives_rollback() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    fill(&table, 0..50);
    test.manager.commit().unwrap();

    fill(&table, 50..100);
    let mut browser = table.browse().unwrap();
    test.manager.rollback().unwrap();

    assert_eq!(keys_forward(&mut browser).unwrap(), (0..100).collect::<Vec<_>>());
    let mut fresh = table.browse().unwrap();
    assert_eq!(keys_forward(&mut fresh).unwrap(), (0..50).collect::<Vec<_>>());
}

/// Volatile keys are odd; stable keys are multiples of four and never touched.
fn volatile_keys() -> Vec<u64> {
    (0..600).map(|i| i * 2 + 1).collect()
}

#[test]
fn test_many_readers_one_writer() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("numbers", numbers()).unwrap();
    let stable: Vec<u64> = (0..300).map(|i| i * 4).collect();
    fill(&table, stable.iter().copied());
    test.manager.commit().unwrap();

    let volatile = volatile_keys();
    thread::scope(|s| {
        s.spawn(|| {
            // Insert every volatile key in order, then remove them in order,
            // so any consistent view holds a prefix or a suffix of them.
            for (i, key) in volatile.iter().enumerate() {
                table.insert(key, &value_of(*key), false).unwrap();
                if i % 97 == 0 {
                    test.manager.commit().unwrap();
                }
            }
            for (i, key) in volatile.iter().enumerate() {
                table.remove(key).unwrap();
                if i % 89 == 0 {
                    test.manager.commit().unwrap();
                }
            }
            test.manager.commit().unwrap();
        });

        for reader in 0..6u64 {
            let table = &table;
            let stable = &stable;
            let volatile = &volatile;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(reader);
                for _ in 0..25 {
                    let mut browser = table.browse().unwrap();
                    let mut stable_seen = Vec::new();
                    let mut volatile_seen = Vec::new();
                    let mut last = None;
                    while let Some(tuple) = browser.get_next().unwrap() {
                        assert!(last < Some(tuple.key), "keys out of order");
                        assert_eq!(tuple.value, value_of(tuple.key));
                        last = Some(tuple.key);
                        if tuple.key % 4 == 0 {
                            stable_seen.push(tuple.key);
                        } else {
                            volatile_seen.push(tuple.key);
                        }
                        if rng.random_range(0..50) == 0 {
                            thread::yield_now();
                        }
                    }
                    assert_eq!(&stable_seen, stable);
                    assert_consistent(&volatile_seen, volatile);
                }
            });
        }
    });

    assert_eq!(table.size().unwrap(), 300);
    let stats = test.manager.stats().unwrap();
    assert_eq!(stats.open_snapshots, 0);
    assert_eq!(stats.shadow_pages, 0);
}

/// `seen` must be a contiguous run of `all` that starts at its beginning or
/// ends at its end.
fn assert_consistent(seen: &[u64], all: &[u64]) {
    if seen.is_empty() {
        return;
    }
    let start = all
        .iter()
        .position(|key| *key == seen[0])
        .expect("volatile key from the writer");
    assert_eq!(all.get(start..start + seen.len()), Some(seen), "torn view");
    assert!(
        start == 0 || start + seen.len() == all.len(),
        "view holds neither a prefix nor a suffix"
    );
}

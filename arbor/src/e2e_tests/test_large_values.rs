//! Test values far larger than a page and keys at the size limit.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::TestManager;
use crate::storage::btree::max_key_size;
use crate::storage::{BytesSerializer, NaturalOrder, StoreError, TableSchema};
use crate::testing::small_options;

fn bytes_schema() -> TableSchema<Vec<u8>, Vec<u8>> {
    TableSchema::new(BytesSerializer, BytesSerializer, NaturalOrder)
}

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.random()).collect()
}

#[test]
fn test_large_values_round_trip_and_persist() {
    let mut test = TestManager::new(small_options());
    let mut rng = StdRng::seed_from_u64(51);
    let values: Vec<Vec<u8>> = [0, 1, 100, 511, 512, 4096, 70_000]
        .iter()
        .map(|len| random_bytes(&mut rng, *len))
        .collect();

    let table = test.manager.table("blobs", bytes_schema()).unwrap();
    for (i, value) in values.iter().enumerate() {
        table.insert(&vec![i as u8], value, false).unwrap();
    }
    for (i, value) in values.iter().enumerate() {
        assert_eq!(table.find(&vec![i as u8]).unwrap().as_ref(), Some(value));
    }

    test.reopen();
    let table = test.manager.table("blobs", bytes_schema()).unwrap();
    let browsed: Vec<Vec<u8>> = table
        .browse()
        .unwrap()
        .map(|tuple| tuple.unwrap().value)
        .collect();
    assert_eq!(browsed, values);
}

#[test]
fn test_replace_between_inline_and_overflow() {
    let test = TestManager::new(small_options());
    let mut rng = StdRng::seed_from_u64(52);
    let table = test.manager.table("blobs", bytes_schema()).unwrap();
    let key = b"k".to_vec();
    let big = random_bytes(&mut rng, 3000);
    let bigger = random_bytes(&mut rng, 9000);

    table.insert(&key, &b"small".to_vec(), false).unwrap();
    assert_eq!(
        table.insert(&key, &big, true).unwrap(),
        Some(b"small".to_vec())
    );
    assert_eq!(table.insert(&key, &bigger, true).unwrap(), Some(big));
    assert_eq!(
        table.insert(&key, &b"tiny".to_vec(), true).unwrap(),
        Some(bigger)
    );
    assert_eq!(table.find(&key).unwrap(), Some(b"tiny".to_vec()));
    assert_eq!(table.remove(&key).unwrap(), Some(b"tiny".to_vec()));
    assert_eq!(table.size().unwrap(), 0);
}

#[test]
fn test_key_size_limit() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("blobs", bytes_schema()).unwrap();
    let max = max_key_size(test.manager.page_size());

    let largest = vec![b'a'; max];
    table.insert(&largest, &vec![1; 1000], false).unwrap();
    assert_eq!(table.find(&largest).unwrap(), Some(vec![1; 1000]));

    let too_large = vec![b'b'; max + 1];
    let err = table.insert(&too_large, &vec![2], false).unwrap_err();
    assert!(matches!(err, StoreError::KeyTooLarge { size, .. } if size == max + 1));
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn test_many_max_size_keys_split_cleanly() {
    let test = TestManager::new(small_options());
    let table = test.manager.table("blobs", bytes_schema()).unwrap();
    let max = max_key_size(test.manager.page_size());
    table.set_page_size(64).unwrap();

    let keys: Vec<Vec<u8>> = (0..200u16)
        .map(|i| {
            let mut key = vec![b'x'; max];
            key[..2].copy_from_slice(&i.to_be_bytes());
            key
        })
        .collect();
    for key in keys.iter().rev() {
        table.insert(key, &key[..2].to_vec(), false).unwrap();
    }

    let browsed: Vec<Vec<u8>> = table
        .browse()
        .unwrap()
        .map(|tuple| tuple.unwrap().key)
        .collect();
    assert_eq!(browsed, keys);
}

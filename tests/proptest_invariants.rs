//! Property-based coverage of the store's core round-trip, ordering, and
//! count invariants against randomized key/value workloads.

use std::collections::BTreeMap;

use arbokv::{Config, Database};
use proptest::prelude::*;

fn small_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', b'd', b'/']), 1..6)
}

fn small_value() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..16)
}

proptest! {
    /// After any sequence of upserts/removes, `get`/`get_size`/`count_keys`
    /// against the final model state agree with a `BTreeMap` shadow.
    #[test]
    fn upsert_remove_sequence_matches_btreemap_model(
        ops in prop::collection::vec((small_key(), small_value(), any::<bool>()), 1..200)
    ) {
        let db = Database::create_anon(Config::default()).unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        {
            let mut txn = db.write_txn(0).unwrap();
            for (key, value, is_remove) in &ops {
                if *is_remove {
                    txn.remove(key).unwrap();
                    model.remove(key);
                } else {
                    txn.upsert(key, value).unwrap();
                    model.insert(key.clone(), value.clone());
                }
            }
            txn.commit().unwrap();
        }

        let read = db.read_txn(0).unwrap();
        prop_assert_eq!(read.count_keys().unwrap(), model.len() as u64);
        for (key, value) in &model {
            prop_assert_eq!(read.get(key).unwrap(), Some(value.clone()));
            prop_assert_eq!(read.get_size(key).unwrap(), Some(value.len()));
        }

        let observed: Vec<Vec<u8>> = read.iter().unwrap().map(|r| r.unwrap().0).collect();
        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        prop_assert_eq!(observed.clone(), expected.clone());

        let observed_rev: Vec<Vec<u8>> = read.iter_rev().unwrap().map(|r| r.unwrap().0).collect();
        let mut expected_rev = expected;
        expected_rev.reverse();
        prop_assert_eq!(observed_rev, expected_rev);
    }

    /// `lower_bound(lo)` always yields exactly the model's keys `>= lo`,
    /// in ascending order, regardless of where `lo` falls relative to the
    /// inserted keys.
    #[test]
    fn lower_bound_matches_model_suffix(
        entries in prop::collection::btree_map(small_key(), small_value(), 0..100),
        lo in small_key(),
    ) {
        let db = Database::create_anon(Config::default()).unwrap();
        {
            let mut txn = db.write_txn(0).unwrap();
            for (key, value) in &entries {
                txn.upsert(key, value).unwrap();
            }
            txn.commit().unwrap();
        }

        let read = db.read_txn(0).unwrap();
        let observed: Vec<Vec<u8>> = read.lower_bound(&lo).unwrap().map(|r| r.unwrap().0).collect();
        let expected: Vec<Vec<u8>> = entries.keys().filter(|k| k.as_slice() >= lo.as_slice()).cloned().collect();
        prop_assert_eq!(observed, expected);
    }

    /// `count_keys_range(lo, hi)` agrees with the model's count of keys
    /// in `[lo, hi)` for arbitrary `lo <= hi`.
    #[test]
    fn count_keys_range_matches_model(
        entries in prop::collection::btree_map(small_key(), small_value(), 0..100),
        a in small_key(),
        b in small_key(),
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let db = Database::create_anon(Config::default()).unwrap();
        {
            let mut txn = db.write_txn(0).unwrap();
            for (key, value) in &entries {
                txn.upsert(key, value).unwrap();
            }
            txn.commit().unwrap();
        }

        let read = db.read_txn(0).unwrap();
        let observed = read.count_keys_range(&lo, &hi).unwrap();
        let expected = entries.keys().filter(|k| k.as_slice() >= lo.as_slice() && k.as_slice() < hi.as_slice()).count() as u64;
        prop_assert_eq!(observed, expected);
    }
}

//! End-to-end coverage of the round-trip, ordering, and count invariants
//! against a whole [`Database`], as opposed to the unit tests living
//! alongside each module that exercise one function in isolation.

use std::sync::Arc;
use std::thread;

use arbokv::{Config, Database};

/// Large ascending-key insert/lookup round trip: every key inserted is
/// readable afterward, and `count_keys` matches the number inserted.
#[test]
fn large_ascending_insert_round_trips_and_counts() {
    let db = Database::create_anon(Config::default()).unwrap();
    const N: u32 = 5_000;

    {
        let mut txn = db.write_txn(0).unwrap();
        for i in 0..N {
            let key = format!("key/{i:08}");
            txn.insert(key.as_bytes(), key.as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    let read = db.read_txn(0).unwrap();
    for i in 0..N {
        let key = format!("key/{i:08}");
        assert_eq!(read.get(key.as_bytes()).unwrap(), Some(key.clone().into_bytes()));
        assert_eq!(read.get_size(key.as_bytes()).unwrap(), Some(key.len()));
    }
    assert_eq!(read.count_keys().unwrap(), N as u64);
}

/// Overlapping-prefix keys ("hello"/"help"/"helmet") diverge into a
/// prefix-compressed subtree without losing any of the three values, and
/// the ascending cursor still visits them in byte order.
#[test]
fn overlapping_prefixes_split_and_preserve_all_values() {
    let db = Database::create_anon(Config::default()).unwrap();

    {
        let mut txn = db.write_txn(0).unwrap();
        txn.insert(b"hello", b"1").unwrap();
        txn.insert(b"help", b"2").unwrap();
        txn.insert(b"helmet", b"3").unwrap();
        txn.commit().unwrap();
    }

    let read = db.read_txn(0).unwrap();
    assert_eq!(read.get(b"hello").unwrap(), Some(b"1".to_vec()));
    assert_eq!(read.get(b"help").unwrap(), Some(b"2".to_vec()));
    assert_eq!(read.get(b"helmet").unwrap(), Some(b"3".to_vec()));
    assert_eq!(read.get(b"hel").unwrap(), None);
    assert_eq!(read.count_keys().unwrap(), 3);

    let keys: Vec<Vec<u8>> = read.iter().unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(keys, vec![b"hello".to_vec(), b"helmet".to_vec(), b"help".to_vec()]);

    let rev_keys: Vec<Vec<u8>> = read.iter_rev().unwrap().map(|r| r.unwrap().0).collect();
    let mut expected_rev = keys.clone();
    expected_rev.reverse();
    assert_eq!(rev_keys, expected_rev);
}

/// A subtree stored as a value under one key is reachable by
/// `get_subtree`/`read_subtree` and behaves like an independent,
/// self-contained trie.
#[test]
fn subtree_value_is_reachable_as_its_own_root() {
    let db = Database::create_anon(Config::default()).unwrap();

    let subtree_root = {
        let mut sub_txn = db.write_txn(1).unwrap();
        sub_txn.insert(b"a", b"1").unwrap();
        sub_txn.insert(b"b", b"2").unwrap();
        sub_txn.commit().unwrap()
    };

    {
        let mut txn = db.write_txn(0).unwrap();
        txn.upsert_subtree(b"nested", subtree_root).unwrap();
        txn.commit().unwrap();
    }

    let outer = db.read_txn(0).unwrap();
    assert_eq!(outer.get(b"nested").unwrap(), None, "a subtree key is not a plain value");
    let resolved = outer.get_subtree(b"nested").unwrap().expect("subtree key present");
    assert_eq!(resolved, subtree_root);

    let inner = db.read_subtree(resolved);
    assert_eq!(inner.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(inner.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(inner.count_keys().unwrap(), 2);
}

/// Repeated overwrites of the same key leave `get`/`get_size` consistent
/// with the most recent write and `count_keys` unchanged by pure updates.
#[test]
fn repeated_overwrite_keeps_get_and_size_consistent() {
    let db = Database::create_anon(Config::default()).unwrap();

    {
        let mut txn = db.write_txn(0).unwrap();
        for i in 0..200u32 {
            let key = format!("item/{i}");
            txn.upsert(key.as_bytes(), b"short").unwrap();
        }
        txn.commit().unwrap();
    }
    assert_eq!(db.read_txn(0).unwrap().count_keys().unwrap(), 200);

    {
        let mut txn = db.write_txn(0).unwrap();
        for i in 0..200u32 {
            let key = format!("item/{i}");
            let value = format!("a much longer replacement value for slot {i}");
            txn.upsert(key.as_bytes(), value.as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    let read = db.read_txn(0).unwrap();
    assert_eq!(read.count_keys().unwrap(), 200, "overwrites must not change the live key count");
    for i in 0..200u32 {
        let key = format!("item/{i}");
        let value = format!("a much longer replacement value for slot {i}");
        assert_eq!(read.get(key.as_bytes()).unwrap(), Some(value.clone().into_bytes()));
        assert_eq!(read.get_size(key.as_bytes()).unwrap(), Some(value.len()));
    }
}

/// A committed write transaction's effects survive a clean close and a
/// fresh open of the same on-disk directory.
#[test]
fn committed_writes_survive_a_clean_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(dir.path(), Config::default()).unwrap();
        let mut txn = db.write_txn(0).unwrap();
        for i in 0..50u32 {
            let key = format!("durable/{i}");
            txn.insert(key.as_bytes(), key.as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    } // clean drop flushes the header

    let db = Database::open(dir.path(), Config::default()).unwrap();
    let read = db.read_txn(0).unwrap();
    assert_eq!(read.count_keys().unwrap(), 50);
    for i in 0..50u32 {
        let key = format!("durable/{i}");
        assert_eq!(read.get(key.as_bytes()).unwrap(), Some(key.into_bytes()));
    }
}

/// Concurrent readers walking `lower_bound` against a snapshot keep
/// seeing a stable, fully-ordered view even while a writer is committing
/// further batches against the same slot.
#[test]
fn concurrent_readers_observe_stable_ordered_snapshots() {
    let db = Arc::new(Database::create_anon(Config::default()).unwrap());

    {
        let mut txn = db.write_txn(0).unwrap();
        for i in 0..1_000u32 {
            let key = format!("r/{i:06}");
            txn.insert(key.as_bytes(), key.as_bytes()).unwrap();
        }
        txn.commit().unwrap();
    }

    let reader_handles: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                let snapshot = db.read_txn(0).unwrap();
                let before: Vec<Vec<u8>> = snapshot
                    .lower_bound(b"r/000500")
                    .unwrap()
                    .map(|r| r.unwrap().0)
                    .collect();
                assert!(before.windows(2).all(|w| w[0] < w[1]), "lower_bound must yield ascending keys");
                assert_eq!(before.first(), Some(&b"r/000500".to_vec()));

                // The writer below may commit additional keys concurrently,
                // but this snapshot's own view must not change underfoot.
                thread::sleep(std::time::Duration::from_millis(5));
                let after: Vec<Vec<u8>> = snapshot
                    .lower_bound(b"r/000500")
                    .unwrap()
                    .map(|r| r.unwrap().0)
                    .collect();
                assert_eq!(before, after);
            })
        })
        .collect();

    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            let mut txn = db.write_txn(0).unwrap();
            for i in 1_000..1_100u32 {
                let key = format!("r/{i:06}");
                txn.insert(key.as_bytes(), key.as_bytes()).unwrap();
            }
            txn.commit().unwrap();
        })
    };

    for handle in reader_handles {
        handle.join().unwrap();
    }
    writer.join().unwrap();

    let final_read = db.read_txn(0).unwrap();
    assert_eq!(final_read.count_keys().unwrap(), 1_100);
    assert_eq!(final_read.count_keys_range(b"r/001000", b"r/001100").unwrap(), 100);
}

//! arbokv basic usage demo
//!
//! Opens an anonymous (in-memory) database, runs a write transaction
//! followed by a read transaction, and shows a snapshot read staying
//! stable across a concurrent commit.

use arbokv::{Config, Database};

fn main() {
    tracing_subscriber::fmt::init();

    demo_insert_and_read();
    demo_update_and_remove();
    demo_snapshot_isolation();

    println!("\nDemo completed!");
}

/// Example 1: insert a handful of keys and read them back.
fn demo_insert_and_read() {
    println!("=== Example 1: Insert and read ===\n");

    let db = Database::create_anon(Config::default()).expect("open anonymous database");

    {
        let mut txn = db.write_txn(0).expect("begin write transaction");
        txn.insert(b"users/1", b"alice").unwrap();
        txn.insert(b"users/2", b"bob").unwrap();
        txn.commit().unwrap();
    }

    let txn = db.read_txn(0).expect("begin read transaction");
    println!("users/1 = {:?}", txn.get(b"users/1").unwrap());
    println!("users/2 = {:?}", txn.get(b"users/2").unwrap());
    println!("users/3 = {:?}\n", txn.get(b"users/3").unwrap());
}

/// Example 2: update an existing key and remove another.
fn demo_update_and_remove() {
    println!("=== Example 2: Update and remove ===\n");

    let db = Database::create_anon(Config::default()).expect("open anonymous database");

    {
        let mut txn = db.write_txn(0).unwrap();
        txn.insert(b"counter", b"1").unwrap();
        txn.commit().unwrap();
    }
    {
        let mut txn = db.write_txn(0).unwrap();
        txn.update(b"counter", b"2").unwrap();
        txn.commit().unwrap();
    }

    let txn = db.read_txn(0).unwrap();
    println!("counter = {:?}", txn.get(b"counter").unwrap());

    {
        let mut txn = db.write_txn(0).unwrap();
        txn.remove(b"counter").unwrap();
        txn.commit().unwrap();
    }
    let txn = db.read_txn(0).unwrap();
    println!("counter after remove = {:?}\n", txn.get(b"counter").unwrap());
}

/// Example 3: a read transaction keeps observing its start-time snapshot
/// even after a later write transaction commits a new value.
fn demo_snapshot_isolation() {
    println!("=== Example 3: Snapshot isolation ===\n");

    let db = Database::create_anon(Config::default()).unwrap();

    {
        let mut txn = db.write_txn(0).unwrap();
        txn.insert(b"key", b"v1").unwrap();
        txn.commit().unwrap();
    }

    let snapshot = db.read_txn(0).unwrap();
    println!("snapshot sees: {:?}", snapshot.get(b"key").unwrap());

    {
        let mut txn = db.write_txn(0).unwrap();
        txn.update(b"key", b"v2").unwrap();
        txn.commit().unwrap();
    }

    println!("snapshot still sees: {:?}", snapshot.get(b"key").unwrap());
    let fresh = db.read_txn(0).unwrap();
    println!("a fresh read sees: {:?}\n", fresh.get(b"key").unwrap());
}

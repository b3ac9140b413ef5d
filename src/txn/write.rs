//! Write transactions: at most one writer active per top-root slot,
//! enforced by holding that slot's writer mutex for the transaction's
//! whole lifetime.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::cbt::Address;
use crate::compactor::eligibility::SegmentMetaTable;
use crate::config::Config;
use crate::epoch::EpochTracker;
use crate::error::Result;
use crate::segment::heap::SegmentHeap;
use crate::segment::log::SegmentWriter;
use crate::trie::{self, refcount, NodeStore, Op};
use crate::txn::root_table::RootTable;

/// A single in-flight write against one root slot. Holds that slot's
/// writer mutex (and its persistent [`SegmentWriter`] session) until
/// `commit` or `abort` — or an unattended drop, which behaves like
/// `abort`.
pub struct WriteTxn<'a> {
    store: NodeStore,
    writer: MutexGuard<'a, Option<SegmentWriter>>,
    roots: &'a RootTable,
    slot: u32,
    root: Address,
    key_count_delta: i64,
    committed: bool,
}

impl<'a> WriteTxn<'a> {
    /// Begin a write transaction on `slot`, blocking until its writer
    /// mutex is free. The slot's [`SegmentWriter`] session is opened on
    /// first use and then kept alive across every future transaction on
    /// this slot, rather than sealed and replaced each commit.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        store: NodeStore,
        heap: Arc<SegmentHeap>,
        epoch: Arc<EpochTracker>,
        meta: Arc<SegmentMetaTable>,
        config: &Config,
        roots: &'a RootTable,
        slot: u32,
    ) -> Result<Self> {
        let mut writer = roots.lock_writer(slot)?;
        if writer.is_none() {
            *writer = Some(SegmentWriter::new(heap, epoch, meta, config.sync_mode)?);
        }
        let root = roots.current(slot)?;
        Ok(Self {
            store,
            writer,
            roots,
            slot,
            root,
            key_count_delta: 0,
            committed: false,
        })
    }

    /// Root Address this transaction currently sees, reflecting any of
    /// its own uncommitted mutations so far.
    pub fn root(&self) -> Address {
        self.root
    }

    /// Net change in live key count produced by this transaction so far.
    pub fn key_count_delta(&self) -> i64 {
        self.key_count_delta
    }

    fn apply(&mut self, key: &[u8], op: Op) -> Result<()> {
        let writer = self.writer.as_mut().expect("writer session populated at begin()");
        let result = trie::apply(&self.store, writer, self.root, key, op)?;
        self.root = result.new_root;
        self.key_count_delta += result.delta_keys;
        Ok(())
    }

    /// Insert `key`; fails with `TxnError::KeyExists` if already present.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(key, Op::Insert(value))
    }

    /// Replace `key`'s value; fails with `TxnError::KeyNotFound` if absent.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(key, Op::Update(value))
    }

    /// Insert or replace `key` unconditionally.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(key, Op::Upsert(value))
    }

    /// Remove `key` if present; a no-op otherwise.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.apply(key, Op::Remove)
    }

    /// Remove `key`; fails with `TxnError::KeyNotFound` if absent.
    pub fn must_remove(&mut self, key: &[u8]) -> Result<()> {
        self.apply(key, Op::MustRemove)
    }

    /// Insert or replace `key` unconditionally, storing a reference to an
    /// already-built subtree root rather than raw bytes. Retains its own
    /// strong reference to `subtree_root`; the caller's existing reference
    /// to it is untouched and remains the caller's responsibility.
    pub fn upsert_subtree(&mut self, key: &[u8], subtree_root: Address) -> Result<()> {
        self.apply(key, Op::UpsertSubtree(subtree_root))
    }

    /// Look up `key` against this transaction's own in-flight root,
    /// observing its own uncommitted writes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        trie::get(&self.store, self.root, key)
    }

    /// Look up `key` as a subtree reference rather than a plain value, or
    /// `None` if absent or not a subtree.
    pub fn get_subtree(&self, key: &[u8]) -> Result<Option<Address>> {
        trie::read::get_subtree(&self.store, self.root, key)
    }

    /// `key`'s value length against this transaction's own in-flight
    /// root, without materializing an out-of-line value's bytes.
    pub fn get_size(&self, key: &[u8]) -> Result<Option<usize>> {
        trie::read::get_size(&self.store, self.root, key)
    }

    /// Count of live keys against this transaction's own in-flight root.
    pub fn count_keys(&self) -> Result<u64> {
        trie::read::count_keys(&self.store, self.root)
    }

    /// Count of live keys in `[lo, hi)` against this transaction's own
    /// in-flight root.
    pub fn count_keys_range(&self, lo: &[u8], hi: &[u8]) -> Result<u64> {
        trie::read::count_keys_range(&self.store, self.root, lo, hi)
    }

    /// Ascending cursor over this transaction's own in-flight root,
    /// observing its own uncommitted writes.
    pub fn iter(&self) -> Result<trie::read::Cursor> {
        trie::read::ascending(self.store.clone(), self.root)
    }

    /// Descending cursor over this transaction's own in-flight root,
    /// visiting the same entries as [`WriteTxn::iter`] in reverse order.
    pub fn iter_rev(&self) -> Result<trie::read::Cursor> {
        trie::read::descending(self.store.clone(), self.root)
    }

    /// Ascending cursor starting at the first key `>= lo` against this
    /// transaction's own in-flight root.
    pub fn lower_bound(&self, lo: &[u8]) -> Result<trie::read::Cursor> {
        trie::read::lower_bound(self.store.clone(), self.root, lo)
    }

    /// Sync the slot's dirty segment bytes per the configured sync
    /// policy, atomically publish the new root, and release the superseded
    /// root's subtree. Returns the root Address this transaction replaced.
    pub fn commit(mut self) -> Result<Address> {
        self.writer
            .as_mut()
            .expect("writer session populated at begin()")
            .sync_now()?;
        let previous = self.roots.publish(self.slot, self.root);
        if previous != self.root {
            refcount::release_subtree(&self.store, previous)?;
        }
        self.committed = true;
        Ok(previous)
    }

    /// Abandon this transaction. Releasing the writer mutex and unwinding
    /// the refcount graph of any new, never-published Address happens in
    /// [`Drop`], so an unattended drop behaves identically.
    pub fn abort(self) {}
}

impl<'a> Drop for WriteTxn<'a> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Ok(published) = self.roots.current(self.slot) {
            if published != self.root {
                let _ = refcount::release_subtree(&self.store, self.root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::ControlBlockTable;
    use crate::compactor::eligibility::SegmentMetaTable;
    use crate::config::Config;
    use crate::node::{LeafNode, NodeBody};
    use crate::segment::heap::SegmentHeap;

    fn harness() -> (NodeStore, Arc<SegmentHeap>, Arc<EpochTracker>, Arc<SegmentMetaTable>, Config, RootTable) {
        let heap = Arc::new(SegmentHeap::anon(4).unwrap());
        let cbt = Arc::new(ControlBlockTable::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let epoch = Arc::new(EpochTracker::new());
        let config = Config::default();
        let store = NodeStore::new(heap.clone(), cbt);

        let mut boot_writer = SegmentWriter::new(heap.clone(), epoch.clone(), meta.clone(), config.sync_mode).unwrap();
        let empty = store.allocate(&mut boot_writer, &NodeBody::Leaf(LeafNode::default())).unwrap();
        drop(boot_writer);

        let roots = RootTable::new(empty, 4);
        (store, heap, epoch, meta, config, roots)
    }

    #[test]
    fn commit_publishes_new_root_and_is_visible_to_next_txn() {
        let (store, heap, epoch, meta, config, roots) = harness();

        let mut txn = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        txn.insert(b"a", b"1").unwrap();
        assert_eq!(txn.key_count_delta(), 1);
        txn.commit().unwrap();

        let txn2 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        assert_eq!(txn2.get(b"a").unwrap(), Some(b"1".to_vec()));
        txn2.abort();
    }

    #[test]
    fn abort_leaves_published_root_untouched() {
        let (store, heap, epoch, meta, config, roots) = harness();

        let mut txn = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        txn.insert(b"a", b"1").unwrap();
        txn.abort();

        let txn2 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        assert_eq!(txn2.get(b"a").unwrap(), None);
        txn2.abort();
    }

    #[test]
    fn dropped_without_commit_behaves_like_abort() {
        let (store, heap, epoch, meta, config, roots) = harness();

        {
            let mut txn = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
            txn.insert(b"a", b"1").unwrap();
            // dropped here without commit() or abort()
        }

        let txn2 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        assert_eq!(txn2.get(b"a").unwrap(), None);
        txn2.abort();
    }

    #[test]
    fn separate_slots_admit_independent_writers() {
        let (store, heap, epoch, meta, config, roots) = harness();

        let mut t0 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        let mut t1 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 1).unwrap();
        t0.insert(b"x", b"0").unwrap();
        t1.insert(b"x", b"1").unwrap();
        t0.commit().unwrap();
        t1.commit().unwrap();

        let r0 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 0).unwrap();
        let r1 = WriteTxn::begin(store.clone(), heap.clone(), epoch.clone(), meta.clone(), &config, &roots, 1).unwrap();
        assert_eq!(r0.get(b"x").unwrap(), Some(b"0".to_vec()));
        assert_eq!(r1.get(b"x").unwrap(), Some(b"1".to_vec()));
        r0.abort();
        r1.abort();
    }
}

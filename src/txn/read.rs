//! Read transactions: captures the Address currently published in a
//! given top-root slot at `start()` time. Because it holds a strong
//! reference to that Address, no descendant can be freed while it lives.

use std::sync::Arc;

use crate::cbt::Address;
use crate::epoch::EpochTracker;
use crate::error::Result;
use crate::trie::{self, refcount, NodeStore};
use crate::txn::root_table::RootTable;

/// A read-only snapshot of one root slot, pinned for the transaction's
/// lifetime by a retained strong reference.
pub struct ReadTxn {
    store: NodeStore,
    epoch: Arc<EpochTracker>,
    session_id: u64,
    root: Address,
}

impl ReadTxn {
    /// Capture `slot`'s current root and retain it, and register with the
    /// epoch tracker so no segment this transaction might still be
    /// reading from is recycled out from under it.
    pub fn start(store: NodeStore, epoch: Arc<EpochTracker>, roots: &RootTable, slot: u32) -> Result<Self> {
        let session_id = epoch.register_session();
        let root = roots.current(slot)?;
        store.retain(root);
        Ok(Self {
            store,
            epoch,
            session_id,
            root,
        })
    }

    /// Open a read snapshot directly on an arbitrary root Address rather
    /// than a published top-root slot — used to descend into a subtree
    /// Address returned by [`ReadTxn::get_subtree`] or
    /// [`crate::txn::write::WriteTxn::get_subtree`].
    pub fn at_root(store: NodeStore, epoch: Arc<EpochTracker>, root: Address) -> Self {
        let session_id = epoch.register_session();
        store.retain(root);
        Self {
            store,
            epoch,
            session_id,
            root,
        }
    }

    /// The root Address this transaction observes; stable for its whole
    /// lifetime regardless of concurrent writers.
    pub fn root(&self) -> Address {
        self.root
    }

    /// Look up `key`, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        trie::get(&self.store, self.root, key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        trie::read::contains(&self.store, self.root, key)
    }

    /// Look up `key` as a subtree reference rather than a plain value, or
    /// `None` if absent or not a subtree. The returned Address is a root
    /// valid for the lifetime of this transaction's snapshot.
    pub fn get_subtree(&self, key: &[u8]) -> Result<Option<Address>> {
        trie::read::get_subtree(&self.store, self.root, key)
    }

    /// `key`'s value length without materializing an out-of-line value's
    /// bytes, or `None` if absent.
    pub fn get_size(&self, key: &[u8]) -> Result<Option<usize>> {
        trie::read::get_size(&self.store, self.root, key)
    }

    /// Count of live keys visible in this snapshot.
    pub fn count_keys(&self) -> Result<u64> {
        trie::read::count_keys(&self.store, self.root)
    }

    /// Count of live keys in `[lo, hi)` visible in this snapshot.
    pub fn count_keys_range(&self, lo: &[u8], hi: &[u8]) -> Result<u64> {
        trie::read::count_keys_range(&self.store, self.root, lo, hi)
    }

    /// Ascending cursor over every plain key/value pair in this snapshot.
    pub fn iter(&self) -> Result<trie::read::Cursor> {
        trie::read::ascending(self.store.clone(), self.root)
    }

    /// Descending cursor over every plain key/value pair in this
    /// snapshot, visiting the same entries as [`ReadTxn::iter`] in
    /// reverse order.
    pub fn iter_rev(&self) -> Result<trie::read::Cursor> {
        trie::read::descending(self.store.clone(), self.root)
    }

    /// Ascending cursor starting at the first key `>= lo` in this
    /// snapshot.
    pub fn lower_bound(&self, lo: &[u8]) -> Result<trie::read::Cursor> {
        trie::read::lower_bound(self.store.clone(), self.root, lo)
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        let _ = refcount::release_subtree(&self.store, self.root);
        self.epoch.unregister_session(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::ControlBlockTable;
    use crate::compactor::eligibility::SegmentMetaTable;
    use crate::config::SyncMode;
    use crate::node::{LeafNode, NodeBody};
    use crate::segment::heap::SegmentHeap;
    use crate::segment::log::SegmentWriter;
    use crate::trie::mutate::{apply, Op};

    #[test]
    fn read_txn_observes_root_as_of_start() {
        let heap = Arc::new(SegmentHeap::anon(1).unwrap());
        let cbt = Arc::new(ControlBlockTable::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let epoch = Arc::new(EpochTracker::new());
        let mut writer = SegmentWriter::new(heap.clone(), epoch.clone(), meta, SyncMode::None).unwrap();
        let store = NodeStore::new(heap, cbt);

        let empty = store.allocate(&mut writer, &NodeBody::Leaf(LeafNode::default())).unwrap();
        let roots = RootTable::new(empty, 1);

        let r1 = apply(&store, &mut writer, roots.current(0).unwrap(), b"k", Op::Insert(b"v1")).unwrap();
        {
            let _guard = roots.lock_writer(0).unwrap();
            roots.publish(0, r1.new_root);
        }

        let txn = ReadTxn::start(store.clone(), epoch.clone(), &roots, 0).unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v1".to_vec()));

        let r2 = apply(&store, &mut writer, roots.current(0).unwrap(), b"k", Op::Upsert(b"v2")).unwrap();
        {
            let _guard = roots.lock_writer(0).unwrap();
            roots.publish(0, r2.new_root);
        }

        // The already-open txn still observes the value as of its start.
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v1".to_vec()));
    }
}

//! Recursive subtree release: when a shared-mode step replaces a branch,
//! the displaced child's subtree must have its refcounts walked down,
//! freeing any control block that hits
//! zero and recursing into *its* children in turn.

use crate::cbt::Address;
use crate::error::Result;
use crate::node::NodeBody;
use crate::trie::store::NodeStore;

/// Release one strong reference to `addr`. If this was the last
/// reference, recursively release every child it held and free the
/// control block.
pub fn release_subtree(store: &NodeStore, addr: Address) -> Result<()> {
    let dropped_to_zero = store.cbt().decrement(addr);
    if !dropped_to_zero {
        return Ok(());
    }
    // The slot is not yet cleared: its location still resolves to the
    // node's bytes, so children can be read before we free it.
    let body = store.resolve(addr)?;
    for child in children_of(&body) {
        release_subtree(store, child)?;
    }
    store.cbt().free_now(addr);
    Ok(())
}

/// Retain every child a node directly references — used when a
/// shared-mode mutation produces a replacement node and the original's
/// children must now be co-owned by both the old and new node, each
/// holding its own independent strong reference.
pub fn retain_children(store: &NodeStore, body: &NodeBody) {
    for child in children_of(body) {
        store.retain(child);
    }
}

fn children_of(body: &NodeBody) -> Vec<Address> {
    match body {
        NodeBody::Inner(inner) => {
            let mut out: Vec<Address> = inner.branches().iter().map(|b| b.child).collect();
            if let Some(eof) = inner.eof_child {
                out.push(eof);
            }
            out
        }
        NodeBody::Leaf(leaf) => leaf
            .entries()
            .iter()
            .filter_map(|entry| match &entry.value {
                crate::node::LeafValue::Spilled {
                    cline_index,
                    slot_index,
                    ..
                }
                | crate::node::LeafValue::Subtree {
                    cline_index,
                    slot_index,
                } => Some(leaf.clines.resolve(*cline_index, *slot_index)),
                crate::node::LeafValue::Inline(_) => None,
            })
            .collect(),
        NodeBody::Value(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::ControlBlockTable;
    use crate::compactor::eligibility::SegmentMetaTable;
    use crate::config::SyncMode;
    use crate::epoch::EpochTracker;
    use crate::node::{LeafNode, LeafValue, ValueNode};
    use crate::segment::heap::SegmentHeap;
    use crate::segment::log::SegmentWriter;
    use std::sync::Arc;

    #[test]
    fn releasing_last_reference_frees_children_too() {
        let heap = Arc::new(SegmentHeap::anon(1).unwrap());
        let cbt = Arc::new(ControlBlockTable::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let epoch = Arc::new(EpochTracker::new());
        let mut writer = SegmentWriter::new(heap.clone(), epoch, meta, SyncMode::None).unwrap();
        let store = NodeStore::new(heap, cbt);

        let value_addr = store
            .allocate(&mut writer, &NodeBody::Value(ValueNode::new(b"spilled".to_vec())))
            .unwrap();

        let mut leaf = LeafNode::default();
        let cline_index = leaf.clines.get_or_insert(value_addr).unwrap();
        leaf.put(
            b"k".to_vec(),
            LeafValue::Spilled {
                cline_index,
                slot_index: value_addr.slot_in_cacheline(),
                len: 7,
            },
        );
        let leaf_addr = store.allocate(&mut writer, &NodeBody::Leaf(leaf)).unwrap();

        release_subtree(&store, leaf_addr).unwrap();

        assert!(store.cbt().try_get(leaf_addr).unwrap().is_freed());
        assert!(store.cbt().try_get(value_addr).unwrap().is_freed());
    }
}

//! Structural growth: splitting an overflowing inner node or leaf, and
//! resolving prefix divergence at an `InnerPrefix` node.

use crate::cbt::Address;
use crate::error::Result;
use crate::node::{InnerNode, LeafNode, NodeBody};
use crate::segment::log::SegmentWriter;
use crate::trie::branch_set::BranchSet;
use crate::trie::refcount::retain_children;
use crate::trie::store::NodeStore;

/// Length of the longest byte sequence shared by every key in `a` and
/// `b` — used both for leaf-entry divergence and for prefix-node
/// divergence against a probe key.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Longest prefix shared by every entry in a leaf about to split. Used
/// to factor a common lead-in out into the wrapping `InnerPrefix` node
/// the split produces, rather than duplicating it in both halves.
fn leaf_shared_prefix(leaf: &LeafNode) -> Vec<u8> {
    let entries = leaf.entries();
    let Some(first) = entries.first() else {
        return Vec::new();
    };
    let mut prefix = first.key.clone();
    for entry in &entries[1..] {
        let len = common_prefix_len(&prefix, &entry.key);
        prefix.truncate(len);
        if prefix.is_empty() {
            break;
        }
    }
    prefix
}

/// Split an overflowing leaf into a new two-child `InnerPrefix` wrapper,
/// returning the wrapper's fresh Address. From the parent's point of
/// view this is a single-edge replacement (`BranchSet::Single`): one
/// leaf Address becomes one inner-node Address that itself owns the two
/// post-split leaves.
pub fn split_leaf(store: &NodeStore, writer: &mut SegmentWriter, leaf: LeafNode) -> Result<Address> {
    let shared = leaf_shared_prefix(&leaf);
    let cp_len = shared.len();
    let pos = leaf.split_position(cp_len);
    let left_key = leaf.entries()[0].key[cp_len];
    let divider = leaf.entries()[pos].key[cp_len];
    let descendants = leaf.len() as u64;
    let (left, right) = leaf.split_at(pos, cp_len);

    let left_body = NodeBody::Leaf(left);
    let right_body = NodeBody::Leaf(right);
    let left_addr = store.allocate(writer, &left_body)?;
    let right_addr = store.allocate_hint(writer, &right_body, &[left_addr])?;

    let mut wrapper = InnerNode::default();
    wrapper.prefix = shared;
    wrapper.put_branch(left_key, left_addr);
    wrapper.put_branch(divider, right_addr);
    wrapper.descendants = descendants;
    let wrapper_addr = store.allocate(writer, &NodeBody::Inner(wrapper))?;
    Ok(wrapper_addr)
}

/// Live key count directly beneath `addr`, used to keep a reconstructed
/// inner node's `descendants` counter exact across a split (an inner
/// node's own `descendants` field is not itself visible without
/// resolving it).
fn child_key_count(store: &NodeStore, addr: Address) -> Result<u64> {
    Ok(match store.resolve(addr)? {
        NodeBody::Inner(inner) => inner.descendants,
        NodeBody::Leaf(leaf) => leaf.len() as u64,
        NodeBody::Value(_) => 1,
    })
}

/// Split an overflowing inner node into siblings that each fit within
/// the cacheline-base capacity a single node's branches can encode
/// against (see [`InnerNode::fits_in_cachelines`]), returning them as a
/// `BranchSet::Multi` for the parent to splice in place of the single
/// edge that overflowed. Ordinarily this produces exactly two pieces; a
/// node whose branches reference more than twice the cacheline capacity
/// fragments further, up to `BranchSet`'s child limit.
pub fn split_inner(store: &NodeStore, writer: &mut SegmentWriter, inner: InnerNode) -> Result<BranchSet> {
    let mut pieces = inner.split_to_fit();
    assert!(pieces.len() >= 2, "an oversized inner node must split into at least two pieces");
    assert!(
        pieces.len() <= crate::trie::branch_set::MAX_BRANCH_SET_CHILDREN,
        "inner node fragmented into more pieces than a single branch_set can carry"
    );

    for piece in &mut pieces {
        piece.descendants = piece
            .branches()
            .iter()
            .map(|b| b.child)
            .chain(piece.eof_child)
            .map(|a| child_key_count(store, a))
            .sum::<Result<u64>>()?;
    }

    let mut dividers = Vec::with_capacity(pieces.len() - 1);
    for piece in &pieces[1..] {
        dividers.push(piece.branches().first().expect("split piece has at least one branch").key);
    }

    let mut children = Vec::with_capacity(pieces.len());
    let mut prev_addr = None;
    for piece in pieces {
        let addr = match prev_addr {
            Some(hint) => store.allocate_hint(writer, &NodeBody::Inner(piece), &[hint])?,
            None => store.allocate(writer, &NodeBody::Inner(piece))?,
        };
        prev_addr = Some(addr);
        children.push(addr);
    }
    Ok(BranchSet::multi(children, dividers))
}

/// Resolve prefix divergence: `node` is an `InnerPrefix` node whose own
/// `prefix` shares only `common_len` leading bytes with the key tail
/// being inserted (shorter than `node.prefix.len()`). Builds a new
/// wrapping node at the common prefix with two children — `node` itself
/// (prefix trimmed to the divergent remainder) and a fresh leaf holding
/// the inserted key's tail — and returns the wrapper's Address.
///
/// `unique` selects whether `node`'s own Address can be reallocated in
/// place (no other root generation can observe it mid-mutation) or must
/// be copied to a fresh Address, retaining co-ownership of its children,
/// leaving the original Address and its content untouched for whatever
/// older snapshot still references it.
#[allow(clippy::too_many_arguments)]
pub fn diverge_prefix(
    store: &NodeStore,
    writer: &mut SegmentWriter,
    existing_addr: Address,
    mut node: InnerNode,
    common_len: usize,
    key_tail: &[u8],
    leaf_for_tail: LeafNode,
    unique: bool,
) -> Result<Address> {
    debug_assert!(common_len < node.prefix.len());
    let divergent_existing_byte = node.prefix[common_len];
    let remaining_prefix = node.prefix[common_len..].to_vec();
    let shared_prefix = node.prefix[..common_len].to_vec();
    let existing_descendants = node.descendants;
    node.prefix = remaining_prefix;

    let existing_child_addr = if unique {
        store.realloc_in_place(writer, existing_addr, &NodeBody::Inner(node))?;
        existing_addr
    } else {
        retain_children(store, &NodeBody::Inner(node.clone()));
        let fresh = store.allocate(writer, &NodeBody::Inner(node))?;
        store.release_one(existing_addr);
        fresh
    };

    let tail_len = leaf_for_tail.len() as u64;
    let new_leaf_addr = store.allocate_hint(writer, &NodeBody::Leaf(leaf_for_tail), &[existing_child_addr])?;
    let new_key_byte = key_tail[common_len];
    debug_assert_ne!(new_key_byte, divergent_existing_byte);

    let mut wrapper = InnerNode::default();
    wrapper.prefix = shared_prefix;
    wrapper.put_branch(divergent_existing_byte, existing_child_addr);
    wrapper.put_branch(new_key_byte, new_leaf_addr);
    wrapper.descendants = existing_descendants + tail_len;
    let wrapper_addr = store.allocate(writer, &NodeBody::Inner(wrapper))?;
    Ok(wrapper_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::ControlBlockTable;
    use crate::compactor::eligibility::SegmentMetaTable;
    use crate::config::SyncMode;
    use crate::epoch::EpochTracker;
    use crate::node::LeafValue;
    use crate::segment::heap::SegmentHeap;
    use std::sync::Arc;

    fn test_store_and_writer() -> (NodeStore, SegmentWriter) {
        let heap = Arc::new(SegmentHeap::anon(1).unwrap());
        let cbt = Arc::new(ControlBlockTable::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let epoch = Arc::new(EpochTracker::new());
        let writer = SegmentWriter::new(heap.clone(), epoch, meta, SyncMode::None).unwrap();
        (NodeStore::new(heap, cbt), writer)
    }

    #[test]
    fn leaf_split_factors_out_shared_prefix() {
        let (store, mut writer) = test_store_and_writer();
        let mut leaf = LeafNode::default();
        leaf.put(b"hello".to_vec(), LeafValue::Inline(b"1".to_vec()));
        leaf.put(b"help".to_vec(), LeafValue::Inline(b"2".to_vec()));
        leaf.put(b"helmet".to_vec(), LeafValue::Inline(b"3".to_vec()));

        let wrapper_addr = split_leaf(&store, &mut writer, leaf).unwrap();
        match store.resolve(wrapper_addr).unwrap() {
            NodeBody::Inner(inner) => {
                assert_eq!(inner.prefix, b"hel");
                assert_eq!(inner.branch_count(), 2);
            }
            _ => panic!("expected inner wrapper"),
        }
    }

    #[test]
    fn inner_split_produces_two_siblings_and_a_divider() {
        let (store, mut writer) = test_store_and_writer();
        let mut inner = InnerNode::default();
        inner.put_branch(b'a', Address::from_raw(10));
        inner.put_branch(b'm', Address::from_raw(20));
        inner.put_branch(b'z', Address::from_raw(30));
        let result = split_inner(&store, &mut writer, inner).unwrap();
        match result {
            BranchSet::Multi { children, dividers } => {
                assert_eq!(children.len(), 2);
                assert_eq!(dividers.len(), 1);
            }
            _ => panic!("expected multi"),
        }
    }

    #[test]
    fn prefix_divergence_wraps_both_children_under_shared_prefix() {
        let (store, mut writer) = test_store_and_writer();
        let mut existing = InnerNode::default();
        existing.prefix = b"hello".to_vec();
        existing.put_branch(b'!', Address::from_raw(99));

        let mut tail_leaf = LeafNode::default();
        tail_leaf.put(b"p".to_vec(), LeafValue::Inline(b"x".to_vec()));

        let existing_addr = store.allocate(&mut writer, &NodeBody::Inner(existing.clone())).unwrap();
        let wrapper_addr = diverge_prefix(
            &store,
            &mut writer,
            existing_addr,
            existing,
            3,
            b"help",
            tail_leaf,
            true,
        )
        .unwrap();

        match store.resolve(wrapper_addr).unwrap() {
            NodeBody::Inner(wrapper) => {
                assert_eq!(wrapper.prefix, b"hel");
                assert_eq!(wrapper.branch_count(), 2);
                assert_eq!(wrapper.child_at_key(b'l'), Some(existing_addr));
            }
            _ => panic!("expected inner wrapper"),
        }
        match store.resolve(existing_addr).unwrap() {
            NodeBody::Inner(shortened) => assert_eq!(shortened.prefix, b"lo"),
            _ => panic!("expected shortened inner"),
        }
    }
}

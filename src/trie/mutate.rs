//! The recursive insert/update/upsert/remove engine.
//!
//! A single recursive function walks from a root Address down to the
//! node that owns the target key, applies the requested operation, and
//! returns a [`BranchSet`] describing what the caller must now place at
//! the edge it recursed through. Every level decides `unique` vs
//! `shared` purely from the live control-block refcount of the node it
//! is about to touch: a node with refcount 1 is reachable from no other
//! root generation and can be rewritten in place (`realloc_in_place`); a
//! node with refcount > 1 must be copied, retaining every untouched
//! child so the old and new node both hold an independent reference.

use crate::cbt::Address;
use crate::config::MAX_KEY_LEN;
use crate::error::{Error, Result, TrieError, TxnError};
use crate::node::cline::ClineTable;
use crate::node::{ApplyMode, InnerNode, LeafNode, LeafValue, NodeBody, ValueNode};
use crate::segment::log::SegmentWriter;
use crate::trie::branch_set::BranchSet;
use crate::trie::refcount;
use crate::trie::split::{self, common_prefix_len};
use crate::trie::store::NodeStore;

/// One of the write operations a transaction can apply to a key.
#[derive(Debug, Clone, Copy)]
pub enum Op<'a> {
    /// Fails with [`TxnError::KeyExists`] if the key is already present.
    Insert(&'a [u8]),
    /// Fails with [`TxnError::KeyNotFound`] if the key is absent.
    Update(&'a [u8]),
    /// Inserts or replaces unconditionally.
    Upsert(&'a [u8]),
    /// No-op if the key is absent.
    Remove,
    /// Fails with [`TxnError::KeyNotFound`] if the key is absent.
    MustRemove,
    /// Inserts or replaces unconditionally, storing a reference to an
    /// already-built subtree root rather than raw bytes. Retains its own
    /// strong reference to `subtree_root`; the caller's existing
    /// reference is untouched.
    UpsertSubtree(Address),
}

/// Where a leaf value's bytes (or nested subtree root) come from, so the
/// inline/spill/subtree classification logic is shared between plain
/// byte values and subtree references.
#[derive(Clone, Copy)]
enum ValueSource<'a> {
    Bytes(&'a [u8]),
    Subtree(Address),
}

/// Outcome of one [`apply`] call: the new root to publish, and the net
/// change in live key count (-1, 0, or +1).
#[derive(Debug, Clone, Copy)]
pub struct MutationResult {
    /// Root Address the caller should install in place of the one it
    /// passed in (may be unchanged, e.g. a no-op `Remove`).
    pub new_root: Address,
    /// Net change in live key count this operation caused.
    pub delta_keys: i64,
}

/// Apply `op` to `key` starting from `root`, returning the new root and
/// key-count delta. `root`'s own reference is consumed: on any change,
/// the caller's hold on `root` is released as part of this call (the
/// returned `new_root` already carries a fresh reference).
pub fn apply(store: &NodeStore, writer: &mut SegmentWriter, root: Address, key: &[u8], op: Op) -> Result<MutationResult> {
    if key.len() > MAX_KEY_LEN {
        return Err(TrieError::KeyTooLarge { len: key.len(), max: MAX_KEY_LEN }.into());
    }
    let (result, delta_keys) = apply_at(store, writer, root, key, &op)?;
    let new_root = match result {
        BranchSet::Single(addr) => {
            if addr != root {
                refcount::release_subtree(store, root)?;
            }
            addr
        }
        BranchSet::Multi { children, dividers } => {
            refcount::release_subtree(store, root)?;
            wrap_root_split(store, writer, children, dividers)?
        }
    };
    Ok(MutationResult { new_root, delta_keys })
}

/// The root itself overflowed and split into two or more siblings with
/// no parent to bubble into; build one fresh top node to hold all of
/// them. The first child's branch key is its own lowest branch key
/// (mirroring how any other parent would already be routing to it);
/// every later child is keyed by the divider `split_inner` assigned it.
fn wrap_root_split(store: &NodeStore, writer: &mut SegmentWriter, children: Vec<Address>, dividers: Vec<u8>) -> Result<Address> {
    debug_assert_eq!(children.len(), dividers.len() + 1);
    let first_key = match store.resolve(children[0])? {
        NodeBody::Inner(inner) => inner.branches().first().map(|b| b.key).unwrap_or(0),
        _ => 0,
    };
    let mut wrapper = InnerNode::default();
    wrapper.put_branch(first_key, children[0]);
    for (divider, child) in dividers.iter().zip(&children[1..]) {
        wrapper.put_branch(*divider, *child);
    }
    let mut descendants = 0u64;
    for child in &children {
        descendants += store.resolve(*child).ok().map(count_of).unwrap_or(0);
    }
    wrapper.descendants = descendants;
    store.allocate(writer, &NodeBody::Inner(wrapper))
}

fn count_of(body: NodeBody) -> u64 {
    match body {
        NodeBody::Inner(inner) => inner.descendants,
        NodeBody::Leaf(leaf) => leaf.len() as u64,
        NodeBody::Value(_) => 1,
    }
}

fn apply_at(store: &NodeStore, writer: &mut SegmentWriter, addr: Address, key: &[u8], op: &Op) -> Result<(BranchSet, i64)> {
    let unique = store.cbt().get(addr).refcount() == 1;
    match store.resolve(addr)? {
        NodeBody::Inner(inner) => apply_inner(store, writer, addr, inner, unique, key, op),
        NodeBody::Leaf(leaf) => apply_leaf(store, writer, addr, leaf, unique, key, op),
        NodeBody::Value(_) => unreachable!("a Value node is never itself a direct trie path node"),
    }
}

fn apply_inner(
    store: &NodeStore,
    writer: &mut SegmentWriter,
    addr: Address,
    mut inner: InnerNode,
    unique: bool,
    key: &[u8],
    op: &Op,
) -> Result<(BranchSet, i64)> {
    let mut key = key;
    if inner.is_prefix_node() {
        let cp = common_prefix_len(key, &inner.prefix);
        if cp < inner.prefix.len() {
            return diverge_for_op(store, writer, addr, inner, unique, key, cp, op);
        }
        key = &key[inner.prefix.len()..];
    }

    if key.is_empty() {
        return apply_eof(store, writer, addr, inner, unique, op);
    }

    let byte = key[0];
    let tail = &key[1..];
    match inner.exact_branch_index(byte) {
        Some(idx) => {
            let old_child = inner.branches()[idx].child;
            let (child_result, delta) = apply_at(store, writer, old_child, tail, op)?;
            if let BranchSet::Single(new_addr) = &child_result {
                if *new_addr == old_child {
                    if delta == 0 {
                        return Ok((BranchSet::Single(addr), delta));
                    }
                    inner.descendants = (inner.descendants as i64 + delta).max(0) as u64;
                    let bs = finish_inner(store, writer, addr, inner, unique, &[])?;
                    return Ok((bs, delta));
                }
            }
            let fresh = child_result.addresses();
            match child_result {
                BranchSet::Single(new_addr) => {
                    inner.remove_branch_at(byte);
                    inner.put_branch(byte, new_addr);
                }
                BranchSet::Multi { children, dividers } => {
                    inner.remove_branch_at(byte);
                    inner.put_branch(byte, children[0]);
                    for (i, divider) in dividers.iter().enumerate() {
                        inner.put_branch(*divider, children[i + 1]);
                    }
                }
            }
            refcount::release_subtree(store, old_child)?;
            inner.descendants = (inner.descendants as i64 + delta).max(0) as u64;
            let bs = finish_inner(store, writer, addr, inner, unique, &fresh)?;
            Ok((bs, delta))
        }
        None => match op {
            Op::Insert(bytes) | Op::Upsert(bytes) => {
                let mut leaf = LeafNode::default();
                let value = make_leaf_value(store, writer, &mut leaf.clines, ValueSource::Bytes(bytes))?
                    .expect("a brand new leaf's cline table cannot already be full");
                leaf.put(tail.to_vec(), value);
                let leaf_addr = store.allocate(writer, &NodeBody::Leaf(leaf))?;
                inner.put_branch(byte, leaf_addr);
                inner.descendants += 1;
                let bs = finish_inner(store, writer, addr, inner, unique, &[leaf_addr])?;
                Ok((bs, 1))
            }
            Op::UpsertSubtree(subtree_root) => {
                let mut leaf = LeafNode::default();
                let value = make_leaf_value(store, writer, &mut leaf.clines, ValueSource::Subtree(*subtree_root))?
                    .expect("a brand new leaf's cline table cannot already be full");
                leaf.put(tail.to_vec(), value);
                let leaf_addr = store.allocate(writer, &NodeBody::Leaf(leaf))?;
                inner.put_branch(byte, leaf_addr);
                inner.descendants += 1;
                let bs = finish_inner(store, writer, addr, inner, unique, &[leaf_addr])?;
                Ok((bs, 1))
            }
            Op::Update(_) | Op::MustRemove => Err(Error::from(TxnError::KeyNotFound)),
            Op::Remove => Ok((BranchSet::Single(addr), 0)),
        },
    }
}

fn diverge_for_op(
    store: &NodeStore,
    writer: &mut SegmentWriter,
    addr: Address,
    inner: InnerNode,
    unique: bool,
    key: &[u8],
    common_len: usize,
    op: &Op,
) -> Result<(BranchSet, i64)> {
    match op {
        Op::Remove => Ok((BranchSet::Single(addr), 0)),
        Op::Update(_) | Op::MustRemove => Err(Error::from(TxnError::KeyNotFound)),
        Op::Insert(bytes) | Op::Upsert(bytes) => {
            let mut tail_leaf = LeafNode::default();
            let value = make_leaf_value(store, writer, &mut tail_leaf.clines, ValueSource::Bytes(bytes))?
                .expect("a brand new leaf's cline table cannot already be full");
            tail_leaf.put(key[common_len + 1..].to_vec(), value);
            let wrapper_addr = split::diverge_prefix(store, writer, addr, inner, common_len, key, tail_leaf, unique)?;
            Ok((BranchSet::Single(wrapper_addr), 1))
        }
        Op::UpsertSubtree(subtree_root) => {
            let mut tail_leaf = LeafNode::default();
            let value = make_leaf_value(store, writer, &mut tail_leaf.clines, ValueSource::Subtree(*subtree_root))?
                .expect("a brand new leaf's cline table cannot already be full");
            tail_leaf.put(key[common_len + 1..].to_vec(), value);
            let wrapper_addr = split::diverge_prefix(store, writer, addr, inner, common_len, key, tail_leaf, unique)?;
            Ok((BranchSet::Single(wrapper_addr), 1))
        }
    }
}

fn apply_eof(
    store: &NodeStore,
    writer: &mut SegmentWriter,
    addr: Address,
    mut inner: InnerNode,
    unique: bool,
    op: &Op,
) -> Result<(BranchSet, i64)> {
    match op {
        Op::Insert(bytes) => {
            if inner.eof_child.is_some() {
                return Err(Error::from(TxnError::KeyExists));
            }
            let new_addr = store.allocate(writer, &NodeBody::Value(ValueNode::new(bytes.to_vec())))?;
            inner.eof_child = Some(new_addr);
            inner.descendants += 1;
            let bs = finish_inner(store, writer, addr, inner, unique, &[new_addr])?;
            Ok((bs, 1))
        }
        Op::Upsert(bytes) => {
            let old = inner.eof_child;
            let new_addr = store.allocate(writer, &NodeBody::Value(ValueNode::new(bytes.to_vec())))?;
            inner.eof_child = Some(new_addr);
            if let Some(old_addr) = old {
                refcount::release_subtree(store, old_addr)?;
            } else {
                inner.descendants += 1;
            }
            let bs = finish_inner(store, writer, addr, inner, unique, &[new_addr])?;
            Ok((bs, if old.is_some() { 0 } else { 1 }))
        }
        Op::Update(bytes) => {
            let Some(old_addr) = inner.eof_child else {
                return Err(Error::from(TxnError::KeyNotFound));
            };
            let new_addr = store.allocate(writer, &NodeBody::Value(ValueNode::new(bytes.to_vec())))?;
            inner.eof_child = Some(new_addr);
            refcount::release_subtree(store, old_addr)?;
            let bs = finish_inner(store, writer, addr, inner, unique, &[new_addr])?;
            Ok((bs, 0))
        }
        Op::UpsertSubtree(subtree_root) => {
            let old = inner.eof_child;
            store.retain(*subtree_root);
            inner.eof_child = Some(*subtree_root);
            if let Some(old_addr) = old {
                refcount::release_subtree(store, old_addr)?;
            } else {
                inner.descendants += 1;
            }
            let bs = finish_inner(store, writer, addr, inner, unique, &[*subtree_root])?;
            Ok((bs, if old.is_some() { 0 } else { 1 }))
        }
        Op::Remove => match inner.eof_child {
            None => Ok((BranchSet::Single(addr), 0)),
            Some(old_addr) => {
                inner.eof_child = None;
                inner.descendants = inner.descendants.saturating_sub(1);
                refcount::release_subtree(store, old_addr)?;
                let bs = finish_inner(store, writer, addr, inner, unique, &[])?;
                Ok((bs, -1))
            }
        },
        Op::MustRemove => {
            let Some(old_addr) = inner.eof_child else {
                return Err(Error::from(TxnError::KeyNotFound));
            };
            inner.eof_child = None;
            inner.descendants = inner.descendants.saturating_sub(1);
            refcount::release_subtree(store, old_addr)?;
            let bs = finish_inner(store, writer, addr, inner, unique, &[])?;
            Ok((bs, -1))
        }
    }
}

/// Commit a structurally-updated inner node: retain untouched siblings
/// if shared, split if its branches no longer fit within one node's
/// cacheline-base capacity, else realloc-in-place (unique) or allocate
/// fresh (shared).
///
/// An inner node's branches are persisted as 1-byte `(cline_index,
/// slot_index)` references into a cacheline-base table built fresh at
/// encode time (see [`crate::node::inner::InnerNode::encode`]), capped
/// at [`crate::node::cline::MAX_CLINES`] distinct bases per node — once
/// a branch's child would need a 17th base, the node must split rather
/// than grow, which is exactly what
/// [`crate::node::inner::InnerNode::fits_in_cachelines`] checks here.
fn finish_inner(
    store: &NodeStore,
    writer: &mut SegmentWriter,
    addr: Address,
    inner: InnerNode,
    unique: bool,
    fresh: &[Address],
) -> Result<BranchSet> {
    if !unique {
        for branch in inner.branches() {
            if !fresh.contains(&branch.child) {
                store.retain(branch.child);
            }
        }
        if let Some(eof) = inner.eof_child {
            if !fresh.contains(&eof) {
                store.retain(eof);
            }
        }
    }
    if !inner.fits_in_cachelines() {
        return split::split_inner(store, writer, inner);
    }
    if unique {
        store.realloc_in_place(writer, addr, &NodeBody::Inner(inner))?;
        Ok(BranchSet::Single(addr))
    } else {
        let new_addr = store.allocate(writer, &NodeBody::Inner(inner))?;
        Ok(BranchSet::Single(new_addr))
    }
}

fn apply_leaf(
    store: &NodeStore,
    writer: &mut SegmentWriter,
    addr: Address,
    mut leaf: LeafNode,
    unique: bool,
    key: &[u8],
    op: &Op,
) -> Result<(BranchSet, i64)> {
    let found = leaf.find(key);
    match op {
        Op::Insert(bytes) => {
            if found.is_ok() {
                return Err(Error::from(TxnError::KeyExists));
            }
            if leaf.can_apply(key.len(), true) == ApplyMode::None {
                return split_and_retry(store, writer, leaf, key, op);
            }
            let value = match make_leaf_value(store, writer, &mut leaf.clines, ValueSource::Bytes(bytes))? {
                Some(v) => v,
                None => return split_and_retry(store, writer, leaf, key, op),
            };
            leaf.put(key.to_vec(), value);
            let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
            Ok((bs, 1))
        }
        Op::Upsert(bytes) => {
            if found.is_ok() {
                if !try_replace_value(store, writer, &mut leaf, key, ValueSource::Bytes(bytes))? {
                    return split_and_retry(store, writer, leaf, key, op);
                }
                let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
                Ok((bs, 0))
            } else {
                if leaf.can_apply(key.len(), true) == ApplyMode::None {
                    return split_and_retry(store, writer, leaf, key, op);
                }
                let value = match make_leaf_value(store, writer, &mut leaf.clines, ValueSource::Bytes(bytes))? {
                    Some(v) => v,
                    None => return split_and_retry(store, writer, leaf, key, op),
                };
                leaf.put(key.to_vec(), value);
                let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
                Ok((bs, 1))
            }
        }
        Op::UpsertSubtree(subtree_root) => {
            if found.is_ok() {
                if !try_replace_value(store, writer, &mut leaf, key, ValueSource::Subtree(*subtree_root))? {
                    return split_and_retry(store, writer, leaf, key, op);
                }
                let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
                Ok((bs, 0))
            } else {
                if leaf.can_apply(key.len(), true) == ApplyMode::None {
                    return split_and_retry(store, writer, leaf, key, op);
                }
                let value = match make_leaf_value(store, writer, &mut leaf.clines, ValueSource::Subtree(*subtree_root))? {
                    Some(v) => v,
                    None => return split_and_retry(store, writer, leaf, key, op),
                };
                leaf.put(key.to_vec(), value);
                let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
                Ok((bs, 1))
            }
        }
        Op::Update(bytes) => {
            if found.is_err() {
                return Err(Error::from(TxnError::KeyNotFound));
            }
            if !try_replace_value(store, writer, &mut leaf, key, ValueSource::Bytes(bytes))? {
                return split_and_retry(store, writer, leaf, key, op);
            }
            let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
            Ok((bs, 0))
        }
        Op::Remove => match found {
            Err(_) => Ok((BranchSet::Single(addr), 0)),
            Ok(_) => {
                let old = leaf.remove(key).expect("find confirmed presence");
                release_out_of_line(store, &mut leaf.clines, &old)?;
                let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
                Ok((bs, -1))
            }
        },
        Op::MustRemove => {
            found.map_err(|_| Error::from(TxnError::KeyNotFound))?;
            let old = leaf.remove(key).expect("find confirmed presence");
            release_out_of_line(store, &mut leaf.clines, &old)?;
            let bs = commit_leaf(store, writer, addr, leaf, unique, key)?;
            Ok((bs, -1))
        }
    }
}

/// Allocate a fresh leaf, splitting the overflowing one behind a new
/// `InnerPrefix` wrapper, and retry the same operation against it. The
/// wrapper is freshly allocated (refcount 1), so the retry always
/// proceeds in `unique` mode.
fn split_and_retry(store: &NodeStore, writer: &mut SegmentWriter, leaf: LeafNode, key: &[u8], op: &Op) -> Result<(BranchSet, i64)> {
    let wrapper_addr = split::split_leaf(store, writer, leaf)?;
    apply_at(store, writer, wrapper_addr, key, op)
}

/// Wrap a value source as the right [`LeafValue`]. For raw bytes: inline
/// if short enough, else allocate an out-of-line [`ValueNode`] and claim
/// a cline slot. For a subtree root: retain it and claim a cline slot
/// directly, with no `ValueNode` allocation. Returns `None` if the value
/// needs a new cacheline base and `clines` has none free — the caller
/// must split instead (any wasted allocation or retain is undone before
/// returning).
fn make_leaf_value(store: &NodeStore, writer: &mut SegmentWriter, clines: &mut ClineTable, source: ValueSource) -> Result<Option<LeafValue>> {
    match source {
        ValueSource::Bytes(bytes) => {
            if LeafNode::classify_value(bytes) {
                return Ok(Some(LeafValue::Inline(bytes.to_vec())));
            }
            let addr = store.allocate(writer, &NodeBody::Value(ValueNode::new(bytes.to_vec())))?;
            match clines.get_or_insert(addr) {
                Some(cline_index) => Ok(Some(LeafValue::Spilled {
                    cline_index,
                    slot_index: addr.slot_in_cacheline(),
                    len: bytes.len() as u32,
                })),
                None => {
                    store.release_one(addr);
                    Ok(None)
                }
            }
        }
        ValueSource::Subtree(addr) => {
            store.retain(addr);
            match clines.get_or_insert(addr) {
                Some(cline_index) => Ok(Some(LeafValue::Subtree {
                    cline_index,
                    slot_index: addr.slot_in_cacheline(),
                })),
                None => {
                    store.release_one(addr);
                    Ok(None)
                }
            }
        }
    }
}

/// Replace the value at an already-present `key`, probing cline
/// capacity on a scratch copy first so a full table can still fall back
/// to a split without having torn down the old entry. Returns `false`
/// (leaf left untouched) when a split is needed instead.
fn try_replace_value(store: &NodeStore, writer: &mut SegmentWriter, leaf: &mut LeafNode, key: &[u8], source: ValueSource) -> Result<bool> {
    let idx = leaf.find(key).expect("caller already confirmed the key exists");
    let old_value = leaf.entries()[idx].value.clone();
    let old_ref = match &old_value {
        LeafValue::Spilled { cline_index, slot_index, .. } => Some((leaf.clines.resolve(*cline_index, *slot_index), false)),
        LeafValue::Subtree { cline_index, slot_index } => Some((leaf.clines.resolve(*cline_index, *slot_index), true)),
        LeafValue::Inline(_) => None,
    };

    let mut probe = leaf.clines.clone();
    match &old_value {
        LeafValue::Spilled { cline_index, .. } | LeafValue::Subtree { cline_index, .. } => probe.release(*cline_index),
        LeafValue::Inline(_) => {}
    }
    let Some(new_value) = make_leaf_value(store, writer, &mut probe, source)? else {
        return Ok(false);
    };

    leaf.put(key.to_vec(), new_value);
    leaf.clines = probe;
    if let Some((old_addr, is_subtree)) = old_ref {
        if is_subtree {
            refcount::release_subtree(store, old_addr)?;
        } else {
            store.release_one(old_addr);
        }
    }
    Ok(true)
}

/// Release the control block (and, for a nested subtree, its whole
/// descendant set) a removed entry's out-of-line value referenced, and
/// free its cline slot.
fn release_out_of_line(store: &NodeStore, clines: &mut ClineTable, value: &LeafValue) -> Result<()> {
    match value {
        LeafValue::Spilled { cline_index, slot_index, .. } => {
            let addr = clines.resolve(*cline_index, *slot_index);
            store.release_one(addr);
            clines.release(*cline_index);
        }
        LeafValue::Subtree { cline_index, slot_index } => {
            let addr = clines.resolve(*cline_index, *slot_index);
            refcount::release_subtree(store, addr)?;
            clines.release(*cline_index);
        }
        LeafValue::Inline(_) => {}
    }
    Ok(())
}

/// Commit a structurally-updated leaf: retain every other entry's
/// out-of-line reference if shared (the one entry at `touched_key`
/// already carries its own fresh reference, or no longer exists), then
/// realloc-in-place (unique) or allocate fresh (shared).
fn commit_leaf(store: &NodeStore, writer: &mut SegmentWriter, addr: Address, leaf: LeafNode, unique: bool, touched_key: &[u8]) -> Result<BranchSet> {
    if !unique {
        for entry in leaf.entries() {
            if entry.key == touched_key {
                continue;
            }
            match &entry.value {
                LeafValue::Spilled { cline_index, slot_index, .. } | LeafValue::Subtree { cline_index, slot_index } => {
                    store.retain(leaf.clines.resolve(*cline_index, *slot_index));
                }
                LeafValue::Inline(_) => {}
            }
        }
    }
    if unique {
        store.realloc_in_place(writer, addr, &NodeBody::Leaf(leaf))?;
        Ok(BranchSet::Single(addr))
    } else {
        let new_addr = store.allocate(writer, &NodeBody::Leaf(leaf))?;
        Ok(BranchSet::Single(new_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::ControlBlockTable;
    use crate::compactor::eligibility::SegmentMetaTable;
    use crate::config::SyncMode;
    use crate::epoch::EpochTracker;
    use crate::segment::heap::SegmentHeap;
    use std::sync::Arc;

    fn test_store_and_writer() -> (NodeStore, SegmentWriter) {
        let heap = Arc::new(SegmentHeap::anon(4).unwrap());
        let cbt = Arc::new(ControlBlockTable::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let epoch = Arc::new(EpochTracker::new());
        let writer = SegmentWriter::new(heap.clone(), epoch, meta, SyncMode::None).unwrap();
        (NodeStore::new(heap, cbt), writer)
    }

    fn empty_root(store: &NodeStore, writer: &mut SegmentWriter) -> Address {
        store.allocate(writer, &NodeBody::Leaf(LeafNode::default())).unwrap()
    }

    fn get(store: &NodeStore, root: Address, key: &[u8]) -> Option<Vec<u8>> {
        crate::trie::read::get(store, root, key).unwrap()
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let result = apply(&store, &mut writer, root, b"hello", Op::Insert(b"world")).unwrap();
        assert_eq!(result.delta_keys, 1);
        assert_eq!(get(&store, result.new_root, b"hello"), Some(b"world".to_vec()));
    }

    #[test]
    fn insert_duplicate_key_errors() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let r1 = apply(&store, &mut writer, root, b"k", Op::Insert(b"v1")).unwrap();
        let err = apply(&store, &mut writer, r1.new_root, b"k", Op::Insert(b"v2"));
        assert!(err.is_err());
    }

    #[test]
    fn update_missing_key_errors() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let err = apply(&store, &mut writer, root, b"missing", Op::Update(b"v"));
        assert!(err.is_err());
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let result = apply(&store, &mut writer, root, b"missing", Op::Remove).unwrap();
        assert_eq!(result.new_root, root);
        assert_eq!(result.delta_keys, 0);
    }

    #[test]
    fn prefix_divergence_builds_wrapper_for_three_way_split() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let r1 = apply(&store, &mut writer, root, b"hello", Op::Insert(b"1")).unwrap();
        let r2 = apply(&store, &mut writer, r1.new_root, b"help", Op::Insert(b"2")).unwrap();
        let r3 = apply(&store, &mut writer, r2.new_root, b"helmet", Op::Insert(b"3")).unwrap();
        assert_eq!(get(&store, r3.new_root, b"hello"), Some(b"1".to_vec()));
        assert_eq!(get(&store, r3.new_root, b"help"), Some(b"2".to_vec()));
        assert_eq!(get(&store, r3.new_root, b"helmet"), Some(b"3".to_vec()));
        assert_eq!(get(&store, r3.new_root, b"nope"), None);
    }

    #[test]
    fn upsert_then_remove_round_trips_through_leaf() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let r1 = apply(&store, &mut writer, root, b"k", Op::Upsert(b"v1")).unwrap();
        assert_eq!(r1.delta_keys, 1);
        let r2 = apply(&store, &mut writer, r1.new_root, b"k", Op::Upsert(b"v2")).unwrap();
        assert_eq!(r2.delta_keys, 0);
        assert_eq!(get(&store, r2.new_root, b"k"), Some(b"v2".to_vec()));
        let r3 = apply(&store, &mut writer, r2.new_root, b"k", Op::MustRemove).unwrap();
        assert_eq!(r3.delta_keys, -1);
        assert_eq!(get(&store, r3.new_root, b"k"), None);
    }

    #[test]
    fn eof_value_insert_and_update() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let r1 = apply(&store, &mut writer, root, b"hel", Op::Insert(b"x")).unwrap();
        let r2 = apply(&store, &mut writer, r1.new_root, b"hello", Op::Insert(b"y")).unwrap();
        assert_eq!(get(&store, r2.new_root, b"hel"), Some(b"x".to_vec()));
        assert_eq!(get(&store, r2.new_root, b"hello"), Some(b"y".to_vec()));
        let r3 = apply(&store, &mut writer, r2.new_root, b"hel", Op::Update(b"z")).unwrap();
        assert_eq!(get(&store, r3.new_root, b"hel"), Some(b"z".to_vec()));
    }

    #[test]
    fn large_value_spills_out_of_line() {
        let (store, mut writer) = test_store_and_writer();
        let root = empty_root(&store, &mut writer);
        let big = vec![0x42u8; 512];
        let result = apply(&store, &mut writer, root, b"k", Op::Insert(&big)).unwrap();
        assert_eq!(get(&store, result.new_root, b"k"), Some(big));
    }

    #[test]
    fn many_inserts_drive_leaf_and_inner_splits() {
        let (store, mut writer) = test_store_and_writer();
        let mut root = empty_root(&store, &mut writer);
        let keys: Vec<String> = (0..500).map(|i| format!("key-{i:05}")).collect();
        for k in &keys {
            let result = apply(&store, &mut writer, root, k.as_bytes(), Op::Upsert(b"v")).unwrap();
            root = result.new_root;
        }
        for k in &keys {
            assert_eq!(get(&store, root, k.as_bytes()), Some(b"v".to_vec()), "missing {k}");
        }
    }
}

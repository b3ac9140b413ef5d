//! Read-path lookups: point `get`, `get_size`, `count_keys`, and ordered
//! `lower_bound`/ascending/descending traversal.

use crate::cbt::Address;
use crate::error::Result;
use crate::node::{InnerNode, LeafEntry, LeafNode, LeafValue, NodeBody};
use crate::trie::store::NodeStore;

/// Resolve `key` to its value starting from `root`, or `None` if absent.
///
/// A key whose remainder runs out exactly at an
/// `InnerPrefix` node's *own* prefix bytes (i.e. it diverges from, or
/// falls short of, the full stored prefix) is NOT a hit, even though the
/// node's `eof_child` slot might be populated for some *other*, longer
/// key that shares this node's full prefix. Only a remainder that
/// consumes the *entire* prefix and then runs out resolves through
/// `eof_child`; falling short partway through the prefix means the key
/// was never inserted here at all.
pub fn get(store: &NodeStore, root: Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut addr = root;
    let mut key = key;
    loop {
        match store.resolve(addr)? {
            NodeBody::Inner(inner) => {
                if inner.is_prefix_node() {
                    if key.len() < inner.prefix.len() || &key[..inner.prefix.len()] != inner.prefix.as_slice() {
                        return Ok(None);
                    }
                    key = &key[inner.prefix.len()..];
                }
                if key.is_empty() {
                    match inner.eof_child {
                        None => return Ok(None),
                        Some(child) => {
                            addr = child;
                            continue;
                        }
                    }
                }
                match inner.exact_branch_index(key[0]) {
                    Some(idx) => {
                        addr = inner.branches()[idx].child;
                        key = &key[1..];
                    }
                    None => return Ok(None),
                }
            }
            NodeBody::Leaf(leaf) => {
                return Ok(match leaf.find(key) {
                    Err(_) => None,
                    Ok(idx) => Some(resolve_value(store, &leaf.clines, &leaf.entries()[idx].value)?),
                });
            }
            NodeBody::Value(value) => return Ok(Some(value.bytes.clone())),
        }
    }
}

fn resolve_value(store: &NodeStore, clines: &crate::node::ClineTable, value: &LeafValue) -> Result<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.clone()),
        LeafValue::Spilled { cline_index, slot_index, .. } => {
            let addr = clines.resolve(*cline_index, *slot_index);
            match store.resolve(addr)? {
                NodeBody::Value(value) => Ok(value.bytes.clone()),
                _ => unreachable!("a Spilled leaf value always resolves to a Value node"),
            }
        }
        LeafValue::Subtree { .. } => unreachable!("subtree values are resolved by the caller, not by get"),
    }
}

/// Whether `key` is present, without materializing its value. Used by
/// transaction-level existence checks that don't need the bytes.
pub fn contains(store: &NodeStore, root: Address, key: &[u8]) -> Result<bool> {
    Ok(get(store, root, key)?.is_some())
}

/// Resolve `key` to its value's byte length, without materializing a
/// `Spilled` value's bytes (the length is cached in the leaf entry
/// itself). `None` if the key is absent or resolves to a subtree.
pub fn get_size(store: &NodeStore, root: Address, key: &[u8]) -> Result<Option<usize>> {
    let mut addr = root;
    let mut key = key;
    loop {
        match store.resolve(addr)? {
            NodeBody::Inner(inner) => {
                if inner.is_prefix_node() {
                    if key.len() < inner.prefix.len() || &key[..inner.prefix.len()] != inner.prefix.as_slice() {
                        return Ok(None);
                    }
                    key = &key[inner.prefix.len()..];
                }
                if key.is_empty() {
                    match inner.eof_child {
                        None => return Ok(None),
                        Some(child) => {
                            addr = child;
                            continue;
                        }
                    }
                }
                match inner.exact_branch_index(key[0]) {
                    Some(idx) => {
                        addr = inner.branches()[idx].child;
                        key = &key[1..];
                    }
                    None => return Ok(None),
                }
            }
            NodeBody::Leaf(leaf) => return Ok(leaf.find(key).ok().and_then(|idx| leaf.entries()[idx].value.len())),
            NodeBody::Value(value) => return Ok(Some(value.bytes.len())),
        }
    }
}

/// Resolve `key` to the root of a subtree stored at that key via
/// `Op::UpsertSubtree`, or `None` if the key is absent or holds a plain
/// byte value instead of a subtree reference.
pub fn get_subtree(store: &NodeStore, root: Address, key: &[u8]) -> Result<Option<Address>> {
    let mut addr = root;
    let mut key = key;
    loop {
        match store.resolve(addr)? {
            NodeBody::Inner(inner) => {
                if inner.is_prefix_node() {
                    if key.len() < inner.prefix.len() || &key[..inner.prefix.len()] != inner.prefix.as_slice() {
                        return Ok(None);
                    }
                    key = &key[inner.prefix.len()..];
                }
                if key.is_empty() {
                    return match inner.eof_child {
                        None => Ok(None),
                        Some(child) => match store.resolve(child)? {
                            NodeBody::Value(_) => Ok(None),
                            _ => Ok(Some(child)),
                        },
                    };
                }
                match inner.exact_branch_index(key[0]) {
                    Some(idx) => {
                        addr = inner.branches()[idx].child;
                        key = &key[1..];
                    }
                    None => return Ok(None),
                }
            }
            NodeBody::Leaf(leaf) => {
                return Ok(match leaf.find(key) {
                    Err(_) => None,
                    Ok(idx) => match &leaf.entries()[idx].value {
                        LeafValue::Subtree { cline_index, slot_index } => Some(leaf.clines.resolve(*cline_index, *slot_index)),
                        _ => None,
                    },
                });
            }
            NodeBody::Value(_) => return Ok(None),
        }
    }
}

/// Count of live keys reachable from `root`. An `Inner`/`InnerPrefix`
/// root's own `descendants` counter already tracks this incrementally;
/// a bare `Leaf` root (small trees before the first split) is counted
/// directly from its entry table.
pub fn count_keys(store: &NodeStore, root: Address) -> Result<u64> {
    Ok(match store.resolve(root)? {
        NodeBody::Inner(inner) => inner.descendants,
        NodeBody::Leaf(leaf) => leaf.len() as u64,
        NodeBody::Value(_) => unreachable!("a top-root never resolves directly to a bare Value node"),
    })
}

/// Count of live keys in `[lo, hi)` reachable from `root`. Walks the
/// ascending cursor seeked to `lo` and stops at the first key `>= hi`;
/// straightforward rather than descent-optimized, per the crate's
/// cursor/iterator scope.
pub fn count_keys_range(store: &NodeStore, root: Address, lo: &[u8], hi: &[u8]) -> Result<u64> {
    let mut count = 0u64;
    let mut cursor = lower_bound(store.clone(), root, lo)?;
    while let Some(entry) = cursor.next() {
        let (key, _) = entry?;
        if key.as_slice() >= hi {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// One pending node in an ascending traversal: a not-yet-fully-consumed
/// `Inner`/`InnerPrefix` node, or a `Leaf`'s entry table, each paired with
/// the key bytes accumulated on the path down to it.
enum Frame {
    Inner {
        prefix: Vec<u8>,
        inner: InnerNode,
        emitted_eof: bool,
        branch_cursor: usize,
    },
    Leaf {
        prefix: Vec<u8>,
        leaf: LeafNode,
        entry_cursor: usize,
    },
}

/// Ordered iterator over every plain (non-subtree) key/value pair
/// reachable from a root, walking either ascending or descending by key.
/// A straightforward explicit-stack walk: each `next()` call either emits
/// one entry or descends one level further, never materializing more of
/// the tree than the current path.
pub struct Cursor {
    store: NodeStore,
    stack: Vec<Frame>,
    reverse: bool,
}

enum Action {
    PopAndContinue,
    Descend { addr: Address, prefix: Vec<u8> },
    EmitLeaf { key: Vec<u8>, value: LeafValue },
    EmitEof { addr: Address },
}

impl Cursor {
    fn push_node(&mut self, addr: Address, mut prefix: Vec<u8>) -> Result<()> {
        match self.store.resolve(addr)? {
            NodeBody::Inner(inner) => {
                prefix.extend_from_slice(&inner.prefix);
                self.stack.push(Frame::Inner {
                    prefix,
                    inner,
                    emitted_eof: false,
                    branch_cursor: 0,
                });
            }
            NodeBody::Leaf(leaf) => {
                self.stack.push(Frame::Leaf { prefix, leaf, entry_cursor: 0 });
            }
            NodeBody::Value(_) => unreachable!("only Inner/Leaf nodes are pushed as traversal frames"),
        }
        Ok(())
    }

}

impl Iterator for Cursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let reverse = self.reverse;
        loop {
            let action = match self.stack.last_mut() {
                None => return None,
                Some(Frame::Leaf { entry_cursor, leaf, .. }) => {
                    if *entry_cursor >= leaf.len() {
                        Action::PopAndContinue
                    } else {
                        let idx = if reverse { leaf.len() - 1 - *entry_cursor } else { *entry_cursor };
                        *entry_cursor += 1;
                        let LeafEntry { key, value } = leaf.entries()[idx].clone();
                        Action::EmitLeaf { key, value }
                    }
                }
                // Ascending: the eof-at-prefix key (no extra bytes) sorts
                // below every branch (which adds at least one byte), so it
                // is emitted first. Descending emits branches highest-first
                // and the eof key last, for the same reason reversed.
                Some(Frame::Inner { emitted_eof, inner, branch_cursor, .. }) if !reverse => {
                    if !*emitted_eof {
                        *emitted_eof = true;
                        match inner.eof_child {
                            None => Action::PopAndContinue,
                            Some(addr) => Action::EmitEof { addr },
                        }
                    } else if *branch_cursor >= inner.branch_count() {
                        Action::PopAndContinue
                    } else {
                        let branch = inner.branches()[*branch_cursor];
                        *branch_cursor += 1;
                        Action::Descend { addr: branch.child, prefix: vec![branch.key] }
                    }
                }
                Some(Frame::Inner { emitted_eof, inner, branch_cursor, .. }) => {
                    let total = inner.branch_count();
                    if *branch_cursor < total {
                        let idx = total - 1 - *branch_cursor;
                        *branch_cursor += 1;
                        let branch = inner.branches()[idx];
                        Action::Descend { addr: branch.child, prefix: vec![branch.key] }
                    } else if !*emitted_eof {
                        *emitted_eof = true;
                        match inner.eof_child {
                            None => Action::PopAndContinue,
                            Some(addr) => Action::EmitEof { addr },
                        }
                    } else {
                        Action::PopAndContinue
                    }
                }
            };
            match action {
                Action::PopAndContinue => {
                    self.stack.pop();
                }
                Action::Descend { addr, prefix: suffix } => {
                    let mut full_prefix = match self.stack.last() {
                        Some(Frame::Inner { prefix, .. }) => prefix.clone(),
                        _ => Vec::new(),
                    };
                    full_prefix.extend_from_slice(&suffix);
                    if let Err(e) = self.push_node(addr, full_prefix) {
                        return Some(Err(e));
                    }
                }
                Action::EmitEof { addr } => {
                    let prefix = match self.stack.last() {
                        Some(Frame::Inner { prefix, .. }) => prefix.clone(),
                        _ => unreachable!(),
                    };
                    match self.store.resolve(addr) {
                        Ok(NodeBody::Value(value)) => return Some(Ok((prefix, value.bytes))),
                        Ok(_) => {} // subtree at this exact key — not a plain value, skip
                        Err(e) => return Some(Err(e)),
                    }
                }
                Action::EmitLeaf { key, value } => {
                    let prefix = match self.stack.last() {
                        Some(Frame::Leaf { prefix, .. }) => prefix.clone(),
                        _ => unreachable!(),
                    };
                    match value {
                        LeafValue::Inline(bytes) => {
                            let mut full_key = prefix;
                            full_key.extend_from_slice(&key);
                            return Some(Ok((full_key, bytes)));
                        }
                        LeafValue::Spilled { cline_index, slot_index, .. } => {
                            let clines = match self.stack.last() {
                                Some(Frame::Leaf { leaf, .. }) => leaf.clines.clone(),
                                _ => unreachable!(),
                            };
                            let value_addr = clines.resolve(cline_index, slot_index);
                            match self.store.resolve(value_addr) {
                                Ok(NodeBody::Value(v)) => {
                                    let mut full_key = prefix;
                                    full_key.extend_from_slice(&key);
                                    return Some(Ok((full_key, v.bytes)));
                                }
                                Ok(_) => unreachable!("a Spilled leaf value always resolves to a Value node"),
                                Err(e) => return Some(Err(e)),
                            }
                        }
                        LeafValue::Subtree { .. } => {} // not a plain value, skip
                    }
                }
            }
        }
    }
}

/// Build an ascending cursor over every plain key/value pair reachable
/// from `root`.
pub fn ascending(store: NodeStore, root: Address) -> Result<Cursor> {
    let mut cursor = Cursor { store, stack: Vec::new(), reverse: false };
    cursor.push_node(root, Vec::new())?;
    Ok(cursor)
}

/// Build a descending cursor over every plain key/value pair reachable
/// from `root`, visiting the same entries as [`ascending`] in reverse
/// order.
pub fn descending(store: NodeStore, root: Address) -> Result<Cursor> {
    let mut cursor = Cursor { store, stack: Vec::new(), reverse: true };
    cursor.push_node(root, Vec::new())?;
    Ok(cursor)
}

/// Build an ascending cursor positioned so its first `next()` yields the
/// smallest live key `>= lo`, or an exhausted cursor if none qualifies.
pub fn lower_bound(store: NodeStore, root: Address, lo: &[u8]) -> Result<Cursor> {
    let stack = seek(&store, root, Vec::new(), lo)?.unwrap_or_default();
    Ok(Cursor { store, stack, reverse: false })
}

/// Build the frame stack positioning a cursor at the first key `>= lo`
/// at or below `addr`, or `None` if every key at or below `addr` is `< lo`.
fn seek(store: &NodeStore, addr: Address, path: Vec<u8>, lo: &[u8]) -> Result<Option<Vec<Frame>>> {
    match store.resolve(addr)? {
        NodeBody::Leaf(leaf) => {
            let idx = leaf.entries().partition_point(|e| e.key.as_slice() < lo);
            if idx >= leaf.len() {
                Ok(None)
            } else {
                Ok(Some(vec![Frame::Leaf { prefix: path, leaf, entry_cursor: idx }]))
            }
        }
        NodeBody::Inner(inner) => {
            let mut full_path = path;
            full_path.extend_from_slice(&inner.prefix);
            let plen = inner.prefix.len();

            let prefix_cmp = if lo.len() <= plen {
                lo.cmp(&inner.prefix[..lo.len()])
            } else {
                lo[..plen].cmp(inner.prefix.as_slice())
            };
            match prefix_cmp {
                std::cmp::Ordering::Less => {
                    // Every key under this node starts with a prefix strictly
                    // greater than `lo`'s corresponding bytes: everything here
                    // qualifies, fresh full descent from the start.
                    Ok(Some(vec![Frame::Inner {
                        prefix: full_path,
                        inner,
                        emitted_eof: false,
                        branch_cursor: 0,
                    }]))
                }
                std::cmp::Ordering::Greater => Ok(None),
                std::cmp::Ordering::Equal if lo.len() <= plen => {
                    // `lo` is a (possibly empty) strict prefix of, or exactly
                    // equals, this node's own prefix: everything here is
                    // `>= lo` (any further byte only increases the key).
                    Ok(Some(vec![Frame::Inner {
                        prefix: full_path,
                        inner,
                        emitted_eof: false,
                        branch_cursor: 0,
                    }]))
                }
                std::cmp::Ordering::Equal => {
                    // Prefix matches exactly; continue with the remainder.
                    let rem = &lo[plen..];
                    let first_byte = rem[0];
                    match inner.exact_branch_index(first_byte) {
                        Some(idx) => {
                            let mut child_path = full_path.clone();
                            child_path.push(first_byte);
                            match seek(store, inner.branches()[idx].child, child_path, &rem[1..])? {
                                Some(mut sub_stack) => {
                                    sub_stack.push(Frame::Inner {
                                        prefix: full_path,
                                        inner,
                                        emitted_eof: true,
                                        branch_cursor: idx + 1,
                                    });
                                    Ok(Some(sub_stack))
                                }
                                None => {
                                    if idx + 1 < inner.branch_count() {
                                        Ok(Some(vec![Frame::Inner {
                                            prefix: full_path,
                                            inner,
                                            emitted_eof: true,
                                            branch_cursor: idx + 1,
                                        }]))
                                    } else {
                                        Ok(None)
                                    }
                                }
                            }
                        }
                        None => {
                            let idx = inner.branches().partition_point(|b| b.key <= first_byte);
                            if idx < inner.branch_count() {
                                Ok(Some(vec![Frame::Inner {
                                    prefix: full_path,
                                    inner,
                                    emitted_eof: true,
                                    branch_cursor: idx,
                                }]))
                            } else {
                                Ok(None)
                            }
                        }
                    }
                }
            }
        }
        NodeBody::Value(_) => unreachable!("only Inner/Leaf nodes are reachable via seek"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::ControlBlockTable;
    use crate::compactor::eligibility::SegmentMetaTable;
    use crate::config::SyncMode;
    use crate::epoch::EpochTracker;
    use crate::node::LeafNode;
    use crate::segment::heap::SegmentHeap;
    use crate::segment::log::SegmentWriter;
    use crate::trie::mutate::{apply, Op};
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
    fn missing_key_returns_none() {
        let (store, mut writer) = test_store_and_writer();
        let root = store.allocate(&mut writer, &NodeBody::Leaf(LeafNode::default())).unwrap();
        assert_eq!(get(&store, root, b"nope").unwrap(), None);
    }

    #[test]
    fn short_remainder_at_prefix_node_is_not_a_hit() {
        let (store, mut writer) = test_store_and_writer();
        let root = store.allocate(&mut writer, &NodeBody::Leaf(LeafNode::default())).unwrap();
        let r1 = apply(&store, &mut writer, root, b"hello", Op::Insert(b"1")).unwrap();
        // "hel" is a strict prefix of the stored "hello"/"help" prefix node
        // and was never itself inserted — must not resolve to anything.
        let r2 = apply(&store, &mut writer, r1.new_root, b"help", Op::Insert(b"2")).unwrap();
        assert_eq!(get(&store, r2.new_root, b"hel").unwrap(), None);
        assert_eq!(get(&store, r2.new_root, b"hello").unwrap(), Some(b"1".to_vec()));
    }
}

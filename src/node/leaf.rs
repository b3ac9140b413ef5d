//! Leaf / binary ("bucket") nodes: a small sorted table of key → value (or
//! subtree Address) entries sharing a common radix context.

use crate::config::MAX_INLINE_VALUE_LEN;
use crate::node::cline::ClineTable;

/// A value stored inline in a leaf entry, an out-of-line value-node
/// Address, or a nested subtree root Address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    /// Bytes small enough to live directly in the leaf's append region.
    Inline(Vec<u8>),
    /// A reference to an out-of-line [`crate::node::value::ValueNode`]
    /// holding bytes too large to inline.
    Spilled {
        /// Cline slot this reference resolves through.
        cline_index: u8,
        /// Slot within that cacheline.
        slot_index: u8,
        /// Original byte length, cached so `get_size` never needs to
        /// resolve the value node.
        len: u32,
    },
    /// A nested subtree root.
    Subtree {
        /// Cline slot this reference resolves through.
        cline_index: u8,
        /// Slot within that cacheline.
        slot_index: u8,
    },
}

impl LeafValue {
    /// Logical byte length this value reports via `get_size`. Subtree
    /// values have no byte length and return `None`.
    pub fn len(&self) -> Option<usize> {
        match self {
            LeafValue::Inline(bytes) => Some(bytes.len()),
            LeafValue::Spilled { len, .. } => Some(*len as usize),
            LeafValue::Subtree { .. } => None,
        }
    }
}

/// One leaf entry: a full key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// Full key bytes (relative to the node's radix context — the caller
    /// walking from the root already consumed any shared prefix).
    pub key: Vec<u8>,
    /// The entry's value.
    pub value: LeafValue,
}

/// A sorted, small table of entries, plus the cacheline-base table any
/// spilled/subtree entries reference.
#[derive(Debug, Clone, Default)]
pub struct LeafNode {
    /// Entries sorted ascending by `key`.
    entries: Vec<LeafEntry>,
    /// Shared cacheline-base table for spilled/subtree entries.
    pub clines: ClineTable,
    /// Bytes logically dead in the append region (tracked so `can_apply`
    /// can decide between an in-place write, a local defrag, or a split —
    /// this implementation's owned-`Vec` representation has no physical
    /// append region to defragment, so this counter is vestigial,
    /// retained only to preserve the decision surface callers expect).
    pub dead_space: u32,
}

/// What a pending insert/update can do to a leaf without structural
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Fits by replacing/inserting in the owned entry vector directly.
    Modify,
    /// Logically the same as `Modify` in this representation (no physical
    /// defragmentation is needed when entries are owned, not packed into
    /// a fixed byte region).
    Defrag,
    /// Does not fit; the node must split.
    None,
}

/// Maximum entries a leaf will hold before preferring a split. Chosen so
/// a leaf stays comfortably inside one allocation granularity for
/// realistic key/value sizes; not a hard protocol constant.
pub const MAX_LEAF_ENTRIES: usize = 64;

impl LeafNode {
    /// Entries in sorted order.
    pub fn entries(&self) -> &[LeafEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary-search for `key`, returning its entry index on a hit.
    pub fn find(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Whether inserting one more entry (or replacing an existing one
    /// with a value that may spill) can be done without a split.
    pub fn can_apply(&self, key_len: usize, inserting_new: bool) -> ApplyMode {
        let would_be = self.entries.len() + inserting_new as usize;
        if would_be > MAX_LEAF_ENTRIES || key_len > crate::config::MAX_KEY_LEN {
            return ApplyMode::None;
        }
        ApplyMode::Modify
    }

    /// Insert a new entry, or replace an existing one at the same key,
    /// returning the replaced value if any.
    pub fn put(&mut self, key: Vec<u8>, value: LeafValue) -> Option<LeafValue> {
        match self.find(&key) {
            Ok(idx) => {
                let old = std::mem::replace(&mut self.entries[idx].value, value);
                Some(old)
            }
            Err(idx) => {
                self.entries.insert(idx, LeafEntry { key, value });
                None
            }
        }
    }

    /// Remove the entry at `key`, returning its value if present.
    pub fn remove(&mut self, key: &[u8]) -> Option<LeafValue> {
        let idx = self.find(key).ok()?;
        Some(self.entries.remove(idx).value)
    }

    /// Wrap `bytes` as the right [`LeafValue`] variant given the inline
    /// threshold, `MAX_INLINE_VALUE_LEN`.
    pub fn classify_value(bytes: &[u8]) -> bool {
        bytes.len() <= MAX_INLINE_VALUE_LEN
    }

    /// Find the split position minimizing size imbalance while landing on
    /// a key-byte boundary where the two halves' first post-common-prefix
    /// byte differs. Returns the index
    /// at which the right half begins.
    pub fn split_position(&self, common_prefix_len: usize) -> usize {
        let len = self.entries.len();
        let mid = len / 2;
        let valid = |pos: usize| -> bool {
            pos > 0
                && pos < len
                && Self::first_byte_after(&self.entries[pos - 1].key, common_prefix_len)
                    != Self::first_byte_after(&self.entries[pos].key, common_prefix_len)
        };
        for distance in 0..len {
            if mid >= distance && valid(mid - distance) {
                return mid - distance;
            }
            if valid(mid + distance) {
                return mid + distance;
            }
        }
        mid.clamp(1, len.saturating_sub(1).max(1))
    }

    fn first_byte_after(key: &[u8], common_prefix_len: usize) -> Option<u8> {
        key.get(common_prefix_len).copied()
    }

    /// Split entries at `at`, returning `(left, right)` leaves with
    /// fresh, minimal cline tables and both the shared key prefix and the
    /// branch byte each side was routed on stripped from every key.
    pub fn split_at(mut self, at: usize, common_prefix_len: usize) -> (LeafNode, LeafNode) {
        let right_entries = self.entries.split_off(at);
        let old_clines = self.clines.clone();
        let (left_entries, left_clines) = Self::rebuild(self.entries, &old_clines, common_prefix_len);
        let (right_entries, right_clines) = Self::rebuild(right_entries, &old_clines, common_prefix_len);
        (
            LeafNode {
                entries: left_entries,
                clines: left_clines,
                dead_space: 0,
            },
            LeafNode {
                entries: right_entries,
                clines: right_clines,
                dead_space: 0,
            },
        )
    }

    /// Strip the shared prefix *and* the one branch byte each entry was
    /// routed on from its key, and remap its cline reference (if any) into
    /// a freshly built, minimal cline table.
    fn rebuild(
        mut entries: Vec<LeafEntry>,
        old_clines: &ClineTable,
        common_prefix_len: usize,
    ) -> (Vec<LeafEntry>, ClineTable) {
        let mut new_clines = ClineTable::new();
        let strip = common_prefix_len + 1;
        for entry in entries.iter_mut() {
            entry.key.drain(0..strip.min(entry.key.len()));
            match &mut entry.value {
                LeafValue::Spilled { cline_index, slot_index, .. }
                | LeafValue::Subtree { cline_index, slot_index } => {
                    let addr = old_clines.resolve(*cline_index, *slot_index);
                    *cline_index = new_clines
                        .get_or_insert(addr)
                        .expect("cline table overflow during leaf split");
                }
                LeafValue::Inline(_) => {}
            }
        }
        (entries, new_clines)
    }

    /// Encode to the persisted byte form.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&(entry.key.len() as u16).to_le_bytes());
            out.extend_from_slice(&entry.key);
            match &entry.value {
                LeafValue::Inline(bytes) => {
                    out.push(0);
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
                LeafValue::Spilled {
                    cline_index,
                    slot_index,
                    len,
                } => {
                    out.push(1);
                    out.push(*cline_index);
                    out.push(*slot_index);
                    out.extend_from_slice(&len.to_le_bytes());
                }
                LeafValue::Subtree { cline_index, slot_index } => {
                    out.push(2);
                    out.push(*cline_index);
                    out.push(*slot_index);
                }
            }
        }
        self.clines.encode(out);
        out.extend_from_slice(&self.dead_space.to_le_bytes());
    }

    /// Decode a node previously written by [`LeafNode::encode`].
    pub fn decode(bytes: &[u8]) -> Self {
        let mut cursor = 0usize;
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        cursor += 4;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = u16::from_le_bytes(bytes[cursor..cursor + 2].try_into().unwrap()) as usize;
            cursor += 2;
            let key = bytes[cursor..cursor + key_len].to_vec();
            cursor += key_len;
            let tag = bytes[cursor];
            cursor += 1;
            let value = match tag {
                0 => {
                    let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
                    cursor += 4;
                    let v = bytes[cursor..cursor + len].to_vec();
                    cursor += len;
                    LeafValue::Inline(v)
                }
                1 => {
                    let cline_index = bytes[cursor];
                    let slot_index = bytes[cursor + 1];
                    cursor += 2;
                    let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
                    cursor += 4;
                    LeafValue::Spilled {
                        cline_index,
                        slot_index,
                        len,
                    }
                }
                2 => {
                    let cline_index = bytes[cursor];
                    let slot_index = bytes[cursor + 1];
                    cursor += 2;
                    LeafValue::Subtree { cline_index, slot_index }
                }
                other => panic!("impossible leaf value tag {other}"),
            };
            entries.push(LeafEntry { key, value });
        }
        let clines = ClineTable::decode(&bytes[cursor..cursor + ClineTable::ENCODED_LEN]);
        cursor += ClineTable::ENCODED_LEN;
        let dead_space = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        Self {
            entries,
            clines,
            dead_space,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_find_roundtrip() {
        let mut leaf = LeafNode::default();
        leaf.put(b"bike".to_vec(), LeafValue::Inline(b"v1".to_vec()));
        leaf.put(b"apple".to_vec(), LeafValue::Inline(b"v2".to_vec()));
        assert_eq!(leaf.entries()[0].key, b"apple");
        assert_eq!(leaf.entries()[1].key, b"bike");
        assert!(leaf.find(b"apple").is_ok());
    }

    #[test]
    fn remove_drops_entry() {
        let mut leaf = LeafNode::default();
        leaf.put(b"k".to_vec(), LeafValue::Inline(b"v".to_vec()));
        let removed = leaf.remove(b"k");
        assert_eq!(removed, Some(LeafValue::Inline(b"v".to_vec())));
        assert!(leaf.is_empty());
    }

    #[test]
    fn classify_value_respects_inline_threshold() {
        assert!(LeafNode::classify_value(&[0u8; 64]));
        assert!(!LeafNode::classify_value(&[0u8; 65]));
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut leaf = LeafNode::default();
        leaf.put(b"a".to_vec(), LeafValue::Inline(b"1".to_vec()));
        leaf.put(b"b".to_vec(), LeafValue::Subtree { cline_index: 0, slot_index: 2 });
        let mut buf = Vec::new();
        leaf.encode(&mut buf);
        let decoded = LeafNode::decode(&buf);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.entries()[0].value, LeafValue::Inline(b"1".to_vec()));
    }
}

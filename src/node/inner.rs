//! Inner and inner-prefix radix nodes.
//!
//! A real arbtrie-style inner node is a raw, fixed-capacity in-place
//! layout the writer mutates byte-by-byte. This crate instead decodes a
//! persisted inner node into an owned [`InnerNode`], mutates the owned
//! form, and re-encodes it back into a fresh (or, under `unique` mode,
//! the same) frame — the "closed sum type, no raw pointer graphs" shape
//! a preferred shape over a `cast_and_call`-style raw dispatch.

use crate::cbt::Address;
use crate::node::cline::ClineTable;

/// One radix branch: the byte a key must present exactly at this node's
/// position to recurse into `child` (`exact_branch_index` routes on
/// equality and consumes the byte; there is no floor/interval matching).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    /// The exact byte this branch routes on.
    pub key: u8,
    /// Child this branch routes to.
    pub child: Address,
}

/// An inner (or inner-prefix) node: a sorted set of byte-keyed branches,
/// an optional EOF child for keys ending exactly at this node's path.
///
/// On the wire each branch's child is encoded as a 1-byte
/// `(cline_index:4, slot_index:4)` reference into a cacheline-base table
/// built fresh at encode time, rather than a full 4-byte `Address` — see
/// [`InnerNode::fits_in_cachelines`] and [`InnerNode::encode`]. The owned,
/// in-memory form stores each branch's resolved `Address` directly so the
/// mutation/read paths never juggle cline indices; only the encode/decode
/// boundary deals in the compact form.
#[derive(Debug, Clone, Default)]
pub struct InnerNode {
    /// Shared prefix bytes (empty for a plain `Inner` node; non-empty
    /// makes this an `InnerPrefix` node on encode).
    pub prefix: Vec<u8>,
    /// Sorted branches, ascending by `key`.
    branches: Vec<Branch>,
    /// Child reached by a key that ends exactly at this node (empty
    /// remainder after the prefix).
    pub eof_child: Option<Address>,
    /// Number of live keys at or below this node.
    pub descendants: u64,
}

impl InnerNode {
    /// Whether this encodes as an `InnerPrefix` node (non-empty prefix).
    pub fn is_prefix_node(&self) -> bool {
        !self.prefix.is_empty()
    }

    /// Number of branches (not counting the EOF child).
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Total distinct children, including the EOF child if present.
    /// Bounded by 257: 256 byte branches plus the EOF slot.
    pub fn child_count(&self) -> usize {
        self.branches.len() + self.eof_child.is_some() as usize
    }

    /// Iterate branches in ascending key order.
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Index of the branch keyed exactly at `byte`, if one already
    /// exists. Mutation needs to know whether `byte` is an existing
    /// divider (recurse into it) or a brand new one (the node gains a
    /// sibling branch instead); the read path uses the same index to
    /// resolve the child and consume the byte.
    pub fn exact_branch_index(&self, byte: u8) -> Option<usize> {
        self.branches.binary_search_by_key(&byte, |b| b.key).ok()
    }

    /// The child routed to by the branch keyed exactly at `byte`, if any.
    pub fn child_at_key(&self, byte: u8) -> Option<Address> {
        let idx = self.exact_branch_index(byte)?;
        Some(self.branches[idx].child)
    }

    /// Insert or replace the branch keyed exactly at `key`. Returns the
    /// replaced child's Address, if any (the caller must release it
    /// under shared mode, or it's already the same node under unique
    /// mode). Does not itself check cacheline capacity — callers commit
    /// a mutated node through [`InnerNode::fits_in_cachelines`] first,
    /// splitting via [`InnerNode::split_to_fit`] if it no longer fits.
    pub fn put_branch(&mut self, key: u8, child: Address) -> Option<Address> {
        match self.branches.binary_search_by_key(&key, |b| b.key) {
            Ok(idx) => {
                let old = self.branches[idx].child;
                self.branches[idx].child = child;
                Some(old)
            }
            Err(idx) => {
                self.branches.insert(idx, Branch { key, child });
                None
            }
        }
    }

    /// Remove the branch keyed exactly at `key`, if any.
    pub fn remove_branch_at(&mut self, key: u8) -> Option<Address> {
        let idx = self.branches.binary_search_by_key(&key, |b| b.key).ok()?;
        let branch = self.branches.remove(idx);
        Some(branch.child)
    }

    /// Whether every branch's (and the EOF child's) Address resolves
    /// into at most [`crate::node::cline::MAX_CLINES`] distinct
    /// cacheline bases — the bound `encode` relies on to persist each
    /// branch as a 1-byte cline reference instead of a full Address.
    pub fn fits_in_cachelines(&self) -> bool {
        let mut probe = ClineTable::new();
        for b in &self.branches {
            if probe.get_or_insert(b.child).is_none() {
                return false;
            }
        }
        if let Some(eof) = self.eof_child {
            if probe.get_or_insert(eof).is_none() {
                return false;
            }
        }
        true
    }

    /// Split this node's branches in half by branch count, returning
    /// `(left, right, divider)` where `divider` is the key of the first
    /// branch moved into `right`.
    pub fn split(mut self) -> (InnerNode, InnerNode, u8) {
        assert!(self.branches.len() >= 2, "cannot split a node with <2 branches");
        let mid = self.branches.len() / 2;
        let right_branches = self.branches.split_off(mid);
        let divider = right_branches[0].key;

        let left = InnerNode {
            prefix: Vec::new(),
            branches: self.branches,
            eof_child: self.eof_child.take(),
            descendants: 0,
        };
        let right = InnerNode {
            prefix: Vec::new(),
            branches: right_branches,
            eof_child: None,
            descendants: 0,
        };

        (left, right, divider)
    }

    /// Recursively split until every resulting piece's branches fit
    /// within [`crate::node::cline::MAX_CLINES`] distinct cacheline
    /// bases, returning the pieces in ascending key order. A piece with
    /// fewer than two branches can't be split further and is returned
    /// as-is regardless — with at most one branch and an EOF child it
    /// spans at most two cacheline bases, always within capacity.
    pub fn split_to_fit(self) -> Vec<InnerNode> {
        if self.fits_in_cachelines() || self.branches.len() < 2 {
            return vec![self];
        }
        let (left, right, _divider) = self.split();
        let mut pieces = left.split_to_fit();
        pieces.extend(right.split_to_fit());
        pieces
    }

    /// Encode this node to its persisted byte form. Each branch's child
    /// is written as a 1-byte `(cline_index:4, slot_index:4)` reference
    /// into a cacheline-base table built fresh from this node's current
    /// branches, rather than as a full 4-byte Address — callers must
    /// have confirmed [`InnerNode::fits_in_cachelines`] beforehand.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut clines = ClineTable::new();
        let packed: Vec<(u8, u8, u8)> = self
            .branches
            .iter()
            .map(|b| {
                let cline_index = clines
                    .get_or_insert(b.child)
                    .expect("encode called on a node exceeding cacheline capacity");
                (b.key, cline_index, b.child.slot_in_cacheline())
            })
            .collect();
        if let Some(eof) = self.eof_child {
            clines
                .get_or_insert(eof)
                .expect("encode called on a node exceeding cacheline capacity");
        }

        out.extend_from_slice(&(self.prefix.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(&(packed.len() as u16).to_le_bytes());
        for (key, cline_index, slot_index) in packed {
            out.push(key);
            out.push((cline_index << 4) | (slot_index & 0xF));
        }
        out.push(self.eof_child.is_some() as u8);
        if let Some(eof) = self.eof_child {
            out.extend_from_slice(&eof.raw().to_le_bytes());
        }
        clines.encode(out);
        out.extend_from_slice(&self.descendants.to_le_bytes());
    }

    /// Decode a node previously written by [`InnerNode::encode`].
    pub fn decode(bytes: &[u8]) -> Self {
        let mut cursor = 0usize;
        let prefix_len = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as usize;
        cursor += 2;
        let prefix = bytes[cursor..cursor + prefix_len].to_vec();
        cursor += prefix_len;

        let branch_count = u16::from_le_bytes(bytes[cursor..cursor + 2].try_into().unwrap()) as usize;
        cursor += 2;
        let mut packed = Vec::with_capacity(branch_count);
        for _ in 0..branch_count {
            let key = bytes[cursor];
            cursor += 1;
            let byte = bytes[cursor];
            cursor += 1;
            packed.push((key, byte >> 4, byte & 0xF));
        }

        let has_eof = bytes[cursor] != 0;
        cursor += 1;
        let eof_child = if has_eof {
            let raw = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
            cursor += 4;
            Some(Address::from_raw(raw))
        } else {
            None
        };

        let clines = ClineTable::decode(&bytes[cursor..cursor + ClineTable::ENCODED_LEN]);
        cursor += ClineTable::ENCODED_LEN;

        let descendants = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());

        let branches = packed
            .into_iter()
            .map(|(key, cline_index, slot_index)| Branch {
                key,
                child: clines.resolve(cline_index, slot_index),
            })
            .collect();

        Self {
            prefix,
            branches,
            eof_child,
            descendants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u32) -> Address {
        Address::from_raw(raw)
    }

    #[test]
    fn exact_branch_index_requires_equality() {
        let mut node = InnerNode::default();
        node.put_branch(b'h', addr(0x10));
        node.put_branch(b'z', addr(0x20));
        assert_eq!(node.child_at_key(b'h'), Some(addr(0x10)));
        assert_eq!(node.child_at_key(b'z'), Some(addr(0x20)));
        assert_eq!(node.child_at_key(b'k'), None, "no branch routes on an unclaimed byte");
        assert_eq!(node.child_at_key(b'a'), None);
    }

    #[test]
    fn put_branch_replaces_existing_key() {
        let mut node = InnerNode::default();
        node.put_branch(b'h', addr(0x10));
        let replaced = node.put_branch(b'h', addr(0x11));
        assert_eq!(replaced, Some(addr(0x10)));
        assert_eq!(node.child_at_key(b'h'), Some(addr(0x11)));
    }

    #[test]
    fn fits_in_cachelines_detects_overflow() {
        let mut node = InnerNode::default();
        // Each address below lands in its own cacheline (distinct upper
        // 28 bits), so the 17th distinct base overflows MAX_CLINES (16).
        for i in 0..16u8 {
            node.put_branch(i, addr((i as u32) << 4));
        }
        assert!(node.fits_in_cachelines());
        node.put_branch(16, addr(16 << 4));
        assert!(!node.fits_in_cachelines());
    }

    #[test]
    fn split_to_fit_keeps_every_piece_within_capacity() {
        let mut node = InnerNode::default();
        for i in 0..32u8 {
            node.put_branch(i, addr((i as u32) << 4));
        }
        assert!(!node.fits_in_cachelines());
        let pieces = node.split_to_fit();
        assert!(pieces.len() >= 2);
        assert_eq!(pieces.iter().map(|p| p.branch_count()).sum::<usize>(), 32);
        for piece in &pieces {
            assert!(piece.fits_in_cachelines());
        }
    }

    #[test]
    fn split_divides_branches_and_preserves_eof_on_left() {
        let mut node = InnerNode::default();
        node.put_branch(b'a', addr(0x10));
        node.put_branch(b'm', addr(0x20));
        node.put_branch(b'z', addr(0x30));
        node.eof_child = Some(addr(0x40));
        let (left, right, divider) = node.split();
        assert_eq!(left.branch_count() + right.branch_count(), 3);
        assert_eq!(left.eof_child, Some(addr(0x40)));
        assert!(right.eof_child.is_none());
        assert_eq!(divider, right.branches()[0].key);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut node = InnerNode::default();
        node.prefix = b"hel".to_vec();
        node.put_branch(b'l', addr(1));
        node.put_branch(b'p', addr(2));
        node.put_branch(b'm', addr(3));
        node.eof_child = Some(addr(4));
        node.descendants = 3;
        let mut buf = Vec::new();
        node.encode(&mut buf);
        let decoded = InnerNode::decode(&buf);
        assert_eq!(decoded.prefix, node.prefix);
        assert_eq!(decoded.branch_count(), 3);
        assert_eq!(decoded.child_at_key(b'p'), Some(addr(2)));
        assert_eq!(decoded.eof_child, Some(addr(4)));
        assert_eq!(decoded.descendants, 3);
    }
}

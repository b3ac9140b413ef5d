//! The cacheline-base table shared by inner and leaf/binary nodes: up to
//! 16 distinct cacheline bases per node, each carrying a saturating
//! in-line reference count in its low 4 bits, letting a child reference
//! cost a single byte
//! `(cline_index:4, slot_index:4)` instead of a full 32-bit Address.

use crate::cbt::Address;

/// Sentinel marking a `cline` slot unused. Matches the reserved
/// "null cacheline" Address band the allocator (`ControlBlockTable`)
/// never hands out — see `zone.rs`.
const NULL_CLINE: u32 = 0xFFFF_FFF0;

/// Maximum number of distinct cacheline bases a single node may carry.
pub const MAX_CLINES: usize = 16;

/// One packed cline entry: the upper 28 bits are a cacheline-base
/// Address, the lower 4 bits are a saturating reference count (1..=15,
/// "null" meaning unused).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClineEntry(u32);

impl ClineEntry {
    const NULL: ClineEntry = ClineEntry(NULL_CLINE);

    fn is_null(self) -> bool {
        self.0 & 0xF == 0
    }

    fn base(self) -> u32 {
        self.0 & !0xF
    }

    fn count(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    fn with_count(self, count: u8) -> ClineEntry {
        debug_assert!(count <= 0xF);
        ClineEntry((self.0 & !0xF) | count as u32)
    }
}

/// Up to [`MAX_CLINES`] cacheline bases referenced by one node, with a
/// saturating per-base reference count so the table can shrink a base out
/// when its last referencing branch is rewritten elsewhere.
#[derive(Debug, Clone)]
pub struct ClineTable {
    entries: [ClineEntry; MAX_CLINES],
}

impl Default for ClineTable {
    fn default() -> Self {
        Self {
            entries: [ClineEntry::NULL; MAX_CLINES],
        }
    }
}

impl ClineTable {
    /// Build an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of populated (non-null) cline slots.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_null()).count()
    }

    /// Whether the table has no populated slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find or create the cline slot for `addr`'s cacheline base,
    /// incrementing its reference count. Returns the cline index, or
    /// `None` if the table is full and `addr`'s base is not already
    /// present (the caller must then split the node).
    pub fn get_or_insert(&mut self, addr: Address) -> Option<u8> {
        let base = addr.cacheline_base();
        if let Some(idx) = self.find_base(base) {
            let entry = self.entries[idx];
            let next_count = entry.count().saturating_add(1).min(0xF);
            self.entries[idx] = entry.with_count(next_count);
            return Some(idx as u8);
        }
        let free_idx = self.entries.iter().position(|e| e.is_null())?;
        self.entries[free_idx] = ClineEntry(base | 1);
        Some(free_idx as u8)
    }

    /// Release one reference on cline `idx`, returning it to null once the
    /// count drops to zero.
    pub fn release(&mut self, idx: u8) {
        let entry = self.entries[idx as usize];
        if entry.is_null() {
            return;
        }
        let next_count = entry.count().saturating_sub(1);
        self.entries[idx as usize] = if next_count == 0 {
            ClineEntry::NULL
        } else {
            entry.with_count(next_count)
        };
    }

    /// Resolve `(cline_index, slot_index)` to a concrete [`Address`].
    pub fn resolve(&self, cline_index: u8, slot_index: u8) -> Address {
        let entry = self.entries[cline_index as usize];
        debug_assert!(!entry.is_null(), "resolving a null cline slot");
        Address::from_raw(entry.base() | slot_index as u32)
    }

    fn find_base(&self, base: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.is_null() && e.base() == base)
    }

    /// Serialize to exactly `MAX_CLINES * 4` bytes (one `u32` per slot,
    /// little-endian), for node encoding.
    pub fn encode(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            out.extend_from_slice(&entry.0.to_le_bytes());
        }
    }

    /// Parse a table out of exactly `MAX_CLINES * 4` bytes.
    pub fn decode(bytes: &[u8]) -> Self {
        let mut entries = [ClineEntry::NULL; MAX_CLINES];
        for (i, entry) in entries.iter_mut().enumerate() {
            let word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            *entry = ClineEntry(word);
        }
        Self { entries }
    }

    /// Byte length of the encoded form.
    pub const ENCODED_LEN: usize = MAX_CLINES * 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u32) -> Address {
        Address::from_raw(raw)
    }

    #[test]
    fn siblings_share_one_cline_slot() {
        let mut table = ClineTable::new();
        let a = table.get_or_insert(addr(0x100)).unwrap();
        let b = table.get_or_insert(addr(0x103)).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_cachelines_use_distinct_slots() {
        let mut table = ClineTable::new();
        let a = table.get_or_insert(addr(0x100)).unwrap();
        let b = table.get_or_insert(addr(0x200)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn release_returns_slot_to_null_at_zero() {
        let mut table = ClineTable::new();
        let idx = table.get_or_insert(addr(0x100)).unwrap();
        table.release(idx);
        assert_eq!(table.len(), 0);
        // slot reusable afterward
        let idx2 = table.get_or_insert(addr(0x200)).unwrap();
        assert_eq!(idx, idx2);
    }

    #[test]
    fn table_full_returns_none_for_new_base() {
        let mut table = ClineTable::new();
        for i in 0..MAX_CLINES as u32 {
            table.get_or_insert(addr(i * 0x10)).unwrap();
        }
        assert!(table.get_or_insert(addr(0xF000)).is_none());
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut table = ClineTable::new();
        table.get_or_insert(addr(0x100));
        table.get_or_insert(addr(0x200));
        let mut buf = Vec::new();
        table.encode(&mut buf);
        assert_eq!(buf.len(), ClineTable::ENCODED_LEN);
        let decoded = ClineTable::decode(&buf);
        assert_eq!(decoded.len(), 2);
    }
}

//! The control block: one atomic word per [`crate::Address`].
//!
//! Every observable transition (refcount change, location move, type set)
//! is a single atomic CAS on the packed word. This mirrors the
//! `AtomicU32`-backed, CAS-retry-loop refcounting used by the reference
//! radix-trie branch header (`triblespace-tribles-rust`'s `Branch::rc_inc`/
//! `rc_dec`), widened to a 64-bit word so refcount, type, the mutual
//! exclusion bits, and the packed segment/offset location all fit in one
//! atomicity domain.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel packed location meaning "does not exist / freed".
pub const LOCATION_FREED: u32 = u32::MAX;

const REFCOUNT_SHIFT: u32 = 0;
const REFCOUNT_BITS: u32 = 16;
const REFCOUNT_MASK: u64 = (1u64 << REFCOUNT_BITS) - 1;

const TYPE_SHIFT: u32 = REFCOUNT_BITS;
const TYPE_BITS: u32 = 8;
const TYPE_MASK: u64 = (1u64 << TYPE_BITS) - 1;

const FLAGS_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;
const FLAGS_BITS: u32 = 8;
const FLAGS_MASK: u64 = (1u64 << FLAGS_BITS) - 1;

const LOCATION_SHIFT: u32 = FLAGS_SHIFT + FLAGS_BITS;

const FLAG_MODIFYING: u8 = 1 << 0;
const FLAG_COPYING: u8 = 1 << 1;
const FLAG_READ: u8 = 1 << 2;
const FLAG_PENDING_CACHE: u8 = 1 << 3;

/// Node-type tag stored in the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    /// Slot is on the free list; no live object.
    Free = 0,
    /// Radix inner node with no shared prefix.
    Inner = 1,
    /// Radix inner node with a shared byte-string prefix.
    InnerPrefix = 2,
    /// Sorted leaf/binary (bucket) node.
    Leaf = 3,
    /// Out-of-line value node.
    Value = 4,
}

impl NodeType {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeType::Free,
            1 => NodeType::Inner,
            2 => NodeType::InnerPrefix,
            3 => NodeType::Leaf,
            4 => NodeType::Value,
            other => panic!("impossible control-block type tag {other}"),
        }
    }
}

/// A decoded snapshot of a control block at one instant. Not itself atomic;
/// produced by [`ControlBlock::load`] and consumed by the CAS helpers that
/// take an "expected previous" snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlockSnapshot {
    raw: u64,
}

impl ControlBlockSnapshot {
    /// Strong reference count.
    pub fn refcount(&self) -> u32 {
        ((self.raw >> REFCOUNT_SHIFT) & REFCOUNT_MASK) as u32
    }

    /// Node-type tag.
    pub fn node_type(&self) -> NodeType {
        NodeType::from_u8(((self.raw >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }

    /// Packed (segment, offset) location, or [`LOCATION_FREED`].
    pub fn location(&self) -> u32 {
        (self.raw >> LOCATION_SHIFT) as u32
    }

    /// True if the slot has been freed (refcount 0, location cleared).
    pub fn is_freed(&self) -> bool {
        self.location() == LOCATION_FREED
    }

    fn flag(&self, bit: u8) -> bool {
        (((self.raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8) & bit != 0
    }

    /// Whether a writer is currently performing an in-place edit.
    pub fn modifying(&self) -> bool {
        self.flag(FLAG_MODIFYING)
    }

    /// Whether the compactor is currently relocating this object.
    pub fn copying(&self) -> bool {
        self.flag(FLAG_COPYING)
    }

    /// Whether a reader has opportunistically marked this object hot.
    pub fn read(&self) -> bool {
        self.flag(FLAG_READ)
    }

    /// Whether this object is queued for promotion into pinned space.
    pub fn pending_cache(&self) -> bool {
        self.flag(FLAG_PENDING_CACHE)
    }
}

fn pack(refcount: u32, ty: NodeType, flags: u8, location: u32) -> u64 {
    debug_assert!(refcount as u64 <= REFCOUNT_MASK);
    (refcount as u64) << REFCOUNT_SHIFT
        | ((ty as u64) & TYPE_MASK) << TYPE_SHIFT
        | ((flags as u64) & FLAGS_MASK) << FLAGS_SHIFT
        | (location as u64) << LOCATION_SHIFT
}

/// A single control-block slot: one packed `AtomicU64` per [`crate::Address`].
#[derive(Debug)]
pub struct ControlBlock {
    word: AtomicU64,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new_free()
    }
}

impl ControlBlock {
    /// A freshly freed / never-allocated slot.
    pub fn new_free() -> Self {
        Self {
            word: AtomicU64::new(pack(0, NodeType::Free, 0, LOCATION_FREED)),
        }
    }

    /// Atomically read the current state.
    pub fn load(&self, order: Ordering) -> ControlBlockSnapshot {
        ControlBlockSnapshot {
            raw: self.word.load(order),
        }
    }

    /// Claim a freed slot for a new object of `ty` at `location`, with
    /// refcount 1. Only valid to call on a slot the caller has exclusively
    /// claimed via the free bitmap.
    pub fn init(&self, ty: NodeType, location: u32) {
        self.word
            .store(pack(1, ty, 0, location), Ordering::Release);
    }

    /// Clear a slot back to the free state. Caller must already hold the
    /// invariant `refcount == 0` before calling this.
    pub fn clear(&self) {
        self.word
            .store(pack(0, NodeType::Free, 0, LOCATION_FREED), Ordering::Release);
    }

    /// Saturating retain. A no-op once the refcount has saturated.
    pub fn retain(&self) {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let refcount = (current & REFCOUNT_MASK) as u32;
            if refcount == REFCOUNT_MASK as u32 {
                return;
            }
            let next = current + 1;
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a strong reference. Returns `true` if this release dropped
    /// the refcount to zero (the caller must now free the slot).
    ///
    /// A saturated refcount never decrements past saturation back toward a
    /// real count; this mirrors saturating `retain` (invariant: a
    /// saturated node is leaked for the database's lifetime, never freed).
    pub fn release(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let refcount = (current & REFCOUNT_MASK) as u32;
            if refcount == REFCOUNT_MASK as u32 {
                return false;
            }
            if refcount == 0 {
                panic!("release on control block with refcount already zero");
            }
            let next = current - 1;
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return refcount == 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// `start_modify`: succeeds only when `copying == 0` and `refcount >
    /// 0`. Spins with backoff while `copying` is set.
    pub fn start_modify(&self) {
        loop {
            let snap = self.load(Ordering::Acquire);
            if snap.copying() {
                std::hint::spin_loop();
                continue;
            }
            assert!(snap.refcount() > 0, "start_modify on a freed control block");
            let raw = snap.raw;
            let flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8 | FLAG_MODIFYING;
            let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
            if self
                .word
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// `end_modify`: clears the modifying bit.
    pub fn end_modify(&self) {
        loop {
            let raw = self.word.load(Ordering::Acquire);
            let flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8 & !FLAG_MODIFYING;
            let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
            if self
                .word
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Publish a freshly constructed node's real location, replacing the
    /// placeholder location set at `init` time. Only valid to call before
    /// the Address is linked into any parent node or root — construction
    /// is not yet visible to any reader, so this is a plain store rather
    /// than part of the `try_start_move`/`try_move` protocol.
    pub fn publish_location(&self, location: u32) {
        loop {
            let raw = self.word.load(Ordering::Acquire);
            let next = (raw & !(u64::MAX << LOCATION_SHIFT)) | ((location as u64) << LOCATION_SHIFT);
            if self
                .word
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// `try_start_move`: succeeds only when `copying == 0`, `modifying ==
    /// 0`, `refcount > 0`, and the current location matches
    /// `expected_location`. Sets `copying = 1`.
    pub fn try_start_move(&self, expected_location: u32) -> bool {
        let raw = self.word.load(Ordering::Acquire);
        let snap = ControlBlockSnapshot { raw };
        if snap.copying() || snap.modifying() || snap.refcount() == 0 {
            return false;
        }
        if snap.location() != expected_location {
            return false;
        }
        let flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8 | FLAG_COPYING;
        let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
        self.word
            .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// `try_move`: CASes `location` from `old_location` to `new_location`
    /// while `copying == 1` and `modifying == 0`. Returns `false` if the
    /// control block was invalidated (refcount hit zero, or a writer won
    /// the race) — the caller must then roll back its new allocation.
    pub fn try_move(&self, old_location: u32, new_location: u32) -> bool {
        loop {
            let raw = self.word.load(Ordering::Acquire);
            let snap = ControlBlockSnapshot { raw };
            if !snap.copying() || snap.modifying() {
                return false;
            }
            if snap.refcount() == 0 || snap.location() != old_location {
                return false;
            }
            let next = (raw & !(u64::MAX << LOCATION_SHIFT)) | ((new_location as u64) << LOCATION_SHIFT);
            match self
                .word
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// `end_move`: clears the copying bit.
    pub fn end_move(&self) {
        loop {
            let raw = self.word.load(Ordering::Acquire);
            let flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8 & !FLAG_COPYING;
            let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
            if self
                .word
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Attempt a single CAS to set the read bit. Fail-open: a lost race is
    /// ignored, matching the spec's "single CAS attempt, fail-open is
    /// fine" for the cache policy.
    pub fn try_set_read_bit(&self) {
        let raw = self.word.load(Ordering::Relaxed);
        let flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8 | FLAG_READ;
        let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
        let _ = self
            .word
            .compare_exchange(raw, next, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Clear the read bit (used by the decay sweep). Fail-open.
    pub fn clear_read_bit(&self) {
        let raw = self.word.load(Ordering::Relaxed);
        let flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8 & !FLAG_READ;
        let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
        let _ = self
            .word
            .compare_exchange(raw, next, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Set or clear the pending-cache bit depending on `value`.
    pub fn set_pending_cache(&self, value: bool) {
        loop {
            let raw = self.word.load(Ordering::Relaxed);
            let mut flags = ((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u8;
            if value {
                flags |= FLAG_PENDING_CACHE;
            } else {
                flags &= !FLAG_PENDING_CACHE;
            }
            let next = (raw & !(FLAGS_MASK << FLAGS_SHIFT)) | ((flags as u64) << FLAGS_SHIFT);
            if self
                .word
                .compare_exchange_weak(raw, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_load_roundtrip() {
        let cb = ControlBlock::new_free();
        assert!(cb.load(Ordering::Relaxed).is_freed());
        cb.init(NodeType::Leaf, 42);
        let snap = cb.load(Ordering::Relaxed);
        assert_eq!(snap.refcount(), 1);
        assert_eq!(snap.node_type(), NodeType::Leaf);
        assert_eq!(snap.location(), 42);
    }

    #[test]
    fn retain_release_to_zero() {
        let cb = ControlBlock::new_free();
        cb.init(NodeType::Inner, 7);
        cb.retain();
        assert_eq!(cb.load(Ordering::Relaxed).refcount(), 2);
        assert!(!cb.release());
        assert!(cb.release());
        assert_eq!(cb.load(Ordering::Relaxed).refcount(), 0);
    }

    #[test]
    #[should_panic(expected = "refcount already zero")]
    fn double_release_panics() {
        let cb = ControlBlock::new_free();
        cb.init(NodeType::Inner, 7);
        cb.release();
        cb.release();
    }

    #[test]
    fn modifying_and_copying_are_mutually_exclusive() {
        let cb = ControlBlock::new_free();
        cb.init(NodeType::Leaf, 5);
        cb.start_modify();
        assert!(!cb.try_start_move(5));
        cb.end_modify();
        assert!(cb.try_start_move(5));
        assert!(cb.try_move(5, 9));
        cb.end_move();
        assert_eq!(cb.load(Ordering::Relaxed).location(), 9);
    }

    #[test]
    fn try_move_fails_on_location_mismatch() {
        let cb = ControlBlock::new_free();
        cb.init(NodeType::Leaf, 5);
        assert!(!cb.try_start_move(6));
    }

    #[test]
    fn saturating_refcount_never_frees() {
        let cb = ControlBlock::new_free();
        cb.init(NodeType::Leaf, 1);
        for _ in 0..(1 << REFCOUNT_BITS) + 10 {
            cb.retain();
        }
        assert_eq!(cb.load(Ordering::Relaxed).refcount(), REFCOUNT_MASK as u32);
        assert!(!cb.release());
    }
}

//! Promotion-ring draining: moving read-hot objects into pinned segments,
//! the read-cache's supplement to plain decay.
//!
//! A reader that observes `read == 1` on a control block it just resolved
//! may push that address into a small per-session ring buffer rather than
//! acting immediately (the actual mlock/relocate work happens off the hot
//! path, on the background compactor), draining a bounded producer-side
//! queue rather than doing blocking work inline.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cbt::{Address, ControlBlockTable};
use crate::compactor::eligibility::SegmentMetaTable;
use crate::segment::unpack_location;

/// Bounded ring a session pushes promotion candidates into. Pushing past
/// capacity drops the oldest candidate — promotion is a hint, never a
/// correctness requirement.
pub struct PromotionRing {
    capacity: usize,
    queue: Mutex<VecDeque<Address>>,
}

impl PromotionRing {
    /// Build an empty ring holding at most `capacity` pending addresses.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Offer an address for promotion. Drops the oldest entry if full.
    pub fn offer(&self, addr: Address) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(addr);
    }

    /// Drain up to `max` pending addresses for the compactor to process.
    pub fn drain(&self, max: usize) -> Vec<Address> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }
}

/// Marks every address drained from a [`PromotionRing`] as pending-cache,
/// and flags the segment each one currently lives in as a pin candidate.
/// The actual `mlock` call is issued by [`crate::cache::pin::PinBudget`]
/// once a segment crosses the pin threshold; this function only updates
/// the bookkeeping that decision reads.
pub fn mark_pending(addrs: &[Address], cbt: &Arc<ControlBlockTable>, meta: &Arc<SegmentMetaTable>) {
    for &addr in addrs {
        let Some(snapshot) = cbt.try_get(addr) else {
            continue;
        };
        if snapshot.is_freed() {
            continue;
        }
        cbt.with_block(addr, |b| b.set_pending_cache(true));
        let (segment, _) = unpack_location(snapshot.location());
        meta.with(segment, |m| {
            m.pin_candidate.fetch_add(1, Ordering::Relaxed);
        });
        trace!(address = %addr, segment, "marked pending cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::NodeType;

    #[test]
    fn ring_drops_oldest_once_full() {
        let ring = PromotionRing::new(2);
        ring.offer(Address::from_raw(1));
        ring.offer(Address::from_raw(2));
        ring.offer(Address::from_raw(3));
        let drained = ring.drain(10);
        assert_eq!(drained, vec![Address::from_raw(2), Address::from_raw(3)]);
    }

    #[test]
    fn mark_pending_sets_flag_on_live_addresses() {
        let cbt = Arc::new(ControlBlockTable::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let addr = cbt.alloc(NodeType::Leaf, crate::segment::pack_location(0, 0)).unwrap();
        meta.register(0);
        mark_pending(&[addr], &cbt, &meta);
        assert!(cbt.get(addr).pending_cache());
    }
}

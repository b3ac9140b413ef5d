//! Pinning sealed segments into physical memory with `mlock`,
//! bounded by a configured byte budget.
//!
//! Grounded on [`crate::segment::heap::SegmentHeap::protect_read_only`]'s
//! use of the `region` crate: the same crate's `lock`/`unlock` give us
//! `mlock`/`munlock` without hand-rolling the `libc` FFI.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::compactor::eligibility::SegmentMetaTable;
use crate::config::SEGMENT_SIZE_BYTES;
use crate::segment::heap::SegmentHeap;

/// A sealed segment becomes a pin candidate once this many of its objects
/// have been marked pending-cache by readers.
const PIN_CANDIDATE_THRESHOLD: u32 = 64;

/// Tracks which segments are currently `mlock`'d and enforces
/// [`crate::config::Config::max_pinned_cache_mb`].
pub struct PinBudget {
    max_bytes: u64,
    pinned_bytes: AtomicU64,
    /// Pinned segments in pin order, oldest first, for LRU-ish eviction
    /// when the budget is exceeded.
    pinned: Mutex<VecDeque<u32>>,
}

impl PinBudget {
    /// Build a budget allowing up to `max_bytes` of pinned segment memory.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            pinned_bytes: AtomicU64::new(0),
            pinned: Mutex::new(VecDeque::new()),
        }
    }

    /// Scan pending-cache counters and pin any segment that has crossed
    /// [`PIN_CANDIDATE_THRESHOLD`] and is not already pinned, evicting the
    /// oldest pinned segments first if the budget would be exceeded.
    pub fn promote_candidates(&self, heap: &Arc<SegmentHeap>, meta: &Arc<SegmentMetaTable>) {
        let candidates = meta.segments_above_pin_candidate_threshold(PIN_CANDIDATE_THRESHOLD);
        for segment in candidates {
            self.try_pin(segment, heap, meta);
        }
    }

    /// Attempt to `mlock` `segment`. Evicts the oldest pinned segment if
    /// doing so is required to stay within budget; gives up silently if
    /// even a single empty budget can't fit one segment.
    pub fn try_pin(&self, segment: u32, heap: &Arc<SegmentHeap>, meta: &Arc<SegmentMetaTable>) -> bool {
        let size = SEGMENT_SIZE_BYTES as u64;
        if size > self.max_bytes {
            return false;
        }
        {
            let pinned = self.pinned.lock();
            if pinned.contains(&segment) {
                return true;
            }
        }
        while self.pinned_bytes.load(Ordering::Relaxed) + size > self.max_bytes {
            let oldest = { self.pinned.lock().pop_front() };
            match oldest {
                Some(victim) => self.unpin(victim, heap, meta),
                None => return false,
            }
        }
        let ptr = heap.get(segment);
        let result = unsafe { region::lock(ptr, SEGMENT_SIZE_BYTES) };
        match result {
            Ok(_) => {
                self.pinned_bytes.fetch_add(size, Ordering::Relaxed);
                self.pinned.lock().push_back(segment);
                meta.with(segment, |m| m.pinned.store(true, Ordering::Relaxed));
                debug!(segment, "pinned segment");
                true
            }
            Err(err) => {
                warn!(segment, %err, "mlock failed, continuing unpinned");
                false
            }
        }
    }

    /// Release a previously pinned segment.
    pub fn unpin(&self, segment: u32, heap: &Arc<SegmentHeap>, meta: &Arc<SegmentMetaTable>) {
        let ptr = heap.get(segment);
        let _ = unsafe { region::unlock(ptr, SEGMENT_SIZE_BYTES) };
        self.pinned_bytes.fetch_sub(SEGMENT_SIZE_BYTES as u64, Ordering::Relaxed);
        meta.with(segment, |m| m.pinned.store(false, Ordering::Relaxed));
        debug!(segment, "unpinned segment");
    }

    /// Current total pinned bytes.
    pub fn pinned_bytes(&self) -> u64 {
        self.pinned_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_budget_never_pins() {
        let heap = Arc::new(SegmentHeap::anon(1).unwrap());
        let meta = Arc::new(SegmentMetaTable::default());
        meta.register(0);
        let budget = PinBudget::new(0);
        assert!(!budget.try_pin(0, &heap, &meta));
        assert_eq!(budget.pinned_bytes(), 0);
    }
}

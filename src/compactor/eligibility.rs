//! Per-segment metadata and the eligibility policy deciding which sealed
//! segments the compactor should visit next.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Mutable, per-segment bookkeeping the writer, compactor, and cache
/// policy all touch. One entry per segment number, for the life of the
/// database.
#[derive(Debug)]
pub struct SegmentMeta {
    /// Bytes freed so far within this segment (objects relocated or
    /// logically dropped without being relocated yet).
    pub freed_bytes: AtomicU32,
    /// Total payload bytes ever written into this segment (fixed once
    /// sealed).
    pub total_bytes: AtomicU32,
    /// Whether the segment has been sealed by its writing session.
    pub sealed: AtomicBool,
    /// Whether the segment is currently mlock'd (cache policy).
    pub pinned: AtomicBool,
    /// Whether the segment is currently queued in the epoch recycle
    /// pipeline (prevents double-scheduling for compaction).
    pub in_recycle_pipeline: AtomicBool,
    /// Virtual age: the wall-clock ms of the nearest preceding sync-head
    /// stamp at the time this segment was sealed.
    pub virtual_age_ms: AtomicU64,
    /// Count of objects in this segment marked pending-cache by readers.
    /// Read by [`crate::cache::pin::PinBudget`] to decide whether the
    /// segment has crossed the pin threshold.
    pub pin_candidate: AtomicU32,
}

impl Default for SegmentMeta {
    fn default() -> Self {
        Self {
            freed_bytes: AtomicU32::new(0),
            total_bytes: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            in_recycle_pipeline: AtomicBool::new(false),
            virtual_age_ms: AtomicU64::new(0),
            pin_candidate: AtomicU32::new(0),
        }
    }
}

impl SegmentMeta {
    /// Fraction of the segment's written bytes that are now dead.
    pub fn freed_fraction(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.freed_bytes.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// Table of per-segment metadata, keyed by segment number.
#[derive(Default)]
pub struct SegmentMetaTable {
    segments: DashMap<u32, SegmentMeta>,
}

impl SegmentMetaTable {
    /// Register a newly acquired segment.
    pub fn register(&self, segment: u32) {
        self.segments.entry(segment).or_default();
    }

    /// Run `f` with the metadata for `segment`.
    pub fn with<R>(&self, segment: u32, f: impl FnOnce(&SegmentMeta) -> R) -> R {
        let entry = self.segments.entry(segment).or_default();
        f(&entry)
    }

    /// Configured eligibility thresholds, in bytes.
    pub fn eligible_segments(
        &self,
        pinned_threshold_bytes: u64,
        unpinned_threshold_bytes: u64,
    ) -> (Vec<u32>, Vec<u32>) {
        let mut pinned = Vec::new();
        let mut unpinned = Vec::new();
        for entry in self.segments.iter() {
            let meta = entry.value();
            if !meta.sealed.load(Ordering::Relaxed) || meta.in_recycle_pipeline.load(Ordering::Relaxed) {
                continue;
            }
            let freed = meta.freed_bytes.load(Ordering::Relaxed) as u64;
            let is_pinned = meta.pinned.load(Ordering::Relaxed);
            if is_pinned && freed >= pinned_threshold_bytes {
                pinned.push(*entry.key());
            } else if !is_pinned && freed >= unpinned_threshold_bytes {
                unpinned.push(*entry.key());
            }
        }
        // Sort by descending virtual age to maintain age-locality.
        let age_of = |seg: &u32| {
            self.segments
                .get(seg)
                .map(|m| m.virtual_age_ms.load(Ordering::Relaxed))
                .unwrap_or(0)
        };
        pinned.sort_by_key(|s| std::cmp::Reverse(age_of(s)));
        unpinned.sort_by_key(|s| std::cmp::Reverse(age_of(s)));
        pinned.truncate(16);
        unpinned.truncate(8);
        (pinned, unpinned)
    }

    /// Segments whose pending-cache candidate count has crossed
    /// `threshold` and that are not already pinned.
    pub fn segments_above_pin_candidate_threshold(&self, threshold: u32) -> Vec<u32> {
        self.segments
            .iter()
            .filter(|entry| {
                !entry.value().pinned.load(Ordering::Relaxed)
                    && entry.value().pin_candidate.load(Ordering::Relaxed) >= threshold
            })
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_respects_thresholds_and_pinned_status() {
        let table = SegmentMetaTable::default();
        table.register(1);
        table.with(1, |m| {
            m.sealed.store(true, Ordering::Relaxed);
            m.total_bytes.store(1000, Ordering::Relaxed);
            m.freed_bytes.store(900, Ordering::Relaxed);
        });
        table.register(2);
        table.with(2, |m| {
            m.sealed.store(true, Ordering::Relaxed);
            m.pinned.store(true, Ordering::Relaxed);
            m.total_bytes.store(1000, Ordering::Relaxed);
            m.freed_bytes.store(100, Ordering::Relaxed);
        });
        let (pinned, unpinned) = table.eligible_segments(50, 500);
        assert_eq!(unpinned, vec![1]);
        assert!(pinned.is_empty());
    }
}

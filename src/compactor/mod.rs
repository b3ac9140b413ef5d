//! The background compactor: periodically walks
//! eligible sealed segments, relocates live objects, and recycles emptied
//! segments once every reader has passed them.

pub mod eligibility;
pub mod pass;
pub mod rcache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::cbt::ControlBlockTable;
use crate::config::Config;
use crate::epoch::EpochTracker;
use crate::error::AllocError;
use crate::segment::heap::SegmentHeap;
use crate::segment::log::SegmentWriter;

pub use eligibility::{SegmentMeta, SegmentMetaTable};
pub use pass::PassStats;
pub use rcache::PromotionRing;

/// Bytes of accumulated dead space a pinned segment must reach before the
/// compactor will visit it.
const MB: u64 = 1 << 20;

/// Owns the compactor's own write segment (its relocation destination) and
/// the shared tables it reads eligibility and liveness from.
pub struct Compactor {
    heap: Arc<SegmentHeap>,
    cbt: Arc<ControlBlockTable>,
    meta: Arc<SegmentMetaTable>,
    epoch: Arc<EpochTracker>,
    dest: SegmentWriter,
    pinned_threshold_bytes: u64,
    unpinned_threshold_bytes: u64,
    shutdown: Arc<AtomicBool>,
}

impl Compactor {
    /// Build a compactor with its own dedicated write segment.
    pub fn new(
        config: &Config,
        heap: Arc<SegmentHeap>,
        cbt: Arc<ControlBlockTable>,
        meta: Arc<SegmentMetaTable>,
        epoch: Arc<EpochTracker>,
    ) -> Result<Self, AllocError> {
        let dest = SegmentWriter::new(
            Arc::clone(&heap),
            Arc::clone(&epoch),
            Arc::clone(&meta),
            config.sync_mode,
        )?;
        Ok(Self {
            heap,
            cbt,
            meta,
            epoch,
            dest,
            pinned_threshold_bytes: config.compact_pinned_unused_threshold_mb * MB,
            unpinned_threshold_bytes: config.compact_unpinned_unused_threshold_mb * MB,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run one full sweep: find eligible segments, compact each, then
    /// recycle whatever the epoch tracker now says is safe.
    pub fn run_once(&mut self) -> Result<PassStats, AllocError> {
        let (pinned, unpinned) = self
            .meta
            .eligible_segments(self.pinned_threshold_bytes, self.unpinned_threshold_bytes);
        let mut total = PassStats::default();
        for segment in pinned.into_iter().chain(unpinned.into_iter()) {
            self.meta.with(segment, |m| {
                m.in_recycle_pipeline.store(true, Ordering::Relaxed);
            });
            match pass::compact_segment(segment, &self.heap, &self.cbt, &self.meta, &mut self.dest) {
                Ok(stats) => {
                    total.relocated += stats.relocated;
                    total.skipped_stale += stats.skipped_stale;
                    total.skipped_sync_head += stats.skipped_sync_head;
                    total.freed_bytes += stats.freed_bytes;
                    let tag = self.epoch.clock().next();
                    self.epoch.push_for_recycle(tag, segment);
                }
                Err(err) => {
                    warn!(segment, %err, "compaction pass failed");
                    self.meta.with(segment, |m| {
                        m.in_recycle_pipeline.store(false, Ordering::Relaxed);
                    });
                }
            }
        }
        for segment in self.epoch.drain_recyclable() {
            pass::recycle_segment(segment, &self.meta, &self.epoch);
        }
        Ok(total)
    }

    /// Spawn a background thread that calls [`Compactor::run_once`] on an
    /// interval until [`Compactor::stop`] is called on the returned handle.
    pub fn spawn(mut self, interval: Duration) -> CompactorHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let join = std::thread::Builder::new()
            .name("arbokv-compactor".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match self.run_once() {
                        Ok(stats) if stats.relocated > 0 => {
                            info!(relocated = stats.relocated, freed = stats.freed_bytes, "compaction sweep")
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "compaction sweep failed"),
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn compactor thread");
        CompactorHandle {
            join: Some(join),
            shutdown: self.shutdown,
        }
    }
}

/// Handle to a spawned background compactor thread.
pub struct CompactorHandle {
    join: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl CompactorHandle {
    /// Signal the compactor thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

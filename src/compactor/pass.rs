//! One compaction pass over a single sealed segment.
//!
//! Forward-scans a sealed segment, relocates anything still live, skips
//! anything already moved, combined with the control-block CAS protocol
//! from [`crate::cbt::control_block`]. Five steps per live frame:
//! 1. Read the frame header; if the frame is a sync-head stamp, skip it.
//! 2. Resolve the frame's `address` and check whether the control block's
//!    current location still points at this physical frame — if not, the
//!    object has already moved or been freed, skip.
//! 3. `try_start_move`, gated on the control block's location matching.
//! 4. Bump-allocate a destination frame, copy the payload + checksum
//!    bytes verbatim, and `try_move` the control block to the new
//!    location.
//! 5. `end_move`, then record the source bytes as freed (and, if the move
//!    lost a race, record the destination bytes as freed too — the bump
//!    allocator cannot reclaim them directly).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cbt::{Address, ControlBlockTable, NodeType};
use crate::compactor::eligibility::SegmentMetaTable;
use crate::epoch::EpochTracker;
use crate::error::AllocError;
use crate::segment::frame::{FrameHeader, FrameKind};
use crate::segment::heap::SegmentHeap;
use crate::segment::log::SegmentWriter;
use crate::segment::{pack_location, unpack_location};

/// Outcome of compacting one segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    /// Frames whose owning object was relocated.
    pub relocated: usize,
    /// Frames skipped because the object had already moved or been freed.
    pub skipped_stale: usize,
    /// Sync-head stamp frames skipped.
    pub skipped_sync_head: usize,
    /// Bytes reclaimed in the source segment.
    pub freed_bytes: u64,
}

/// Runs one forward scan over `segment`, relocating every still-live
/// object into `dest`. The segment must already be sealed (no writer will
/// append to it again).
pub fn compact_segment(
    segment: u32,
    heap: &Arc<SegmentHeap>,
    cbt: &Arc<ControlBlockTable>,
    meta: &Arc<SegmentMetaTable>,
    dest: &mut SegmentWriter,
) -> Result<PassStats, AllocError> {
    let header_size = std::mem::size_of::<FrameHeader>();
    let written = meta.with(segment, |m| m.total_bytes.load(Ordering::Relaxed)) as usize;
    let base = heap.get(segment);
    let mut offset = 0usize;
    let mut stats = PassStats::default();

    while offset + header_size <= written {
        let header_bytes = unsafe { std::slice::from_raw_parts(base.add(offset), header_size) };
        let header = FrameHeader::read(header_bytes);
        let frame_size = header.size as usize;
        if frame_size == 0 {
            break; // never-written tail of the segment
        }

        if header.frame_kind() == FrameKind::SyncHead {
            stats.skipped_sync_head += 1;
            offset += frame_size;
            continue;
        }

        let address = Address::from_raw(header.address);
        let old_location = pack_location(segment, offset as u32);
        let node_type = cbt.try_get(address).map(|s| s.node_type());

        let relocated = relocate_one(
            address,
            old_location,
            frame_size,
            header_size,
            base,
            node_type,
            cbt,
            meta,
            dest,
        )?;

        if relocated {
            stats.relocated += 1;
            stats.freed_bytes += frame_size as u64;
        } else {
            stats.skipped_stale += 1;
        }
        offset += frame_size;
    }

    meta.with(segment, |m| {
        m.freed_bytes
            .fetch_add(stats.freed_bytes as u32, Ordering::Relaxed);
    });
    trace!(segment, ?stats, "compaction pass complete");
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn relocate_one(
    address: Address,
    old_location: u32,
    frame_size: usize,
    header_size: usize,
    src_base: *mut u8,
    node_type: Option<NodeType>,
    cbt: &Arc<ControlBlockTable>,
    meta: &Arc<SegmentMetaTable>,
    dest: &mut SegmentWriter,
) -> Result<bool, AllocError> {
    let Some(node_type) = node_type else {
        return Ok(false); // address never claimed, or outside allocated zones
    };

    let started = cbt.with_block(address, |b| b.try_start_move(old_location));
    if !started {
        return Ok(false);
    }

    let payload_len = frame_size - header_size;
    let (new_location, dest_ptr) = dest.alloc_data(payload_len, node_type, address.raw())?;
    unsafe {
        let src_payload = src_base.add(old_location_offset(old_location)).add(header_size);
        std::ptr::copy_nonoverlapping(src_payload, dest_ptr, payload_len);
    }

    let moved = cbt.with_block(address, |b| b.try_move(old_location, new_location));
    cbt.with_block(address, |b| b.end_move());

    if moved {
        debug!(address = %address, old_location, new_location, "relocated object");
        Ok(true)
    } else {
        // Lost the race (object was freed or force-updated concurrently);
        // the destination bytes are stranded. Count them against the
        // destination segment so eligibility tracking stays accurate.
        let (dest_segment, _) = unpack_location(new_location);
        meta.with(dest_segment, |m| {
            m.freed_bytes.fetch_add(frame_size as u32, Ordering::Relaxed);
        });
        Ok(false)
    }
}

fn old_location_offset(location: u32) -> usize {
    unpack_location(location).1 as usize
}

/// Once every live reader has passed a segment's epoch tag, it can be
/// truncated back to zero bytes and handed back to the free pool. This
/// implementation never shrinks the backing file (segments are reused in
/// place); `recycle` resets the segment's bookkeeping only.
pub fn recycle_segment(segment: u32, meta: &Arc<SegmentMetaTable>, epoch: &Arc<EpochTracker>) {
    meta.with(segment, |m| {
        m.freed_bytes.store(0, Ordering::Relaxed);
        m.total_bytes.store(0, Ordering::Relaxed);
        m.sealed.store(false, Ordering::Relaxed);
        m.in_recycle_pipeline.store(false, Ordering::Relaxed);
    });
    debug!(segment, "segment recycled");
    let _ = epoch;
}

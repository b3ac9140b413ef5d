//! Per-session bump allocator over an owned write segment.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::cbt::NodeType;
use crate::compactor::eligibility::SegmentMetaTable;
use crate::config::{SyncMode, SEGMENT_SIZE_BYTES};
use crate::epoch::EpochTracker;
use crate::error::AllocError;
use crate::segment::frame::{checksum, FrameHeader, SyncHeadPayload, CHECKSUM_LEN};
use crate::segment::heap::SegmentHeap;
use crate::segment::{pack_location, ALLOC_GRANULARITY};

const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();
/// Rewrite a sync-head stamp after this many bytes of writes, so readers
/// and the compactor can derive a virtual age without scanning too far
/// back.
const SYNC_HEAD_INTERVAL_BYTES: usize = 1 << 20;

fn align_up(value: usize, granularity: usize) -> usize {
    (value + granularity - 1) / granularity * granularity
}

fn wall_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A session's write handle onto the segment heap: bump-allocates inside
/// at most one open segment at a time, sealing and rotating to a fresh one
/// as needed.
pub struct SegmentWriter {
    heap: Arc<SegmentHeap>,
    epoch: Arc<EpochTracker>,
    meta: Arc<SegmentMetaTable>,
    sync_mode: SyncMode,
    session_id: u64,
    current_segment: u32,
    cursor: usize,
    synced_up_to: usize,
    bytes_since_sync_head: usize,
}

impl SegmentWriter {
    /// Open a new session, acquiring its first segment immediately.
    pub fn new(
        heap: Arc<SegmentHeap>,
        epoch: Arc<EpochTracker>,
        meta: Arc<SegmentMetaTable>,
        sync_mode: SyncMode,
    ) -> Result<Self, AllocError> {
        let session_id = epoch.register_session();
        let mut writer = Self {
            heap,
            epoch,
            meta,
            sync_mode,
            session_id,
            current_segment: 0,
            cursor: 0,
            synced_up_to: 0,
            bytes_since_sync_head: 0,
        };
        writer.open_fresh_segment()?;
        Ok(writer)
    }

    /// Session identifier used to publish this writer's epoch lower bound.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn open_fresh_segment(&mut self) -> Result<(), AllocError> {
        let segment = self.heap.alloc_segment()?;
        self.meta.register(segment);
        self.current_segment = segment;
        self.cursor = 0;
        self.synced_up_to = 0;
        self.bytes_since_sync_head = 0;
        self.write_sync_head()?;
        Ok(())
    }

    fn write_sync_head(&mut self) -> Result<(), AllocError> {
        let payload_size = std::mem::size_of::<SyncHeadPayload>();
        let total = align_up(FRAME_HEADER_SIZE + payload_size, ALLOC_GRANULARITY);
        if self.cursor + total > SEGMENT_SIZE_BYTES {
            return Ok(()); // segment is about to be sealed anyway
        }
        let sequence = self.epoch.clock().next();
        let header = FrameHeader::sync_head(total as u32, sequence as u32);
        let payload = SyncHeadPayload {
            wall_time_ms: wall_time_ms(),
        };
        unsafe {
            let base = self.heap.get(self.current_segment).add(self.cursor);
            std::ptr::copy_nonoverlapping(header.as_bytes().as_ptr(), base, FRAME_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&payload).as_ptr(),
                base.add(FRAME_HEADER_SIZE),
                payload_size,
            );
        }
        self.cursor += total;
        self.bytes_since_sync_head = 0;
        self.meta.with(self.current_segment, |m| {
            m.total_bytes.fetch_add(total as u32, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Bump-allocate `payload_len` bytes (plus a trailing checksum) for an
    /// object of `node_type` destined for control-block `address`,
    /// returning the packed location and a pointer to the payload region
    /// (immediately following the frame header). The caller must allocate
    /// the control-block slot first so `address` is known before the frame
    /// is written — the compactor relies on every object frame carrying
    /// its owning address. Once the payload bytes are written, the caller
    /// must call [`SegmentWriter::finalize`] with the same location to
    /// stamp the trailing checksum.
    pub fn alloc_data(
        &mut self,
        payload_len: usize,
        node_type: NodeType,
        address: u32,
    ) -> Result<(u32, *mut u8), AllocError> {
        let total = align_up(FRAME_HEADER_SIZE + payload_len + CHECKSUM_LEN, ALLOC_GRANULARITY);
        if self.cursor + total > SEGMENT_SIZE_BYTES {
            self.seal()?;
            self.open_fresh_segment()?;
        }
        let sequence = self.epoch.clock().next();
        let header = FrameHeader::object(total as u32, node_type, address, sequence as u32);
        let offset = self.cursor;
        let ptr = unsafe {
            let base = self.heap.get(self.current_segment).add(offset);
            std::ptr::copy_nonoverlapping(header.as_bytes().as_ptr(), base, FRAME_HEADER_SIZE);
            base.add(FRAME_HEADER_SIZE)
        };
        self.cursor += total;
        self.bytes_since_sync_head += total;
        self.meta.with(self.current_segment, |m| {
            m.total_bytes.fetch_add(total as u32, Ordering::Relaxed);
        });
        if self.bytes_since_sync_head >= SYNC_HEAD_INTERVAL_BYTES {
            self.write_sync_head()?;
        }
        let location = pack_location(self.current_segment, offset as u32);
        Ok((location, ptr))
    }

    /// Stamp the trailing checksum for a frame previously allocated with
    /// [`SegmentWriter::alloc_data`], once `payload_len` bytes have been
    /// written starting at its payload pointer.
    ///
    /// # Safety
    /// `location` must have been returned by a prior `alloc_data` call on
    /// this writer, and exactly `payload_len` payload bytes must already be
    /// written at its payload pointer.
    pub unsafe fn finalize(&self, location: u32, payload_len: usize) {
        let (segment, offset) = crate::segment::unpack_location(location);
        let base = self.heap.get(segment).add(offset as usize);
        let payload_ptr = base.add(FRAME_HEADER_SIZE);
        let payload = std::slice::from_raw_parts(payload_ptr, payload_len);
        let sum = checksum(payload);
        std::ptr::copy_nonoverlapping(
            sum.to_le_bytes().as_ptr(),
            payload_ptr.add(payload_len),
            CHECKSUM_LEN,
        );
    }

    /// Flush this session's written-but-unsynced bytes in its current
    /// segment per the configured sync policy, without sealing the
    /// segment — more writes may still land in it afterward. Used at
    /// write-transaction commit, ahead of publishing the new root.
    pub fn sync_now(&mut self) -> Result<(), AllocError> {
        if matches!(
            self.sync_mode,
            SyncMode::MsyncAsync | SyncMode::MsyncSync | SyncMode::Fsync | SyncMode::Full
        ) {
            let _ = self
                .heap
                .flush_range(self.current_segment, self.synced_up_to, self.cursor - self.synced_up_to);
            self.synced_up_to = self.cursor;
        }
        Ok(())
    }

    /// Seal the currently open segment: freeze the bump cursor, write-
    /// protect the written range, and apply the configured sync policy.
    pub fn seal(&mut self) -> Result<(), AllocError> {
        let segment = self.current_segment;
        let written = self.cursor;
        if matches!(
            self.sync_mode,
            SyncMode::Mprotect | SyncMode::MsyncAsync | SyncMode::MsyncSync | SyncMode::Fsync | SyncMode::Full
        ) {
            self.heap.protect_read_only(segment, self.synced_up_to, written - self.synced_up_to);
        }
        if matches!(
            self.sync_mode,
            SyncMode::MsyncAsync | SyncMode::MsyncSync | SyncMode::Fsync | SyncMode::Full
        ) {
            let _ = self.heap.flush_range(segment, 0, written);
        }
        self.synced_up_to = written;
        self.meta.with(segment, |m| {
            m.sealed.store(true, Ordering::Release);
            m.virtual_age_ms.store(wall_time_ms(), Ordering::Relaxed);
        });
        debug!(segment, written, "sealed segment");
        Ok(())
    }

    /// Publish this session's epoch lower bound: the sequence of the
    /// oldest object it might still be reading from.
    pub fn publish_lower_bound(&self, lower_bound: u64) {
        self.epoch.publish_lower_bound(self.session_id, lower_bound);
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.epoch.unregister_session(self.session_id);
    }
}

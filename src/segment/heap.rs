//! The segment block allocator: grows a single backing file's worth
//! of 32 MiB segments, handed out whole, mapped into memory.
//!
//! Rather than remapping one ever-growing `mmap` (which would require
//! invalidating every raw pointer handed out so far), each segment gets
//! its own `memmap2::MmapRaw` region, appended to a `Vec` under a
//! dedicated grow mutex. Existing segments' addresses are therefore
//! never invalidated by growth, and the read path (`get`) only takes the
//! `RwLock` read side.

use memmap2::{MmapMut, MmapOptions, MmapRaw};
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::path::Path;
use tracing::debug;

use crate::config::SEGMENT_SIZE_BYTES;
use crate::error::AllocError;

/// A growable heap of fixed-size segments, backed either by a file or by
/// anonymous memory.
pub struct SegmentHeap {
    file: Option<Mutex<File>>,
    grow_lock: Mutex<()>,
    segments: RwLock<Vec<MmapRaw>>,
}

// SAFETY: `MmapRaw` points at OS-managed pages that remain valid for the
// life of the mapping; we only ever hand out pointers derived from a
// segment already pushed into `segments`, and segments are never removed.
unsafe impl Send for SegmentHeap {}
unsafe impl Sync for SegmentHeap {}

impl SegmentHeap {
    /// Open (or create) a file-backed segment heap at `path`.
    pub fn open(path: &Path, initial_segments: u32) -> Result<Self, AllocError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| AllocError::SegmentsExhausted { current_segments: 0 })?;
        let heap = Self {
            file: Some(Mutex::new(file)),
            grow_lock: Mutex::new(()),
            segments: RwLock::new(Vec::new()),
        };
        for _ in 0..initial_segments.max(1) {
            heap.alloc_segment()?;
        }
        Ok(heap)
    }

    /// Create an anonymous (non-persistent) segment heap, for tests and
    /// in-memory databases.
    pub fn anon(initial_segments: u32) -> Result<Self, AllocError> {
        let heap = Self {
            file: None,
            grow_lock: Mutex::new(()),
            segments: RwLock::new(Vec::new()),
        };
        for _ in 0..initial_segments.max(1) {
            heap.alloc_segment()?;
        }
        Ok(heap)
    }

    /// Grow by exactly one segment; returns its segment number.
    pub fn alloc_segment(&self) -> Result<u32, AllocError> {
        let _guard = self.grow_lock.lock();
        let index = self.segments.read().len() as u32;
        let map = match &self.file {
            Some(file) => {
                let f = file.lock();
                let new_len = (index as u64 + 1) * SEGMENT_SIZE_BYTES as u64;
                f.set_len(new_len).map_err(|_| AllocError::SegmentsExhausted {
                    current_segments: index,
                })?;
                MmapOptions::new()
                    .offset(index as u64 * SEGMENT_SIZE_BYTES as u64)
                    .len(SEGMENT_SIZE_BYTES)
                    .map_raw(&*f)
                    .map_err(|_| AllocError::SegmentsExhausted {
                        current_segments: index,
                    })?
            }
            None => MmapRaw::from(MmapMut::map_anon(SEGMENT_SIZE_BYTES).map_err(|_| {
                AllocError::SegmentsExhausted {
                    current_segments: index,
                }
            })?),
        };
        debug!(segment = index, "grew segment heap by one segment");
        self.segments.write().push(map);
        Ok(index)
    }

    /// Byte pointer to the start of an already-allocated segment.
    pub fn get(&self, segment: u32) -> *mut u8 {
        let segments = self.segments.read();
        segments
            .get(segment as usize)
            .unwrap_or_else(|| panic!("segment {segment} has not been allocated"))
            .as_mut_ptr()
    }

    /// Number of segments currently allocated.
    pub fn segment_count(&self) -> u32 {
        self.segments.read().len() as u32
    }

    /// `msync` a byte range of one segment per the configured sync policy.
    pub fn flush_range(&self, segment: u32, offset: usize, len: usize) -> std::io::Result<()> {
        let segments = self.segments.read();
        let map = &segments[segment as usize];
        map.flush_range(offset, len)
    }

    /// Write-protect a byte range of a sealed segment so no further writes
    /// can land before the bytes are durable.
    pub fn protect_read_only(&self, segment: u32, offset: usize, len: usize) {
        let segments = self.segments.read();
        let map = &segments[segment as usize];
        let ptr = unsafe { map.as_ptr().add(offset) };
        // SAFETY: `ptr..ptr+len` lies entirely within the segment's mapped
        // region, which outlives this call (segments are never unmapped).
        unsafe {
            region::protect(ptr, len, region::Protection::READ)
                .expect("mprotect to read-only failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_heap_grows_and_returns_distinct_segments() {
        let heap = SegmentHeap::anon(1).unwrap();
        let s0 = 0;
        let s1 = heap.alloc_segment().unwrap();
        assert_ne!(s0, s1);
        assert_eq!(heap.segment_count(), 2);
        let p0 = heap.get(s0);
        let p1 = heap.get(s1);
        assert_ne!(p0, p1);
    }
}

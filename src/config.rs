//! Database-open configuration.

use serde::{Deserialize, Serialize};

/// Durability policy applied at commit and at segment seal time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// No explicit flushing beyond what the OS does on its own schedule.
    None,
    /// Write-protect sealed pages (`mprotect`) but do not `msync`.
    Mprotect,
    /// `mprotect` plus an asynchronous `msync` (`MS_ASYNC`).
    MsyncAsync,
    /// `mprotect` plus a synchronous `msync` (`MS_SYNC`).
    MsyncSync,
    /// `fsync` the segments file after `msync`.
    Fsync,
    /// Platform full-sync (e.g. `F_FULLFSYNC`) on the header file.
    Full,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::MsyncSync
    }
}

/// Size of a single segment: 32 MiB.
pub const SEGMENT_SIZE_BYTES: usize = 32 << 20;

/// Number of control-block entries per zone: 2^22.
pub const ZONE_SIZE_ENTRIES: u32 = 1 << 22;

/// Maximum accepted key length, enforced at the public API boundary.
pub const MAX_KEY_LEN: usize = 4096;

/// Values at or below this length are stored inline in a leaf entry;
/// larger values spill to a [`crate::node::value::ValueNode`].
pub const MAX_INLINE_VALUE_LEN: usize = 64;

/// Runtime configuration for opening or creating a [`crate::Database`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Durability policy for commits and segment seals.
    pub sync_mode: SyncMode,

    /// Target mlock budget for pinned (hot) segments, in megabytes.
    pub max_pinned_cache_mb: u64,

    /// A sealed, pinned segment becomes compaction-eligible once its freed
    /// bytes exceed this threshold.
    pub compact_pinned_unused_threshold_mb: u64,

    /// A sealed, unpinned segment becomes compaction-eligible once its
    /// freed bytes exceed this threshold.
    pub compact_unpinned_unused_threshold_mb: u64,

    /// Target period, in seconds, for one full read-bit decay sweep of the
    /// control-block table.
    pub read_cache_window_sec: u64,

    /// Master switch for promoting observed-hot objects into pinned space.
    pub enable_read_cache: bool,

    /// Initial size, in bytes, to preallocate the segment heap to.
    pub initial_segments: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            max_pinned_cache_mb: 256,
            compact_pinned_unused_threshold_mb: 8,
            compact_unpinned_unused_threshold_mb: 16,
            read_cache_window_sec: 60,
            enable_read_cache: true,
            initial_segments: 1,
        }
    }
}

impl Config {
    /// Number of top-root slots, derived from a 32-bit [`crate::Address`]
    /// and a 4 KiB filesystem sync unit.
    pub const TOP_ROOT_COUNT: usize = 4096 / std::mem::size_of::<u32>();
}

//! Error taxonomy for the store.
//!
//! Each concern gets its own `thiserror` enum; [`Error`] composes them for
//! the crate-wide `Result`. Internal invariant violations (corruption, a
//! double free, an impossible control-block transition) are not part of
//! this taxonomy at all — they panic, because continuing would silently
//! corrupt user data rather than surface a recoverable condition.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type returned by public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Segment heap / allocator failure.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// Trie mutation or lookup failure.
    #[error(transparent)]
    Trie(#[from] TrieError),

    /// Transaction or root-table failure.
    #[error(transparent)]
    Txn(#[from] TxnError),

    /// Configuration or database-open failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the segment allocator and control-block table.
#[derive(Error, Debug)]
pub enum AllocError {
    /// The segments file could not be grown further (out of file space).
    #[error("segment heap exhausted: cannot grow past {current_segments} segments")]
    SegmentsExhausted {
        /// Segment count at the time of failure.
        current_segments: u32,
    },

    /// The control-block table has allocated all 2^32 addresses.
    #[error("control-block table exhausted: all addresses in use")]
    AddressSpaceExhausted,

    /// A zone's free bitmap reported corruption (bit set for a slot whose
    /// control block is also marked live, or vice versa).
    #[error("control-block zone {zone} bitmap is corrupt")]
    CorruptZone {
        /// Index of the offending zone.
        zone: u32,
    },

    /// Allocation retried past its bound without acquiring a slot.
    #[error("allocator retry bound exceeded after {attempts} attempts")]
    RetryBoundExceeded {
        /// Number of CAS attempts made before giving up.
        attempts: u32,
    },
}

/// Errors from trie node encode/decode and mutation.
#[derive(Error, Debug)]
pub enum TrieError {
    /// Key exceeds [`crate::node::MAX_KEY_LEN`].
    #[error("key length {len} exceeds maximum of {max}")]
    KeyTooLarge {
        /// Actual key length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Inline value exceeds the binary-node inline budget and could not be
    /// spilled (only reachable if value-node allocation itself failed).
    #[error("value length {len} exceeds maximum of {max}")]
    ValueTooLarge {
        /// Actual value length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame's checksum did not match its recorded value while decoding.
    #[error("checksum mismatch decoding node at address {address}")]
    ChecksumMismatch {
        /// Address whose frame failed to verify.
        address: u32,
    },
}

/// Errors surfaced by read/write transactions.
#[derive(Error, Debug)]
pub enum TxnError {
    /// `insert` called on a key that already exists.
    #[error("key already exists")]
    KeyExists,

    /// `update` or `must_remove` called on a key that is absent.
    #[error("key not found")]
    KeyNotFound,

    /// A top-root slot index was out of range.
    #[error("root slot {slot} out of range (0..{count})")]
    RootOutOfRange {
        /// Requested slot.
        slot: u32,
        /// Number of top-root slots.
        count: u32,
    },

    /// A write transaction's `modify_lock` was poisoned by a panic in
    /// another thread's transaction.
    #[error("write transaction lock poisoned")]
    LockPoisoned,

    /// A durability-affecting sync call to the OS failed after commit was
    /// otherwise complete; the database remains internally consistent in
    /// memory but the durability of the most recent commit is unknown.
    #[error("post-commit sync failed: {0}")]
    SyncFailed(String),
}

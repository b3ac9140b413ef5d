//! Process-wide database-instance registry: a bounded set of indices
//! handed out to [`crate::Database`] instances, keying each thread's
//! current-session pointer.
//!
//! Pairs a `once_cell::sync::Lazy` global with a `thread_local!` slot: a
//! lock-protected bitfield in place of a full map, since slot identity
//! (not a value per slot) is all that's tracked.

use std::cell::Cell;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Upper bound on concurrently open databases in one process.
pub const REGISTRY_SLOTS: usize = 64;

static REGISTRY: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

thread_local! {
    static CURRENT_SLOT: Cell<Option<u32>> = const { Cell::new(None) };
}

/// A reservation in the process-wide registry, freed automatically when
/// dropped.
pub struct RegistrySlot(u32);

impl RegistrySlot {
    /// Claim the lowest free slot, failing once all [`REGISTRY_SLOTS`]
    /// are in use.
    pub fn acquire() -> Result<Self> {
        let mut bits = REGISTRY.lock();
        let free = (0..REGISTRY_SLOTS as u32).find(|i| bits.wrapping_shr(*i) & 1 == 0);
        match free {
            Some(slot) => {
                *bits |= 1 << slot;
                Ok(Self(slot))
            }
            None => Err(Error::Config(format!(
                "database-instance registry exhausted ({REGISTRY_SLOTS} slots in use)"
            ))),
        }
    }

    /// This reservation's index.
    pub fn index(&self) -> u32 {
        self.0
    }

    /// Mark this slot as the calling thread's current session for the
    /// lifetime of `f`, restoring whatever was current beforehand.
    pub fn with_current<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT_SLOT.with(|c| c.replace(Some(self.0)));
        let result = f();
        CURRENT_SLOT.with(|c| c.set(previous));
        result
    }
}

impl Drop for RegistrySlot {
    fn drop(&mut self) {
        let mut bits = REGISTRY.lock();
        *bits &= !(1 << self.0);
    }
}

/// The registry index of the calling thread's current database session,
/// if one has been established via [`RegistrySlot::with_current`].
pub fn current_slot() -> Option<u32> {
    CURRENT_SLOT.with(|c| c.get())
}

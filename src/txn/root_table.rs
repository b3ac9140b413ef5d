//! Fixed-size top-root table: one atomically published [`Address`] slot
//! per independent root, each with its own writer mutex so different
//! slots admit parallel writers — at most one writer per top-root slot.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::cbt::Address;
use crate::error::{Result, TxnError};
use crate::segment::log::SegmentWriter;

/// `count` independent root slots. Reads of the published root never
/// block (a plain atomic load); only two writers contending for the
/// *same* slot ever block each other.
///
/// Each slot's mutex guards an `Option<SegmentWriter>`: the slot's
/// persistent per-session bump allocator, lazily opened on its first
/// write transaction and reused across every subsequent commit to that
/// slot, rather than sealing and replacing it on every single commit.
pub struct RootTable {
    slots: Vec<AtomicU32>,
    writers: Vec<Mutex<Option<SegmentWriter>>>,
}

impl RootTable {
    /// Build a table with every slot initialized to `initial_root`. The
    /// caller is responsible for having already retained one strong
    /// reference to `initial_root` per slot.
    pub fn new(initial_root: Address, count: usize) -> Self {
        let slots = (0..count).map(|_| AtomicU32::new(initial_root.raw())).collect();
        let writers = (0..count).map(|_| Mutex::new(None)).collect();
        Self { slots, writers }
    }

    /// Number of root slots.
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot as usize >= self.slots.len() {
            return Err(TxnError::RootOutOfRange {
                slot,
                count: self.slots.len() as u32,
            }
            .into());
        }
        Ok(())
    }

    /// Current root Address published in `slot`.
    pub fn current(&self, slot: u32) -> Result<Address> {
        self.check_slot(slot)?;
        Ok(Address::from_raw(self.slots[slot as usize].load(Ordering::Acquire)))
    }

    /// Acquire `slot`'s writer mutex for the duration of one write
    /// transaction, blocking if another writer already holds it. The
    /// guard exposes `slot`'s persistent [`SegmentWriter`] session,
    /// `None` until the first transaction opens it.
    pub fn lock_writer(&self, slot: u32) -> Result<MutexGuard<'_, Option<SegmentWriter>>> {
        self.check_slot(slot)?;
        Ok(self.writers[slot as usize].lock())
    }

    /// Publish `new_root` into `slot`, returning the Address it
    /// replaced. The caller must already hold `slot`'s writer mutex —
    /// this is the commit step that atomically stores the new root
    /// Address into the slot.
    pub fn publish(&self, slot: u32, new_root: Address) -> Address {
        let previous = self.slots[slot as usize].swap(new_root.raw(), Ordering::AcqRel);
        Address::from_raw(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_reports_initial_root_in_every_slot() {
        let root = Address::from_raw(7);
        let table = RootTable::new(root, 4);
        for slot in 0..4 {
            assert_eq!(table.current(slot).unwrap(), root);
        }
    }

    #[test]
    fn publish_replaces_and_returns_previous() {
        let table = RootTable::new(Address::from_raw(1), 2);
        let guard = table.lock_writer(0).unwrap();
        assert!(guard.is_none());
        drop(guard);
        let previous = table.publish(0, Address::from_raw(2));
        assert_eq!(previous, Address::from_raw(1));
        assert_eq!(table.current(0).unwrap(), Address::from_raw(2));
        assert_eq!(table.current(1).unwrap(), Address::from_raw(1));
    }

    #[test]
    fn out_of_range_slot_errors() {
        let table = RootTable::new(Address::from_raw(1), 2);
        assert!(table.current(5).is_err());
        assert!(table.lock_writer(5).is_err());
    }
}

//! The control-block table: a zone-grown array of control blocks indexed
//! by [`Address`], with hinted and unhinted allocation.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

use crate::cbt::control_block::{ControlBlock, ControlBlockSnapshot, NodeType};
use crate::cbt::zone::Zone;
use crate::config::ZONE_SIZE_ENTRIES;
use crate::error::AllocError;
use crate::Address;

/// Retry bound before an allocation attempt surfaces
/// [`AllocError::RetryBoundExceeded`].
const ALLOC_RETRY_BOUND: u32 = 1 << 20;

/// Zone-grown control-block table.
///
/// Growth is guarded by a single mutex; read paths (`get`, `try_get`) only
/// take the `RwLock` read side and never block on growth.
pub struct ControlBlockTable {
    zones: RwLock<Vec<Zone>>,
    grow_lock: Mutex<()>,
    min_occupancy_zone_hint: AtomicU32,
}

impl Default for ControlBlockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlockTable {
    /// Build a table with a single initial zone.
    pub fn new() -> Self {
        Self {
            zones: RwLock::new(vec![Zone::new(0)]),
            grow_lock: Mutex::new(()),
            min_occupancy_zone_hint: AtomicU32::new(0),
        }
    }

    fn zone_and_local(addr: Address) -> (u32, u32) {
        let raw = addr.0;
        (raw / ZONE_SIZE_ENTRIES, raw % ZONE_SIZE_ENTRIES)
    }

    /// Resolve an address to its control block, panicking if the address
    /// lies outside any allocated zone. Used on hot paths where the
    /// address is known to be live (e.g. just loaded from a parent node).
    pub fn get(&self, addr: Address) -> ControlBlockSnapshot {
        self.try_get(addr)
            .unwrap_or_else(|| panic!("address {addr:?} outside allocated control-block zones"))
    }

    /// Resolve an address to its control block snapshot, or `None` if the
    /// address lies outside the currently allocated zones.
    pub fn try_get(&self, addr: Address) -> Option<ControlBlockSnapshot> {
        let (zone_idx, local) = Self::zone_and_local(addr);
        let zones = self.zones.read();
        zones
            .get(zone_idx as usize)
            .map(|zone| zone.block(local).load(Ordering::Acquire))
    }

    /// Run a closure with a borrowed reference to the raw control block
    /// (for CAS operations that need more than a snapshot).
    pub fn with_block<R>(&self, addr: Address, f: impl FnOnce(&ControlBlock) -> R) -> R {
        let (zone_idx, local) = Self::zone_and_local(addr);
        let zones = self.zones.read();
        let zone = zones
            .get(zone_idx as usize)
            .unwrap_or_else(|| panic!("address {addr:?} outside allocated control-block zones"));
        f(zone.block(local))
    }

    /// Retain a strong reference.
    pub fn retain(&self, addr: Address) {
        self.with_block(addr, |b| b.retain());
    }

    /// Publish a freshly constructed node's real location. See
    /// [`ControlBlock::publish_location`].
    pub fn publish_location(&self, addr: Address, location: u32) {
        self.with_block(addr, |b| b.publish_location(location));
    }

    /// Release a strong reference; if it drops to zero, free the slot.
    pub fn release(&self, addr: Address) {
        let freed_now = self.with_block(addr, |b| b.release());
        if freed_now {
            self.free(addr);
        }
    }

    /// Decrement a strong reference without freeing the slot, even if it
    /// drops to zero. Returns `true` if this decrement dropped the
    /// refcount to zero. Used by the trie's recursive subtree release
    /// ([`crate::trie::refcount`]), which must read the node's children
    /// out of the still-valid location before the slot is cleared.
    pub fn decrement(&self, addr: Address) -> bool {
        self.with_block(addr, |b| b.release())
    }

    /// Return a zeroed-out-and-decremented slot to the free bitmap. Only
    /// valid to call once the caller has already observed (via
    /// [`Self::decrement`]) that the refcount reached zero.
    pub fn free_now(&self, addr: Address) {
        self.free(addr);
    }

    fn free(&self, addr: Address) {
        let (zone_idx, local) = Self::zone_and_local(addr);
        let zones = self.zones.read();
        let zone = &zones[zone_idx as usize];
        if !zone.free(local) {
            panic!("double free detected at address {addr:?}");
        }
    }

    /// Allocate a fresh control block with no locality hint, following the
    /// unhinted policy: pick the minimum-occupancy zone, randomize a
    /// 512-bit window inside its bitmap, claim the highest-popcount byte's
    /// best bit, and retry on lost CAS up to a bound.
    pub fn alloc(&self, ty: NodeType, location: u32) -> Result<Address, AllocError> {
        let mut attempts = 0u32;
        loop {
            let zone_idx = self.pick_min_occupancy_zone();
            let claimed = {
                let zones = self.zones.read();
                let zone = &zones[zone_idx as usize];
                let word_count = Zone::word_count();
                let start = if word_count > 8 {
                    rand::thread_rng().gen_range(0..=word_count - 8)
                } else {
                    0
                };
                zone.try_claim_in_window(start).map(|local| {
                    zone.init_block(local, ty, location);
                    Address(zone_idx * ZONE_SIZE_ENTRIES + local)
                })
            };
            if let Some(addr) = claimed {
                self.maybe_grow();
                return Ok(addr);
            }
            attempts += 1;
            if attempts >= ALLOC_RETRY_BOUND {
                warn!(attempts, "control-block allocation retry bound exceeded");
                return Err(AllocError::RetryBoundExceeded { attempts });
            }
        }
    }

    /// Allocate biased toward the cachelines of `hints`, falling back to
    /// [`Self::alloc`] if none of the hinted bands have room.
    pub fn alloc_hint(
        &self,
        ty: NodeType,
        location: u32,
        hints: &[Address],
    ) -> Result<Address, AllocError> {
        let zones = self.zones.read();
        for hint in hints {
            let (zone_idx, local) = Self::zone_and_local(*hint);
            let Some(zone) = zones.get(zone_idx as usize) else {
                continue;
            };
            let local_base = local & !0xF;
            if let Some(claimed) = zone.try_claim_in_band(local_base) {
                zone.init_block(claimed, ty, location);
                let addr = Address(zone_idx * ZONE_SIZE_ENTRIES + claimed);
                drop(zones);
                self.maybe_grow();
                return Ok(addr);
            }
        }
        drop(zones);
        self.alloc(ty, location)
    }

    /// Used only by recovery to reconstruct a specific address.
    pub fn get_or_alloc(&self, addr: Address, ty: NodeType, location: u32) -> Result<(), AllocError> {
        self.ensure_zone_for(addr);
        let (zone_idx, local) = Self::zone_and_local(addr);
        let zones = self.zones.read();
        let zone = &zones[zone_idx as usize];
        // Recovery forcibly reclaims this exact slot regardless of its
        // current bitmap state.
        zone.try_claim(local);
        zone.init_block(local, ty, location);
        Ok(())
    }

    fn ensure_zone_for(&self, addr: Address) {
        let (zone_idx, _) = Self::zone_and_local(addr);
        loop {
            {
                let zones = self.zones.read();
                if (zone_idx as usize) < zones.len() {
                    return;
                }
            }
            let _guard = self.grow_lock.lock();
            let mut zones = self.zones.write();
            while (zone_idx as usize) >= zones.len() {
                let next = zones.len() as u32;
                zones.push(Zone::new(next));
            }
            return;
        }
    }

    fn pick_min_occupancy_zone(&self) -> u32 {
        let hint = self.min_occupancy_zone_hint.load(Ordering::Relaxed);
        let zones = self.zones.read();
        if (hint as usize) < zones.len() {
            return hint;
        }
        0
    }

    /// Grow by one zone when the *average* occupancy across existing zones
    /// exceeds 50%. Growth is guarded by a single mutex; read paths never
    /// block on it.
    fn maybe_grow(&self) {
        let should_grow = {
            let zones = self.zones.read();
            if zones.is_empty() {
                return;
            }
            let total: f64 = zones.iter().map(|z| z.occupancy()).sum();
            let avg = total / zones.len() as f64;
            let min_idx = zones
                .iter()
                .min_by(|a, b| a.occupancy().partial_cmp(&b.occupancy()).unwrap())
                .map(|z| z.index())
                .unwrap_or(0);
            self.min_occupancy_zone_hint.store(min_idx, Ordering::Relaxed);
            avg > 0.5
        };
        if !should_grow {
            return;
        }
        let _guard = self.grow_lock.lock();
        let mut zones = self.zones.write();
        let total: f64 = zones.iter().map(|z| z.occupancy()).sum();
        let avg = total / zones.len() as f64;
        if avg > 0.5 {
            let next = zones.len() as u32;
            debug!(zone = next, "growing control-block table by one zone");
            zones.push(Zone::new(next));
        }
    }

    /// Number of currently allocated zones.
    pub fn zone_count(&self) -> usize {
        self.zones.read().len()
    }

    /// Total number of live (non-free) control blocks across all zones.
    pub fn live_count(&self) -> u64 {
        self.zones.read().iter().map(|z| z.live_count() as u64).sum()
    }

    /// Clear the read bit on every live control block in one zone (the
    /// decay sweep, spread across zones by [`crate::cache::decay::DecaySweeper`]).
    pub fn clear_read_bits_in_zone(&self, zone: u32) {
        let zones = self.zones.read();
        if let Some(z) = zones.get(zone as usize) {
            z.clear_all_read_bits();
        }
    }
}

//! A single zone: 2^22 control blocks plus a companion free bitmap.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cbt::control_block::{ControlBlock, NodeType};
use crate::config::ZONE_SIZE_ENTRIES;

const WORD_BITS: u32 = 64;
const WORDS_PER_ZONE: u32 = ZONE_SIZE_ENTRIES / WORD_BITS;

/// One zone of the control-block table: `ZONE_SIZE_ENTRIES` control blocks
/// and a parallel bitmap (1 = free) used to find and claim slots.
pub struct Zone {
    index: u32,
    blocks: Box<[ControlBlock]>,
    /// 1 = free, 0 = in use. `fetch_and`/`fetch_or` on individual words is
    /// the atomicity domain for claiming/freeing a bit.
    free_bitmap: Box<[AtomicU64]>,
    live_count: AtomicU32,
}

impl Zone {
    /// Build a new, entirely-free zone at `index`. If this zone contains
    /// the reserved null-cacheline band (the top 16 addresses of the full
    /// 32-bit address space, `0xFFFF_FFF0..=0xFFFF_FFFF`), those bits are
    /// marked permanently unavailable so the allocator can never return an
    /// address the cacheline encoding reserves as "null".
    pub fn new(index: u32) -> Self {
        let blocks = (0..ZONE_SIZE_ENTRIES)
            .map(|_| ControlBlock::new_free())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free_bitmap = (0..WORDS_PER_ZONE)
            .map(|_| AtomicU64::new(u64::MAX))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let zone = Self {
            index,
            blocks,
            free_bitmap,
            live_count: AtomicU32::new(0),
        };
        zone.reserve_null_cacheline_band();
        zone
    }

    fn reserve_null_cacheline_band(&self) {
        const NULL_CACHELINE_BASE: u32 = 0xFFFF_FFF0;
        let zone_base = self.index * ZONE_SIZE_ENTRIES;
        let zone_end = zone_base + ZONE_SIZE_ENTRIES;
        if NULL_CACHELINE_BASE >= zone_base && NULL_CACHELINE_BASE < zone_end {
            let local_base = NULL_CACHELINE_BASE - zone_base;
            for slot in local_base..(local_base + 16).min(ZONE_SIZE_ENTRIES) {
                self.clear_free_bit(slot);
            }
        }
    }

    fn clear_free_bit(&self, local: u32) {
        let word = (local / WORD_BITS) as usize;
        let bit = local % WORD_BITS;
        self.free_bitmap[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
    }

    /// Zone index within the table.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Number of live (non-free) control blocks, for the growth heuristic.
    pub fn live_count(&self) -> u32 {
        self.live_count.load(Ordering::Relaxed)
    }

    /// Fraction of the zone's slots currently in use.
    pub fn occupancy(&self) -> f64 {
        self.live_count() as f64 / ZONE_SIZE_ENTRIES as f64
    }

    /// Control block at local index `local`.
    pub fn block(&self, local: u32) -> &ControlBlock {
        &self.blocks[local as usize]
    }

    /// Try to atomically claim the free bit at `local`. Returns `true` on
    /// success.
    pub fn try_claim(&self, local: u32) -> bool {
        let word = (local / WORD_BITS) as usize;
        let bit = local % WORD_BITS;
        let mask = 1u64 << bit;
        let prev = self.free_bitmap[word].fetch_and(!mask, Ordering::AcqRel);
        let claimed = prev & mask != 0;
        if claimed {
            self.live_count.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    /// Return a slot to the free bitmap and clear its control block.
    /// Double-free is detectable: the bit is already free.
    pub fn free(&self, local: u32) -> bool {
        let word = (local / WORD_BITS) as usize;
        let bit = local % WORD_BITS;
        let mask = 1u64 << bit;
        self.blocks[local as usize].clear();
        let prev = self.free_bitmap[word].fetch_or(mask, Ordering::AcqRel);
        let was_free = prev & mask != 0;
        if !was_free {
            self.live_count.fetch_sub(1, Ordering::Relaxed);
        }
        !was_free
    }

    /// Pick the highest-popcount byte inside an 8-word (512-bit) window
    /// starting at `start_word`, and attempt to claim one of its set bits.
    /// Returns the claimed local index, if any.
    pub fn try_claim_in_window(&self, start_word: u32) -> Option<u32> {
        let end_word = (start_word + 8).min(WORDS_PER_ZONE);
        let mut best_byte: Option<(u32, u8, u32)> = None; // (word, byte offset, popcount)
        for w in start_word..end_word {
            let value = self.free_bitmap[w as usize].load(Ordering::Relaxed);
            for byte_off in 0..8u32 {
                let byte = ((value >> (byte_off * 8)) & 0xFF) as u8;
                let pc = byte.count_ones();
                if pc == 0 {
                    continue;
                }
                if best_byte.map(|(_, _, best_pc)| pc > best_pc).unwrap_or(true) {
                    best_byte = Some((w, byte_off as u8, pc));
                }
            }
        }
        let (word, byte_off, _) = best_byte?;
        for bit_in_byte in 0..8u32 {
            let bit = byte_off as u32 * 8 + bit_in_byte;
            let local = word * WORD_BITS + bit;
            if self.try_claim(local) {
                return Some(local);
            }
        }
        None
    }

    /// Attempt to claim any free slot in the 16-slot cacheline band
    /// starting at `local_base` (caller guarantees 16-alignment).
    pub fn try_claim_in_band(&self, local_base: u32) -> Option<u32> {
        for local in local_base..(local_base + 16).min(ZONE_SIZE_ENTRIES) {
            if self.try_claim(local) {
                return Some(local);
            }
        }
        None
    }

    /// Number of bitmap words in a zone (exposed for window randomization).
    pub fn word_count() -> u32 {
        WORDS_PER_ZONE
    }

    /// Initialize a freshly claimed block's control block contents.
    pub fn init_block(&self, local: u32, ty: NodeType, location: u32) {
        self.blocks[local as usize].init(ty, location);
    }

    /// Clear the read bit on every live control block in this zone (the
    /// decay sweep). Skips free slots, which have no meaningful state to
    /// decay.
    pub fn clear_all_read_bits(&self) {
        for block in self.blocks.iter() {
            if !block.load(Ordering::Relaxed).is_freed() {
                block.clear_read_bit();
            }
        }
    }
}

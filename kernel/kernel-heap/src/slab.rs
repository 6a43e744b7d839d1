//! # Slab Metadata
//!
//! One slab is one page holding `4096 / class` equally sized objects,
//! tracked by a slot inventory (0 = free, 1 = used) and a free count. The
//! metadata lives in a fixed arena inside the heap; slabs link into the
//! per-class partial/full/empty lists through arena indices, never through
//! pointers.

use kernel_addresses::{PAGE_SIZE, VirtAddr};

/// Index sentinel terminating a slab list.
pub(crate) const NIL: u16 = u16::MAX;

/// List a slab belongs to. Every live slab is a member of exactly one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SlabState {
    /// Some slots used, some free.
    Partial = 0,
    /// Every slot used.
    Full = 1,
    /// Every slot free.
    Empty = 2,
}

pub(crate) const SLAB_STATES: usize = 3;

/// Metadata of one slab.
#[derive(Copy, Clone)]
pub(crate) struct SlabMeta {
    /// Size-class index.
    pub(crate) class: usize,
    /// Page backing the objects.
    pub(crate) base: VirtAddr,
    /// One bit per object slot, `0` = free. Bits beyond the capacity stay
    /// permanently used.
    pub(crate) inventory: [u64; 4],
    pub(crate) free_count: usize,
    pub(crate) state: SlabState,
    pub(crate) next: u16,
    pub(crate) prev: u16,
    pub(crate) live: bool,
}

impl SlabMeta {
    pub(crate) const DEAD: Self = Self {
        class: 0,
        base: VirtAddr::new(0),
        inventory: [u64::MAX; 4],
        free_count: 0,
        state: SlabState::Empty,
        next: NIL,
        prev: NIL,
        live: false,
    };

    /// A fresh slab for `class_bytes`-sized objects backed by `base`.
    pub(crate) fn fresh(class: usize, class_bytes: usize, base: VirtAddr) -> Self {
        let capacity = PAGE_SIZE as usize / class_bytes;
        let mut inventory = [u64::MAX; 4];
        for slot in 0..capacity {
            inventory[slot / 64] &= !(1 << (slot % 64));
        }
        Self {
            class,
            base,
            inventory,
            free_count: capacity,
            state: SlabState::Empty,
            next: NIL,
            prev: NIL,
            live: true,
        }
    }

    /// Objects this slab holds when full.
    pub(crate) const fn capacity(&self, class_bytes: usize) -> usize {
        PAGE_SIZE as usize / class_bytes
    }

    /// Lowest free slot. `None` only when the slab is full.
    pub(crate) fn lowest_free_slot(&self) -> Option<usize> {
        for (word_idx, &word) in self.inventory.iter().enumerate() {
            if word != u64::MAX {
                return Some(word_idx * 64 + (!word).trailing_zeros() as usize);
            }
        }
        None
    }

    #[inline]
    pub(crate) const fn is_slot_used(&self, slot: usize) -> bool {
        self.inventory[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub(crate) fn mark_used(&mut self, slot: usize) {
        debug_assert!(!self.is_slot_used(slot));
        self.inventory[slot / 64] |= 1 << (slot % 64);
        self.free_count -= 1;
    }

    pub(crate) fn mark_free(&mut self, slot: usize) {
        debug_assert!(self.is_slot_used(slot));
        self.inventory[slot / 64] &= !(1 << (slot % 64));
        self.free_count += 1;
    }

    /// The list this slab belongs to at its current fill level.
    pub(crate) fn target_state(&self, class_bytes: usize) -> SlabState {
        if self.free_count == 0 {
            SlabState::Full
        } else if self.free_count == self.capacity(class_bytes) {
            SlabState::Empty
        } else {
            SlabState::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slab_is_empty_with_tail_bits_used() {
        let slab = SlabMeta::fresh(3, 128, VirtAddr::new(0x1000));
        assert_eq!(slab.free_count, 32);
        assert_eq!(slab.lowest_free_slot(), Some(0));
        assert!(slab.is_slot_used(32), "beyond-capacity bits stay used");
        assert_eq!(slab.target_state(128), SlabState::Empty);
    }

    #[test]
    fn fill_level_drives_the_target_state() {
        let mut slab = SlabMeta::fresh(7, 2048, VirtAddr::new(0x1000));
        assert_eq!(slab.capacity(2048), 2);
        slab.mark_used(0);
        assert_eq!(slab.target_state(2048), SlabState::Partial);
        slab.mark_used(1);
        assert_eq!(slab.target_state(2048), SlabState::Full);
        slab.mark_free(0);
        assert_eq!(slab.target_state(2048), SlabState::Partial);
        slab.mark_free(1);
        assert_eq!(slab.target_state(2048), SlabState::Empty);
    }

    #[test]
    fn slots_come_back_lowest_first() {
        let mut slab = SlabMeta::fresh(0, 16, VirtAddr::new(0x1000));
        for expected in 0..4 {
            let slot = slab.lowest_free_slot().unwrap();
            assert_eq!(slot, expected);
            slab.mark_used(slot);
        }
        slab.mark_free(1);
        assert_eq!(slab.lowest_free_slot(), Some(1));
    }
}

//! # Zones and Bit Inventories
//!
//! One [`ZoneInventory`] tracks the frames of a contiguous physical range
//! with one bit per frame: `0` = free, `1` = used. A monotonic first-free
//! hint narrows where scans start; it never causes a false "no space"
//! because `free` lowers it and allocation only raises it past consumed
//! bits.
//!
//! Inventory capacity is fixed at compile time per zone; the populated span
//! (`frame_count`) is set at initialization from the actual memory size and
//! all bits beyond it stay permanently used.

use kernel_addresses::{PAGE_SHIFT, PhysAddr};

/// The physical zones, ordered by address.
///
/// `Dma` is kept for devices that cannot reach higher memory; `Normal` is
/// the default allocation zone; `High` is everything above it up to the
/// managed cap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Zone {
    /// Low memory reachable by legacy DMA engines.
    Dma,
    /// The default zone.
    Normal,
    /// Memory above the normal zone.
    High,
}

/// Bits per inventory word.
const WORD_BITS: usize = u64::BITS as usize;

/// Frame inventory of one zone.
///
/// # Invariants
/// - `free_frames` equals the number of zero bits in
///   `inventory[.. frame_count bits]` after any operation sequence.
/// - No zero bit exists below `hint`.
/// - Bits at and beyond `frame_count` are always `1`.
pub(crate) struct ZoneInventory<const WORDS: usize> {
    /// Physical base address of the zone.
    base: u64,
    /// Populated frames; the remainder of the capacity stays used.
    frame_count: usize,
    /// Number of zero bits within the populated span.
    free_frames: usize,
    /// First frame index worth scanning from.
    hint: usize,
    /// One bit per frame, `0` = free, `1` = used.
    inventory: [u64; WORDS],
}

impl<const WORDS: usize> ZoneInventory<WORDS> {
    /// An inventory with every frame marked used and no populated span.
    pub(crate) const fn new(base: u64) -> Self {
        Self {
            base,
            frame_count: 0,
            free_frames: 0,
            hint: 0,
            inventory: [u64::MAX; WORDS],
        }
    }

    /// Set the populated span, clamped to the compile-time capacity.
    pub(crate) fn set_span(&mut self, frame_count: usize) {
        self.frame_count = frame_count.min(WORDS * WORD_BITS);
    }

    #[inline]
    pub(crate) const fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub(crate) const fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub(crate) const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frame index within this zone for a physical address, if the address
    /// falls into the populated span.
    pub(crate) fn index_of(&self, addr: PhysAddr) -> Option<usize> {
        let idx = usize::try_from((addr.as_u64() - self.base) >> PAGE_SHIFT).ok()?;
        (idx < self.frame_count).then_some(idx)
    }

    /// Physical base address of the frame at `idx`.
    #[inline]
    pub(crate) const fn address_of(&self, idx: usize) -> PhysAddr {
        PhysAddr::new(self.base + ((idx as u64) << PAGE_SHIFT))
    }

    /// Allocate the lowest free frame, scanning word-wise from the hint.
    pub(crate) fn allocate(&mut self) -> Option<usize> {
        let last_word = self.frame_count.div_ceil(WORD_BITS);
        for word_idx in self.hint / WORD_BITS..last_word {
            let word = self.inventory[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let idx = word_idx * WORD_BITS + bit;
            debug_assert!(idx < self.frame_count);
            debug_assert!(idx >= self.hint, "free bit below the hint");
            self.inventory[word_idx] |= 1 << bit;
            self.free_frames -= 1;
            if idx == self.hint {
                self.hint = idx + 1;
            }
            return Some(idx);
        }
        None
    }

    /// Allocate `count` consecutive frames.
    ///
    /// Linear per-bit scan counting consecutive free frames, resetting the
    /// run on any used bit. O(frame count) worst case and does not consult
    /// the hint; single-frame allocation is the fast path, runs are for
    /// rare device-buffer setups.
    pub(crate) fn allocate_run(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free_frames {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for idx in 0..self.frame_count {
            if self.is_used(idx) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.inventory[i / WORD_BITS] |= 1 << (i % WORD_BITS);
                    }
                    self.free_frames -= count;
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Mark the frame at `idx` free.
    ///
    /// Returns `false` if it was already free (the caller decides whether
    /// that is a guarded no-op or an invariant violation).
    pub(crate) fn free(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.frame_count);
        if !self.is_used(idx) {
            return false;
        }
        self.inventory[idx / WORD_BITS] &= !(1 << (idx % WORD_BITS));
        self.free_frames += 1;
        if idx < self.hint {
            self.hint = idx;
        }
        true
    }

    #[inline]
    pub(crate) const fn is_used(&self, idx: usize) -> bool {
        self.inventory[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    /// Recount the zero bits of the populated span.
    ///
    /// Diagnostic; the result must always equal [`free_frames`](Self::free_frames).
    pub(crate) fn count_free_bits(&self) -> usize {
        let mut zeros = 0;
        for idx in 0..self.frame_count {
            if !self.is_used(idx) {
                zeros += 1;
            }
        }
        zeros
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated(frames: usize) -> ZoneInventory<64> {
        let mut zone = ZoneInventory::<64>::new(0);
        zone.set_span(frames);
        for idx in 0..frames {
            assert!(zone.free(idx));
        }
        zone
    }

    #[test]
    fn allocates_lowest_free_frame() {
        let mut zone = populated(128);
        assert_eq!(zone.allocate(), Some(0));
        assert_eq!(zone.allocate(), Some(1));
        assert!(zone.free(0));
        assert_eq!(zone.allocate(), Some(0), "freed frame lowers the hint");
    }

    #[test]
    fn hint_never_hides_free_frames() {
        let mut zone = populated(128);
        // Drain a full word so the hint crosses a word boundary.
        for expected in 0..64 {
            assert_eq!(zone.allocate(), Some(expected));
        }
        assert!(zone.free(3));
        assert_eq!(zone.allocate(), Some(3));
        assert_eq!(zone.allocate(), Some(64));
    }

    #[test]
    fn run_allocation_resets_on_used_bit() {
        let mut zone = populated(128);
        assert_eq!(zone.allocate(), Some(0));
        assert_eq!(zone.allocate(), Some(1));
        assert!(zone.free(0));
        // Frame 1 is used, so a run of 3 cannot start at 0.
        assert_eq!(zone.allocate_run(3), Some(2));
        for idx in 2..5 {
            assert!(zone.is_used(idx));
        }
    }

    #[test]
    fn free_count_matches_inventory_zeros() {
        let mut zone = populated(100);
        let _ = zone.allocate();
        let _ = zone.allocate_run(7);
        assert!(zone.free(0));
        assert_eq!(zone.free_frames(), zone.count_free_bits());
    }

    #[test]
    fn double_free_is_reported() {
        let mut zone = populated(16);
        assert_eq!(zone.allocate(), Some(0));
        assert!(zone.free(0));
        assert!(!zone.free(0), "second free of the same frame must not count");
        assert_eq!(zone.free_frames(), zone.count_free_bits());
    }
}

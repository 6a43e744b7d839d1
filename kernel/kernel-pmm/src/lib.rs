//! # Physical Frame Allocator
//!
//! Hands out 4 KiB physical frames from zoned bit inventories. The zones
//! ([`Zone::Dma`], [`Zone::Normal`], [`Zone::High`]) partition managed
//! physical memory at the boundaries in [`kernel_info::memory`]; each zone
//! tracks its frames with one bit per frame and a first-free hint.
//!
//! Exhaustion is an expected outcome and is reported as `None`; callers
//! decide how to degrade. Freeing a frame that is already free is a guarded
//! no-op that logs a warning, it never corrupts the inventory.
//!
//! Two initialization paths exist: [`FrameAllocator::from_memory_map`] seeds
//! the inventories from the boot memory map, and
//! [`FrameAllocator::with_fallback_layout`] assumes a flat layout when no
//! map was handed over.

#![cfg_attr(not(test), no_std)]

mod zone;

use core::sync::atomic::{AtomicUsize, Ordering};

use kernel_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, align_down, align_up};
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::{
    DMA_ZONE_END, LOW_MEMORY_RESERVATION, MANAGED_PHYS_END, NORMAL_ZONE_END,
};
use log::{debug, info, warn};

pub use zone::Zone;
use zone::ZoneInventory;

/// Inventory words of the DMA zone.
const DMA_WORDS: usize = (DMA_ZONE_END / PAGE_SIZE) as usize / 64;
/// Inventory words of the normal zone.
const NORMAL_WORDS: usize = ((NORMAL_ZONE_END - DMA_ZONE_END) / PAGE_SIZE) as usize / 64;
/// Inventory words of the high zone.
const HIGH_WORDS: usize = ((MANAGED_PHYS_END - NORMAL_ZONE_END) / PAGE_SIZE) as usize / 64;

const _: () = {
    assert!(DMA_ZONE_END.is_multiple_of(PAGE_SIZE * 64));
    assert!(NORMAL_ZONE_END.is_multiple_of(PAGE_SIZE * 64));
    assert!(MANAGED_PHYS_END.is_multiple_of(PAGE_SIZE * 64));
};

/// Point-in-time frame accounting.
///
/// `total == free + reserved + kernel + outstanding allocations` holds at
/// all times.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames under management across all zones.
    pub total_frames: usize,
    /// Frames currently free.
    pub free_frames: usize,
    /// Frames withheld at initialization (low memory, holes, frame 0).
    pub reserved_frames: usize,
    /// Frames occupied by the kernel image.
    pub kernel_frames: usize,
}

/// The zoned physical frame allocator.
pub struct FrameAllocator {
    dma: ZoneInventory<DMA_WORDS>,
    normal: ZoneInventory<NORMAL_WORDS>,
    high: ZoneInventory<HIGH_WORDS>,
    /// Mirror of the summed per-zone free counts, readable without
    /// exclusive access for [`stats`](Self::stats).
    free_total: AtomicUsize,
    total_frames: usize,
    reserved_frames: usize,
    kernel_frames: usize,
}

impl FrameAllocator {
    fn empty() -> Self {
        Self {
            dma: ZoneInventory::new(0),
            normal: ZoneInventory::new(DMA_ZONE_END),
            high: ZoneInventory::new(NORMAL_ZONE_END),
            free_total: AtomicUsize::new(0),
            total_frames: 0,
            reserved_frames: 0,
            kernel_frames: 0,
        }
    }

    /// Size the per-zone spans for memory ending at `managed_end`.
    fn set_spans(&mut self, managed_end: u64) {
        let dma_end = managed_end.min(DMA_ZONE_END);
        let normal_end = managed_end.clamp(DMA_ZONE_END, NORMAL_ZONE_END);
        let high_end = managed_end.max(NORMAL_ZONE_END);
        self.dma.set_span((dma_end / PAGE_SIZE) as usize);
        self.normal
            .set_span(((normal_end - DMA_ZONE_END) / PAGE_SIZE) as usize);
        self.high
            .set_span(((high_end - NORMAL_ZONE_END) / PAGE_SIZE) as usize);
        self.total_frames =
            self.dma.frame_count() + self.normal.frame_count() + self.high.frame_count();
    }

    /// Seed the inventories from the boot memory map.
    ///
    /// Only [usable](MemoryMapEntry::is_usable) regions contribute frames;
    /// partial frames at region edges are dropped. Frames overlapping the
    /// kernel image `[kernel_start, kernel_end)` are accounted as kernel
    /// frames, frame 0 stays reserved so [`PhysAddr::NULL`] is never a
    /// valid frame. Memory beyond the managed cap is ignored with a
    /// warning.
    #[must_use]
    pub fn from_memory_map(
        map: &[MemoryMapEntry],
        kernel_start: PhysAddr,
        kernel_end: PhysAddr,
    ) -> Self {
        let mut this = Self::empty();

        let mut managed_end = 0;
        for entry in map.iter().filter(|e| e.is_usable()) {
            if entry.end() > MANAGED_PHYS_END {
                warn!(
                    "usable region 0x{:x}..0x{:x} extends beyond the managed cap, truncating",
                    entry.base,
                    entry.end()
                );
            }
            managed_end = managed_end.max(entry.end().min(MANAGED_PHYS_END));
        }
        this.set_spans(align_down(managed_end, PAGE_SIZE));

        for entry in map.iter().filter(|e| e.is_usable()) {
            let first = align_up(entry.base, PAGE_SIZE) >> PAGE_SHIFT;
            let last = align_down(entry.end().min(MANAGED_PHYS_END), PAGE_SIZE) >> PAGE_SHIFT;
            for frame in first..last {
                let addr = PhysAddr::from_frame_number(frame);
                if addr == PhysAddr::NULL {
                    continue;
                }
                if Self::overlaps_kernel(addr, kernel_start, kernel_end) {
                    this.kernel_frames += 1;
                } else {
                    this.release_at_init(addr);
                }
            }
        }

        this.finish_init("memory map")
    }

    /// Seed the inventories assuming a flat `[0, total_bytes)` layout.
    ///
    /// Used when the boot protocol handed over no memory map. Everything
    /// below [`LOW_MEMORY_RESERVATION`] stays reserved; the rest is free
    /// except for the kernel image.
    #[must_use]
    pub fn with_fallback_layout(
        kernel_start: PhysAddr,
        kernel_end: PhysAddr,
        total_bytes: u64,
    ) -> Self {
        let mut this = Self::empty();
        let managed_end = align_down(total_bytes, PAGE_SIZE).min(MANAGED_PHYS_END);
        this.set_spans(managed_end);

        let first = LOW_MEMORY_RESERVATION >> PAGE_SHIFT;
        let last = managed_end >> PAGE_SHIFT;
        for frame in first..last {
            let addr = PhysAddr::from_frame_number(frame);
            if Self::overlaps_kernel(addr, kernel_start, kernel_end) {
                this.kernel_frames += 1;
            } else {
                this.release_at_init(addr);
            }
        }

        this.finish_init("fallback layout")
    }

    fn overlaps_kernel(frame: PhysAddr, kernel_start: PhysAddr, kernel_end: PhysAddr) -> bool {
        frame.as_u64() < kernel_end.as_u64()
            && frame.as_u64() + PAGE_SIZE > kernel_start.as_u64()
    }

    fn release_at_init(&mut self, addr: PhysAddr) {
        match self.zone_of(addr) {
            Some(Zone::Dma) => {
                if let Some(idx) = self.dma.index_of(addr) {
                    let _ = self.dma.free(idx);
                }
            }
            Some(Zone::Normal) => {
                if let Some(idx) = self.normal.index_of(addr) {
                    let _ = self.normal.free(idx);
                }
            }
            Some(Zone::High) => {
                if let Some(idx) = self.high.index_of(addr) {
                    let _ = self.high.free(idx);
                }
            }
            None => {}
        }
    }

    fn finish_init(mut self, origin: &str) -> Self {
        let free = self.dma.free_frames() + self.normal.free_frames() + self.high.free_frames();
        self.reserved_frames = self.total_frames - free - self.kernel_frames;
        self.free_total.store(free, Ordering::Relaxed);
        info!(
            "frame allocator initialized from {origin}: {} frames total, {} free, {} reserved, {} kernel",
            self.total_frames, free, self.reserved_frames, self.kernel_frames
        );
        debug!(
            "zone spans: dma {} frames, normal {} frames, high {} frames",
            self.dma.frame_count(),
            self.normal.frame_count(),
            self.high.frame_count()
        );
        self
    }

    /// The zone containing `addr`, if it is under management.
    fn zone_of(&self, addr: PhysAddr) -> Option<Zone> {
        let a = addr.as_u64();
        if a < DMA_ZONE_END {
            Some(Zone::Dma)
        } else if a < NORMAL_ZONE_END {
            Some(Zone::Normal)
        } else if a < MANAGED_PHYS_END {
            Some(Zone::High)
        } else {
            None
        }
    }

    fn allocate_from(&mut self, zone: Zone) -> Option<PhysAddr> {
        match zone {
            Zone::Dma => self.dma.allocate().map(|i| self.dma.address_of(i)),
            Zone::Normal => self.normal.allocate().map(|i| self.normal.address_of(i)),
            Zone::High => self.high.allocate().map(|i| self.high.address_of(i)),
        }
    }

    fn allocate_run_from(&mut self, zone: Zone, count: usize) -> Option<PhysAddr> {
        match zone {
            Zone::Dma => self.dma.allocate_run(count).map(|i| self.dma.address_of(i)),
            Zone::Normal => self
                .normal
                .allocate_run(count)
                .map(|i| self.normal.address_of(i)),
            Zone::High => self
                .high
                .allocate_run(count)
                .map(|i| self.high.address_of(i)),
        }
    }

    /// Allocate one frame from the default zone.
    ///
    /// Falls back across zones like [`allocate_in`](Self::allocate_in);
    /// `None` means physical memory is exhausted.
    pub fn allocate(&mut self) -> Option<PhysAddr> {
        self.allocate_in(Zone::Normal)
    }

    /// Allocate one frame, preferring `zone`.
    ///
    /// If the preferred zone is exhausted the request falls back to
    /// [`Zone::High`] and finally [`Zone::Dma`].
    pub fn allocate_in(&mut self, zone: Zone) -> Option<PhysAddr> {
        for candidate in [zone, Zone::High, Zone::Dma] {
            if let Some(addr) = self.allocate_from(candidate) {
                self.free_total.fetch_sub(1, Ordering::Relaxed);
                return Some(addr);
            }
        }
        warn!("physical memory exhausted, no frame in any zone");
        None
    }

    /// Allocate `count` physically consecutive frames, preferring `zone`.
    ///
    /// Runs never cross a zone boundary. Same fallback order as single
    /// allocation; returns the base of the run.
    pub fn allocate_contiguous(&mut self, count: usize, zone: Zone) -> Option<PhysAddr> {
        for candidate in [zone, Zone::High, Zone::Dma] {
            if let Some(addr) = self.allocate_run_from(candidate, count) {
                self.free_total.fetch_sub(count, Ordering::Relaxed);
                return Some(addr);
            }
        }
        warn!("no run of {count} consecutive frames in any zone");
        None
    }

    /// Return one frame to its zone.
    ///
    /// Freeing an unmanaged or already-free frame is a guarded no-op with
    /// a warning; the inventory stays consistent.
    pub fn free(&mut self, addr: PhysAddr) {
        let addr = addr.page_base();
        let released = match self.zone_of(addr) {
            Some(Zone::Dma) => self
                .dma
                .index_of(addr)
                .is_some_and(|idx| self.dma.free(idx)),
            Some(Zone::Normal) => self
                .normal
                .index_of(addr)
                .is_some_and(|idx| self.normal.free(idx)),
            Some(Zone::High) => self
                .high
                .index_of(addr)
                .is_some_and(|idx| self.high.free(idx)),
            None => {
                warn!("free of unmanaged frame {addr} ignored");
                return;
            }
        };
        if released {
            self.free_total.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!("double free of frame {addr} ignored");
        }
    }

    /// Return `count` consecutive frames starting at `addr`.
    pub fn free_contiguous(&mut self, addr: PhysAddr, count: usize) {
        for i in 0..count {
            self.free(addr + (i as u64) * PAGE_SIZE);
        }
    }

    /// Point-in-time accounting snapshot.
    ///
    /// The free count is read from a relaxed atomic mirror; it is exact
    /// whenever the caller holds the allocator exclusively.
    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            free_frames: self.free_total.load(Ordering::Relaxed),
            reserved_frames: self.reserved_frames,
            kernel_frames: self.kernel_frames,
        }
    }

    /// Free frames remaining in one zone.
    #[must_use]
    pub fn free_in_zone(&self, zone: Zone) -> usize {
        match zone {
            Zone::Dma => self.dma.free_frames(),
            Zone::Normal => self.normal.free_frames(),
            Zone::High => self.high.free_frames(),
        }
    }

    /// Recount every inventory bit and compare against the running counts.
    ///
    /// Diagnostic used by integrity checks; `false` means the inventory
    /// and the counters disagree.
    #[must_use]
    pub fn verify_inventory(&self) -> bool {
        let recounted =
            self.dma.count_free_bits() + self.normal.count_free_bits() + self.high.count_free_bits();
        let summed =
            self.dma.free_frames() + self.normal.free_frames() + self.high.free_frames();
        recounted == summed && summed == self.free_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    fn kernel_image() -> (PhysAddr, PhysAddr) {
        (PhysAddr::new(16 * MIB), PhysAddr::new(16 * MIB + 64 * 1024))
    }

    #[test]
    fn fallback_layout_accounting() {
        let (kstart, kend) = kernel_image();
        let pmm = FrameAllocator::with_fallback_layout(kstart, kend, 256 * MIB);
        let stats = pmm.stats();
        assert_eq!(stats.total_frames, 65_536);
        assert_eq!(stats.kernel_frames, 16);
        assert_eq!(stats.reserved_frames, 4096);
        assert_eq!(stats.free_frames, 61_424);
        assert!(pmm.verify_inventory());
    }

    #[test]
    fn memory_map_accounting() {
        let (kstart, kend) = kernel_image();
        let map = [
            MemoryMapEntry::usable(0, 4 * MIB),
            MemoryMapEntry {
                base: 4 * MIB,
                length: 12 * MIB,
                entry_type: 2,
                reserved: 0,
            },
            MemoryMapEntry::usable(16 * MIB, 240 * MIB),
        ];
        let pmm = FrameAllocator::from_memory_map(&map, kstart, kend);
        let stats = pmm.stats();
        assert_eq!(stats.total_frames, 65_536);
        assert_eq!(stats.kernel_frames, 16);
        // 4 MiB minus frame 0, plus 240 MiB minus the kernel image.
        assert_eq!(stats.free_frames, 1023 + 61_440 - 16);
        assert_eq!(
            stats.total_frames,
            stats.free_frames + stats.reserved_frames + stats.kernel_frames
        );
        assert!(pmm.verify_inventory());
    }

    #[test]
    fn truncates_beyond_managed_cap() {
        let map = [MemoryMapEntry::usable(0, 4096 * MIB)];
        let pmm = FrameAllocator::from_memory_map(&map, PhysAddr::new(MIB), PhysAddr::new(2 * MIB));
        assert_eq!(pmm.stats().total_frames, 262_144);
        assert!(pmm.verify_inventory());
    }

    #[test]
    fn falls_back_high_then_dma() {
        // Normal zone fully occupied by the kernel, one free frame in High,
        // the DMA zone open.
        let map = [
            MemoryMapEntry::usable(0, 16 * MIB),
            MemoryMapEntry::usable(16 * MIB, 2 * PAGE_SIZE),
            MemoryMapEntry::usable(896 * MIB, PAGE_SIZE),
        ];
        let kstart = PhysAddr::new(16 * MIB);
        let kend = PhysAddr::new(16 * MIB + 2 * PAGE_SIZE);
        let mut pmm = FrameAllocator::from_memory_map(&map, kstart, kend);
        assert_eq!(pmm.free_in_zone(Zone::Normal), 0);

        assert_eq!(pmm.allocate(), Some(PhysAddr::new(896 * MIB)));
        // High is drained too; the last resort is the DMA zone, lowest
        // frame first (frame 0 stays reserved).
        assert_eq!(pmm.allocate(), Some(PhysAddr::new(PAGE_SIZE)));
        assert!(pmm.verify_inventory());
    }

    #[test]
    fn exhaustion_is_a_value_not_a_failure() {
        let map = [MemoryMapEntry::usable(16 * MIB, 4 * PAGE_SIZE)];
        let kstart = PhysAddr::new(16 * MIB);
        let kend = PhysAddr::new(16 * MIB + PAGE_SIZE);
        let mut pmm = FrameAllocator::from_memory_map(&map, kstart, kend);

        let mut held = Vec::new();
        while let Some(addr) = pmm.allocate() {
            held.push(addr);
        }
        assert_eq!(held.len(), 3);
        assert_eq!(pmm.stats().free_frames, 0);

        pmm.free(held.pop().unwrap());
        assert!(pmm.allocate().is_some());
    }

    #[test]
    fn double_free_is_guarded() {
        let (kstart, kend) = kernel_image();
        let mut pmm = FrameAllocator::with_fallback_layout(kstart, kend, 64 * MIB);
        let addr = pmm.allocate().unwrap();
        let free_before = pmm.stats().free_frames;

        pmm.free(addr);
        pmm.free(addr);
        assert_eq!(pmm.stats().free_frames, free_before + 1);
        assert!(pmm.verify_inventory());

        // Unmanaged addresses are ignored as well.
        pmm.free(PhysAddr::new(2 * MANAGED_PHYS_END));
        assert!(pmm.verify_inventory());
    }

    #[test]
    fn contiguous_run_is_consecutive() {
        let (kstart, kend) = kernel_image();
        let mut pmm = FrameAllocator::with_fallback_layout(kstart, kend, 64 * MIB);
        let free_before = pmm.stats().free_frames;

        let base = pmm.allocate_contiguous(8, Zone::Normal).unwrap();
        assert_eq!(pmm.stats().free_frames, free_before - 8);
        // A second single allocation must not land inside the run.
        let single = pmm.allocate().unwrap();
        let run = base.as_u64()..base.as_u64() + 8 * PAGE_SIZE;
        assert!(!run.contains(&single.as_u64()));

        pmm.free_contiguous(base, 8);
        pmm.free(single);
        assert_eq!(pmm.stats().free_frames, free_before);
        assert!(pmm.verify_inventory());
    }

    #[test]
    fn no_frame_is_handed_out_twice() {
        let (kstart, kend) = kernel_image();
        let mut pmm = FrameAllocator::with_fallback_layout(kstart, kend, 128 * MIB);
        let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
        let mut held: Vec<PhysAddr> = Vec::new();
        let mut live: HashSet<u64> = HashSet::new();

        for _ in 0..10_000 {
            if rng.next() % 3 != 0 || held.is_empty() {
                if let Some(addr) = pmm.allocate() {
                    assert!(live.insert(addr.as_u64()), "frame {addr} handed out twice");
                    held.push(addr);
                }
            } else {
                let idx = (rng.next() as usize) % held.len();
                let addr = held.swap_remove(idx);
                assert!(live.remove(&addr.as_u64()));
                pmm.free(addr);
            }
        }

        let stats = pmm.stats();
        assert_eq!(
            stats.total_frames,
            stats.free_frames + stats.reserved_frames + stats.kernel_frames + held.len()
        );
        assert!(pmm.verify_inventory());
    }
}

//! # Kernel Heap
//!
//! Byte-granularity allocation on top of the address-space layer. Requests
//! up to one page draw from size-classed slabs; anything larger is backed
//! directly by a fresh page region with a 16-byte header slot at the region
//! base, so a large allocation is recognizable by its page-aligned header.
//!
//! Exhaustion surfaces as `None` and the caller decides. Freeing an address
//! the heap does not own, or a slab slot that is already free, is a
//! structural-invariant violation and halts deliberately instead of
//! corrupting the bookkeeping.

#![cfg_attr(not(test), no_std)]

mod slab;

use core::sync::atomic::{AtomicUsize, Ordering};

use kernel_addresses::{PAGE_SIZE, VirtAddr};
use kernel_pmm::FrameAllocator;
use kernel_vmem::{AddressSpaceManager, PageFlags};
use log::{debug, error, warn};

use slab::{NIL, SLAB_STATES, SlabMeta, SlabState};

/// The allocation-size ladder. Requests above the last rung take the
/// page-backed large path.
pub const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// Bytes reserved at the base of a large allocation's region; the caller
/// receives `base + LARGE_HEADER`.
pub const LARGE_HEADER: u64 = 16;

/// Slab metadata arena capacity.
const MAX_SLABS: usize = 64;

/// Large-allocation record arena capacity.
const MAX_LARGE: usize = 64;

const _: () = {
    assert!(MAX_SLABS < NIL as usize && MAX_LARGE < NIL as usize);
    assert!(SIZE_CLASSES[NUM_CLASSES - 1] == PAGE_SIZE as usize);
};

/// Record of one page-backed allocation, threaded onto the in-use list by
/// arena index.
#[derive(Copy, Clone)]
struct LargeMeta {
    base: VirtAddr,
    pages: usize,
    next: u16,
    prev: u16,
    live: bool,
}

impl LargeMeta {
    const DEAD: Self = Self {
        base: VirtAddr::new(0),
        pages: 0,
        next: NIL,
        prev: NIL,
        live: false,
    };
}

/// Point-in-time heap accounting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes handed out and not yet freed, rounded up to the class size
    /// (slabs) or page granularity (large allocations).
    pub used_bytes: usize,
    /// Bytes of backing pages the heap holds. Slab pages are kept even
    /// when their slab empties; large pages are returned on free.
    pub allocated_bytes: usize,
    pub per_class_free: [usize; NUM_CLASSES],
    pub per_class_total: [usize; NUM_CLASSES],
}

/// The kernel heap.
///
/// Structural mutation is `&mut self`, single-threaded by construction;
/// only the statistics counters are atomics.
pub struct Heap {
    slabs: [SlabMeta; MAX_SLABS],
    /// List heads per state per class, arena indices.
    heads: [[u16; NUM_CLASSES]; SLAB_STATES],
    large: [LargeMeta; MAX_LARGE],
    large_head: u16,
    used: AtomicUsize,
    allocated: AtomicUsize,
}

impl Heap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slabs: [SlabMeta::DEAD; MAX_SLABS],
            heads: [[NIL; NUM_CLASSES]; SLAB_STATES],
            large: [LargeMeta::DEAD; MAX_LARGE],
            large_head: NIL,
            used: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate `size` bytes.
    ///
    /// Up to [`SIZE_CLASSES`]' last rung the smallest covering class is
    /// used and the returned address is class-aligned within a slab page.
    /// Above it the request is backed by whole pages through
    /// `allocate_region` and the returned address sits behind the header.
    /// `None` on exhaustion of any underlying resource.
    pub fn kmalloc(
        &mut self,
        vm: &mut AddressSpaceManager,
        frames: &mut FrameAllocator,
        size: usize,
    ) -> Option<VirtAddr> {
        if size <= SIZE_CLASSES[NUM_CLASSES - 1] {
            self.slab_alloc(vm, frames, size)
        } else {
            self.large_alloc(vm, frames, size)
        }
    }

    /// Free an address previously returned by [`kmalloc`](Self::kmalloc).
    ///
    /// # Panics
    /// Deliberately halts on a foreign address, an unaligned slab address,
    /// or a slab slot that is already free.
    pub fn kfree(
        &mut self,
        vm: &mut AddressSpaceManager,
        frames: &mut FrameAllocator,
        addr: VirtAddr,
    ) {
        let page = addr.page_base();
        if let Some(idx) = self.slabs.iter().position(|s| s.live && s.base == page) {
            self.slab_free(idx, addr);
            return;
        }
        if addr.page_offset() == LARGE_HEADER {
            let base = VirtAddr::new(addr.as_u64() - LARGE_HEADER);
            if let Some(idx) = (0..MAX_LARGE).find(|&i| self.large[i].live && self.large[i].base == base)
            {
                self.large_free(vm, frames, idx);
                return;
            }
        }
        error!("kfree: {addr} belongs to no slab or large allocation");
        panic!("heap misuse: foreign free");
    }

    /// Accounting snapshot; the per-class columns are recomputed from the
    /// slab arena on every call.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut per_class_free = [0; NUM_CLASSES];
        let mut per_class_total = [0; NUM_CLASSES];
        for meta in self.slabs.iter().filter(|s| s.live) {
            per_class_total[meta.class] += meta.capacity(SIZE_CLASSES[meta.class]);
            per_class_free[meta.class] += meta.free_count;
        }
        HeapStats {
            used_bytes: self.used.load(Ordering::Relaxed),
            allocated_bytes: self.allocated.load(Ordering::Relaxed),
            per_class_free,
            per_class_total,
        }
    }

    fn slab_alloc(
        &mut self,
        vm: &mut AddressSpaceManager,
        frames: &mut FrameAllocator,
        size: usize,
    ) -> Option<VirtAddr> {
        let class = SIZE_CLASSES.iter().position(|&c| c >= size)?;
        let class_bytes = SIZE_CLASSES[class];
        let idx = match self.usable_slab(class) {
            Some(idx) => idx,
            None => self.create_slab(vm, frames, class)?,
        };
        let slot = self.slabs[idx].lowest_free_slot()?;
        self.slabs[idx].mark_used(slot);
        self.requeue(idx);
        self.used.fetch_add(class_bytes, Ordering::Relaxed);
        Some(self.slabs[idx].base + (slot * class_bytes) as u64)
    }

    fn slab_free(&mut self, idx: usize, addr: VirtAddr) {
        let class_bytes = SIZE_CLASSES[self.slabs[idx].class];
        let offset = addr.page_offset() as usize;
        if offset % class_bytes != 0 {
            error!("kfree: {addr} is not an object boundary of its slab");
            panic!("heap misuse: unaligned slab free");
        }
        let slot = offset / class_bytes;
        if !self.slabs[idx].is_slot_used(slot) {
            error!("kfree: {addr} was already free");
            panic!("heap misuse: double free");
        }
        self.slabs[idx].mark_free(slot);
        self.requeue(idx);
        self.used.fetch_sub(class_bytes, Ordering::Relaxed);
    }

    /// A slab with room: partial first, then an emptied one.
    fn usable_slab(&self, class: usize) -> Option<usize> {
        for state in [SlabState::Partial, SlabState::Empty] {
            let head = self.heads[state as usize][class];
            if head != NIL {
                return Some(head as usize);
            }
        }
        None
    }

    fn create_slab(
        &mut self,
        vm: &mut AddressSpaceManager,
        frames: &mut FrameAllocator,
        class: usize,
    ) -> Option<usize> {
        let Some(idx) = self.slabs.iter().position(|s| !s.live) else {
            warn!("slab arena exhausted ({MAX_SLABS} slots)");
            return None;
        };
        let base = match vm.allocate_region(frames, 1, PageFlags::WRITABLE) {
            Ok(base) => base,
            Err(err) => {
                warn!("slab page allocation failed: {err}");
                return None;
            }
        };
        self.slabs[idx] = SlabMeta::fresh(class, SIZE_CLASSES[class], base);
        self.attach(idx, SlabState::Empty);
        self.allocated.fetch_add(PAGE_SIZE as usize, Ordering::Relaxed);
        debug!(
            "slab for class {} created at {base}",
            SIZE_CLASSES[class]
        );
        Some(idx)
    }

    /// Move a slab to the list matching its fill level, if it changed.
    fn requeue(&mut self, idx: usize) {
        let class_bytes = SIZE_CLASSES[self.slabs[idx].class];
        let target = self.slabs[idx].target_state(class_bytes);
        if target != self.slabs[idx].state {
            self.detach(idx);
            self.attach(idx, target);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (state, class, prev, next) = {
            let s = &self.slabs[idx];
            (s.state, s.class, s.prev, s.next)
        };
        if prev == NIL {
            self.heads[state as usize][class] = next;
        } else {
            self.slabs[prev as usize].next = next;
        }
        if next != NIL {
            self.slabs[next as usize].prev = prev;
        }
        self.slabs[idx].next = NIL;
        self.slabs[idx].prev = NIL;
    }

    fn attach(&mut self, idx: usize, state: SlabState) {
        let class = self.slabs[idx].class;
        let head = self.heads[state as usize][class];
        self.slabs[idx].state = state;
        self.slabs[idx].prev = NIL;
        self.slabs[idx].next = head;
        if head != NIL {
            self.slabs[head as usize].prev = idx as u16;
        }
        self.heads[state as usize][class] = idx as u16;
    }

    fn large_alloc(
        &mut self,
        vm: &mut AddressSpaceManager,
        frames: &mut FrameAllocator,
        size: usize,
    ) -> Option<VirtAddr> {
        let pages = (size + LARGE_HEADER as usize).div_ceil(PAGE_SIZE as usize);
        let Some(idx) = self.large.iter().position(|l| !l.live) else {
            warn!("large-allocation arena exhausted ({MAX_LARGE} slots)");
            return None;
        };
        let base = match vm.allocate_region(frames, pages, PageFlags::WRITABLE) {
            Ok(base) => base,
            Err(err) => {
                warn!("large allocation of {pages} pages failed: {err}");
                return None;
            }
        };
        self.large[idx] = LargeMeta {
            base,
            pages,
            next: self.large_head,
            prev: NIL,
            live: true,
        };
        if self.large_head != NIL {
            self.large[self.large_head as usize].prev = idx as u16;
        }
        self.large_head = idx as u16;
        let bytes = pages * PAGE_SIZE as usize;
        self.used.fetch_add(bytes, Ordering::Relaxed);
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
        Some(base + LARGE_HEADER)
    }

    fn large_free(
        &mut self,
        vm: &mut AddressSpaceManager,
        frames: &mut FrameAllocator,
        idx: usize,
    ) {
        let LargeMeta { base, pages, next, prev, .. } = self.large[idx];
        if prev == NIL {
            self.large_head = next;
        } else {
            self.large[prev as usize].next = next;
        }
        if next != NIL {
            self.large[next as usize].prev = prev;
        }
        self.large[idx] = LargeMeta::DEAD;
        vm.free_region(frames, base, pages);
        let bytes = pages * PAGE_SIZE as usize;
        self.used.fetch_sub(bytes, Ordering::Relaxed);
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Walk every list and cross-check membership against the arenas.
    ///
    /// Diagnostic; `false` means a link, state, or fill level is
    /// inconsistent.
    #[must_use]
    pub fn check_lists(&self) -> bool {
        let mut seen = 0;
        for (state_idx, heads) in self.heads.iter().enumerate() {
            for (class, &head) in heads.iter().enumerate() {
                let mut idx = head;
                let mut prev = NIL;
                while idx != NIL {
                    let s = &self.slabs[idx as usize];
                    let class_bytes = SIZE_CLASSES[class];
                    if !s.live
                        || s.class != class
                        || s.state as usize != state_idx
                        || s.prev != prev
                        || s.target_state(class_bytes) != s.state
                    {
                        return false;
                    }
                    seen += 1;
                    prev = idx;
                    idx = s.next;
                }
            }
        }
        if seen != self.slabs.iter().filter(|s| s.live).count() {
            return false;
        }

        let mut idx = self.large_head;
        let mut prev = NIL;
        let mut live_large = 0;
        while idx != NIL {
            let l = &self.large[idx as usize];
            if !l.live || l.prev != prev {
                return false;
            }
            live_large += 1;
            prev = idx;
            idx = l.next;
        }
        live_large == self.large.iter().filter(|l| l.live).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use kernel_addresses::PhysAddr;

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

    struct Fixture {
        frames: FrameAllocator,
        vm: Box<AddressSpaceManager>,
        heap: Heap,
    }

    fn fixture() -> Fixture {
        let mut frames = FrameAllocator::with_fallback_layout(
            PhysAddr::new(16 * MIB),
            PhysAddr::new(16 * MIB + 64 * 1024),
            64 * MIB,
        );
        let vm = Box::new(AddressSpaceManager::new(&mut frames).unwrap());
        Fixture {
            frames,
            vm,
            heap: Heap::new(),
        }
    }

    impl Fixture {
        fn alloc(&mut self, size: usize) -> Option<VirtAddr> {
            self.heap.kmalloc(&mut self.vm, &mut self.frames, size)
        }

        fn free(&mut self, addr: VirtAddr) {
            self.heap.kfree(&mut self.vm, &mut self.frames, addr);
        }
    }

    #[test]
    fn largest_class_boundary() {
        let mut f = fixture();
        let slab = f.alloc(4096).unwrap();
        assert!(slab.is_page_aligned(), "one-object slab hands out its base");
        let stats = f.heap.stats();
        assert_eq!(stats.per_class_total[8], 1);
        assert_eq!(stats.per_class_free[8], 0);

        // One byte more switches to the page-backed path: two pages, the
        // address sits behind the header.
        let large = f.alloc(4097).unwrap();
        assert_eq!(large.page_offset(), LARGE_HEADER);
        assert_eq!(f.heap.stats().per_class_total[8], 1);
        assert_eq!(
            f.heap.stats().allocated_bytes,
            4096 + 2 * 4096,
            "slab page plus two large pages"
        );
    }

    #[test]
    fn class_covers_size_and_aligns() {
        let mut f = fixture();
        let a = f.alloc(17).unwrap();
        assert_eq!(a.as_u64() % 32, 0, "17 bytes lands in the 32-byte class");
        let b = f.alloc(100).unwrap();
        assert_eq!(b.as_u64() % 128, 0);
        let c = f.alloc(1).unwrap();
        assert_eq!(c.as_u64() % 16, 0);
        assert!(f.heap.check_lists());
    }

    #[test]
    fn freed_slot_is_reused_lowest_first() {
        let mut f = fixture();
        let a = f.alloc(64).unwrap();
        let b = f.alloc(64).unwrap();
        assert_eq!(b, a + 64);
        f.free(a);
        assert_eq!(f.alloc(64), Some(a));
    }

    #[test]
    fn slabs_move_between_lists_at_fill_transitions() {
        let mut f = fixture();
        // Class 2048 holds two objects per slab.
        let a = f.alloc(2048).unwrap();
        let b = f.alloc(2048).unwrap();
        assert_eq!(b, a + 2048);
        assert_eq!(f.heap.stats().per_class_free[7], 0, "first slab is full");

        let c = f.alloc(2048).unwrap();
        assert_eq!(c.page_base().as_u64(), a.page_base().as_u64() + 4096);
        assert_eq!(f.heap.stats().per_class_total[7], 4);

        // Freeing reopens the full slab; the next allocation prefers it.
        f.free(a);
        assert_eq!(f.alloc(2048), Some(a));
        assert!(f.heap.check_lists());
    }

    #[test]
    fn emptied_slab_keeps_its_page() {
        let mut f = fixture();
        let a = f.alloc(2048).unwrap();
        let b = f.alloc(2048).unwrap();
        let free_frames = f.frames.stats().free_frames;
        let allocated = f.heap.stats().allocated_bytes;

        f.free(a);
        f.free(b);
        let stats = f.heap.stats();
        assert_eq!(stats.per_class_free[7], stats.per_class_total[7]);
        assert_eq!(stats.allocated_bytes, allocated, "page is retained");
        assert_eq!(f.frames.stats().free_frames, free_frames);
        assert_eq!(stats.used_bytes, 0);
        assert!(f.heap.check_lists());
    }

    #[test]
    fn large_allocation_returns_its_pages() {
        let mut f = fixture();
        // Warm the table path so the accounting below is exact.
        let warm = f.alloc(5000).unwrap();
        f.free(warm);
        let free_frames = f.frames.stats().free_frames;

        // 10000 + 16 bytes of header needs three pages.
        let p = f.alloc(10_000).unwrap();
        assert_eq!(f.frames.stats().free_frames, free_frames - 3);
        assert_eq!(f.heap.stats().used_bytes, 3 * 4096);

        f.free(p);
        assert_eq!(f.frames.stats().free_frames, free_frames);
        assert_eq!(f.heap.stats().used_bytes, 0);
        assert_eq!(f.heap.stats().allocated_bytes, 0);
        assert!(f.heap.check_lists());
    }

    #[test]
    fn slab_arena_exhaustion_is_graceful() {
        let mut f = fixture();
        // Class 4096 holds one object per slab, so this drains the arena.
        let mut held = Vec::new();
        while let Some(addr) = f.alloc(4096) {
            held.push(addr);
        }
        assert_eq!(held.len(), 64);
        // The large path is unaffected.
        assert!(f.alloc(5000).is_some());
    }

    #[test]
    #[should_panic(expected = "foreign free")]
    fn foreign_free_halts() {
        let mut f = fixture();
        f.free(VirtAddr::new(0xdead_b000));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_halts() {
        let mut f = fixture();
        let a = f.alloc(64).unwrap();
        f.free(a);
        f.free(a);
    }

    #[test]
    fn random_interleavings_round_trip_contents() {
        let mut f = fixture();
        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
        // Shadow of what each live object "wrote": sparse byte pattern
        // keyed by address. Overlapping allocations would clobber each
        // other's entries and fail the read-back on free.
        let mut shadow: HashMap<u64, u8> = HashMap::new();
        let mut live: Vec<(VirtAddr, usize, u8)> = Vec::new();

        for _ in 0..2000 {
            if rng.next() % 2 == 0 && live.len() < 48 {
                let size = (rng.next() as usize % 6000) + 1;
                if let Some(addr) = f.alloc(size) {
                    let seed = rng.next() as u8;
                    for off in (0..size as u64).step_by(8) {
                        shadow.insert(addr.as_u64() + off, seed);
                    }
                    live.push((addr, size, seed));
                }
            } else if !live.is_empty() {
                let pick = rng.next() as usize % live.len();
                let (addr, size, seed) = live.swap_remove(pick);
                for off in (0..size as u64).step_by(8) {
                    assert_eq!(
                        shadow.remove(&(addr.as_u64() + off)),
                        Some(seed),
                        "object at {addr} was clobbered"
                    );
                }
                f.free(addr);
            }
        }

        for (addr, _, _) in live.drain(..) {
            f.free(addr);
        }
        let stats = f.heap.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.per_class_free, stats.per_class_total);
        assert!(f.heap.check_lists());
        assert!(f.frames.verify_inventory());
    }
}

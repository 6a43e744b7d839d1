//! # Address Space Manager
//!
//! Builds and mutates the four-level page tables of a fixed pool of address
//! spaces. Every table lives in the [`TableArena`]; every frame the tables
//! consume comes from the caller's [`FrameAllocator`]. The manager owns no
//! leaf target frames, only the tables that reference them.
//!
//! All structural mutation goes through `&mut self`; the design is
//! single-threaded by construction. Callers running under interrupts must
//! mask them for the duration of a call. The only cross-thread signals are
//! the statistics counters and the mutation sequence number.

use core::sync::atomic::{AtomicU64, Ordering};

use kernel_addresses::{PAGE_SIZE, PhysAddr, VirtAddr};
use kernel_info::memory::{MAX_ADDRESS_SPACES, REGION_SPACE_BASE};
use kernel_pmm::FrameAllocator;
use log::{debug, error, info, warn};

use crate::VmemError;
use crate::arena::TableArena;
use crate::cache::TranslationCache;
use crate::entry::{PageFlags, PageTableEntry};
use crate::index::{
    HUGE_PAGE_OFFSET_MASK, KERNEL_HALF_FIRST_INDEX, LARGE_PAGE_OFFSET_MASK, TABLE_ENTRIES,
    level_indices,
};

/// Handle to one pool slot. Slots are handed out in order and never
/// recycled; a destroyed space's handle stays dead forever.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressSpaceId(usize);

#[derive(Copy, Clone)]
struct AddressSpace {
    root: usize,
    mapped_pages: usize,
    live: bool,
}

impl AddressSpace {
    const DEAD: Self = Self {
        root: 0,
        mapped_pages: 0,
        live: false,
    };
}

/// The address space manager.
///
/// Holds the table arena, the space pool, the bump-pointer region
/// allocator, and the software translation cache for the active space.
pub struct AddressSpaceManager {
    arena: TableArena,
    spaces: [AddressSpace; MAX_ADDRESS_SPACES],
    /// Pool slots handed out so far; never decremented.
    created: usize,
    current: AddressSpaceId,
    /// Next virtual address the region allocator hands out. Freed regions
    /// are not reused.
    region_cursor: VirtAddr,
    cache: TranslationCache,
    /// Bumped with `Release` after every completed structural mutation.
    sequence: AtomicU64,
}

impl AddressSpaceManager {
    /// The kernel's own address space, created at initialization and never
    /// destroyed.
    pub const KERNEL_SPACE: AddressSpaceId = AddressSpaceId(0);

    /// Create the manager with the kernel address space in pool slot 0.
    pub fn new(frames: &mut FrameAllocator) -> Result<Self, VmemError> {
        let mut arena = TableArena::new();
        let root = arena.create(frames)?;
        let mut spaces = [AddressSpace::DEAD; MAX_ADDRESS_SPACES];
        spaces[0] = AddressSpace {
            root,
            mapped_pages: 0,
            live: true,
        };
        info!(
            "address space manager initialized, kernel root backed by {}",
            arena.backing_frame(root)
        );
        Ok(Self {
            arena,
            spaces,
            created: 1,
            current: Self::KERNEL_SPACE,
            region_cursor: VirtAddr::new(REGION_SPACE_BASE),
            cache: TranslationCache::new(),
            sequence: AtomicU64::new(0),
        })
    }

    /// Map `virt` to `phys` in the active space.
    ///
    /// Missing intermediate tables are created on demand, one frame and one
    /// arena slot each. [`PageFlags::LARGE`] maps a 2 MiB leaf one level
    /// up; both addresses must then be 2 MiB aligned. Remapping a present
    /// leaf overwrites it.
    ///
    /// Tables created before a mid-walk exhaustion stay in place; only
    /// [`allocate_region`](Self::allocate_region) unwinds on failure.
    ///
    /// # Panics
    /// Halts deliberately when `virt` is already covered by a superpage
    /// leaf at a higher level: descending through the leaf would corrupt
    /// an unrelated table. Unmap the leaf first, or remap it whole.
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), VmemError> {
        let large = flags.contains(PageFlags::LARGE);
        if large {
            debug_assert!(virt.as_u64() & LARGE_PAGE_OFFSET_MASK == 0);
            debug_assert!(phys.as_u64() & LARGE_PAGE_OFFSET_MASK == 0);
        } else {
            debug_assert!(virt.is_page_aligned() && phys.is_page_aligned());
        }
        let indices = level_indices(virt);
        let leaf_depth = if large { 2 } else { 3 };
        let user = flags.contains(PageFlags::USER);

        let mut slot = self.spaces[self.current.0].root;
        for depth in 0..leaf_depth {
            let idx = indices[depth];
            let entry = self.arena.node(slot).get(idx);
            slot = if entry.present() {
                // A leaf carries no child slot; descending through it would
                // land in an unrelated arena slot and overwrite its node.
                if entry.large() {
                    error!("map: {virt} is already covered by a superpage leaf");
                    panic!("vmem misuse: mapping below a superpage leaf");
                }
                entry.table_slot() as usize
            } else {
                let child = self.arena.create(frames)?;
                let frame = self.arena.backing_frame(child);
                self.arena
                    .node_mut(slot)
                    .set(idx, PageTableEntry::table(frame, child, user));
                child
            };
        }

        let idx = indices[leaf_depth];
        let previous = self.arena.node(slot).get(idx);
        self.arena.node_mut(slot).set(idx, PageTableEntry::leaf(phys, flags));
        if !previous.present() {
            self.spaces[self.current.0].mapped_pages += 1;
        }
        if large || previous.large() {
            // A superpage spans many cache lines; drop them all.
            self.cache.flush();
        } else {
            self.cache.invalidate(virt.page_base());
        }
        self.bump_sequence();
        Ok(())
    }

    /// Clear the leaf mapping `virt` in the active space.
    ///
    /// A superpage leaf encountered above the last level is cleared as a
    /// whole. Returns `false` if any level on the walk is absent.
    pub fn unmap(&mut self, virt: VirtAddr) -> bool {
        let indices = level_indices(virt);
        let mut slot = self.spaces[self.current.0].root;
        for depth in 0..4 {
            let idx = indices[depth];
            let entry = self.arena.node(slot).get(idx);
            if !entry.present() {
                return false;
            }
            if depth == 3 || entry.large() {
                self.arena.node_mut(slot).set(idx, PageTableEntry::new());
                let space = &mut self.spaces[self.current.0];
                space.mapped_pages = space.mapped_pages.saturating_sub(1);
                if entry.large() {
                    self.cache.flush();
                } else {
                    self.cache.invalidate(virt.page_base());
                }
                self.bump_sequence();
                return true;
            }
            slot = entry.table_slot() as usize;
        }
        false
    }

    /// Translate `virt` through the active space.
    ///
    /// Consults the translation cache first. Superpage leaves resolve by
    /// masking the low bits of the virtual address instead of continuing
    /// the walk. `None` if any level is absent.
    #[must_use]
    pub fn get_physical(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let page = virt.page_base();
        if let Some(frame) = self.cache.lookup(page) {
            return Some(frame + virt.page_offset());
        }
        let indices = level_indices(virt);
        let mut slot = self.spaces[self.current.0].root;
        for depth in 0..4 {
            let entry = self.arena.node(slot).get(indices[depth]);
            if !entry.present() {
                return None;
            }
            if depth == 3 {
                let frame = entry.address();
                self.cache.insert(page, frame);
                return Some(frame + virt.page_offset());
            }
            if entry.large() {
                let mask = match depth {
                    1 => HUGE_PAGE_OFFSET_MASK,
                    2 => LARGE_PAGE_OFFSET_MASK,
                    _ => return None,
                };
                let addr = PhysAddr::new(entry.address().as_u64() | (virt.as_u64() & mask));
                self.cache.insert(page, addr.page_base());
                return Some(addr);
            }
            slot = entry.table_slot() as usize;
        }
        None
    }

    /// Allocate `pages` virtually consecutive pages, one fresh frame each.
    ///
    /// Bump-pointer: ranges come from the region space in address order and
    /// freed ranges are never handed out again. On any mid-loop failure
    /// every page already committed in this request is unmapped and its
    /// frame freed, and the cursor is left untouched. Intermediate tables
    /// created for the request follow [`map`](Self::map)'s non-rollback
    /// rule and stay in place, so on a cold table path the frame count
    /// does not return all the way to its pre-call value.
    pub fn allocate_region(
        &mut self,
        frames: &mut FrameAllocator,
        pages: usize,
        flags: PageFlags,
    ) -> Result<VirtAddr, VmemError> {
        debug_assert!(!flags.contains(PageFlags::LARGE));
        let base = self.region_cursor;
        for committed in 0..pages {
            let virt = base + (committed as u64) * PAGE_SIZE;
            let Some(frame) = frames.allocate() else {
                self.unwind_region(frames, base, committed);
                return Err(VmemError::FrameExhausted);
            };
            if let Err(err) = self.map(frames, virt, frame, flags) {
                frames.free(frame);
                self.unwind_region(frames, base, committed);
                return Err(err);
            }
        }
        self.region_cursor = base + (pages as u64) * PAGE_SIZE;
        debug!("region of {pages} pages allocated at {base}");
        Ok(base)
    }

    fn unwind_region(&mut self, frames: &mut FrameAllocator, base: VirtAddr, committed: usize) {
        for i in 0..committed {
            let virt = base + (i as u64) * PAGE_SIZE;
            if let Some(phys) = self.get_physical(virt) {
                self.unmap(virt);
                frames.free(phys.page_base());
            }
        }
    }

    /// Unmap a region and return its frames.
    ///
    /// The virtual range stays retired; the cursor never moves back.
    pub fn free_region(&mut self, frames: &mut FrameAllocator, virt: VirtAddr, pages: usize) {
        for i in 0..pages {
            let page = virt + (i as u64) * PAGE_SIZE;
            if let Some(phys) = self.get_physical(page) {
                self.unmap(page);
                frames.free(phys.page_base());
            } else {
                warn!("free_region: page {page} was not mapped");
            }
        }
    }

    /// Create a new address space sharing the kernel half.
    ///
    /// The kernel space's upper-half root entries are copied by reference:
    /// the new space sees the same child tables, it does not own them.
    pub fn create_address_space(
        &mut self,
        frames: &mut FrameAllocator,
    ) -> Result<AddressSpaceId, VmemError> {
        if self.created == MAX_ADDRESS_SPACES {
            warn!("address space pool exhausted ({MAX_ADDRESS_SPACES} slots)");
            return Err(VmemError::SpacePoolExhausted);
        }
        let root = self.arena.create(frames)?;
        let kernel_root = self.spaces[Self::KERNEL_SPACE.0].root;
        for idx in KERNEL_HALF_FIRST_INDEX..TABLE_ENTRIES {
            let entry = self.arena.node(kernel_root).get(idx);
            self.arena.node_mut(root).set(idx, entry);
        }
        let id = AddressSpaceId(self.created);
        self.spaces[id.0] = AddressSpace {
            root,
            mapped_pages: 0,
            live: true,
        };
        self.created += 1;
        self.bump_sequence();
        debug!("address space {} created", id.0);
        Ok(id)
    }

    /// Destroy an address space: release every owned lower-half table and
    /// the root. Kernel-half tables are shared and stay untouched, and leaf
    /// target frames belong to whoever mapped them. The pool slot is
    /// retired, not recycled.
    pub fn destroy_address_space(&mut self, frames: &mut FrameAllocator, id: AddressSpaceId) {
        if id == Self::KERNEL_SPACE {
            warn!("refusing to destroy the kernel address space");
            return;
        }
        if id.0 >= self.created || !self.spaces[id.0].live {
            warn!("destroy of dead address space {} ignored", id.0);
            return;
        }
        if id == self.current {
            self.current = Self::KERNEL_SPACE;
        }
        let root = self.spaces[id.0].root;
        for idx in 0..KERNEL_HALF_FIRST_INDEX {
            let entry = self.arena.node(root).get(idx);
            if entry.present() && !entry.large() {
                self.release_subtree(frames, entry.table_slot() as usize, 1);
            }
        }
        self.arena.release(root, frames);
        self.spaces[id.0].live = false;
        self.spaces[id.0].mapped_pages = 0;
        self.cache.flush();
        self.bump_sequence();
        debug!("address space {} destroyed, slot retired", id.0);
    }

    fn release_subtree(&mut self, frames: &mut FrameAllocator, slot: usize, depth: usize) {
        if depth < 3 {
            for idx in 0..TABLE_ENTRIES {
                let entry = self.arena.node(slot).get(idx);
                if entry.present() && !entry.large() {
                    self.release_subtree(frames, entry.table_slot() as usize, depth + 1);
                }
            }
        }
        self.arena.release(slot, frames);
    }

    /// Make `id` the active space and flush the translation cache.
    ///
    /// Returns the root table's physical address for the architecture layer
    /// to load, or `None` if the space is dead.
    pub fn switch(&mut self, id: AddressSpaceId) -> Option<PhysAddr> {
        if id.0 >= self.created || !self.spaces[id.0].live {
            warn!("switch to dead address space {} refused", id.0);
            return None;
        }
        self.current = id;
        self.cache.flush();
        self.bump_sequence();
        Some(self.arena.backing_frame(self.spaces[id.0].root))
    }

    /// The currently active space.
    #[must_use]
    pub const fn current_space(&self) -> AddressSpaceId {
        self.current
    }

    /// Present leaf entries of a space, or `None` if the space is dead.
    #[must_use]
    pub fn mapped_pages(&self, id: AddressSpaceId) -> Option<usize> {
        (id.0 < self.created && self.spaces[id.0].live).then(|| self.spaces[id.0].mapped_pages)
    }

    /// Next address the region allocator would hand out.
    #[must_use]
    pub const fn next_region_base(&self) -> VirtAddr {
        self.region_cursor
    }

    /// Live page-table nodes across all spaces.
    #[must_use]
    pub const fn live_tables(&self) -> usize {
        self.arena.live_tables()
    }

    /// Mutation sequence number, `Acquire`-paired with the `Release` bump
    /// after each mutation: a reader seeing sequence `n` sees every
    /// mutation up to `n` completed.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn bump_sequence(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
    }
}

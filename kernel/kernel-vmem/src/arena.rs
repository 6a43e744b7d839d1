//! # Table-Node Arena
//!
//! Storage for every live page-table node. A table is an arena slot plus a
//! backing frame drawn from the frame allocator; the two are created and
//! released together, so a table exists exactly when its backing frame is
//! marked used. No node is ever addressed through its physical address.

use kernel_addresses::PhysAddr;
use kernel_pmm::FrameAllocator;
use log::debug;

use crate::VmemError;
use crate::entry::PageTableNode;

/// Arena capacity. Must fit the 11 slot-cache bits of a table entry.
pub(crate) const MAX_TABLES: usize = 64;

const _: () = assert!(MAX_TABLES <= 1 << 11);

pub(crate) struct TableArena {
    nodes: [PageTableNode; MAX_TABLES],
    /// Backing frame per slot; [`PhysAddr::NULL`] when the slot is dead.
    backing: [PhysAddr; MAX_TABLES],
    /// One bit per slot, `0` = free, `1` = live.
    used: [u64; MAX_TABLES / 64],
    live_tables: usize,
}

impl TableArena {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: [PageTableNode::EMPTY; MAX_TABLES],
            backing: [PhysAddr::NULL; MAX_TABLES],
            used: [0; MAX_TABLES / 64],
            live_tables: 0,
        }
    }

    /// Create a zeroed table: one arena slot plus one backing frame.
    ///
    /// The frame is allocated first; if no slot is left it is returned, so
    /// failure never leaks either resource.
    pub(crate) fn create(&mut self, frames: &mut FrameAllocator) -> Result<usize, VmemError> {
        let frame = frames.allocate().ok_or(VmemError::FrameExhausted)?;
        let Some(slot) = self.lowest_free_slot() else {
            frames.free(frame);
            return Err(VmemError::TableArenaExhausted);
        };
        self.used[slot / 64] |= 1 << (slot % 64);
        self.backing[slot] = frame;
        self.nodes[slot].clear();
        self.live_tables += 1;
        debug!("table created in slot {slot}, backed by {frame}");
        Ok(slot)
    }

    /// Release a table: the backing frame goes back to the frame allocator
    /// and the slot becomes reusable.
    pub(crate) fn release(&mut self, slot: usize, frames: &mut FrameAllocator) {
        debug_assert!(self.is_live(slot), "releasing a dead table slot");
        frames.free(self.backing[slot]);
        self.backing[slot] = PhysAddr::NULL;
        self.used[slot / 64] &= !(1 << (slot % 64));
        self.live_tables -= 1;
    }

    fn lowest_free_slot(&self) -> Option<usize> {
        for (word_idx, &word) in self.used.iter().enumerate() {
            if word != u64::MAX {
                let slot = word_idx * 64 + (!word).trailing_zeros() as usize;
                return (slot < MAX_TABLES).then_some(slot);
            }
        }
        None
    }

    #[inline]
    pub(crate) const fn is_live(&self, slot: usize) -> bool {
        self.used[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    pub(crate) fn node(&self, slot: usize) -> &PageTableNode {
        debug_assert!(self.is_live(slot));
        &self.nodes[slot]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, slot: usize) -> &mut PageTableNode {
        debug_assert!(self.is_live(slot));
        &mut self.nodes[slot]
    }

    #[inline]
    pub(crate) const fn backing_frame(&self, slot: usize) -> PhysAddr {
        self.backing[slot]
    }

    #[inline]
    pub(crate) const fn live_tables(&self) -> usize {
        self.live_tables
    }
}

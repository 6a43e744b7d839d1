//! # Page-Table Entries
//!
//! The 64-bit entry format shared by all four table levels, and the
//! caller-facing permission flags.
//!
//! The hardware ignores bits 52..=62; this implementation caches the child
//! table's arena slot there so a walk descends in O(1) without mapping the
//! child frame back to a node.

use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_addresses::PhysAddr;

use crate::index::TABLE_ENTRIES;

/// One entry of a page-table node.
///
/// An absent entry is entirely zero. For a present non-leaf entry `frame`
/// is the child table's backing frame and `table_slot` its arena slot; for
/// a leaf it is the target frame.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Terminates the walk above the last level (2 MiB / 1 GiB leaf).
    pub large: bool,
    pub global: bool,
    /// Ignored by the hardware.
    #[bits(3)]
    pub os_low: u8,
    /// Frame number of the child table or the mapped frame.
    #[bits(40)]
    pub frame: u64,
    /// Arena slot of the child table node. Ignored by the hardware,
    /// meaningless on leaf entries.
    #[bits(11)]
    pub table_slot: u16,
    pub no_execute: bool,
}

bitflags! {
    /// Mapping permissions as callers request them.
    ///
    /// Bit positions coincide with the entry format so conversion is a
    /// straight mask, but callers never touch entries directly.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u64 {
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        /// Map a 2 MiB leaf one level above the base granule.
        const LARGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableEntry {
    /// A present leaf pointing at `phys` with the requested permissions.
    #[must_use]
    pub fn leaf(phys: PhysAddr, flags: PageFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_frame(phys.frame_number())
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user(flags.contains(PageFlags::USER))
            .with_write_through(flags.contains(PageFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(PageFlags::CACHE_DISABLE))
            .with_large(flags.contains(PageFlags::LARGE))
            .with_global(flags.contains(PageFlags::GLOBAL))
            .with_no_execute(flags.contains(PageFlags::NO_EXECUTE))
    }

    /// A present entry pointing at the child table in `slot` backed by
    /// `frame`. Intermediate entries stay permissive; the leaf restricts.
    #[must_use]
    pub fn table(frame: PhysAddr, slot: usize, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(frame.frame_number())
            .with_table_slot(slot as u16)
    }

    /// Physical base address this entry points at.
    #[must_use]
    pub fn address(self) -> PhysAddr {
        PhysAddr::from_frame_number(self.frame())
    }
}

/// One 4 KiB page-table node: 512 entries at any level.
#[repr(C, align(4096))]
pub(crate) struct PageTableNode {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTableNode {
    pub(crate) const EMPTY: Self = Self {
        entries: [PageTableEntry::new(); TABLE_ENTRIES],
    };

    #[inline]
    pub(crate) fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    pub(crate) fn clear(&mut self) {
        self.entries = [PageTableEntry::new(); TABLE_ENTRIES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_entry_is_all_zero() {
        assert_eq!(PageTableEntry::new().into_bits(), 0);
        assert!(!PageTableEntry::new().present());
    }

    #[test]
    fn leaf_round_trips_address_and_flags() {
        let phys = PhysAddr::new(0x1234_5000);
        let e = PageTableEntry::leaf(phys, PageFlags::WRITABLE | PageFlags::NO_EXECUTE);
        assert!(e.present());
        assert!(e.writable());
        assert!(e.no_execute());
        assert!(!e.user());
        assert!(!e.large());
        assert_eq!(e.address(), phys);
    }

    #[test]
    fn table_entry_caches_arena_slot() {
        let e = PageTableEntry::table(PhysAddr::new(0x40_0000), 37, false);
        assert_eq!(e.table_slot(), 37);
        assert_eq!(e.address(), PhysAddr::new(0x40_0000));
        assert!(e.present() && e.writable() && !e.large());
    }

    #[test]
    fn node_layout_is_one_page() {
        assert_eq!(core::mem::size_of::<PageTableNode>(), 4096);
    }
}

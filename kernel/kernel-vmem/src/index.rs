//! # Virtual-Address Decomposition
//!
//! Explicit shift/mask accessors splitting a canonical virtual address into
//! the four table-level indices, plus the offset masks of the superpage
//! leaf sizes. No overlapping-storage tricks; every index is a plain
//! shift-and-mask.

use kernel_addresses::VirtAddr;

/// Entries per table node at every level.
pub const TABLE_ENTRIES: usize = 512;

/// Mask selecting one 9-bit level index.
const INDEX_MASK: u64 = 0x1ff;

/// Bit positions of the four level indices, root first.
pub const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

/// In-page offset mask of a 1 GiB leaf.
pub const HUGE_PAGE_OFFSET_MASK: u64 = (1 << 30) - 1;

/// In-page offset mask of a 2 MiB leaf.
pub const LARGE_PAGE_OFFSET_MASK: u64 = (1 << 21) - 1;

/// First root-table index of the kernel half; entries at and above this
/// index are shared across address spaces.
pub const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// Root-table (level 4) index.
#[inline]
#[must_use]
pub const fn l4_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> LEVEL_SHIFTS[0]) & INDEX_MASK) as usize
}

/// Level-3 index.
#[inline]
#[must_use]
pub const fn l3_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> LEVEL_SHIFTS[1]) & INDEX_MASK) as usize
}

/// Level-2 index.
#[inline]
#[must_use]
pub const fn l2_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> LEVEL_SHIFTS[2]) & INDEX_MASK) as usize
}

/// Level-1 (leaf table) index.
#[inline]
#[must_use]
pub const fn l1_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> LEVEL_SHIFTS[3]) & INDEX_MASK) as usize
}

/// All four level indices of `virt`, root first.
#[inline]
#[must_use]
pub const fn level_indices(virt: VirtAddr) -> [usize; 4] {
    [
        l4_index(virt),
        l3_index(virt),
        l2_index(virt),
        l1_index(virt),
    ]
}

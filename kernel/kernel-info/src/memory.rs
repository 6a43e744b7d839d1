//! # Memory Layout
//!
//! Physical zone boundaries and the virtual-address plan. These constants are
//! the single source of truth; the allocators size their inventories from
//! them at compile time.

use kernel_addresses::PAGE_SIZE;

/// Physical memory below this is never handed out by the fallback
/// initializer: legacy DMA buffers, firmware areas, the boot trampoline.
pub const LOW_MEMORY_RESERVATION: u64 = 16 * 1024 * 1024;

/// End of the DMA zone (exclusive). Frames below here are reachable by
/// legacy 24-bit-ish DMA engines and are only handed out as a last resort.
pub const DMA_ZONE_END: u64 = 16 * 1024 * 1024;

/// End of the normal zone (exclusive); the default allocation zone.
pub const NORMAL_ZONE_END: u64 = 896 * 1024 * 1024;

/// Upper bound of physical memory the frame allocator manages. Memory above
/// this is ignored (and logged) at initialization.
pub const MANAGED_PHYS_END: u64 = 1024 * 1024 * 1024;

/// First virtual address of the kernel half. The top-level table entries at
/// and above this address are shared by reference across all address spaces.
pub const KERNEL_HALF_BASE: u64 = 0xffff_8000_0000_0000;

/// Base of the region space: the bump-pointer virtual allocator hands out
/// page-granular ranges upwards from here. Freed ranges are not reused.
pub const REGION_SPACE_BASE: u64 = 0xffff_a000_0000_0000;

/// Capacity of the address-space pool. Slots are never recycled, so this
/// bounds the number of `create_address_space` calls over the kernel's
/// lifetime.
pub const MAX_ADDRESS_SPACES: usize = 16;

const _: () = {
    assert!(DMA_ZONE_END <= NORMAL_ZONE_END);
    assert!(NORMAL_ZONE_END <= MANAGED_PHYS_END);
    assert!(LOW_MEMORY_RESERVATION.is_multiple_of(PAGE_SIZE));
    assert!(DMA_ZONE_END.is_multiple_of(PAGE_SIZE));
    assert!(NORMAL_ZONE_END.is_multiple_of(PAGE_SIZE));
    assert!(MANAGED_PHYS_END.is_multiple_of(PAGE_SIZE));
    assert!(REGION_SPACE_BASE >= KERNEL_HALF_BASE);
};

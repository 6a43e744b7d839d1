//! # Physical and Virtual Memory Addresses
//!
//! Newtypes over `u64` that keep the two address kinds from mixing, plus the
//! page-granularity helpers every layer of the memory manager shares.
//!
//! - [`PhysAddr`]: a machine bus address. Frame-grain code works in these.
//! - [`VirtAddr`]: an address as seen through the active page tables.
//! - [`PAGE_SIZE`] / [`PAGE_SHIFT`]: the base translation granule (4 KiB).
//!
//! Neither type guarantees alignment by itself; use [`PhysAddr::is_page_aligned`]
//! and friends where an operation requires it.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::ops::{Add, AddAssign};

/// Size of the base page / frame granule in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`; shifting by this converts addresses to frame numbers.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// A **physical** memory address.
///
/// Newtype over `u64` to prevent mixing with virtual addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(u64);

/// A **virtual** memory address.
///
/// Newtype over `u64` to prevent mixing with physical addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(u64);

impl PhysAddr {
    /// The zero address. Never handed out as a frame; layers treat it as
    /// "no address" where a sentinel is unavoidable.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame number this address falls into.
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Base address of a frame given its number.
    #[inline]
    #[must_use]
    pub const fn from_frame_number(frame: u64) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    /// Round down to the containing frame base.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Offset of this address within its frame.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtAddr {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing page base.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

/// Align `value` upwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Align `value` downwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Number of whole pages needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE) >> PAGE_SHIFT
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    /// # Panics
    /// Halts deliberately on address overflow; a wrapped physical address
    /// would alias frame 0.
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("PhysAddr add"))
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;

    /// # Panics
    /// Halts deliberately on address overflow; a wrapped virtual address
    /// would land in the lower half.
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("VirtAddr add"))
    }
}

impl AddAssign<u64> for PhysAddr {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl AddAssign<u64> for VirtAddr {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:012x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr(0x{:016x})", self.0)
    }
}

impl From<u64> for PhysAddr {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

impl From<u64> for VirtAddr {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_number_round_trip() {
        let pa = PhysAddr::new(0x40_3000);
        assert_eq!(pa.frame_number(), 0x403);
        assert_eq!(PhysAddr::from_frame_number(pa.frame_number()), pa);
        assert!(pa.is_page_aligned());
        assert!(!(pa + 8).is_page_aligned());
        assert_eq!((pa + 8).page_base(), pa);
        assert_eq!((pa + 8).page_offset(), 8);
    }

    #[test]
    #[should_panic(expected = "VirtAddr add")]
    fn address_addition_halts_on_overflow() {
        let _ = VirtAddr::new(u64::MAX) + 1;
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}

//! # Boot Memory Map
//!
//! The memory-map entry layout as the boot protocol hands it over. The frame
//! allocator consumes a slice of these to seed its inventories; only entries
//! of type [`USABLE_RAM`] contribute free frames.

/// Region type value meaning "usable RAM".
pub const USABLE_RAM: u32 = 1;

/// One region of the boot-time physical memory map.
///
/// Matches the wire layout of the boot protocol's memory-map tag, so a slice
/// of these can be reinterpreted straight out of the boot information block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical start of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Region type; see [`USABLE_RAM`].
    pub entry_type: u32,
    /// Padding in the wire format; always zero.
    pub reserved: u32,
}

impl MemoryMapEntry {
    /// A usable-RAM entry covering `[base, base + length)`.
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            entry_type: USABLE_RAM,
            reserved: 0,
        }
    }

    /// Whether this region may be handed to the frame allocator.
    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.entry_type == USABLE_RAM
    }

    /// Physical end of the region (exclusive), saturating at the address
    /// space limit.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_layout_matches_wire_format() {
        assert_eq!(core::mem::size_of::<MemoryMapEntry>(), 24);
        let e = MemoryMapEntry::usable(0x10_0000, 0x40_0000);
        assert!(e.is_usable());
        assert_eq!(e.end(), 0x50_0000);
    }
}

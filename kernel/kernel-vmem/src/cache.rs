//! # Software Translation Cache
//!
//! A small direct-mapped cache of page-granular translations in front of
//! the table walk. Mutating operations invalidate the affected line and an
//! address-space switch flushes everything, so a hit is always current for
//! the active space.

use core::cell::Cell;

use kernel_addresses::{PAGE_SHIFT, PhysAddr, VirtAddr};

const CACHE_LINES: usize = 64;

/// One cached translation: virtual page base to physical frame base.
type Line = Option<(u64, u64)>;

pub(crate) struct TranslationCache {
    lines: [Cell<Line>; CACHE_LINES],
}

impl TranslationCache {
    pub(crate) fn new() -> Self {
        Self {
            lines: core::array::from_fn(|_| Cell::new(None)),
        }
    }

    #[inline]
    fn line_of(page: VirtAddr) -> usize {
        ((page.as_u64() >> PAGE_SHIFT) as usize) % CACHE_LINES
    }

    pub(crate) fn lookup(&self, page: VirtAddr) -> Option<PhysAddr> {
        debug_assert!(page.is_page_aligned());
        match self.lines[Self::line_of(page)].get() {
            Some((tag, frame)) if tag == page.as_u64() => Some(PhysAddr::new(frame)),
            _ => None,
        }
    }

    pub(crate) fn insert(&self, page: VirtAddr, frame: PhysAddr) {
        debug_assert!(page.is_page_aligned() && frame.is_page_aligned());
        self.lines[Self::line_of(page)].set(Some((page.as_u64(), frame.as_u64())));
    }

    /// Drop the cached translation for `page`, if any.
    pub(crate) fn invalidate(&self, page: VirtAddr) {
        let line = &self.lines[Self::line_of(page)];
        if matches!(line.get(), Some((tag, _)) if tag == page.as_u64()) {
            line.set(None);
        }
    }

    pub(crate) fn flush(&self) {
        for line in &self.lines {
            line.set(None);
        }
    }
}

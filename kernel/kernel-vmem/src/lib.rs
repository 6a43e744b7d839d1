//! # Virtual Memory: Address Spaces and Page Tables
//!
//! The middle layer of the memory manager: four-level page tables built
//! over frames from [`kernel_pmm`], with map/unmap/translate, a coarse
//! bump-pointer region allocator, and a fixed pool of address spaces that
//! share the kernel half of the root table.
//!
//! Table nodes live in an arena and are addressed by slot, never through
//! their physical address; a table exists exactly when its backing frame is
//! marked used in the frame allocator. See [`AddressSpaceManager`] for the
//! operation surface.

#![cfg_attr(not(test), no_std)]

mod address_space;
mod arena;
mod cache;
mod entry;
pub mod index;

use thiserror::Error;

pub use address_space::{AddressSpaceId, AddressSpaceManager};
pub use entry::{PageFlags, PageTableEntry};

/// Failures of the address-space layer. All of them are exhaustion; the
/// caller decides whether to degrade or treat them as fatal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum VmemError {
    /// The frame allocator has no frame left.
    #[error("no physical frame available")]
    FrameExhausted,
    /// Every table-node arena slot is live.
    #[error("page-table arena exhausted")]
    TableArenaExhausted,
    /// Every address-space pool slot has been handed out.
    #[error("address-space pool exhausted")]
    SpacePoolExhausted,
}

//! # Kernel Configuration and Boot Information
//!
//! Shared constants describing the physical and virtual memory layout, and
//! the boot-protocol memory-map format handed to the frame allocator.
//!
//! This crate is a leaf: every memory-management layer reads it, none of the
//! layout knowledge lives anywhere else.

#![cfg_attr(not(test), no_std)]

pub mod boot;
pub mod memory;

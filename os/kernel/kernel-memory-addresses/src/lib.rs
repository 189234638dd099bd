//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the kernel memory
//! allocators.
//!
//! ## Overview
//!
//! | Type | Description |
//! |----------|----------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`PhysicalAddress`] | A physical frame address; indexes the frame descriptor table. |
//! | [`VirtualAddress`] | A kernel virtual address; may be turned into a pointer. |
//!
//! The allocators work in units of one base page ([`PAGE_SIZE`], 4 KiB). Every
//! buddy block is a power-of-two number of pages and aligned to its own size,
//! so the helpers here deal in byte alignments that are powers of two.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8000_0000_3000);
//! assert!(va.is_page_aligned());
//! assert_eq!(pages_for(4097), 2);
//! assert_eq!(order_for_pages(3), 2);
//!
//! let pa = PhysicalAddress::new(0x0010_0000);
//! assert!(pa.is_aligned(1 << 20));
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys in tests and tooling.
//! - Only virtual addresses convert to pointers; physical addresses are opaque
//!   numbers as far as the allocators are concerned.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod physical_address;
mod virtual_address;

pub use crate::memory_address::MemoryAddress;
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of base pages needed to hold `bytes` (at least one).
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    if bytes == 0 {
        1
    } else {
        bytes.div_ceil(PAGE_SIZE)
    }
}

/// Smallest `order` such that `2^order >= pages` (`pages == 0` yields `0`).
#[inline]
#[must_use]
pub const fn order_for_pages(pages: u64) -> u32 {
    if pages <= 1 {
        0
    } else {
        u64::BITS - (pages - 1).leading_zeros()
    }
}

/// Byte size of a block of the given `order`.
#[inline]
#[must_use]
pub const fn order_size(order: u32) -> u64 {
    PAGE_SIZE << order
}

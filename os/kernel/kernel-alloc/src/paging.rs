//! # Paging Collaborator
//!
//! The allocators never touch page tables themselves. They consume three
//! primitives through the [`Paging`] trait:
//!
//! | Call | Contract |
//! |---|---|
//! | [`map`](Paging::map) | Establish a single 4 KiB mapping; fails if already mapped. |
//! | [`unmap`](Paging::unmap) | Remove a single mapping; a no-op for unmapped pages. |
//! | [`translate`](Paging::translate) | Backing physical address, or `None` if unmapped. |
//!
//! `map` and `unmap` receive the [`FrameAllocator`] so that implementations can
//! take frames for intermediate page tables and keep them alive with
//! [`FrameAllocator::mark_mapped`] / [`FrameAllocator::unmark_mapped`]: a table
//! frame is released once the last entry pointing into it goes away.

use crate::frame_alloc::FrameAllocator;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Leaf permissions requested for a kernel mapping.
#[bitfield(u8)]
pub struct MapFlags {
    /// Page may be written.
    pub writable: bool,
    /// Translation survives address-space switches.
    pub global: bool,
    /// Instruction fetches fault.
    pub no_execute: bool,
    #[bits(5)]
    __: u8,
}

impl MapFlags {
    /// Read/write, global, non-executable: the default for heap pages.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new()
            .with_writable(true)
            .with_global(true)
            .with_no_execute(true)
    }
}

/// Failure reported by a [`Paging`] implementation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    #[error("virtual address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("no frame available for an intermediate page table")]
    OutOfTables,
    #[error("mapping of {0} rejected")]
    Rejected(VirtualAddress),
}

/// Page-table primitives for the kernel address space.
pub trait Paging {
    /// Map one 4 KiB page `va → pa`.
    ///
    /// # Errors
    /// [`PagingError::AlreadyMapped`] if `va` is mapped, or any
    /// implementation-specific failure.
    fn map(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), PagingError>;

    /// Remove the mapping of `va`, returning the frame it pointed to.
    fn unmap(&mut self, frames: &mut FrameAllocator, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Translate `va` to its backing physical address (with in-page offset).
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}

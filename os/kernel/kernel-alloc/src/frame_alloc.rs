//! # Physical Frame Allocator
//!
//! Buddy allocator over a contiguous pool of physical page frames, plus the
//! per-frame bookkeeping the upper layers hang off each frame:
//!
//! | Field | Purpose |
//! |---|---|
//! | block header | Buddy state (see [`buddy`](crate::buddy)). |
//! | `maps` | Number of live virtual mappings onto the frame. |
//! | `owner` | Which higher-level structure currently uses the frame. |
//!
//! ## Mapping Reference Counts
//!
//! The paging collaborator bumps `maps` for every page-table entry that points
//! at a frame, including entries pointing at intermediate table frames. With
//! [`UnmapPolicy::Release`] the frame is handed back to the buddy lists once
//! the last mapping is gone; this is how a page-table frame dies together with
//! its last entry. The region allocator uses [`UnmapPolicy::Keep`] because it
//! frees whole multi-page blocks itself.
//!
//! ## Ownership Tags
//!
//! While a frame is in use it is tagged with at most one [`FrameOwner`]. The
//! slab allocator resolves free-by-address through this tag:
//! `virtual address → translate → frame → owning slab`.

use crate::buddy::{Block, BuddyDescriptor, BuddyTable, FreeBlocks};
use crate::error::AllocError;
use crate::slab::Slab;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress};

/// Higher-level structure a frame currently belongs to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameOwner {
    /// Free, a page table, or a raw [`FrameAllocator::alloc`] user.
    #[default]
    Unowned,
    /// Backs a virtual region handed out by the region allocator.
    Region,
    /// Backs the objects of this slab.
    Slab(NonNull<Slab>),
}

/// What [`FrameAllocator::unmark_mapped`] does when a count drops to zero.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UnmapPolicy {
    /// Free the frame if it heads an allocated block.
    #[default]
    Release,
    /// Leave the frame allocated; the caller frees it.
    Keep,
}

/// Metadata for one physical page frame.
#[derive(Copy, Clone, Debug)]
pub struct FrameDescriptor {
    block: Block,
    maps: u32,
    owner: FrameOwner,
}

impl FrameDescriptor {
    pub const EMPTY: Self = Self {
        block: Block::EMPTY,
        maps: 0,
        owner: FrameOwner::Unowned,
    };

    #[inline]
    #[must_use]
    pub const fn maps(&self) -> u32 {
        self.maps
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> FrameOwner {
        self.owner
    }
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BuddyDescriptor for FrameDescriptor {
    #[inline]
    fn block(&self) -> &Block {
        &self.block
    }

    #[inline]
    fn block_mut(&mut self) -> &mut Block {
        &mut self.block
    }
}

/// Buddy allocator over physical frames.
pub struct FrameAllocator {
    table: BuddyTable<FrameDescriptor>,
}

// SAFETY: the slab pointers stored in ownership tags are only dereferenced by
// the slab allocator while it holds its own lock; the allocator itself never
// touches them.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Manage `len` bytes of physical memory starting at `base`.
    ///
    /// `descs` needs one entry per page.
    ///
    /// # Errors
    /// See [`BuddyTable::new`].
    pub fn new(
        base: PhysicalAddress,
        len: u64,
        descs: &'static mut [FrameDescriptor],
    ) -> Result<Self, AllocError> {
        let table = BuddyTable::new(base.as_u64(), len, descs)?;
        log::info!(
            "frame allocator: {} pages at {base}, top level {}",
            len >> PAGE_SHIFT,
            table.max_level()
        );
        Ok(Self { table })
    }

    /// Allocate a power-of-two run of frames holding at least `size` bytes.
    ///
    /// The returned address is aligned to the rounded size.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`], [`AllocError::AllocationTooLarge`], or
    /// [`AllocError::Corruption`].
    pub fn alloc(&mut self, size: u64) -> Result<PhysicalAddress, AllocError> {
        let pa = self.table.alloc(size).map(PhysicalAddress::new)?;
        log::trace!("phys alloc {size:#x} -> {pa}");
        Ok(pa)
    }

    /// Return the block headed at `pa` and coalesce it with free buddies.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] for interior, unaligned, foreign or
    /// already free addresses.
    pub fn free(&mut self, pa: PhysicalAddress) -> Result<(), AllocError> {
        let level = self.table.free(pa.as_u64())?;
        log::trace!("phys free {pa} (merged to level {level})");
        Ok(())
    }

    /// Record one more mapping onto the frame containing `pa`.
    ///
    /// Returns the new count.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if `pa` is outside the pool.
    pub fn mark_mapped(&mut self, pa: PhysicalAddress) -> Result<u32, AllocError> {
        let desc = self
            .table
            .descriptor_mut(pa.as_u64())
            .ok_or(AllocError::InvalidAddress(pa.as_u64()))?;
        desc.maps = desc
            .maps
            .checked_add(1)
            .ok_or(AllocError::Corruption("mapping count overflow"))?;
        Ok(desc.maps)
    }

    /// Drop one mapping from the frame containing `pa`.
    ///
    /// Returns `true` if the count reached zero and the frame was freed.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if `pa` is outside the pool or the frame
    /// has no mappings left.
    pub fn unmark_mapped(
        &mut self,
        pa: PhysicalAddress,
        policy: UnmapPolicy,
    ) -> Result<bool, AllocError> {
        let frame = pa.page_base();
        let desc = self
            .table
            .descriptor_mut(frame.as_u64())
            .ok_or(AllocError::InvalidAddress(pa.as_u64()))?;
        if desc.maps == 0 {
            return Err(AllocError::InvalidAddress(pa.as_u64()));
        }
        desc.maps -= 1;
        if desc.maps != 0 || policy == UnmapPolicy::Keep {
            return Ok(false);
        }
        if self.table.allocated_head(frame.as_u64()).is_none() {
            return Ok(false);
        }
        if let Some(desc) = self.table.descriptor_mut(frame.as_u64()) {
            desc.owner = FrameOwner::Unowned;
        }
        self.free(frame)?;
        Ok(true)
    }

    /// Current mapping count of the frame containing `pa`.
    #[must_use]
    pub fn maps(&self, pa: PhysicalAddress) -> Option<u32> {
        self.table.descriptor(pa.as_u64()).map(FrameDescriptor::maps)
    }

    /// Owner tag of the frame containing `pa`.
    #[must_use]
    pub fn owner(&self, pa: PhysicalAddress) -> Option<FrameOwner> {
        self.table.descriptor(pa.as_u64()).map(FrameDescriptor::owner)
    }

    /// Re-tag the frame containing `pa`.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if `pa` is outside the pool.
    pub fn set_owner(&mut self, pa: PhysicalAddress, owner: FrameOwner) -> Result<(), AllocError> {
        let desc = self
            .table
            .descriptor_mut(pa.as_u64())
            .ok_or(AllocError::InvalidAddress(pa.as_u64()))?;
        desc.owner = owner;
        Ok(())
    }

    /// Page count of the allocated block headed at `pa`, if any.
    #[must_use]
    pub fn allocated_block_pages(&self, pa: PhysicalAddress) -> Option<u64> {
        self.table
            .allocated_head(pa.as_u64())
            .map(|b| b.size() >> PAGE_SHIFT)
    }

    /// `true` if `pa` lies inside the managed pool.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.table.contains(pa.as_u64())
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.table.free_bytes()
    }

    #[must_use]
    pub const fn max_level(&self) -> u8 {
        self.table.max_level()
    }

    /// Iterate the free lists.
    #[must_use]
    pub const fn free_blocks(&self) -> FreeBlocks<'_, FrameDescriptor> {
        self.table.free_blocks()
    }

    /// # Errors
    /// [`AllocError::Corruption`] if a free-list invariant is broken.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        self.table.check_invariants()
    }
}

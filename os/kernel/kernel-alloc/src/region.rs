//! # Virtual Region Allocator
//!
//! Buddy allocator over the kernel's reserved virtual address range. Regions
//! can be handed out *unbacked* (address space only) or *backed*, in which
//! case every page is mapped to a physical frame before the call returns.
//!
//! ## Backing Strategy
//!
//! Backing tries to satisfy the whole region from one physically contiguous
//! run and halves the run size whenever the frame allocator cannot provide it:
//!
//! ```text
//! region (8 pages):   [ 0 1 2 3 4 5 6 7 ]
//! try 8 pages  -> out of memory
//! try 4 pages  -> ok    [ 0 1 2 3 ] -> frames A..A+3
//! try 4 pages  -> out of memory
//! try 2 pages  -> ok            [ 4 5 ] -> frames B..B+1
//! try 2 pages  -> ok                [ 6 7 ] -> frames C..C+1
//! ```
//!
//! Frames obtained here are tagged [`FrameOwner::Region`] and carry one
//! mapping reference per page.
//!
//! ## Rollback
//!
//! If any frame allocation or map fails, every mapping established by the
//! same call is torn down, every frame obtained by it is freed, and the
//! region goes back onto the virtual free lists. The call then fails with
//! [`AllocError::MappingFailure`].

use crate::buddy::{Block, BuddyDescriptor, BuddyTable, FreeBlocks};
use crate::error::AllocError;
use crate::frame_alloc::{FrameAllocator, FrameOwner, UnmapPolicy};
use crate::paging::{MapFlags, Paging};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Metadata for one page of kernel virtual address space.
#[derive(Copy, Clone, Debug)]
pub struct RegionDescriptor {
    block: Block,
    backed: bool,
}

impl RegionDescriptor {
    pub const EMPTY: Self = Self {
        block: Block::EMPTY,
        backed: false,
    };
}

impl Default for RegionDescriptor {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BuddyDescriptor for RegionDescriptor {
    #[inline]
    fn block(&self) -> &Block {
        &self.block
    }

    #[inline]
    fn block_mut(&mut self) -> &mut Block {
        &mut self.block
    }
}

/// Buddy allocator over kernel virtual address space.
pub struct RegionAllocator<P> {
    table: BuddyTable<RegionDescriptor>,
    paging: P,
    flags: MapFlags,
}

impl<P: Paging> RegionAllocator<P> {
    /// Manage `[base, base + len)` and map backing pages with `flags`.
    ///
    /// # Errors
    /// See [`BuddyTable::new`].
    pub fn new(
        base: VirtualAddress,
        len: u64,
        descs: &'static mut [RegionDescriptor],
        paging: P,
        flags: MapFlags,
    ) -> Result<Self, AllocError> {
        let table = BuddyTable::new(base.as_u64(), len, descs)?;
        log::info!(
            "region allocator: {} pages at {base}, top level {}",
            len >> PAGE_SHIFT,
            table.max_level()
        );
        Ok(Self {
            table,
            paging,
            flags,
        })
    }

    /// Allocate a power-of-two region of at least `size` bytes.
    ///
    /// # Errors
    /// - [`AllocError::OutOfMemory`] / [`AllocError::AllocationTooLarge`] if
    ///   no virtual block is available.
    /// - [`AllocError::MappingFailure`] if backing failed and was rolled back.
    pub fn alloc(
        &mut self,
        frames: &mut FrameAllocator,
        size: u64,
        backed: bool,
    ) -> Result<VirtualAddress, AllocError> {
        let va = VirtualAddress::new(self.table.alloc(size)?);
        if !backed {
            log::trace!("virt alloc {size:#x} -> {va} (unbacked)");
            return Ok(va);
        }

        let pages = self.region_pages(va)?;
        if let Err(err) = self.back(frames, va, pages) {
            // back() already released whatever it mapped
            self.table.free(va.as_u64())?;
            log::warn!("virt alloc {size:#x} at {va}: backing failed ({err}), rolled back");
            return Err(match err {
                AllocError::Corruption(_) => err,
                _ => AllocError::MappingFailure(va.as_u64()),
            });
        }

        self.set_backed(va, true);
        log::debug!("virt alloc {size:#x} -> {va} ({pages} pages backed)");
        Ok(va)
    }

    /// Unmap the region headed at `va`, release its frames, and merge it back.
    ///
    /// Pages that are not mapped are skipped. Frames are only freed for
    /// regions this allocator backed itself.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if `va` does not head an allocated region.
    pub fn free(&mut self, frames: &mut FrameAllocator, va: VirtualAddress) -> Result<(), AllocError> {
        let pages = self.region_pages(va)?;
        let backed = self.is_backed(va);
        if backed {
            self.release(frames, va, pages)?;
        } else {
            self.unmap_foreign(frames, va, pages);
        }
        self.set_backed(va, false);
        self.table.free(va.as_u64())?;
        log::trace!("virt free {va} ({pages} pages)");
        Ok(())
    }

    /// Back `pages` pages at `va`, a window *outside* the buddy range.
    ///
    /// Used for the pre-mapped bootstrap pages. The frames stay mapped for
    /// the lifetime of the allocator.
    ///
    /// # Errors
    /// - [`AllocError::InvalidLayout`] if the window is unaligned or overlaps
    ///   the managed range.
    /// - [`AllocError::MappingFailure`] if backing failed and was rolled back.
    pub fn premap(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtualAddress,
        pages: u64,
    ) -> Result<(), AllocError> {
        let end = va
            .checked_add(pages << PAGE_SHIFT)
            .ok_or(AllocError::InvalidLayout("premap window wraps"))?;
        let (lo, hi) = (self.table.base(), self.table.base() + self.table.len());
        if !va.is_page_aligned() || (va.as_u64() < hi && end.as_u64() > lo) {
            return Err(AllocError::InvalidLayout("premap window must be aligned and outside the region pool"));
        }

        for page in 0..pages {
            let at = va + (page << PAGE_SHIFT);
            if let Err(err) = self.map_one_frame(frames, at) {
                self.release(frames, va, page)?;
                log::warn!("premap of {pages} pages at {va} failed at {at}: {err}");
                return Err(AllocError::MappingFailure(va.as_u64()));
            }
        }
        log::debug!("premapped {pages} pages at {va}");
        Ok(())
    }

    /// Physical address backing `va`.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.paging.translate(va)
    }

    /// `true` if `va` heads a region this allocator backed.
    #[must_use]
    pub fn is_backed(&self, va: VirtualAddress) -> bool {
        self.table
            .allocated_head(va.as_u64())
            .is_some()
            && self.table.descriptor(va.as_u64()).is_some_and(|d| d.backed)
    }

    /// Size in bytes of the allocated region headed at `va`.
    #[must_use]
    pub fn region_size(&self, va: VirtualAddress) -> Option<u64> {
        self.table.allocated_head(va.as_u64()).map(Block::size)
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.table.contains(va.as_u64())
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.table.free_bytes()
    }

    #[must_use]
    pub const fn free_blocks(&self) -> FreeBlocks<'_, RegionDescriptor> {
        self.table.free_blocks()
    }

    /// # Errors
    /// [`AllocError::Corruption`] if a free-list invariant is broken.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        self.table.check_invariants()
    }

    #[must_use]
    pub const fn paging(&self) -> &P {
        &self.paging
    }

    pub const fn paging_mut(&mut self) -> &mut P {
        &mut self.paging
    }

    fn region_pages(&self, va: VirtualAddress) -> Result<u64, AllocError> {
        self.region_size(va)
            .map(|size| size >> PAGE_SHIFT)
            .ok_or(AllocError::InvalidAddress(va.as_u64()))
    }

    fn set_backed(&mut self, va: VirtualAddress, backed: bool) {
        if let Some(desc) = self.table.descriptor_mut(va.as_u64()) {
            desc.backed = backed;
        }
    }

    /// Map `pages` pages at `va`, largest physical run first.
    ///
    /// On failure everything mapped so far is released again.
    fn back(&mut self, frames: &mut FrameAllocator, va: VirtualAddress, pages: u64) -> Result<(), AllocError> {
        let mut done = 0;
        let mut chunk = pages;
        while done < pages {
            let pa = match frames.alloc(chunk << PAGE_SHIFT) {
                Ok(pa) => pa,
                Err(AllocError::OutOfMemory | AllocError::AllocationTooLarge { .. }) if chunk > 1 => {
                    chunk /= 2;
                    continue;
                }
                Err(err) => {
                    self.release(frames, va, done)?;
                    return Err(err);
                }
            };

            for page in 0..chunk {
                let at = va + ((done + page) << PAGE_SHIFT);
                let frame = pa + (page << PAGE_SHIFT);
                if let Err(err) = self.map_frame(frames, at, frame) {
                    log::debug!("map {at} -> {frame} failed: {err}");
                    // the partial run is mapped but not yet accounted in `done`
                    self.release(frames, va, done + page)?;
                    if page == 0 {
                        frames.free(pa)?;
                    }
                    return Err(AllocError::MappingFailure(va.as_u64()));
                }
            }
            done += chunk;
        }
        Ok(())
    }

    fn map_frame(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), AllocError> {
        self.paging
            .map(frames, va, pa, self.flags)
            .map_err(|_| AllocError::MappingFailure(va.as_u64()))?;
        frames.mark_mapped(pa)?;
        frames.set_owner(pa, FrameOwner::Region)
    }

    fn map_one_frame(&mut self, frames: &mut FrameAllocator, va: VirtualAddress) -> Result<(), AllocError> {
        let pa = frames.alloc(PAGE_SIZE)?;
        self.map_frame(frames, va, pa).or_else(|err| {
            frames.free(pa)?;
            Err(err)
        })
    }

    /// Unmap the first `pages` pages at `va` and free the frame runs behind them.
    ///
    /// Each run is freed once all of its pages are unmapped, by walking the
    /// run from its head frame.
    fn release(&mut self, frames: &mut FrameAllocator, va: VirtualAddress, pages: u64) -> Result<(), AllocError> {
        let mut page = 0;
        while page < pages {
            let at = va + (page << PAGE_SHIFT);
            let Some(head) = self.paging.translate(at) else {
                page += 1;
                continue;
            };
            let run = frames.allocated_block_pages(head).unwrap_or(1);
            let mapped = run.min(pages - page);
            for i in 0..mapped {
                let at = va + ((page + i) << PAGE_SHIFT);
                if let Some(pa) = self.paging.unmap(frames, at) {
                    frames.unmark_mapped(pa, UnmapPolicy::Keep)?;
                    frames.set_owner(pa, FrameOwner::Unowned)?;
                }
            }
            if frames.allocated_block_pages(head).is_some() {
                frames.free(head)?;
            }
            page += mapped;
        }
        Ok(())
    }

    /// Unmap pages the caller mapped into an unbacked region.
    fn unmap_foreign(&mut self, frames: &mut FrameAllocator, va: VirtualAddress, pages: u64) {
        for page in 0..pages {
            let at = va + (page << PAGE_SHIFT);
            if let Some(pa) = self.paging.unmap(frames, at)
                && frames.contains(pa)
                && let Err(err) = frames.unmark_mapped(pa, UnmapPolicy::Keep)
            {
                log::warn!("unmapped {at} but frame {pa} kept no mapping count: {err}");
            }
        }
    }
}

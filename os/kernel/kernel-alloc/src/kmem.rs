//! # Kernel Memory Context
//!
//! [`Kmem`] owns the three allocators and is the only entry point the rest of
//! the kernel uses. Each allocator sits behind its own [`OrderedLock`]; the
//! levels are declared once:
//!
//! ```text
//! CacheLevel  ──▶  RegionLevel  ──▶  FrameLevel
//! (slab caches)    (virtual pool)    (physical pool)
//! ```
//!
//! A slab operation holds the cache lock and takes the region and frame locks
//! beneath it whenever it grows or shrinks a cache; a region operation holds
//! the region lock and takes the frame lock beneath it. Taking the locks in
//! any other order does not compile.
//!
//! ## Construction
//!
//! [`Kmem::new`] runs the whole bring-up:
//!
//! 1. Frame and region allocators over the configured pools.
//! 2. [`RegionAllocator::premap`] of the bootstrap window.
//! 3. Phase 1 of the slab allocator on that window, then phase 2.
//! 4. One cache per entry of [`SIZE_CLASSES`] for [`Kmem::generic_alloc`].
//!
//! ## Size Classes
//!
//! | Request | Served by |
//! |---|---|
//! | `size <= 2048`, `align <= 16` | smallest class of at least `max(size, align)` bytes |
//! | anything else | a backed region of `max(size, align)` bytes |
//!
//! [`Kmem::generic_free`] finds its way back from the pointer alone, through
//! the owner tag of the backing frame.

mod global_alloc;

pub use global_alloc::GlobalKmem;

use crate::error::AllocError;
use crate::frame_alloc::{FrameAllocator, FrameDescriptor, FrameOwner, UnmapPolicy};
use crate::paging::{MapFlags, Paging};
use crate::region::{RegionAllocator, RegionDescriptor};
use crate::slab::{
    AllocFlags, CacheConfig, CacheDestroyError, CacheRef, CacheStats, ReapFlags, SlabAllocator,
    SlabBacking,
};
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};
use kernel_sync::{LockContext, OrderedLock};

/// Lock level of the slab cache registry.
pub enum CacheLevel {}
/// Lock level of the virtual region allocator.
pub enum RegionLevel {}
/// Lock level of the physical frame allocator.
pub enum FrameLevel {}

kernel_sync::lock_order!(CacheLevel => RegionLevel => FrameLevel);

/// Object sizes of the generic caches.
pub const SIZE_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// Largest alignment a generic cache guarantees.
pub const SIZE_CLASS_MAX_ALIGN: usize = 16;

const SIZE_CLASS_NAMES: [&str; 9] = [
    "size-8", "size-16", "size-32", "size-64", "size-128", "size-256", "size-512", "size-1024",
    "size-2048",
];

/// Pools and windows handed to [`Kmem::new`].
#[derive(Copy, Clone, Debug)]
pub struct KmemConfig {
    /// Start of the physical frame pool.
    pub phys_base: PhysicalAddress,
    /// Length of the physical frame pool in bytes.
    pub phys_len: u64,
    /// Start of the virtual region pool.
    pub virt_base: VirtualAddress,
    /// Length of the virtual region pool in bytes.
    pub virt_len: u64,
    /// Start of the bootstrap window; must lie outside the region pool.
    pub bootstrap_base: VirtualAddress,
    /// Pages in the bootstrap window.
    pub bootstrap_pages: usize,
    /// Leaf permissions for every backing page.
    pub map_flags: MapFlags,
}

/// The kernel memory allocators and their locks.
pub struct Kmem<P> {
    caches: OrderedLock<CacheLevel, SlabAllocator>,
    regions: OrderedLock<RegionLevel, RegionAllocator<P>>,
    frames: OrderedLock<FrameLevel, FrameAllocator>,
    classes: [Option<CacheRef>; SIZE_CLASSES.len()],
}

impl<P: Paging> Kmem<P> {
    /// Bring up all three allocators.
    ///
    /// `frame_descs` needs one entry per page of the physical pool and
    /// `region_descs` one per page of the virtual pool.
    ///
    /// # Errors
    /// Any construction failure of the underlying allocators, a failure to
    /// back the bootstrap window, or a failure to seed the core caches.
    pub fn new(
        config: KmemConfig,
        paging: P,
        frame_descs: &'static mut [FrameDescriptor],
        region_descs: &'static mut [RegionDescriptor],
    ) -> Result<Self, AllocError> {
        let mut frames = FrameAllocator::new(config.phys_base, config.phys_len, frame_descs)?;
        let mut regions = RegionAllocator::new(
            config.virt_base,
            config.virt_len,
            region_descs,
            paging,
            config.map_flags,
        )?;
        regions.premap(
            &mut frames,
            config.bootstrap_base,
            config.bootstrap_pages as u64,
        )?;

        let mut kmem = Self {
            caches: OrderedLock::new(SlabAllocator::new()),
            regions: OrderedLock::new(regions),
            frames: OrderedLock::new(frames),
            classes: [const { None }; SIZE_CLASSES.len()],
        };

        let mut root = LockContext::new();
        let (mut slabs, mut ctx) = kmem.caches.lock(&mut root);
        let mut backing = KmemBacking {
            regions: &kmem.regions,
            frames: &kmem.frames,
            ctx: &mut ctx,
        };
        slabs.seed(&mut backing, config.bootstrap_base, config.bootstrap_pages)?;
        slabs.finish_bootstrap()?;
        for ((slot, size), name) in kmem
            .classes
            .iter_mut()
            .zip(SIZE_CLASSES)
            .zip(SIZE_CLASS_NAMES)
        {
            let config = CacheConfig::new(name, size).with_align(size.min(SIZE_CLASS_MAX_ALIGN));
            *slot = Some(slabs.create(&mut backing, &config)?);
        }
        drop(slabs);

        log::info!(
            "kmem: ready, {} KiB physical and {} KiB virtual free",
            kmem.phys_free_bytes() >> 10,
            kmem.virt_free_bytes() >> 10
        );
        Ok(kmem)
    }

    /// See [`FrameAllocator::alloc`].
    ///
    /// # Errors
    /// As [`FrameAllocator::alloc`].
    pub fn phys_alloc(&self, size: u64) -> Result<PhysicalAddress, AllocError> {
        let mut root = LockContext::new();
        let (mut frames, _) = self.frames.lock(&mut root);
        frames.alloc(size)
    }

    /// See [`FrameAllocator::free`].
    ///
    /// # Errors
    /// As [`FrameAllocator::free`].
    pub fn phys_free(&self, pa: PhysicalAddress) -> Result<(), AllocError> {
        let mut root = LockContext::new();
        let (mut frames, _) = self.frames.lock(&mut root);
        frames.free(pa)
    }

    /// # Errors
    /// As [`FrameAllocator::mark_mapped`].
    pub fn mark_mapped(&self, pa: PhysicalAddress) -> Result<u32, AllocError> {
        let mut root = LockContext::new();
        let (mut frames, _) = self.frames.lock(&mut root);
        frames.mark_mapped(pa)
    }

    /// # Errors
    /// As [`FrameAllocator::unmark_mapped`].
    pub fn unmark_mapped(&self, pa: PhysicalAddress, policy: UnmapPolicy) -> Result<bool, AllocError> {
        let mut root = LockContext::new();
        let (mut frames, _) = self.frames.lock(&mut root);
        frames.unmark_mapped(pa, policy)
    }

    /// See [`RegionAllocator::alloc`].
    ///
    /// # Errors
    /// As [`RegionAllocator::alloc`].
    pub fn virt_alloc(&self, size: u64, backed: bool) -> Result<VirtualAddress, AllocError> {
        let mut root = LockContext::new();
        let (mut regions, mut ctx) = self.regions.lock(&mut root);
        let (mut frames, _) = self.frames.lock(&mut ctx);
        regions.alloc(&mut frames, size, backed)
    }

    /// See [`RegionAllocator::free`].
    ///
    /// # Errors
    /// As [`RegionAllocator::free`].
    pub fn virt_free(&self, va: VirtualAddress) -> Result<(), AllocError> {
        let mut root = LockContext::new();
        let (mut regions, mut ctx) = self.regions.lock(&mut root);
        let (mut frames, _) = self.frames.lock(&mut ctx);
        regions.free(&mut frames, va)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut root = LockContext::new();
        let (regions, _) = self.regions.lock(&mut root);
        regions.translate(va)
    }

    /// Owner tag of the frame containing `pa`.
    #[must_use]
    pub fn frame_owner(&self, pa: PhysicalAddress) -> Option<FrameOwner> {
        let mut root = LockContext::new();
        let (frames, _) = self.frames.lock(&mut root);
        frames.owner(pa)
    }

    /// # Errors
    /// As [`SlabAllocator::create`].
    pub fn cache_create(&self, config: &CacheConfig) -> Result<CacheRef, AllocError> {
        self.with_slabs(|slabs, backing| slabs.create(backing, config))
    }

    /// # Errors
    /// As [`SlabAllocator::alloc`].
    pub fn cache_alloc(&self, cache: &CacheRef, flags: AllocFlags) -> Result<NonNull<u8>, AllocError> {
        self.with_slabs(|slabs, backing| slabs.alloc(backing, cache, flags))
    }

    /// # Errors
    /// As [`SlabAllocator::free`].
    pub fn cache_free(&self, cache: &CacheRef, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.with_slabs(|slabs, backing| slabs.free(backing, cache, ptr))
    }

    /// # Errors
    /// As [`SlabAllocator::destroy`].
    pub fn cache_destroy(&self, cache: CacheRef) -> Result<(), CacheDestroyError> {
        self.with_slabs(|slabs, backing| slabs.destroy(backing, cache))
    }

    /// # Errors
    /// As [`SlabAllocator::reap`].
    pub fn cache_reap(&self, flags: ReapFlags) -> Result<usize, AllocError> {
        self.with_slabs(|slabs, backing| slabs.reap(backing, flags))
    }

    #[must_use]
    pub fn cache_stats(&self, cache: &CacheRef) -> CacheStats {
        let mut root = LockContext::new();
        let (slabs, _) = self.caches.lock(&mut root);
        slabs.stats(cache)
    }

    /// Statistics of the first registered cache named `name`.
    #[must_use]
    pub fn cache_stats_by_name(&self, name: &str) -> Option<CacheStats> {
        let mut root = LockContext::new();
        let (slabs, _) = self.caches.lock(&mut root);
        slabs.all_stats().find(|stats| stats.name == name)
    }

    /// Allocate `size` bytes at the natural alignment of a size class.
    ///
    /// # Errors
    /// [`AllocError::InvalidLayout`] for `size == 0`, otherwise the failure
    /// of the cache or region that served the request.
    pub fn generic_alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.generic_alloc_aligned(size, 1)
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// [`AllocError::InvalidLayout`] for `size == 0` or an alignment that is
    /// not a power of two, otherwise the failure of the cache or region that
    /// served the request.
    pub fn generic_alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidLayout("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidLayout("alignment must be a power of two"));
        }
        let need = size.max(align);
        if align <= SIZE_CLASS_MAX_ALIGN
            && let Some(cache) = self.class_for(need)
        {
            return self.cache_alloc(cache, AllocFlags::new());
        }
        let va = self.virt_alloc(need as u64, true)?;
        va.as_nonnull()
            .ok_or(AllocError::Corruption("null region address"))
    }

    /// Free anything returned by [`generic_alloc`](Self::generic_alloc).
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if `ptr` is neither a live size-class
    /// object nor the head of a backed region.
    pub fn generic_free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let va = VirtualAddress::from_nonnull(ptr);
        let invalid = AllocError::InvalidAddress(va.as_u64());
        let pa = self.translate(va).ok_or(invalid)?;
        match self.frame_owner(pa).ok_or(invalid)? {
            FrameOwner::Slab(_) => self.with_slabs(|slabs, backing| slabs.free_any(backing, ptr)),
            FrameOwner::Region if va.is_page_aligned() => self.virt_free(va),
            _ => Err(invalid),
        }
    }

    /// Handle of the generic cache for objects of `size` bytes.
    #[must_use]
    pub fn class_for(&self, size: usize) -> Option<&CacheRef> {
        let index = SIZE_CLASSES.iter().position(|&class| class >= size)?;
        self.classes[index].as_ref()
    }

    #[must_use]
    pub fn phys_free_bytes(&self) -> u64 {
        let mut root = LockContext::new();
        let (frames, _) = self.frames.lock(&mut root);
        frames.free_bytes()
    }

    #[must_use]
    pub fn virt_free_bytes(&self) -> u64 {
        let mut root = LockContext::new();
        let (regions, _) = self.regions.lock(&mut root);
        regions.free_bytes()
    }

    /// Run `f` on the paging collaborator under the region lock.
    pub fn with_paging<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut root = LockContext::new();
        let (mut regions, _) = self.regions.lock(&mut root);
        f(regions.paging_mut())
    }

    /// Check the free lists of both buddy allocators and every slab cache.
    ///
    /// # Errors
    /// [`AllocError::Corruption`] describing the first violation.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        let mut root = LockContext::new();
        let (slabs, mut ctx) = self.caches.lock(&mut root);
        slabs.check_invariants()?;
        let (regions, mut ctx) = self.regions.lock(&mut ctx);
        regions.check_invariants()?;
        let (frames, _) = self.frames.lock(&mut ctx);
        frames.check_invariants()
    }

    fn with_slabs<R>(
        &self,
        f: impl FnOnce(&mut SlabAllocator, &mut KmemBacking<'_, '_, P>) -> R,
    ) -> R {
        let mut root = LockContext::new();
        let (mut slabs, mut ctx) = self.caches.lock(&mut root);
        let mut backing = KmemBacking {
            regions: &self.regions,
            frames: &self.frames,
            ctx: &mut ctx,
        };
        f(&mut slabs, &mut backing)
    }
}

/// The region and frame allocators as seen from under the cache lock.
struct KmemBacking<'a, 'c, P> {
    regions: &'a OrderedLock<RegionLevel, RegionAllocator<P>>,
    frames: &'a OrderedLock<FrameLevel, FrameAllocator>,
    ctx: &'c mut LockContext<'a, CacheLevel>,
}

impl<P: Paging> SlabBacking for KmemBacking<'_, '_, P> {
    fn alloc_pages(&mut self, pages: u64) -> Result<VirtualAddress, AllocError> {
        let (mut regions, mut ctx) = self.regions.lock(self.ctx);
        let (mut frames, _) = self.frames.lock(&mut ctx);
        regions.alloc(&mut frames, pages << PAGE_SHIFT, true)
    }

    fn free_pages(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        let (mut regions, mut ctx) = self.regions.lock(self.ctx);
        let (mut frames, _) = self.frames.lock(&mut ctx);
        regions.free(&mut frames, va)
    }

    fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (regions, _) = self.regions.lock(self.ctx);
        regions.translate(va)
    }

    fn frame_owner(&mut self, pa: PhysicalAddress) -> Option<FrameOwner> {
        let (frames, _) = self.frames.lock(self.ctx);
        frames.owner(pa)
    }

    fn set_frame_owner(&mut self, pa: PhysicalAddress, owner: FrameOwner) -> Result<(), AllocError> {
        let (mut frames, _) = self.frames.lock(self.ctx);
        frames.set_owner(pa, owner)
    }
}

//! # Slab Cache Allocator
//!
//! Named caches of equal-size objects carved out of virtually backed pages.
//!
//! ## Records
//!
//! Everything the allocator tracks lives in raw slab memory:
//!
//! | Record | Where | Linked into |
//! |---|---|---|
//! | [`Cache`] | an object of the cache of caches (`kmem_cache`) | the registry |
//! | [`Slab`] | on-page: start of its page; off-page: head of an [`OffPageSlab`] in `kmem_slab` | one of its cache's free / partial / full lists |
//! | [`Bufctl`] | on-page: in front of its object; off-page: a `kmem_bufctl` object | its slab's free list while the object is free |
//!
//! A slab is in exactly one of its cache's lists, chosen by its fill count:
//!
//! ```text
//!   used == 0          0 < used < max        used == max
//!  ┌──────────┐ alloc ┌─────────────┐ alloc ┌──────────┐
//!  │   Free   │──────▶│   Partial   │──────▶│   Full   │
//!  │          │◀──────│             │◀──────│          │
//!  └──────────┘ free  └─────────────┘ free  └──────────┘
//! ```
//!
//! ## Free by Address
//!
//! Every frame backing a slab is tagged with [`FrameOwner::Slab`], so an
//! object pointer resolves in constant time:
//! `pointer → translate → frame owner → slab → bufctl`. On-page bufctls sit
//! directly in front of their object; off-page slabs index them by
//! `(pointer - object_base) / stride`.
//!
//! ## Growth and Reserves
//!
//! A cache grows lazily when it has neither partial nor free slabs. Caches
//! with `min_free_slabs > 0` are topped up after each allocation unless
//! [`AllocFlags::no_reserve`] is set; growth of off-page slabs allocates its
//! headers with that flag so it cannot recurse into another top-up, and
//! refills the metadata caches' reserves afterwards.
//!
//! ## Reaping
//!
//! [`SlabAllocator::reap`] scans at most [`REAP_SCAN_LIMIT`] caches, resuming
//! where the previous scan stopped, and empties the free slabs of the cache
//! holding the most pages in them.
//!
//! See [`bootstrap`] for how the first caches come to exist.

pub mod bootstrap;
mod cache;
mod layout;

pub use bootstrap::{BootstrapPhase, BootstrapPool, MAX_BOOTSTRAP_PAGES};
pub use cache::{
    AllocFlags, Cache, CacheConfig, CacheDestroyError, CacheFlags, CacheRef, CacheStats,
    ObjectHook, ReapFlags,
};
pub use layout::{
    BUFCTL_HEADER_SIZE, MAX_OBJECT_SIZE, MAX_WASTE_DIVISOR, MIN_OBJECT_ALIGN, OFF_PAGE_MAX_OBJECTS,
    OFF_PAGE_MAX_PAGES, ON_PAGE_SHIFT, Placement, SLAB_HEADER_SIZE, SlabLayout,
};

use crate::error::AllocError;
use crate::frame_alloc::FrameOwner;
use crate::list::{Link, Linked, List};
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};

/// Caches inspected per [`SlabAllocator::reap`] call.
pub const REAP_SCAN_LIMIT: usize = 16;

/// What the slab allocator needs from the layers below it.
pub trait SlabBacking {
    /// A fresh, physically backed region of at least `pages` pages.
    ///
    /// # Errors
    /// Whatever the region allocator reports.
    fn alloc_pages(&mut self, pages: u64) -> Result<VirtualAddress, AllocError>;

    /// Unmap and release a region from [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Errors
    /// Whatever the region allocator reports.
    fn free_pages(&mut self, va: VirtualAddress) -> Result<(), AllocError>;

    fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress>;

    fn frame_owner(&mut self, pa: PhysicalAddress) -> Option<FrameOwner>;

    /// # Errors
    /// [`AllocError::InvalidAddress`] for frames outside the frame pool.
    fn set_frame_owner(&mut self, pa: PhysicalAddress, owner: FrameOwner) -> Result<(), AllocError>;
}

/// Where a slab's pages came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlabOrigin {
    Bootstrap,
    Region,
}

/// Fill state of a slab.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlabState {
    Free,
    Partial,
    Full,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BufctlState {
    Free,
    Allocated,
}

/// Header of one slab.
#[repr(C)]
pub struct Slab {
    link: Link<Slab>,
    cache: NonNull<Cache>,
    base: VirtualAddress,
    object_base: VirtualAddress,
    used: u32,
    max: u32,
    pages: u32,
    origin: SlabOrigin,
    placement: Placement,
    free: List<Bufctl>,
}

/// Header of an off-page slab: the slab and the index of its bufctls.
///
/// Off-page objects carry no bufctl in front of them, so freeing one looks
/// its bufctl up here by object index.
#[repr(C)]
pub struct OffPageSlab {
    slab: Slab,
    bufctls: [Option<NonNull<Bufctl>>; OFF_PAGE_MAX_OBJECTS],
}

// SAFETY: `link` is a field of `Slab`.
unsafe impl Linked for Slab {
    unsafe fn link(node: NonNull<Self>) -> NonNull<Link<Self>> {
        unsafe { NonNull::new_unchecked(&raw mut (*node.as_ptr()).link) }
    }
}

impl Slab {
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }

    #[must_use]
    pub const fn max(&self) -> u32 {
        self.max
    }

    #[must_use]
    pub const fn state(&self) -> SlabState {
        if self.used == 0 {
            SlabState::Free
        } else if self.used == self.max {
            SlabState::Full
        } else {
            SlabState::Partial
        }
    }
}

/// Bookkeeping for one object.
#[repr(C)]
pub struct Bufctl {
    link: Link<Bufctl>,
    base: VirtualAddress,
    slab: NonNull<Slab>,
    state: BufctlState,
}

// SAFETY: `link` is a field of `Bufctl`.
unsafe impl Linked for Bufctl {
    unsafe fn link(node: NonNull<Self>) -> NonNull<Link<Self>> {
        unsafe { NonNull::new_unchecked(&raw mut (*node.as_ptr()).link) }
    }
}

impl Cache {
    const fn list_mut(&mut self, state: SlabState) -> &mut List<Slab> {
        match state {
            SlabState::Free => &mut self.free,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }
}

const fn core_flags() -> CacheFlags {
    CacheFlags::new().with_no_reap(true).with_core(true)
}

/// The cache registry and everything hanging off it.
pub struct SlabAllocator {
    phase: BootstrapPhase,
    pool: BootstrapPool,
    registry: List<Cache>,
    cache_cache: Option<NonNull<Cache>>,
    slab_cache: Option<NonNull<Cache>>,
    bufctl_cache: Option<NonNull<Cache>>,
    reap_cursor: Option<NonNull<Cache>>,
}

// SAFETY: the records behind the pointers are owned by this allocator and only
// touched through `&mut self`.
unsafe impl Send for SlabAllocator {}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: BootstrapPhase::Unseeded,
            pool: BootstrapPool::EMPTY,
            registry: List::new(),
            cache_cache: None,
            slab_cache: None,
            bufctl_cache: None,
            reap_cursor: None,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    /// Pages of the bootstrap window not used by any slab.
    #[must_use]
    pub const fn bootstrap_pages_free(&self) -> usize {
        self.pool.free_pages()
    }

    /// Phase 1: seed the core caches on `pages` pre-mapped pages at `window`.
    ///
    /// Writes the cache-of-caches record to the first page, creates
    /// `kmem_slab` and `kmem_bufctl`, and fills their reserves.
    ///
    /// # Errors
    /// - [`AllocError::InvalidLayout`] if already seeded or the window is bad.
    /// - [`AllocError::InvalidAddress`] if a window page is not mapped.
    /// - [`AllocError::BootstrapExhaustion`] if the window is too small.
    pub fn seed<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        window: VirtualAddress,
        pages: usize,
    ) -> Result<(), AllocError> {
        if self.phase != BootstrapPhase::Unseeded {
            return Err(AllocError::InvalidLayout("slab allocator already seeded"));
        }
        let mut pool = BootstrapPool::new(window, pages)?;
        for page in 0..pages as u64 {
            let va = window + (page << PAGE_SHIFT);
            backing
                .translate(va)
                .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
        }
        pool.claim(window, 1)?;

        let config = CacheConfig::new("kmem_cache", size_of::<Cache>())
            .with_align(align_of::<Cache>())
            .with_flags(core_flags());
        let layout = SlabLayout::compute(config.object_size, config.align)?;
        let record = window
            .as_nonnull::<Cache>()
            .ok_or(AllocError::InvalidAddress(window.as_u64()))?;
        // SAFETY: page 0 of the window is mapped, claimed, and large enough.
        unsafe {
            record.as_ptr().write(Cache::from_config(&config, layout));
            self.registry.push_back(record);
        }
        self.pool = pool;
        self.cache_cache = Some(record);
        self.phase = BootstrapPhase::Bootstrap;

        if let Err(err) = self.seed_core_caches(backing) {
            self.unseed(backing, window, pages);
            return Err(err);
        }
        log::info!("slab: bootstrap phase, {pages} pages at {window}");
        self.refill_core_reserves(backing);
        Ok(())
    }

    fn seed_core_caches<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
    ) -> Result<(), AllocError> {
        let slab_cache = self.create_record(
            backing,
            &CacheConfig::new("kmem_slab", size_of::<OffPageSlab>())
                .with_align(align_of::<OffPageSlab>())
                .with_min_free_slabs(1)
                .with_flags(core_flags()),
        )?;
        self.slab_cache = Some(slab_cache);
        let bufctl_cache = self.create_record(
            backing,
            &CacheConfig::new("kmem_bufctl", size_of::<Bufctl>())
                .with_align(align_of::<Bufctl>())
                .with_min_free_slabs(1)
                .with_flags(core_flags()),
        )?;
        self.bufctl_cache = Some(bufctl_cache);
        Ok(())
    }

    /// Forget a half-done seed so that `seed` can be retried. Everything
    /// built so far lives on window pages, which stay with the caller.
    fn unseed<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        window: VirtualAddress,
        pages: usize,
    ) {
        for page in 0..pages as u64 {
            let va = window + (page << PAGE_SHIFT);
            if let Some(pa) = backing.translate(va)
                && let Err(err) = backing.set_frame_owner(pa, FrameOwner::Region)
            {
                log::warn!("slab: cannot release window page {va}: {err}");
            }
        }
        *self = Self::new();
        log::warn!("slab: seeding on {pages} pages at {window} failed");
    }

    /// Phase 2: from now on all growth goes through backed regions.
    ///
    /// # Errors
    /// [`AllocError::Uninitialized`] if [`seed`](Self::seed) has not run.
    pub fn finish_bootstrap(&mut self) -> Result<(), AllocError> {
        match self.phase {
            BootstrapPhase::Unseeded => Err(AllocError::Uninitialized),
            BootstrapPhase::Bootstrap => {
                self.phase = BootstrapPhase::SelfHosting;
                log::info!(
                    "slab: self-hosting, {} bootstrap pages left",
                    self.pool.free_pages()
                );
                Ok(())
            }
            BootstrapPhase::SelfHosting => Ok(()),
        }
    }

    /// Create and register a cache.
    ///
    /// # Errors
    /// - [`AllocError::Uninitialized`] before seeding.
    /// - [`AllocError::InvalidLayout`] for unusable size or alignment.
    /// - Any growth failure of the cache of caches.
    pub fn create<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        config: &CacheConfig,
    ) -> Result<CacheRef, AllocError> {
        self.ensure_seeded()?;
        let config = CacheConfig {
            flags: config.flags.with_core(false),
            ..*config
        };
        self.create_record(backing, &config).map(CacheRef)
    }

    /// Allocate one object.
    ///
    /// # Errors
    /// [`AllocError::Uninitialized`], or the growth failure when the cache had
    /// no free object and could not grow.
    pub fn alloc<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: &CacheRef,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        self.alloc_from(backing, cache.as_ptr(), flags)
    }

    /// Return `ptr` to `cache`.
    ///
    /// # Errors
    /// - [`AllocError::WrongCache`] if `ptr` belongs to another cache.
    /// - [`AllocError::InvalidAddress`] if `ptr` is not a live slab object.
    pub fn free<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: &CacheRef,
        ptr: NonNull<u8>,
    ) -> Result<(), AllocError> {
        self.free_object(backing, Some(cache.as_ptr()), ptr)
    }

    /// Return `ptr` to whichever cache owns it.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if `ptr` is not a live slab object.
    pub fn free_any<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        ptr: NonNull<u8>,
    ) -> Result<(), AllocError> {
        self.free_object(backing, None, ptr)
    }

    /// Add one free slab to `cache` using the current phase's growth path.
    ///
    /// # Errors
    /// [`AllocError::BootstrapExhaustion`] in phase 1, region failures in phase 2.
    pub fn grow<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: &CacheRef,
    ) -> Result<(), AllocError> {
        self.grow_cache(backing, cache.as_ptr())
    }

    /// Add one free slab to `cache` on already mapped bootstrap pages at `at`.
    ///
    /// # Errors
    /// - [`AllocError::InvalidAddress`] if the pages are outside the bootstrap
    ///   window or unmapped.
    /// - [`AllocError::BootstrapExhaustion`] if they are already in use.
    pub fn grow_at<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: &CacheRef,
        at: VirtualAddress,
    ) -> Result<(), AllocError> {
        self.grow_at_ptr(backing, cache.as_ptr(), at)
    }

    /// Release the free slabs of the best eligible cache.
    ///
    /// Returns the number of pages released; `0` if no scanned cache had any.
    ///
    /// # Errors
    /// [`AllocError::Corruption`] or a region failure while destroying slabs.
    pub fn reap<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        flags: ReapFlags,
    ) -> Result<usize, AllocError> {
        let mut cursor = self.reap_cursor.or_else(|| self.registry.front());
        let mut best: Option<(NonNull<Cache>, usize)> = None;

        for _ in 0..REAP_SCAN_LIMIT.min(self.registry.len()) {
            let Some(cache) = cursor else { break };
            // SAFETY: `cache` is a member of the registry.
            cursor = unsafe { self.registry.next_wrapping(cache) };
            // SAFETY: registered records are live.
            let c = unsafe { &mut *cache.as_ptr() };

            if c.flags.no_reap() && !flags.brutal() {
                continue;
            }
            if c.flags.just_grown() {
                c.flags.set_just_grown(false);
                if !flags.force() {
                    continue;
                }
            }
            let pages = c.reapable_pages();
            if pages > 0 && best.is_none_or(|(_, most)| pages > most) {
                best = Some((cache, pages));
            }
        }
        self.reap_cursor = cursor;

        let Some((cache, _)) = best else {
            log::trace!("slab: reap found nothing eligible");
            return Ok(0);
        };
        let (slabs, pages) = self.drain_free_slabs(backing, cache)?;
        // SAFETY: registered records are live.
        let c = unsafe { &mut *cache.as_ptr() };
        c.reaped_slabs += slabs as u64;
        log::debug!("slab: reaped {slabs} slabs ({pages} pages) from {}", c.name);
        Ok(pages)
    }

    /// Destroy an empty cache and unregister it.
    ///
    /// # Errors
    /// [`AllocError::CacheNotEmpty`] if partial or full slabs remain; the
    /// handle is returned inside the error.
    pub fn destroy<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: CacheRef,
    ) -> Result<(), CacheDestroyError> {
        let ptr = cache.as_ptr();
        // SAFETY: handles only exist for registered records.
        let busy = unsafe {
            let c = ptr.as_ref();
            !c.partial.is_empty() || !c.full.is_empty()
        };
        if busy {
            return Err(CacheDestroyError {
                cache,
                error: AllocError::CacheNotEmpty,
            });
        }
        self.destroy_record(backing, ptr)
            .map_err(move |error| CacheDestroyError { cache, error })
    }

    #[must_use]
    pub fn stats(&self, cache: &CacheRef) -> CacheStats {
        // SAFETY: handles only exist for registered records.
        unsafe { cache.as_ptr().as_ref() }.stats()
    }

    /// Statistics of every registered cache, in registration order.
    pub fn all_stats(&self) -> impl Iterator<Item = CacheStats> + '_ {
        // SAFETY: registered records are live.
        self.registry
            .iter()
            .map(|cache| unsafe { cache.as_ref() }.stats())
    }

    /// Cross-check every slab's fill count against the list holding it.
    ///
    /// # Errors
    /// [`AllocError::Corruption`] describing the first violation.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        for cache in self.registry.iter() {
            // SAFETY: registered records and their slabs are live.
            let c = unsafe { cache.as_ref() };
            let mut live = 0_u64;
            for (list, state) in [
                (&c.free, SlabState::Free),
                (&c.partial, SlabState::Partial),
                (&c.full, SlabState::Full),
            ] {
                for slab in list.iter() {
                    let s = unsafe { slab.as_ref() };
                    if s.cache != cache {
                        return Err(AllocError::Corruption("slab listed under a foreign cache"));
                    }
                    if s.used > s.max || s.state() != state {
                        return Err(AllocError::Corruption("slab on the wrong list for its fill"));
                    }
                    if s.free.len() != (s.max - s.used) as usize {
                        return Err(AllocError::Corruption("slab free count mismatch"));
                    }
                    live += u64::from(s.used);
                }
            }
            if live != c.live_objects {
                return Err(AllocError::Corruption("cache live object count mismatch"));
            }
        }
        Ok(())
    }

    const fn ensure_seeded(&self) -> Result<(), AllocError> {
        match self.phase {
            BootstrapPhase::Unseeded => Err(AllocError::Uninitialized),
            _ => Ok(()),
        }
    }

    fn create_record<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        config: &CacheConfig,
    ) -> Result<NonNull<Cache>, AllocError> {
        let layout = SlabLayout::compute(config.object_size, config.align)?;
        let cache_cache = self.cache_cache.ok_or(AllocError::Uninitialized)?;
        let record = self
            .alloc_from(backing, cache_cache, AllocFlags::new())?
            .cast::<Cache>();
        // SAFETY: a fresh `kmem_cache` object is sized and aligned for `Cache`.
        unsafe {
            record.as_ptr().write(Cache::from_config(config, layout));
            self.registry.push_back(record);
        }
        log::debug!(
            "slab: created {} ({} B objects, {} per {}-page {:?} slab)",
            config.name,
            config.object_size,
            layout.capacity,
            layout.pages,
            layout.placement
        );
        Ok(record)
    }

    fn destroy_record<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
    ) -> Result<(), AllocError> {
        let cache_cache = self.cache_cache.ok_or(AllocError::Uninitialized)?;
        self.drain_free_slabs(backing, cache)?;
        if self.reap_cursor == Some(cache) {
            // SAFETY: `cache` is still registered.
            self.reap_cursor =
                unsafe { self.registry.next_wrapping(cache) }.filter(|&next| next != cache);
        }
        // SAFETY: registered; zeroed only after unlinking.
        let name = unsafe {
            let name = cache.as_ref().name;
            self.registry.remove(cache);
            cache.as_ptr().write_bytes(0, 1);
            name
        };
        self.free_object(backing, Some(cache_cache), cache.cast())?;
        log::debug!("slab: destroyed {name}");
        Ok(())
    }

    fn alloc_from<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        self.ensure_seeded()?;
        // SAFETY (all derefs below): `cache` is registered, its slabs and
        // their bufctls are live, and no other reference to them is held.
        let exhausted = unsafe {
            let c = cache.as_ref();
            c.partial.is_empty() && c.free.is_empty()
        };
        if exhausted {
            self.grow_cache(backing, cache)?;
        }

        let (object, reserve) = unsafe {
            let c = &mut *cache.as_ptr();
            let slab = c
                .partial
                .front()
                .or_else(|| c.free.front())
                .ok_or(AllocError::Corruption("grown cache has no free object"))?;
            let before = slab.as_ref().state();
            let bufctl = (*slab.as_ptr())
                .free
                .pop_front()
                .ok_or(AllocError::Corruption("listed slab has no free object"))?;
            let b = &mut *bufctl.as_ptr();
            if b.state != BufctlState::Free {
                return Err(AllocError::Corruption("allocated object on a free list"));
            }
            b.state = BufctlState::Allocated;
            (*slab.as_ptr()).used += 1;
            relist(c, slab, before);
            c.live_objects += 1;
            log::trace!("slab: {} alloc {}", c.name, b.base);
            (b.base, c.min_free_slabs)
        };

        if reserve > 0 && !flags.no_reserve() {
            self.top_up(backing, cache);
        }
        object
            .as_nonnull()
            .ok_or(AllocError::Corruption("null object address"))
    }

    fn free_object<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        expected: Option<NonNull<Cache>>,
        ptr: NonNull<u8>,
    ) -> Result<(), AllocError> {
        self.ensure_seeded()?;
        let va = VirtualAddress::from_nonnull(ptr);
        let pa = backing
            .translate(va)
            .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
        let Some(FrameOwner::Slab(slab)) = backing.frame_owner(pa) else {
            return Err(AllocError::InvalidAddress(va.as_u64()));
        };

        // SAFETY: frames are only tagged with live slabs.
        unsafe {
            let cache = slab.as_ref().cache;
            if expected.is_some_and(|expected| expected != cache) {
                return Err(AllocError::WrongCache);
            }
            let bufctl = bufctl_of(slab, va)?;
            let b = &mut *bufctl.as_ptr();
            if b.state != BufctlState::Allocated {
                return Err(AllocError::InvalidAddress(va.as_u64()));
            }
            b.state = BufctlState::Free;

            let before = slab.as_ref().state();
            let s = &mut *slab.as_ptr();
            s.used -= 1;
            s.free.push_front(bufctl);

            let c = &mut *cache.as_ptr();
            relist(c, slab, before);
            c.live_objects -= 1;
            log::trace!("slab: {} free {va}", c.name);
        }
        Ok(())
    }

    /// Grow until `cache` holds its reserve of free slabs. Failures are soft.
    fn top_up<B: SlabBacking + ?Sized>(&mut self, backing: &mut B, cache: NonNull<Cache>) {
        loop {
            // SAFETY: registered records are live.
            let (short, name) = unsafe {
                let c = cache.as_ref();
                (c.free.len() < c.min_free_slabs as usize, c.name)
            };
            if !short {
                return;
            }
            if let Err(err) = self.grow_cache(backing, cache) {
                log::warn!("slab: {name} reserve top-up failed: {err}");
                return;
            }
        }
    }

    fn refill_core_reserves<B: SlabBacking + ?Sized>(&mut self, backing: &mut B) {
        for cache in [self.slab_cache, self.bufctl_cache].into_iter().flatten() {
            self.top_up(backing, cache);
        }
    }

    fn grow_cache<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
    ) -> Result<(), AllocError> {
        // SAFETY: registered records are live.
        let pages = unsafe { cache.as_ref() }.layout.pages;
        match self.phase {
            BootstrapPhase::Unseeded => Err(AllocError::Uninitialized),
            BootstrapPhase::Bootstrap => {
                let at = self.pool.find(pages as usize)?;
                self.grow_at_ptr(backing, cache, at)
            }
            BootstrapPhase::SelfHosting => {
                let base = backing.alloc_pages(u64::from(pages))?;
                match self.build_slab(backing, cache, base, SlabOrigin::Region) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        backing.free_pages(base)?;
                        Err(err)
                    }
                }
            }
        }
    }

    fn grow_at_ptr<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
        at: VirtualAddress,
    ) -> Result<(), AllocError> {
        self.ensure_seeded()?;
        // SAFETY: registered records are live.
        let pages = unsafe { cache.as_ref() }.layout.pages as usize;
        if !self.pool.contains(at, pages) {
            return Err(AllocError::InvalidAddress(at.as_u64()));
        }
        for page in 0..pages as u64 {
            let va = at + (page << PAGE_SHIFT);
            backing
                .translate(va)
                .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
        }
        self.pool.claim(at, pages)?;
        match self.build_slab(backing, cache, at, SlabOrigin::Bootstrap) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.pool.release(at, pages)?;
                Err(err)
            }
        }
    }

    /// Lay out a slab on the mapped pages at `base` and file it as free.
    fn build_slab<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
        base: VirtualAddress,
        origin: SlabOrigin,
    ) -> Result<(), AllocError> {
        // SAFETY: registered records are live.
        let (layout, color, ctor, name) = unsafe {
            let c = &mut *cache.as_ptr();
            (c.layout, c.take_color(), c.ctor, c.name)
        };
        let object_base = base + (layout.first + color) as u64;

        let header = Slab {
            link: Link::new(),
            cache,
            base,
            object_base,
            used: 0,
            max: layout.capacity,
            pages: layout.pages,
            origin,
            placement: layout.placement,
            free: List::new(),
        };
        let slab = match layout.placement {
            Placement::OnPage => {
                let slab = base
                    .as_nonnull::<Slab>()
                    .ok_or(AllocError::InvalidAddress(base.as_u64()))?;
                // SAFETY: the first bytes of the page are reserved for the header.
                unsafe { slab.as_ptr().write(header) };
                slab
            }
            Placement::OffPage => {
                let slab = self
                    .alloc_core(backing, self.slab_cache)?
                    .cast::<OffPageSlab>();
                // SAFETY: a fresh `kmem_slab` object is sized for `OffPageSlab`.
                unsafe {
                    slab.as_ptr().write(OffPageSlab {
                        slab: header,
                        bufctls: [None; OFF_PAGE_MAX_OBJECTS],
                    });
                }
                slab.cast::<Slab>()
            }
        };

        for index in 0..layout.capacity as usize {
            let object = object_base + (index * layout.stride) as u64;
            let bufctl = match layout.placement {
                Placement::OnPage => VirtualAddress::new(object.as_u64() - BUFCTL_HEADER_SIZE as u64)
                    .as_nonnull::<Bufctl>()
                    .ok_or(AllocError::InvalidAddress(object.as_u64()))?,
                Placement::OffPage => match self.alloc_core(backing, self.bufctl_cache) {
                    Ok(ptr) => ptr.cast::<Bufctl>(),
                    Err(err) => {
                        self.release_headers(backing, slab)?;
                        return Err(err);
                    }
                },
            };
            // SAFETY: `bufctl` is either in front of its on-page object or a
            // fresh `kmem_bufctl` object.
            unsafe {
                bufctl.as_ptr().write(Bufctl {
                    link: Link::new(),
                    base: object,
                    slab,
                    state: BufctlState::Free,
                });
                if layout.placement == Placement::OffPage {
                    let slot = (*slab.cast::<OffPageSlab>().as_ptr())
                        .bufctls
                        .get_mut(index)
                        .ok_or(AllocError::Corruption("off-page slab over capacity"))?;
                    *slot = Some(bufctl);
                }
                (*slab.as_ptr()).free.push_back(bufctl);
            }
        }

        for page in 0..u64::from(layout.pages) {
            let va = base + (page << PAGE_SHIFT);
            let pa = backing
                .translate(va)
                .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
            backing.set_frame_owner(pa, FrameOwner::Slab(slab))?;
        }

        if let Some(ctor) = ctor {
            for index in 0..layout.capacity as usize {
                let object = object_base + (index * layout.stride) as u64;
                if let Some(ptr) = object.as_nonnull::<u8>() {
                    ctor(ptr);
                }
            }
        }

        // SAFETY: registered records are live; `slab` is unlinked.
        unsafe {
            let c = &mut *cache.as_ptr();
            c.free.push_front(slab);
            c.flags.set_just_grown(true);
            c.grows += 1;
        }
        log::debug!(
            "slab: {name} grew by {} pages at {base} ({} objects, color {color}, {origin:?})",
            layout.pages,
            layout.capacity
        );

        if layout.placement == Placement::OffPage {
            self.refill_core_reserves(backing);
        }
        Ok(())
    }

    fn alloc_core<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        core: Option<NonNull<Cache>>,
    ) -> Result<NonNull<u8>, AllocError> {
        let cache = core.ok_or(AllocError::Uninitialized)?;
        self.alloc_from(backing, cache, AllocFlags::new().with_no_reserve(true))
    }

    /// Destroy every free slab of `cache`. Returns `(slabs, pages)`.
    fn drain_free_slabs<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
    ) -> Result<(usize, usize), AllocError> {
        let (mut slabs, mut pages) = (0, 0);
        // SAFETY: registered records are live.
        while let Some(slab) = unsafe { cache.as_ref() }.free.front() {
            pages += self.destroy_slab(backing, cache, slab)?;
            slabs += 1;
        }
        Ok((slabs, pages))
    }

    /// Tear down a free slab and return its pages. Returns the page count.
    fn destroy_slab<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        cache: NonNull<Cache>,
        slab: NonNull<Slab>,
    ) -> Result<usize, AllocError> {
        // SAFETY: `slab` is a live, free slab on `cache`'s free list.
        let (base, pages, origin, placement) = unsafe {
            let s = slab.as_ref();
            if s.used != 0 {
                return Err(AllocError::Corruption("reaping a slab with live objects"));
            }
            if let Some(dtor) = cache.as_ref().dtor {
                for bufctl in s.free.iter() {
                    if let Some(ptr) = bufctl.as_ref().base.as_nonnull::<u8>() {
                        dtor(ptr);
                    }
                }
            }
            (s.base, s.pages, s.origin, s.placement)
        };
        // SAFETY: as above.
        unsafe { (*cache.as_ptr()).free.remove(slab) };

        for page in 0..u64::from(pages) {
            let va = base + (page << PAGE_SHIFT);
            if let Some(pa) = backing.translate(va) {
                backing.set_frame_owner(pa, FrameOwner::Region)?;
            }
        }
        if placement == Placement::OffPage {
            self.release_headers(backing, slab)?;
        }
        match origin {
            SlabOrigin::Region => backing.free_pages(base)?,
            SlabOrigin::Bootstrap => self.pool.release(base, pages as usize)?,
        }
        Ok(pages as usize)
    }

    /// Return an off-page slab's bufctls and header to the metadata caches.
    fn release_headers<B: SlabBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        slab: NonNull<Slab>,
    ) -> Result<(), AllocError> {
        // SAFETY: off-page headers are live `kmem_slab` / `kmem_bufctl` objects.
        while let Some(bufctl) = unsafe { (*slab.as_ptr()).free.pop_front() } {
            self.free_object(backing, self.bufctl_cache, bufctl.cast())?;
        }
        self.free_object(backing, self.slab_cache, slab.cast())
    }
}

/// Move `slab` to the list matching its fill if it left the one for `before`.
///
/// # Safety
/// `slab` must be a member of `cache`'s list for `before`.
unsafe fn relist(cache: &mut Cache, slab: NonNull<Slab>, before: SlabState) {
    unsafe {
        let after = slab.as_ref().state();
        if before != after {
            cache.list_mut(before).remove(slab);
            cache.list_mut(after).push_front(slab);
        }
    }
}

/// The bufctl describing the object at `va` in `slab`.
///
/// # Safety
/// `slab` must be live.
unsafe fn bufctl_of(slab: NonNull<Slab>, va: VirtualAddress) -> Result<NonNull<Bufctl>, AllocError> {
    let invalid = AllocError::InvalidAddress(va.as_u64());
    unsafe {
        let s = slab.as_ref();
        let stride = s.cache.as_ref().layout.stride as u64;
        let offset = va.offset_from(s.object_base).ok_or(invalid)?;
        let index = offset / stride;
        if offset % stride != 0 || index >= u64::from(s.max) {
            return Err(invalid);
        }
        let bufctl = match s.placement {
            Placement::OnPage => {
                VirtualAddress::new(va.as_u64() - BUFCTL_HEADER_SIZE as u64).as_nonnull::<Bufctl>()
            }
            Placement::OffPage => usize::try_from(index).ok().and_then(|index| {
                slab.cast::<OffPageSlab>()
                    .as_ref()
                    .bufctls
                    .get(index)
                    .copied()
                    .flatten()
            }),
        }
        .ok_or(AllocError::Corruption("slab object without bufctl"))?;
        let b = bufctl.as_ref();
        if b.base != va || b.slab != slab {
            return Err(AllocError::Corruption("bufctl does not describe its object"));
        }
        Ok(bufctl)
    }
}

#[cfg(test)]
mod tests;

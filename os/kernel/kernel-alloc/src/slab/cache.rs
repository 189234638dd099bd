//! Cache records, their creation parameters, and the flags steering
//! allocation and reaping.

use super::Slab;
use super::layout::{Placement, SlabLayout};
use crate::error::AllocError;
use crate::list::{Link, Linked, List};
use bitfield_struct::bitfield;
use core::ptr::NonNull;

/// Object constructor or destructor hook.
pub type ObjectHook = fn(NonNull<u8>);

/// Per-cache behavior flags.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct CacheFlags {
    /// Never reaped unless [`ReapFlags::brutal`] is set.
    pub no_reap: bool,
    /// Grew since the last reap scan looked at it.
    pub just_grown: bool,
    /// One of the allocator's own metadata caches.
    pub core: bool,
    #[bits(5)]
    __: u8,
}

/// Flags for a single allocation.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AllocFlags {
    /// Skip the `min_free_slabs` top-up after this allocation.
    pub no_reserve: bool,
    #[bits(7)]
    __: u8,
}

/// Flags for a reap pass.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ReapFlags {
    /// Also consider caches flagged `no_reap`.
    pub brutal: bool,
    /// Also consider caches that just grew.
    pub force: bool,
    #[bits(6)]
    __: u8,
}

/// Parameters of [`SlabAllocator::create`](super::SlabAllocator::create).
#[derive(Copy, Clone, Debug)]
pub struct CacheConfig {
    pub name: &'static str,
    pub object_size: usize,
    /// Object alignment; `0` picks the minimum.
    pub align: usize,
    /// Fully free slabs kept in reserve after each allocation.
    pub min_free_slabs: u32,
    pub flags: CacheFlags,
    /// Runs once per object when its slab is created.
    pub ctor: Option<ObjectHook>,
    /// Runs once per object when its slab is destroyed.
    pub dtor: Option<ObjectHook>,
}

impl CacheConfig {
    #[must_use]
    pub const fn new(name: &'static str, object_size: usize) -> Self {
        Self {
            name,
            object_size,
            align: 0,
            min_free_slabs: 0,
            flags: CacheFlags::new(),
            ctor: None,
            dtor: None,
        }
    }

    #[must_use]
    pub const fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn with_min_free_slabs(mut self, slabs: u32) -> Self {
        self.min_free_slabs = slabs;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_ctor(mut self, ctor: ObjectHook) -> Self {
        self.ctor = Some(ctor);
        self
    }

    #[must_use]
    pub const fn with_dtor(mut self, dtor: ObjectHook) -> Self {
        self.dtor = Some(dtor);
        self
    }
}

/// Snapshot of a cache's state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub placement: Placement,
    pub objects_per_slab: u32,
    pub pages_per_slab: u32,
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub live_objects: u64,
    pub grows: u64,
    pub reaped_slabs: u64,
}

/// A cache record. Lives in an object of the cache of caches.
#[repr(C)]
pub struct Cache {
    pub(super) link: Link<Cache>,
    pub(super) name: &'static str,
    pub(super) object_size: usize,
    pub(super) layout: SlabLayout,
    pub(super) color: usize,
    pub(super) min_free_slabs: u32,
    pub(super) flags: CacheFlags,
    pub(super) ctor: Option<ObjectHook>,
    pub(super) dtor: Option<ObjectHook>,
    pub(super) free: List<Slab>,
    pub(super) partial: List<Slab>,
    pub(super) full: List<Slab>,
    pub(super) live_objects: u64,
    pub(super) grows: u64,
    pub(super) reaped_slabs: u64,
}

// SAFETY: `link` is a field of `Cache`.
unsafe impl Linked for Cache {
    unsafe fn link(node: NonNull<Self>) -> NonNull<Link<Self>> {
        unsafe { NonNull::new_unchecked(&raw mut (*node.as_ptr()).link) }
    }
}

impl Cache {
    pub(super) fn from_config(config: &CacheConfig, layout: SlabLayout) -> Self {
        Self {
            link: Link::new(),
            name: config.name,
            object_size: config.object_size,
            layout,
            color: 0,
            min_free_slabs: config.min_free_slabs,
            flags: config.flags.with_just_grown(false),
            ctor: config.ctor,
            dtor: config.dtor,
            free: List::new(),
            partial: List::new(),
            full: List::new(),
            live_objects: 0,
            grows: 0,
            reaped_slabs: 0,
        }
    }

    /// Color for the next slab; advances the running offset.
    pub(super) const fn take_color(&mut self) -> usize {
        let color = self.color;
        self.color = self.layout.next_color(color);
        color
    }

    /// Pages currently held by wholly free slabs.
    pub(super) const fn reapable_pages(&self) -> usize {
        self.free.len() * self.layout.pages as usize
    }

    pub(super) const fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name,
            object_size: self.object_size,
            placement: self.layout.placement,
            objects_per_slab: self.layout.capacity,
            pages_per_slab: self.layout.pages,
            free_slabs: self.free.len(),
            partial_slabs: self.partial.len(),
            full_slabs: self.full.len(),
            live_objects: self.live_objects,
            grows: self.grows,
            reaped_slabs: self.reaped_slabs,
        }
    }
}

/// Handle to a cache created with
/// [`SlabAllocator::create`](super::SlabAllocator::create).
///
/// Neither `Copy` nor `Clone`: destroying a cache consumes its handle.
#[derive(Debug, PartialEq, Eq)]
pub struct CacheRef(pub(super) NonNull<Cache>);

// SAFETY: the record behind the handle is only accessed under the cache lock.
unsafe impl Send for CacheRef {}
// SAFETY: as above; the handle itself is an opaque address.
unsafe impl Sync for CacheRef {}

impl CacheRef {
    #[inline]
    pub(super) const fn as_ptr(&self) -> NonNull<Cache> {
        self.0
    }
}

/// [`SlabAllocator::destroy`](super::SlabAllocator::destroy) refused; the
/// handle is returned to the caller.
#[derive(Debug, thiserror::Error)]
#[error("cannot destroy cache: {error}")]
pub struct CacheDestroyError {
    pub cache: CacheRef,
    pub error: AllocError,
}

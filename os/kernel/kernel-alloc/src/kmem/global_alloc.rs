//! `GlobalAlloc` over an installed [`Kmem`].
//!
//! The static is created empty and the kernel installs the context once the
//! pools are known:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: GlobalKmem<KernelPaging> = GlobalKmem::new();
//!
//! GLOBAL_ALLOCATOR.install(Kmem::new(config, paging, frames, regions)?)?;
//! ```
//!
//! Allocations made before `install` return null.

use super::Kmem;
use crate::paging::Paging;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SyncOnceCell;

/// The kernel's global allocator.
pub struct GlobalKmem<P> {
    kmem: SyncOnceCell<Kmem<P>>,
}

impl<P> Default for GlobalKmem<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> GlobalKmem<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kmem: SyncOnceCell::new(),
        }
    }

    /// Make `kmem` the backing of every global allocation.
    ///
    /// # Errors
    /// Hands `kmem` back if a context is already installed.
    pub fn install(&self, kmem: Kmem<P>) -> Result<&Kmem<P>, Kmem<P>> {
        self.kmem.set(kmem)
    }

    #[must_use]
    pub fn get(&self) -> Option<&Kmem<P>> {
        self.kmem.get()
    }
}

unsafe impl<P: Paging + Send> GlobalAlloc for GlobalKmem<P> {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(kmem) = self.kmem.get() else {
            return ptr::null_mut();
        };
        match kmem.generic_alloc_aligned(layout.size(), layout.align()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => {
                log::debug!("global alloc {layout:?} failed: {err}");
                ptr::null_mut()
            }
        }
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from `alloc`.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let (Some(kmem), Some(ptr)) = (self.kmem.get(), NonNull::new(ptr)) else {
            return;
        };
        if let Err(err) = kmem.generic_free(ptr) {
            log::warn!("global dealloc of {ptr:p} ({layout:?}) failed: {err}");
        }
    }
}

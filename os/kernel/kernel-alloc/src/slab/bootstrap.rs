//! # Bootstrap Pages
//!
//! The slab allocator needs cache records before any cache exists, and the
//! metadata caches for off-page slabs before it can build an off-page slab.
//! Both are solved by seeding the core caches on a small window of pages that
//! were mapped before the allocator came up.
//!
//! | Phase | Growth path | Entered by |
//! |---|---|---|
//! | [`Unseeded`](BootstrapPhase::Unseeded) | none; every call fails with `Uninitialized` | construction |
//! | [`Bootstrap`](BootstrapPhase::Bootstrap) | `grow_at` on pages of the [`BootstrapPool`] | `seed` |
//! | [`SelfHosting`](BootstrapPhase::SelfHosting) | backed virtual regions | `finish_bootstrap` |
//!
//! Page 0 of the window holds the cache-of-caches record. Slabs built on
//! bootstrap pages keep their origin and hand the pages back to the pool
//! when destroyed.

use crate::error::AllocError;
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// Largest bootstrap window, in pages.
pub const MAX_BOOTSTRAP_PAGES: usize = 64;

/// Initialization state of the slab allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    Unseeded,
    Bootstrap,
    SelfHosting,
}

/// Bitmap over the pre-mapped bootstrap window.
pub struct BootstrapPool {
    base: VirtualAddress,
    pages: usize,
    used: u64,
}

impl BootstrapPool {
    /// An empty pool that hands out nothing.
    pub const EMPTY: Self = Self {
        base: VirtualAddress::zero(),
        pages: 0,
        used: 0,
    };

    /// # Errors
    /// [`AllocError::InvalidLayout`] for unaligned windows or page counts
    /// outside `2..=MAX_BOOTSTRAP_PAGES`.
    pub fn new(base: VirtualAddress, pages: usize) -> Result<Self, AllocError> {
        if !base.is_page_aligned() {
            return Err(AllocError::InvalidLayout("bootstrap window must be page aligned"));
        }
        if !(2..=MAX_BOOTSTRAP_PAGES).contains(&pages) {
            return Err(AllocError::InvalidLayout("bootstrap window must span 2..=64 pages"));
        }
        Ok(Self {
            base,
            pages,
            used: 0,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn free_pages(&self) -> usize {
        self.pages - self.used.count_ones() as usize
    }

    /// `true` if `[va, va + pages)` lies inside the window.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress, pages: usize) -> bool {
        self.index_of(va).is_some_and(|first| first + pages <= self.pages)
    }

    /// First free run of `pages` pages.
    ///
    /// # Errors
    /// [`AllocError::BootstrapExhaustion`] if no such run exists.
    pub fn find(&self, pages: usize) -> Result<VirtualAddress, AllocError> {
        (0..self.pages.saturating_sub(pages.saturating_sub(1)))
            .find(|&first| self.used & Self::mask(first, pages) == 0)
            .map(|first| self.address_of(first))
            .ok_or(AllocError::BootstrapExhaustion)
    }

    /// Mark `[va, va + pages)` used.
    ///
    /// # Errors
    /// - [`AllocError::InvalidAddress`] outside the window or unaligned.
    /// - [`AllocError::BootstrapExhaustion`] if any page is already used.
    pub fn claim(&mut self, va: VirtualAddress, pages: usize) -> Result<(), AllocError> {
        let first = self
            .index_of(va)
            .filter(|&first| first + pages <= self.pages)
            .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
        let mask = Self::mask(first, pages);
        if self.used & mask != 0 {
            return Err(AllocError::BootstrapExhaustion);
        }
        self.used |= mask;
        Ok(())
    }

    /// Hand `[va, va + pages)` back.
    ///
    /// # Errors
    /// [`AllocError::InvalidAddress`] if the run is outside the window or not
    /// fully claimed.
    pub fn release(&mut self, va: VirtualAddress, pages: usize) -> Result<(), AllocError> {
        let first = self
            .index_of(va)
            .filter(|&first| first + pages <= self.pages)
            .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
        let mask = Self::mask(first, pages);
        if self.used & mask != mask {
            return Err(AllocError::InvalidAddress(va.as_u64()));
        }
        self.used &= !mask;
        Ok(())
    }

    fn index_of(&self, va: VirtualAddress) -> Option<usize> {
        if !va.is_page_aligned() {
            return None;
        }
        let off = va.offset_from(self.base)?;
        usize::try_from(off >> PAGE_SHIFT)
            .ok()
            .filter(|&idx| idx < self.pages)
    }

    fn address_of(&self, idx: usize) -> VirtualAddress {
        self.base + ((idx as u64) << PAGE_SHIFT)
    }

    const fn mask(first: usize, pages: usize) -> u64 {
        let run = if pages >= 64 { u64::MAX } else { (1 << pages) - 1 };
        run << first
    }
}

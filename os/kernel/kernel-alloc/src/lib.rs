//! # Kernel Dynamic Memory Core
//!
//! Physical frames, kernel virtual regions, and fixed-size object caches,
//! layered so that each allocator only ever calls the one beneath it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Kmem (context object)                │
//! │    • generic_alloc / generic_free size classes      │
//! │    • GlobalAlloc adapter                            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  CacheLevel lock
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Slab Cache Allocator                   │
//! │    • named caches of equal-size objects             │
//! │    • on-page / off-page slabs, coloring, reaping    │
//! │    • two-phase bootstrap on pre-mapped pages        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  RegionLevel lock
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Virtual Region Allocator                  │
//! │    • buddy allocator over kernel virtual space      │
//! │    • optional backing with rollback on failure      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  FrameLevel lock
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • buddy allocator over physical frames           │
//! │    • mapping counts and owner tags per frame        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page tables are not touched here; the region allocator drives a
//! [`Paging`](paging::Paging) implementation supplied by the kernel.
//!
//! ## Core Components
//!
//! ### Buddy Tables ([`buddy`])
//!
//! The frame and region allocators share one buddy engine over a dense
//! descriptor arena: one descriptor per page, free lists as circular index
//! lists, blocks aligned to their own size so the buddy of a block is found
//! by flipping one address bit.
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//!
//! * **Rounding**: every request becomes the smallest power-of-two run of
//!   frames that holds it.
//! * **Mapping counts**: page-table frames die with their last entry.
//! * **Owner tags**: the slab allocator finds the slab of any object through
//!   the frame backing it.
//!
//! ### Virtual Region Allocator ([`region`])
//!
//! Hands out power-of-two regions of kernel virtual space. Backed regions get
//! frames mapped behind every page before the call returns; a failure part way
//! unmaps and frees whatever was already set up.
//!
//! ### Slab Cache Allocator ([`slab`])
//!
//! Caches of equal-size objects with constructor and destructor hooks. Slab
//! headers, bufctls, and cache records live in slab memory themselves, linked
//! through the intrusive lists of [`list`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_alloc::kmem::{Kmem, KmemConfig};
//! use kernel_alloc::slab::{AllocFlags, CacheConfig};
//!
//! let kmem = Kmem::new(config, paging, frame_descs, region_descs)?;
//!
//! let inodes = kmem.cache_create(&CacheConfig::new("inode", 200).with_align(32))?;
//! let inode = kmem.cache_alloc(&inodes, AllocFlags::new())?;
//! kmem.cache_free(&inodes, inode)?;
//!
//! let buf = kmem.generic_alloc(300)?;
//! kmem.generic_free(buf)?;
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns [`AllocError`]; nothing panics on an allocation
//! path. Broken free-list or slab invariants surface as
//! [`AllocError::Corruption`] instead of being silently repaired.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod buddy;
pub mod error;
pub mod frame_alloc;
pub mod kmem;
pub mod list;
pub mod paging;
pub mod region;
pub mod slab;

pub use error::AllocError;
pub use frame_alloc::{FrameAllocator, FrameDescriptor, FrameOwner, UnmapPolicy};
pub use kmem::{GlobalKmem, Kmem, KmemConfig};
pub use paging::{MapFlags, Paging, PagingError};
pub use region::{RegionAllocator, RegionDescriptor};
pub use slab::{CacheConfig, CacheRef, SlabAllocator};

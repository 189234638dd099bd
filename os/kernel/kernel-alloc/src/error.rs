//! Error kinds shared by the frame, region, and slab allocators.

/// Failure of an allocator operation.
///
/// Every operation returns its failure; nothing in this crate panics on an
/// allocation path.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No free block at any eligible level.
    #[error("out of memory")]
    OutOfMemory,
    /// No block, region, or object is tracked at this address.
    #[error("no allocation is tracked at address {0:#x}")]
    InvalidAddress(u64),
    /// The request exceeds the largest block the allocator can represent.
    #[error("requested {requested} bytes exceed the largest block of {largest} bytes")]
    AllocationTooLarge { requested: u64, largest: u64 },
    /// An object was returned to a cache that does not own it.
    #[error("object does not belong to this cache")]
    WrongCache,
    /// Backing the virtual region at this address failed and was rolled back.
    #[error("failed to back virtual region at {0:#x}")]
    MappingFailure(u64),
    /// The pre-mapped pages reserved for seeding the core caches ran out.
    #[error("bootstrap pages exhausted")]
    BootstrapExhaustion,
    /// A free-list or slab invariant was found broken.
    #[error("allocator state corrupted: {0}")]
    Corruption(&'static str),
    /// Parameters that cannot describe a usable pool, table, or slab.
    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),
    /// The cache still has partial or full slabs.
    #[error("cache still has live objects")]
    CacheNotEmpty,
    /// The slab allocator was used before its core caches were seeded.
    #[error("slab allocator is not bootstrapped")]
    Uninitialized,
}

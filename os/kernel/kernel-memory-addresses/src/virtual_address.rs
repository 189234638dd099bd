use crate::{MemoryAddress, PAGE_SIZE};
use core::fmt;
use core::ops::{Add, AddAssign};
use core::ptr::NonNull;

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// It does not validate canonicality at runtime; it only carries the *kind* of
/// address at the type level so you don't accidentally mix virtual and physical
/// values.
///
/// Unlike [`PhysicalAddress`](super::PhysicalAddress), a virtual address may be
/// turned into a pointer with [`as_mut_ptr`](Self::as_mut_ptr). Whether that
/// pointer may be dereferenced depends on the current mappings.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
/// assert_eq!(va.page_base().as_u64(), 0xFFFF_FFFF_8000_1000);
/// assert!(!va.is_page_aligned());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    /// Capture the address of `ptr`, exposing its provenance so that
    /// [`as_mut_ptr`](Self::as_mut_ptr) may recreate a usable pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr.expose_provenance() as u64)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    /// Raw pointer to this address.
    ///
    /// The pointer is only valid to dereference while the page is mapped.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.as_u64() as usize)
    }

    /// Non-null pointer to this address, `None` for the zero address.
    #[inline]
    #[must_use]
    pub fn as_nonnull<T>(self) -> Option<NonNull<T>> {
        NonNull::new(self.as_mut_ptr())
    }

    /// Base of the 4 KiB page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0.align_down(PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0.is_aligned(PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0.is_aligned(align)
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Option<Self> {
        match self.0.align_up(align) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn offset_from(self, base: Self) -> Option<u64> {
        self.0.offset_from(base.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(a: VirtualAddress) -> Self {
        a.as_u64()
    }
}

impl<T> From<NonNull<T>> for VirtualAddress {
    #[inline]
    fn from(ptr: NonNull<T>) -> Self {
        Self::from_nonnull(ptr)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

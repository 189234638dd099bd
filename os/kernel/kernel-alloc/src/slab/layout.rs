//! # Slab Geometry
//!
//! How a cache carves its backing pages into objects. Two placements exist:
//!
//! ```text
//! on-page (object_size <= PAGE_SIZE >> ON_PAGE_SHIFT), one page:
//! ┌──────┬───────┬────────┬─────┬────────┬─────┬─────┬────────┬───────┐
//! │ Slab │ color │ Bufctl │ obj │ Bufctl │ obj │ ... │ Bufctl │ obj │ slack │
//! └──────┴───────┴────────┴─────┴────────┴─────┴─────┴────────┴───────┘
//!
//! off-page (larger objects), 2^n pages, headers allocated elsewhere:
//! ┌───────┬─────┬─────┬─────┬───────┐
//! │ color │ obj │ obj │ ... │ slack │
//! └───────┴─────┴─────┴─────┴───────┘
//! ```
//!
//! On-page bufctls sit immediately in front of their object, so the bufctl of
//! an object is found by subtracting [`BUFCTL_HEADER_SIZE`]. Off-page slabs
//! keep an index of at most [`OFF_PAGE_MAX_OBJECTS`] bufctl pointers instead.
//!
//! An off-page slab starts at the fewest pages that hold one object and
//! doubles until the slack is at most `1 / MAX_WASTE_DIVISOR` of the slab,
//! up to [`OFF_PAGE_MAX_PAGES`]. Once the bound holds, the slab is smaller than
//! `2 * MAX_WASTE_DIVISOR` strides, which is what [`OFF_PAGE_MAX_OBJECTS`]
//! is sized for. If no size within the cap meets the bound, the one wasting
//! the smallest share wins.
//!
//! The color offset of successive slabs advances by the effective alignment
//! and wraps to zero once it would exceed the slack, so the capacity of a
//! cache's slabs never depends on the color.

use super::{Bufctl, Slab};
use crate::error::AllocError;
use kernel_memory_addresses::PAGE_SIZE;

/// Objects up to `PAGE_SIZE >> ON_PAGE_SHIFT` bytes use on-page slabs.
pub const ON_PAGE_SHIFT: u32 = 3;

/// Slack allowed per slab, as a fraction `1 / MAX_WASTE_DIVISOR` of its bytes.
pub const MAX_WASTE_DIVISOR: usize = 8;

/// Objects per off-page slab at most.
pub const OFF_PAGE_MAX_OBJECTS: usize = 2 * MAX_WASTE_DIVISOR;

/// Pages an off-page slab grows to while searching for a tight fit.
pub const OFF_PAGE_MAX_PAGES: usize = 64;

/// Bytes taken by an on-page slab header.
pub const SLAB_HEADER_SIZE: usize = size_of::<Slab>();

/// Bytes taken by an on-page bufctl in front of each object.
pub const BUFCTL_HEADER_SIZE: usize = size_of::<Bufctl>();

/// Alignment every object gets at minimum.
pub const MIN_OBJECT_ALIGN: usize = align_of::<Bufctl>();

/// Largest object a cache accepts.
pub const MAX_OBJECT_SIZE: usize = (PAGE_SIZE as usize) << 8;

const PAGE: usize = PAGE_SIZE as usize;

/// Where a slab keeps its header and bufctls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    OnPage,
    OffPage,
}

/// Precomputed slab geometry of a cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlabLayout {
    pub placement: Placement,
    /// Backing pages per slab; a power of two.
    pub pages: u32,
    /// Offset of the first object at color zero.
    pub first: usize,
    /// Distance between consecutive objects.
    pub stride: usize,
    /// Objects per slab.
    pub capacity: u32,
    /// Unused bytes at color zero; the color range.
    pub slack: usize,
    /// Effective object alignment.
    pub align: usize,
}

impl SlabLayout {
    /// Compute the geometry for `object_size` bytes at `align` (`0` = default).
    ///
    /// # Errors
    /// [`AllocError::InvalidLayout`] for zero or oversized objects and for
    /// alignments that are not a power of two or exceed a page.
    pub fn compute(object_size: usize, align: usize) -> Result<Self, AllocError> {
        if object_size == 0 {
            return Err(AllocError::InvalidLayout("object size must be non-zero"));
        }
        if object_size > MAX_OBJECT_SIZE {
            return Err(AllocError::InvalidLayout("object too large for a slab"));
        }
        if align != 0 && (!align.is_power_of_two() || align > PAGE) {
            return Err(AllocError::InvalidLayout("alignment must be a power of two up to a page"));
        }
        let align = align.max(MIN_OBJECT_ALIGN);

        if object_size <= PAGE >> ON_PAGE_SHIFT
            && let Some(layout) = Self::on_page(object_size, align)
        {
            return Ok(layout);
        }
        Ok(Self::off_page(object_size, align))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn on_page(object_size: usize, align: usize) -> Option<Self> {
        let first = (SLAB_HEADER_SIZE + BUFCTL_HEADER_SIZE).next_multiple_of(align);
        let stride = (BUFCTL_HEADER_SIZE + object_size).next_multiple_of(align);
        if first + object_size > PAGE {
            return None;
        }
        let capacity = (PAGE - first - object_size) / stride + 1;
        Some(Self {
            placement: Placement::OnPage,
            pages: 1,
            first,
            stride,
            capacity: capacity as u32,
            slack: PAGE - (first + (capacity - 1) * stride + object_size),
            align,
        })
    }

    fn off_page(object_size: usize, align: usize) -> Self {
        let stride = object_size.next_multiple_of(align);
        let mut pages = object_size.div_ceil(PAGE).next_power_of_two();
        let mut best = Self::off_page_with(object_size, stride, align, pages);
        while !best.within_waste_bound() && pages < OFF_PAGE_MAX_PAGES {
            pages *= 2;
            let candidate = Self::off_page_with(object_size, stride, align, pages);
            // slack / bytes compared without division
            if candidate.slack * best.bytes() < best.slack * candidate.bytes() {
                best = candidate;
            }
        }
        best
    }

    #[allow(clippy::cast_possible_truncation)]
    fn off_page_with(object_size: usize, stride: usize, align: usize, pages: usize) -> Self {
        let bytes = pages * PAGE;
        let capacity = ((bytes - object_size) / stride + 1).min(OFF_PAGE_MAX_OBJECTS);
        Self {
            placement: Placement::OffPage,
            pages: pages as u32,
            first: 0,
            stride,
            capacity: capacity as u32,
            slack: bytes - ((capacity - 1) * stride + object_size),
            align,
        }
    }

    /// `true` if the slack is within `1 / MAX_WASTE_DIVISOR` of the slab.
    #[inline]
    #[must_use]
    pub const fn within_waste_bound(&self) -> bool {
        self.slack <= self.bytes() / MAX_WASTE_DIVISOR
    }

    /// Bytes of backing memory per slab.
    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.pages as usize * PAGE
    }

    /// Color that follows `color`.
    #[inline]
    #[must_use]
    pub const fn next_color(&self, color: usize) -> usize {
        let next = color + self.align;
        if next > self.slack { 0 } else { next }
    }
}

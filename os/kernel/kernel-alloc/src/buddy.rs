//! # Buddy Free-List Table
//!
//! The split/merge engine shared by the [physical frame](crate::frame_alloc)
//! and [virtual region](crate::region) allocators.
//!
//! ## Layout
//!
//! A pool of `units` base pages starting at `base` is described by a dense
//! descriptor table, one descriptor per page, addressed by
//! `(address - base) >> PAGE_SHIFT`:
//!
//! ```text
//!  index:   0    1    2    3    4    5    6    7
//!         ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!         │head│int │head│int │head│head│int │int │ ...
//!         │L1  │    │L1  │    │L0  │L2? │    │    │
//!         └────┴────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! Only the first descriptor of a block (the *head*) carries `size > 0`. All
//! other descriptors of the block are *interior* points with `size == 0`.
//!
//! The free-list table holds, for every level `0..=MAX_LEVEL`, a circular
//! doubly linked list threaded through the descriptors by index. Indices
//! replace raw pointers so the table can be moved and inspected safely.
//!
//! ## Invariants
//!
//! - A head of level `L` spans `2^L` pages and its address is aligned to
//!   `PAGE_SIZE << L` (absolute alignment, not relative to `base`).
//! - A descriptor is in the list of level `L` iff it is a `Free` head of level `L`.
//! - No two heads overlap.
//! - The buddy of a block at `start` with `size` bytes is the block at
//!   `start ^ size`.

use crate::error::AllocError;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, order_for_pages, pages_for};

/// Highest buddy level any table supports (`2^24` pages, 64 GiB).
pub const MAX_LEVEL: u8 = 24;

const LEVELS: usize = MAX_LEVEL as usize + 1;

/// Null link.
const NIL: u32 = u32::MAX;

/// Role of a descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockState {
    /// Not a block head; part of a larger block.
    #[default]
    Interior,
    /// Head of a block that sits on a free list.
    Free,
    /// Head of a block handed out to a caller.
    Allocated,
}

/// Buddy bookkeeping common to frame and region descriptors.
#[derive(Copy, Clone, Debug)]
pub struct Block {
    start: u64,
    size: u64,
    level: u8,
    state: BlockState,
    prev: u32,
    next: u32,
}

impl Block {
    pub const EMPTY: Self = Self {
        start: 0,
        size: 0,
        level: 0,
        state: BlockState::Interior,
        prev: NIL,
        next: NIL,
    };

    /// Base address of the block this descriptor represents.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Block size in bytes; `0` for interior points.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> BlockState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.size != 0
    }

    const fn interior(start: u64) -> Self {
        Self { start, ..Self::EMPTY }
    }

    const fn head(start: u64, level: u8, state: BlockState) -> Self {
        Self {
            start,
            size: PAGE_SIZE << level,
            level,
            state,
            prev: NIL,
            next: NIL,
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Access to the [`Block`] embedded in a descriptor type.
pub trait BuddyDescriptor {
    fn block(&self) -> &Block;
    fn block_mut(&mut self) -> &mut Block;
}

/// One free block as reported by [`BuddyTable::free_blocks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    pub level: u8,
    pub start: u64,
}

/// Buddy allocator state over a caller-provided descriptor table.
pub struct BuddyTable<D: 'static> {
    base: u64,
    units: u32,
    max_level: u8,
    heads: [u32; LEVELS],
    free_pages: u64,
    descs: &'static mut [D],
}

impl<D: BuddyDescriptor> BuddyTable<D> {
    /// Take over `descs` to manage `[base, base + len)`.
    ///
    /// The range is carved greedily into the largest naturally aligned blocks
    /// that fit; a `2^n`-page range at a `2^n`-page aligned base becomes a
    /// single top-level block.
    ///
    /// # Errors
    /// - [`AllocError::InvalidAddress`] if `base` is not page aligned.
    /// - [`AllocError::InvalidLayout`] if the range is empty, too large, or
    ///   `descs` has fewer entries than the range has pages.
    pub fn new(base: u64, len: u64, descs: &'static mut [D]) -> Result<Self, AllocError> {
        if base % PAGE_SIZE != 0 {
            return Err(AllocError::InvalidAddress(base));
        }
        let units = u32::try_from(len >> PAGE_SHIFT)
            .ok()
            .filter(|&u| u != 0 && u != NIL)
            .ok_or(AllocError::InvalidLayout("pool must span 1..2^32-1 pages"))?;
        if descs.len() < units as usize {
            return Err(AllocError::InvalidLayout("descriptor table smaller than pool"));
        }
        if base.checked_add(u64::from(units) << PAGE_SHIFT).is_none() {
            return Err(AllocError::InvalidLayout("pool wraps the address space"));
        }

        #[allow(clippy::cast_possible_truncation)]
        let max_level = ((u32::BITS - 1 - units.leading_zeros()) as u8).min(MAX_LEVEL);

        let mut table = Self {
            base,
            units,
            max_level,
            heads: [NIL; LEVELS],
            free_pages: 0,
            descs,
        };

        for idx in 0..units {
            let start = table.address_of(idx);
            *table.block_mut(idx) = Block::interior(start);
        }

        let mut idx = 0;
        while idx < units {
            let start = table.address_of(idx);
            let mut level = max_level;
            while level > 0
                && (start % (PAGE_SIZE << level) != 0 || idx + (1 << level) > units)
            {
                level -= 1;
            }
            *table.block_mut(idx) = Block::head(start, level, BlockState::Free);
            table.push(level, idx);
            table.free_pages += 1 << level;
            idx += 1 << level;
        }

        Ok(table)
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Total bytes covered by the table.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        (self.units as u64) << PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Bytes currently sitting on free lists.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_pages << PAGE_SHIFT
    }

    /// `true` if `addr` lies inside the managed range.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.containing_index(addr).is_some()
    }

    /// Level a request of `size` bytes is served from.
    ///
    /// # Errors
    /// [`AllocError::AllocationTooLarge`] beyond the largest level of this table.
    pub fn level_for(&self, size: u64) -> Result<u8, AllocError> {
        let order = order_for_pages(pages_for(size));
        if order > u32::from(self.max_level) {
            return Err(AllocError::AllocationTooLarge {
                requested: size,
                largest: PAGE_SIZE << self.max_level,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(order as u8)
    }

    /// Allocate the smallest power-of-two block holding `size` bytes.
    ///
    /// # Errors
    /// - [`AllocError::AllocationTooLarge`] if no level is big enough.
    /// - [`AllocError::OutOfMemory`] if no eligible level has a free block.
    /// - [`AllocError::Corruption`] if a free list is found inconsistent.
    pub fn alloc(&mut self, size: u64) -> Result<u64, AllocError> {
        let target = self.level_for(size)?;
        let mut level = (target..=self.max_level)
            .find(|&l| self.heads[l as usize] != NIL)
            .ok_or(AllocError::OutOfMemory)?;

        while level > target {
            let idx = self.pop(level)?;
            self.split(idx, level);
            level -= 1;
        }

        let idx = self.pop(target)?;
        self.block_mut(idx).state = BlockState::Allocated;
        self.free_pages -= 1 << target;
        Ok(self.address_of(idx))
    }

    /// Return the block starting at `addr`, merging with free buddies.
    ///
    /// Returns the level the merged block was filed under.
    ///
    /// # Errors
    /// - [`AllocError::InvalidAddress`] if `addr` is not the head of an
    ///   allocated block, or not aligned to that block's size.
    /// - [`AllocError::Corruption`] if a free buddy is not on its list.
    pub fn free(&mut self, addr: u64) -> Result<u8, AllocError> {
        let mut idx = self.index_of(addr).ok_or(AllocError::InvalidAddress(addr))?;
        let block = *self.block(idx);
        if block.state != BlockState::Allocated || !block.is_head() {
            return Err(AllocError::InvalidAddress(addr));
        }
        if addr & (block.size - 1) != 0 {
            return Err(AllocError::InvalidAddress(addr));
        }

        let mut level = block.level;
        self.free_pages += 1 << level;

        while level < self.max_level {
            let size = PAGE_SIZE << level;
            let buddy_addr = self.address_of(idx) ^ size;
            let Some(buddy) = self.index_of(buddy_addr) else {
                break;
            };
            if u64::from(buddy) + (1 << level) > u64::from(self.units) {
                break;
            }
            let candidate = *self.block(buddy);
            if candidate.state != BlockState::Free || candidate.level != level {
                break;
            }
            if !self.is_linked(buddy) {
                return Err(AllocError::Corruption("free buddy missing from its level list"));
            }
            self.unlink(level, buddy);

            let (lower, upper) = if buddy < idx { (buddy, idx) } else { (idx, buddy) };
            let upper_start = self.address_of(upper);
            *self.block_mut(upper) = Block::interior(upper_start);
            idx = lower;
            level += 1;
        }

        let start = self.address_of(idx);
        *self.block_mut(idx) = Block::head(start, level, BlockState::Free);
        self.push(level, idx);
        Ok(level)
    }

    /// Block header at exactly `addr`, if `addr` is a page of this table.
    #[must_use]
    pub fn block_at(&self, addr: u64) -> Option<&Block> {
        self.index_of(addr).map(|idx| self.block(idx))
    }

    /// Descriptor of the page containing `addr`.
    #[must_use]
    pub fn descriptor(&self, addr: u64) -> Option<&D> {
        self.containing_index(addr).map(|idx| &self.descs[idx as usize])
    }

    /// Descriptor of the page containing `addr`.
    pub fn descriptor_mut(&mut self, addr: u64) -> Option<&mut D> {
        self.containing_index(addr)
            .map(|idx| &mut self.descs[idx as usize])
    }

    /// Allocated head at exactly `addr`.
    #[must_use]
    pub fn allocated_head(&self, addr: u64) -> Option<&Block> {
        self.block_at(addr)
            .filter(|b| b.is_head() && b.state == BlockState::Allocated)
    }

    /// Iterate all free blocks, lowest level first.
    #[must_use]
    pub const fn free_blocks(&self) -> FreeBlocks<'_, D> {
        FreeBlocks {
            table: self,
            level: 0,
            cursor: None,
        }
    }

    /// Number of free blocks on the list of `level`.
    #[must_use]
    pub fn free_count(&self, level: u8) -> usize {
        self.free_blocks().filter(|b| b.level == level).count()
    }

    /// Walk every free list and cross-check it against the descriptors.
    ///
    /// # Errors
    /// [`AllocError::Corruption`] describing the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        let mut listed_pages = 0_u64;
        let mut listed_blocks = 0_u64;
        for level in 0..=self.max_level {
            let head = self.heads[level as usize];
            if head == NIL {
                continue;
            }
            let mut cursor = head;
            let mut steps = 0_u32;
            loop {
                let b = self.block(cursor);
                if b.state != BlockState::Free || b.level != level || !b.is_head() {
                    return Err(AllocError::Corruption("listed block is not a free head of this level"));
                }
                if b.start % b.size != 0 || b.start != self.address_of(cursor) {
                    return Err(AllocError::Corruption("listed block is misaligned"));
                }
                if self.block(b.next).prev != cursor || self.block(b.prev).next != cursor {
                    return Err(AllocError::Corruption("broken free-list links"));
                }
                listed_pages += 1 << level;
                listed_blocks += 1;
                steps += 1;
                if steps > self.units {
                    return Err(AllocError::Corruption("free list does not close"));
                }
                cursor = b.next;
                if cursor == head {
                    break;
                }
            }
        }

        let free_heads = (0..self.units)
            .filter(|&i| self.block(i).state == BlockState::Free)
            .count() as u64;
        if free_heads != listed_blocks {
            return Err(AllocError::Corruption("free head missing from the free lists"));
        }
        if listed_pages != self.free_pages {
            return Err(AllocError::Corruption("free page accounting mismatch"));
        }
        Ok(())
    }

    #[inline]
    fn address_of(&self, idx: u32) -> u64 {
        self.base + (u64::from(idx) << PAGE_SHIFT)
    }

    /// Index of the page starting exactly at `addr`.
    #[inline]
    fn index_of(&self, addr: u64) -> Option<u32> {
        let off = addr.checked_sub(self.base)?;
        if off % PAGE_SIZE != 0 {
            return None;
        }
        self.containing_index(addr)
    }

    /// Index of the page containing `addr`.
    #[inline]
    fn containing_index(&self, addr: u64) -> Option<u32> {
        let off = addr.checked_sub(self.base)?;
        u32::try_from(off >> PAGE_SHIFT)
            .ok()
            .filter(|&idx| idx < self.units)
    }

    #[inline]
    fn block(&self, idx: u32) -> &Block {
        self.descs[idx as usize].block()
    }

    #[inline]
    fn block_mut(&mut self, idx: u32) -> &mut Block {
        self.descs[idx as usize].block_mut()
    }

    /// Split the (already unlinked) head `idx` of `level` into two free halves.
    fn split(&mut self, idx: u32, level: u8) {
        let child = level - 1;
        let upper = idx + (1 << child);
        let (lower_start, upper_start) = (self.address_of(idx), self.address_of(upper));
        *self.block_mut(upper) = Block::head(upper_start, child, BlockState::Free);
        *self.block_mut(idx) = Block::head(lower_start, child, BlockState::Free);
        // lower half ends up at the list head so it is handed out first
        self.push(child, upper);
        self.push(child, idx);
    }

    fn pop(&mut self, level: u8) -> Result<u32, AllocError> {
        let idx = self.heads[level as usize];
        if idx == NIL {
            return Err(AllocError::Corruption("pop from an empty free list"));
        }
        let b = *self.block(idx);
        if b.state != BlockState::Free || b.level != level {
            return Err(AllocError::Corruption("free-list head is not a free block of its level"));
        }
        self.unlink(level, idx);
        Ok(idx)
    }

    fn push(&mut self, level: u8, idx: u32) {
        let head = self.heads[level as usize];
        if head == NIL {
            let b = self.block_mut(idx);
            b.prev = idx;
            b.next = idx;
        } else {
            let tail = self.block(head).prev;
            {
                let b = self.block_mut(idx);
                b.prev = tail;
                b.next = head;
            }
            self.block_mut(tail).next = idx;
            self.block_mut(head).prev = idx;
        }
        self.heads[level as usize] = idx;
    }

    fn unlink(&mut self, level: u8, idx: u32) {
        let Block { prev, next, .. } = *self.block(idx);
        if next == idx {
            self.heads[level as usize] = NIL;
        } else {
            self.block_mut(prev).next = next;
            self.block_mut(next).prev = prev;
            if self.heads[level as usize] == idx {
                self.heads[level as usize] = next;
            }
        }
        let b = self.block_mut(idx);
        b.prev = NIL;
        b.next = NIL;
    }

    fn is_linked(&self, idx: u32) -> bool {
        let b = self.block(idx);
        b.next != NIL
            && b.prev != NIL
            && self.block(b.next).prev == idx
            && self.block(b.prev).next == idx
    }
}

/// Iterator over the free lists of a [`BuddyTable`].
pub struct FreeBlocks<'t, D: 'static> {
    table: &'t BuddyTable<D>,
    level: u8,
    cursor: Option<u32>,
}

impl<D: BuddyDescriptor> Iterator for FreeBlocks<'_, D> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.level > self.table.max_level {
                return None;
            }
            let head = self.table.heads[self.level as usize];
            let current = self.cursor.unwrap_or(head);
            if current == NIL {
                self.level += 1;
                self.cursor = None;
                continue;
            }
            let next = self.table.block(current).next;
            self.cursor = Some(if next == head { NIL } else { next });
            return Some(FreeBlock {
                level: self.level,
                start: self.table.address_of(current),
            });
        }
    }
}

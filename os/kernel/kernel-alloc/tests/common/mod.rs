#![allow(dead_code)]

use kernel_alloc::{
    FrameAllocator, FrameDescriptor, Kmem, KmemConfig, MapFlags, Paging, PagingError,
    RegionDescriptor, UnmapPolicy,
};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use std::alloc::{Layout, alloc_zeroed};
use std::collections::BTreeMap;

pub const PHYS_BASE: u64 = 0x4000_0000;
pub const PHYS_LEN: u64 = 4 << 20;
pub const MIB: u64 = 1 << 20;
pub const BOOTSTRAP_PAGES: usize = 16;

/// Virtual span covered by one fake page table.
const TABLE_SHIFT: u32 = 21;

/// Page tables as a map from page to frame.
///
/// One table frame is taken from the frame allocator per 2 MiB of mapped
/// virtual space and kept alive by the mapping count of its entries.
#[derive(Default)]
pub struct FakePaging {
    entries: BTreeMap<u64, PhysicalAddress>,
    tables: BTreeMap<u64, PhysicalAddress>,
    /// Reject the map call after this many successes.
    pub fail_after: Option<usize>,
}

impl FakePaging {
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    pub fn table_frames(&self) -> usize {
        self.tables.len()
    }
}

impl Paging for FakePaging {
    fn map(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        _flags: MapFlags,
    ) -> Result<(), PagingError> {
        if let Some(n) = self.fail_after.as_mut() {
            if *n == 0 {
                return Err(PagingError::Rejected(va));
            }
            *n -= 1;
        }
        let page = va.page_base().as_u64();
        if self.entries.contains_key(&page) {
            return Err(PagingError::AlreadyMapped(va));
        }
        let key = page >> TABLE_SHIFT;
        let table = match self.tables.get(&key) {
            Some(&table) => table,
            None => {
                let table = frames.alloc(PAGE_SIZE).map_err(|_| PagingError::OutOfTables)?;
                self.tables.insert(key, table);
                table
            }
        };
        frames
            .mark_mapped(table)
            .map_err(|_| PagingError::OutOfTables)?;
        self.entries.insert(page, pa.page_base());
        Ok(())
    }

    fn unmap(&mut self, frames: &mut FrameAllocator, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = va.page_base().as_u64();
        let pa = self.entries.remove(&page)?;
        let key = page >> TABLE_SHIFT;
        if let Some(&table) = self.tables.get(&key)
            && frames.unmark_mapped(table, UnmapPolicy::Release) == Ok(true)
        {
            self.tables.remove(&key);
        }
        Some(pa)
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = va.page_base();
        self.entries
            .get(&page.as_u64())
            .map(|&pa| pa + (va.as_u64() - page.as_u64()))
    }
}

/// Leaked, zeroed host memory standing in for kernel virtual space:
/// the bootstrap window at the start, the region pool in the second MiB.
pub fn host_window() -> VirtualAddress {
    let layout = Layout::from_size_align(2 * MIB as usize, 2 * MIB as usize).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    VirtualAddress::from_ptr(ptr)
}

pub fn config(window: VirtualAddress, phys_len: u64) -> KmemConfig {
    KmemConfig {
        phys_base: PhysicalAddress::new(PHYS_BASE),
        phys_len,
        virt_base: window + MIB,
        virt_len: MIB,
        bootstrap_base: window,
        bootstrap_pages: BOOTSTRAP_PAGES,
        map_flags: MapFlags::kernel_data(),
    }
}

pub fn kmem_with(phys_len: u64) -> Kmem<FakePaging> {
    let window = host_window();
    let frames = vec![FrameDescriptor::EMPTY; (phys_len >> PAGE_SHIFT) as usize].leak();
    let regions = vec![RegionDescriptor::EMPTY; (MIB >> PAGE_SHIFT) as usize].leak();
    Kmem::new(config(window, phys_len), FakePaging::default(), frames, regions).unwrap()
}

pub fn kmem() -> Kmem<FakePaging> {
    kmem_with(PHYS_LEN)
}

pub fn mapped_pages(kmem: &Kmem<FakePaging>) -> usize {
    kmem.with_paging(|paging| paging.mapped_pages())
}

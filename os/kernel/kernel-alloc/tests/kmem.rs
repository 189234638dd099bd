mod common;

use common::{BOOTSTRAP_PAGES, PHYS_LEN, kmem, kmem_with, mapped_pages};
use kernel_alloc::kmem::SIZE_CLASSES;
use kernel_alloc::slab::{
    AllocFlags, BUFCTL_HEADER_SIZE, CacheConfig, Placement, ReapFlags, SLAB_HEADER_SIZE,
};
use kernel_alloc::{AllocError, FrameOwner, UnmapPolicy};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use std::ptr::NonNull;

fn owner_of(kmem: &kernel_alloc::Kmem<common::FakePaging>, ptr: NonNull<u8>) -> Option<FrameOwner> {
    let pa = kmem.translate(VirtualAddress::from_nonnull(ptr))?;
    kmem.frame_owner(pa)
}

#[test]
fn bring_up_leaves_everything_consistent() {
    let kmem = kmem();
    kmem.check_invariants().unwrap();

    // bootstrap window plus one table frame
    assert!(mapped_pages(&kmem) >= BOOTSTRAP_PAGES);
    assert!(kmem.phys_free_bytes() <= PHYS_LEN - (BOOTSTRAP_PAGES as u64 + 1) * PAGE_SIZE);
    for name in ["kmem_cache", "kmem_slab", "kmem_bufctl", "size-8", "size-2048"] {
        assert!(kmem.cache_stats_by_name(name).is_some(), "{name} missing");
    }
    assert!(kmem.cache_stats_by_name("kmem_slab").unwrap().free_slabs >= 1);
}

#[test]
fn phys_alloc_rounds_and_refcounts() {
    let kmem = kmem();
    let before = kmem.phys_free_bytes();

    let pa = kmem.phys_alloc(3 * PAGE_SIZE).unwrap();
    assert!(pa.is_aligned(4 * PAGE_SIZE));
    assert_eq!(kmem.phys_free_bytes(), before - 4 * PAGE_SIZE);
    kmem.phys_free(pa).unwrap();
    assert_eq!(kmem.phys_free_bytes(), before);

    let pa = kmem.phys_alloc(PAGE_SIZE).unwrap();
    assert_eq!(kmem.mark_mapped(pa), Ok(1));
    assert_eq!(kmem.mark_mapped(pa), Ok(2));
    assert_eq!(kmem.unmark_mapped(pa, UnmapPolicy::Release), Ok(false));
    assert_eq!(kmem.unmark_mapped(pa, UnmapPolicy::Release), Ok(true));
    assert_eq!(kmem.phys_free_bytes(), before);
    assert_eq!(kmem.phys_free(pa), Err(AllocError::InvalidAddress(pa.as_u64())));
}

#[test]
fn backed_region_round_trip() {
    let kmem = kmem();
    let (phys, virt, mapped) = (kmem.phys_free_bytes(), kmem.virt_free_bytes(), mapped_pages(&kmem));

    let va = kmem.virt_alloc(5 * PAGE_SIZE, true).unwrap();
    assert_eq!(kmem.virt_free_bytes(), virt - 8 * PAGE_SIZE);
    assert_eq!(mapped_pages(&kmem), mapped + 8);
    for page in 0..8 {
        let pa = kmem.translate(va + page * PAGE_SIZE).unwrap();
        assert_eq!(kmem.frame_owner(pa), Some(FrameOwner::Region));
    }
    // the region is real memory
    unsafe { va.as_mut_ptr::<u8>().write_bytes(0xCD, 8 * PAGE_SIZE as usize) };

    kmem.virt_free(va).unwrap();
    assert_eq!(
        (kmem.phys_free_bytes(), kmem.virt_free_bytes(), mapped_pages(&kmem)),
        (phys, virt, mapped)
    );
    assert_eq!(kmem.virt_free(va), Err(AllocError::InvalidAddress(va.as_u64())));
    kmem.check_invariants().unwrap();
}

#[test]
fn unbacked_region_is_not_mapped() {
    let kmem = kmem();
    let phys = kmem.phys_free_bytes();
    let va = kmem.virt_alloc(PAGE_SIZE, false).unwrap();
    assert!(kmem.translate(va).is_none());
    assert_eq!(kmem.phys_free_bytes(), phys);
    kmem.virt_free(va).unwrap();
}

#[test]
fn frame_shortage_rolls_back_the_region() {
    let kmem = kmem();
    let mut hoard = Vec::new();
    while kmem.phys_free_bytes() > PAGE_SIZE {
        hoard.push(kmem.phys_alloc(PAGE_SIZE).unwrap());
    }
    let (virt, mapped) = (kmem.virt_free_bytes(), mapped_pages(&kmem));

    let err = kmem.virt_alloc(2 * PAGE_SIZE, true).unwrap_err();
    assert!(matches!(err, AllocError::MappingFailure(_)));
    assert_eq!(kmem.phys_free_bytes(), PAGE_SIZE);
    assert_eq!(kmem.virt_free_bytes(), virt);
    assert_eq!(mapped_pages(&kmem), mapped);
    kmem.check_invariants().unwrap();

    // the single frame left still serves a one-page region
    let va = kmem.virt_alloc(PAGE_SIZE, true).unwrap();
    kmem.virt_free(va).unwrap();
    for pa in hoard {
        kmem.phys_free(pa).unwrap();
    }
    kmem.check_invariants().unwrap();
}

#[test]
fn rejected_mapping_rolls_back_the_region() {
    let kmem = kmem();
    let (phys, virt, mapped) = (kmem.phys_free_bytes(), kmem.virt_free_bytes(), mapped_pages(&kmem));

    kmem.with_paging(|paging| paging.fail_after = Some(2));
    let err = kmem.virt_alloc(4 * PAGE_SIZE, true).unwrap_err();
    assert!(matches!(err, AllocError::MappingFailure(_)));
    kmem.with_paging(|paging| paging.fail_after = None);

    assert_eq!(
        (kmem.phys_free_bytes(), kmem.virt_free_bytes(), mapped_pages(&kmem)),
        (phys, virt, mapped)
    );
    kmem.check_invariants().unwrap();
}

#[test]
fn cache_fills_one_slab_then_grows() {
    let kmem = kmem();
    let cache = kmem
        .cache_create(&CacheConfig::new("obj64", 64).with_align(8))
        .unwrap();
    let max = (PAGE_SIZE as usize - SLAB_HEADER_SIZE) / (64 + BUFCTL_HEADER_SIZE);
    assert_eq!(kmem.cache_stats(&cache).objects_per_slab as usize, max);

    let mut objects = Vec::new();
    for _ in 0..max {
        objects.push(kmem.cache_alloc(&cache, AllocFlags::new()).unwrap());
    }
    let stats = kmem.cache_stats(&cache);
    assert_eq!((stats.full_slabs, stats.partial_slabs, stats.grows), (1, 0, 1));

    objects.push(kmem.cache_alloc(&cache, AllocFlags::new()).unwrap());
    let stats = kmem.cache_stats(&cache);
    assert_eq!((stats.full_slabs, stats.partial_slabs, stats.grows), (1, 1, 2));

    for &obj in &objects {
        assert!(matches!(owner_of(&kmem, obj), Some(FrameOwner::Slab(_))));
        kmem.cache_free(&cache, obj).unwrap();
    }
    assert_eq!(kmem.cache_stats(&cache).live_objects, 0);
    kmem.check_invariants().unwrap();
}

#[test]
fn reaped_and_destroyed_caches_return_their_pages() {
    let kmem = kmem();
    let cache = kmem.cache_create(&CacheConfig::new("tmp", 3000)).unwrap();
    assert_eq!(kmem.cache_stats(&cache).placement, Placement::OffPage);

    let a = kmem.cache_alloc(&cache, AllocFlags::new()).unwrap();
    let b = kmem.cache_alloc(&cache, AllocFlags::new()).unwrap();
    assert_ne!(a, b);
    kmem.cache_free(&cache, a).unwrap();

    let err = kmem.cache_destroy(cache).unwrap_err();
    assert_eq!(err.error, AllocError::CacheNotEmpty);
    let cache = err.cache;

    kmem.cache_free(&cache, b).unwrap();
    let (phys, virt) = (kmem.phys_free_bytes(), kmem.virt_free_bytes());
    let pages = kmem.cache_reap(ReapFlags::new().with_force(true)).unwrap() as u64;
    assert_eq!(pages, u64::from(kmem.cache_stats(&cache).pages_per_slab));
    assert_eq!(kmem.cache_stats(&cache).free_slabs, 0);
    assert_eq!(kmem.virt_free_bytes(), virt + pages * PAGE_SIZE);
    assert_eq!(kmem.phys_free_bytes(), phys + pages * PAGE_SIZE);

    kmem.cache_destroy(cache).unwrap();
    assert!(kmem.cache_stats_by_name("tmp").is_none());
    kmem.check_invariants().unwrap();
}

#[test]
fn full_off_page_slabs_waste_at_most_an_eighth() {
    let kmem = kmem();
    for size in [2100, 4097, 5000] {
        let cache = kmem.cache_create(&CacheConfig::new("odd", size)).unwrap();
        let stats = kmem.cache_stats(&cache);
        assert_eq!(stats.placement, Placement::OffPage);

        let objects: Vec<_> = (0..stats.objects_per_slab)
            .map(|_| kmem.cache_alloc(&cache, AllocFlags::new()).unwrap())
            .collect();
        let stats = kmem.cache_stats(&cache);
        assert_eq!((stats.full_slabs, stats.grows), (1, 1), "size {size}");
        let slab_bytes = u64::from(stats.pages_per_slab) * PAGE_SIZE;
        let used = stats.live_objects * size as u64;
        assert!(8 * (slab_bytes - used) <= slab_bytes, "size {size}: {stats:?}");

        for obj in objects {
            kmem.cache_free(&cache, obj).unwrap();
        }
        kmem.cache_destroy(cache).unwrap();
    }
    kmem.check_invariants().unwrap();
}

#[test]
fn wrong_cache_is_refused() {
    let kmem = kmem();
    let a = kmem.cache_create(&CacheConfig::new("a", 24)).unwrap();
    let b = kmem.cache_create(&CacheConfig::new("b", 24)).unwrap();
    let obj = kmem.cache_alloc(&a, AllocFlags::new()).unwrap();
    assert_eq!(kmem.cache_free(&b, obj), Err(AllocError::WrongCache));
    kmem.cache_free(&a, obj).unwrap();
}

#[test]
fn small_requests_use_size_classes() {
    let kmem = kmem();
    for size in [1, 8, 9, 100, 1000, 2048] {
        let class = SIZE_CLASSES.iter().copied().find(|&c| c >= size).unwrap();
        let name = format!("size-{class}");
        let live = kmem.cache_stats_by_name(&name).unwrap().live_objects;

        let ptr = kmem.generic_alloc(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % class.min(16), 0);
        assert!(matches!(owner_of(&kmem, ptr), Some(FrameOwner::Slab(_))));
        assert_eq!(kmem.cache_stats_by_name(&name).unwrap().live_objects, live + 1);
        unsafe { ptr.as_ptr().write_bytes(0x11, size) };

        kmem.generic_free(ptr).unwrap();
        assert_eq!(kmem.cache_stats_by_name(&name).unwrap().live_objects, live);
    }
}

#[test]
fn alignment_picks_a_large_enough_class() {
    let kmem = kmem();
    let ptr = kmem.generic_alloc_aligned(8, 16).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    assert_eq!(kmem.cache_stats_by_name("size-16").unwrap().live_objects, 1);
    kmem.generic_free(ptr).unwrap();

    let ptr = kmem.generic_alloc_aligned(64, 4096).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 4096, 0);
    assert_eq!(owner_of(&kmem, ptr), Some(FrameOwner::Region));
    kmem.generic_free(ptr).unwrap();
}

#[test]
fn large_requests_use_regions() {
    let kmem = kmem();
    let virt = kmem.virt_free_bytes();
    let ptr = kmem.generic_alloc(5000).unwrap();
    assert_eq!(owner_of(&kmem, ptr), Some(FrameOwner::Region));
    assert_eq!(kmem.virt_free_bytes(), virt - 2 * PAGE_SIZE);

    let inside = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(8)) };
    assert!(matches!(kmem.generic_free(inside), Err(AllocError::InvalidAddress(_))));
    kmem.generic_free(ptr).unwrap();
    assert_eq!(kmem.virt_free_bytes(), virt);
}

#[test]
fn generic_free_rejects_foreign_and_stale_pointers() {
    let kmem = kmem();
    assert!(matches!(kmem.generic_alloc(0), Err(AllocError::InvalidLayout(_))));

    let mut local = 0_u64;
    let foreign = NonNull::from(&mut local).cast::<u8>();
    assert!(matches!(kmem.generic_free(foreign), Err(AllocError::InvalidAddress(_))));

    let ptr = kmem.generic_alloc(32).unwrap();
    kmem.generic_free(ptr).unwrap();
    assert!(matches!(kmem.generic_free(ptr), Err(AllocError::InvalidAddress(_))));
}

#[test]
fn concurrent_generic_traffic() {
    let kmem = kmem_with(8 << 20);
    std::thread::scope(|scope| {
        for t in 0..4_u8 {
            let kmem = &kmem;
            scope.spawn(move || {
                let mut held = Vec::new();
                for i in 0..200_usize {
                    let size = [16, 40, 200, 700, 1500, 6000][(i + usize::from(t)) % 6];
                    let ptr = kmem.generic_alloc(size).unwrap();
                    unsafe { ptr.as_ptr().write_bytes(t, size) };
                    held.push((ptr, size));
                    if held.len() > 8 {
                        let (ptr, size) = held.remove(0);
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t));
                        kmem.generic_free(ptr).unwrap();
                    }
                }
                for (ptr, _) in held {
                    kmem.generic_free(ptr).unwrap();
                }
            });
        }
    });
    for class in SIZE_CLASSES {
        let stats = kmem.cache_stats_by_name(&format!("size-{class}")).unwrap();
        assert_eq!(stats.live_objects, 0);
    }
    kmem.check_invariants().unwrap();
}

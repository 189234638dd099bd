use super::*;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

const PAGE: usize = 4096;

/// Host memory standing in for mapped kernel pages; "physical" addresses
/// are identical to virtual ones.
#[derive(Default)]
struct HostBacking {
    mapped: BTreeSet<u64>,
    owners: BTreeMap<u64, FrameOwner>,
    regions: BTreeMap<u64, usize>,
    fail_alloc: bool,
    /// Reject owner updates after this many successes.
    fail_owner_after: Option<usize>,
}

impl HostBacking {
    fn host_pages(pages: usize) -> VirtualAddress {
        let layout = Layout::from_size_align(pages * PAGE, PAGE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        VirtualAddress::from_ptr(ptr)
    }

    fn map(&mut self, base: VirtualAddress, pages: usize) {
        for page in 0..pages as u64 {
            let va = base.as_u64() + page * PAGE as u64;
            self.mapped.insert(va);
            self.owners.insert(va, FrameOwner::Region);
        }
    }

    fn window(&mut self, pages: usize) -> VirtualAddress {
        let base = Self::host_pages(pages);
        self.map(base, pages);
        base
    }
}

impl SlabBacking for HostBacking {
    fn alloc_pages(&mut self, pages: u64) -> Result<VirtualAddress, AllocError> {
        if self.fail_alloc {
            return Err(AllocError::OutOfMemory);
        }
        let pages = pages as usize;
        let base = Self::host_pages(pages);
        self.map(base, pages);
        self.regions.insert(base.as_u64(), pages);
        Ok(base)
    }

    fn free_pages(&mut self, va: VirtualAddress) -> Result<(), AllocError> {
        let pages = self
            .regions
            .remove(&va.as_u64())
            .ok_or(AllocError::InvalidAddress(va.as_u64()))?;
        for page in 0..pages as u64 {
            let at = va.as_u64() + page * PAGE as u64;
            self.mapped.remove(&at);
            self.owners.remove(&at);
        }
        let layout = Layout::from_size_align(pages * PAGE, PAGE).unwrap();
        unsafe { dealloc(va.as_mut_ptr(), layout) };
        Ok(())
    }

    fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.mapped
            .contains(&va.page_base().as_u64())
            .then(|| PhysicalAddress::new(va.as_u64()))
    }

    fn frame_owner(&mut self, pa: PhysicalAddress) -> Option<FrameOwner> {
        self.owners.get(&pa.page_base().as_u64()).copied()
    }

    fn set_frame_owner(&mut self, pa: PhysicalAddress, owner: FrameOwner) -> Result<(), AllocError> {
        let page = pa.page_base().as_u64();
        if !self.mapped.contains(&page) {
            return Err(AllocError::InvalidAddress(pa.as_u64()));
        }
        if let Some(n) = self.fail_owner_after.as_mut() {
            if *n == 0 {
                return Err(AllocError::InvalidAddress(pa.as_u64()));
            }
            *n -= 1;
        }
        self.owners.insert(page, owner);
        Ok(())
    }
}

fn seeded(window_pages: usize) -> (SlabAllocator, HostBacking, VirtualAddress) {
    let mut backing = HostBacking::default();
    let window = backing.window(window_pages);
    let mut slabs = SlabAllocator::new();
    slabs.seed(&mut backing, window, window_pages).unwrap();
    (slabs, backing, window)
}

fn self_hosting() -> (SlabAllocator, HostBacking) {
    let (mut slabs, backing, _) = seeded(16);
    slabs.finish_bootstrap().unwrap();
    (slabs, backing)
}

fn stats_of(slabs: &SlabAllocator, name: &str) -> CacheStats {
    slabs.all_stats().find(|s| s.name == name).unwrap()
}

#[test]
fn unseeded_allocator_refuses_work() {
    let mut backing = HostBacking::default();
    let mut slabs = SlabAllocator::new();
    assert_eq!(slabs.phase(), BootstrapPhase::Unseeded);
    assert_eq!(
        slabs.create(&mut backing, &CacheConfig::new("x", 32)).unwrap_err(),
        AllocError::Uninitialized
    );
    assert_eq!(slabs.finish_bootstrap(), Err(AllocError::Uninitialized));
}

#[test]
fn seeding_creates_the_core_caches() {
    let (mut slabs, mut backing, window) = seeded(16);
    assert_eq!(slabs.phase(), BootstrapPhase::Bootstrap);
    let names: Vec<_> = slabs.all_stats().map(|s| s.name).collect();
    assert_eq!(names, ["kmem_cache", "kmem_slab", "kmem_bufctl"]);
    assert!(stats_of(&slabs, "kmem_slab").free_slabs >= 1);
    assert!(stats_of(&slabs, "kmem_bufctl").free_slabs >= 1);
    assert!(backing.regions.is_empty(), "phase 1 must not touch regions");
    slabs.check_invariants().unwrap();

    assert!(matches!(
        slabs.seed(&mut backing, window, 16),
        Err(AllocError::InvalidLayout(_))
    ));
    slabs.finish_bootstrap().unwrap();
    assert_eq!(slabs.phase(), BootstrapPhase::SelfHosting);
}

#[test]
fn seeding_requires_a_mapped_window() {
    let mut backing = HostBacking::default();
    let window = HostBacking::host_pages(4);
    let mut slabs = SlabAllocator::new();
    assert_eq!(
        slabs.seed(&mut backing, window, 4),
        Err(AllocError::InvalidAddress(window.as_u64()))
    );
}

#[test]
fn failed_seed_can_be_retried() {
    let mut backing = HostBacking::default();
    let window = backing.window(8);
    let mut slabs = SlabAllocator::new();

    // the first slab of the cache of caches cannot be tagged
    backing.fail_owner_after = Some(0);
    assert!(slabs.seed(&mut backing, window, 8).is_err());
    assert_eq!(slabs.phase(), BootstrapPhase::Unseeded);
    assert_eq!(slabs.all_stats().count(), 0);
    assert_eq!(
        slabs.create(&mut backing, &CacheConfig::new("x", 32)).unwrap_err(),
        AllocError::Uninitialized
    );

    backing.fail_owner_after = None;
    slabs.seed(&mut backing, window, 8).unwrap();
    assert_eq!(slabs.phase(), BootstrapPhase::Bootstrap);
    let names: Vec<_> = slabs.all_stats().map(|s| s.name).collect();
    assert_eq!(names, ["kmem_cache", "kmem_slab", "kmem_bufctl"]);
    slabs.check_invariants().unwrap();
}

#[test]
fn on_page_slab_fills_in_order_and_grows_once_full() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs
        .create(&mut backing, &CacheConfig::new("obj64", 64).with_align(8))
        .unwrap();
    let max = (PAGE - SLAB_HEADER_SIZE) / (64 + BUFCTL_HEADER_SIZE);
    assert_eq!(slabs.stats(&cache).objects_per_slab as usize, max);

    let mut objects = Vec::new();
    objects.push(slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap());
    let s = slabs.stats(&cache);
    assert_eq!((s.free_slabs, s.partial_slabs, s.full_slabs), (0, 1, 0));

    for _ in 1..max {
        objects.push(slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap());
    }
    let s = slabs.stats(&cache);
    assert_eq!((s.free_slabs, s.partial_slabs, s.full_slabs), (0, 0, 1));
    assert_eq!(s.grows, 1);

    objects.push(slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap());
    let s = slabs.stats(&cache);
    assert_eq!(s.grows, 2);
    assert_eq!((s.partial_slabs, s.full_slabs), (1, 1));
    assert_eq!(s.live_objects as usize, max + 1);

    let mut sorted: Vec<_> = objects.iter().map(|p| p.as_ptr() as usize).collect();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), objects.len());
    assert!(sorted.windows(2).all(|w| w[1] - w[0] >= 64));
    assert!(sorted.iter().all(|p| p % 8 == 0));
    slabs.check_invariants().unwrap();
}

#[test]
fn free_returns_slab_through_partial_to_free() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs.create(&mut backing, &CacheConfig::new("c", 256)).unwrap();
    let max = slabs.stats(&cache).objects_per_slab as usize;
    let objects: Vec<_> = (0..max)
        .map(|_| slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap())
        .collect();
    assert_eq!(slabs.stats(&cache).full_slabs, 1);

    slabs.free(&mut backing, &cache, objects[0]).unwrap();
    assert_eq!(slabs.stats(&cache).partial_slabs, 1);
    for &obj in &objects[1..] {
        slabs.free(&mut backing, &cache, obj).unwrap();
    }
    let s = slabs.stats(&cache);
    assert_eq!((s.free_slabs, s.partial_slabs, s.full_slabs), (1, 0, 0));
    assert_eq!(s.live_objects, 0);
    slabs.check_invariants().unwrap();
}

#[test]
fn free_checks_ownership() {
    let (mut slabs, mut backing) = self_hosting();
    let a = slabs.create(&mut backing, &CacheConfig::new("a", 48)).unwrap();
    let b = slabs.create(&mut backing, &CacheConfig::new("b", 48)).unwrap();
    let obj = slabs.alloc(&mut backing, &a, AllocFlags::new()).unwrap();

    assert_eq!(slabs.free(&mut backing, &b, obj), Err(AllocError::WrongCache));
    let inside = unsafe { NonNull::new_unchecked(obj.as_ptr().add(8)) };
    assert_eq!(
        slabs.free(&mut backing, &a, inside),
        Err(AllocError::InvalidAddress(inside.as_ptr() as u64))
    );
    slabs.free(&mut backing, &a, obj).unwrap();
    assert_eq!(
        slabs.free(&mut backing, &a, obj),
        Err(AllocError::InvalidAddress(obj.as_ptr() as u64))
    );

    let mut outside = Box::new(0_u64);
    let foreign = NonNull::from(&mut *outside).cast::<u8>();
    assert!(matches!(
        slabs.free_any(&mut backing, foreign),
        Err(AllocError::InvalidAddress(_))
    ));
}

#[test]
fn off_page_slabs_take_headers_from_core_caches() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs.create(&mut backing, &CacheConfig::new("big", 1000)).unwrap();
    let s = slabs.stats(&cache);
    assert_eq!(s.placement, Placement::OffPage);

    let slab_live = stats_of(&slabs, "kmem_slab").live_objects;
    let bufctl_live = stats_of(&slabs, "kmem_bufctl").live_objects;
    let objects: Vec<_> = (0..s.objects_per_slab)
        .map(|_| slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap())
        .collect();
    assert_eq!(stats_of(&slabs, "kmem_slab").live_objects, slab_live + 1);
    assert_eq!(
        stats_of(&slabs, "kmem_bufctl").live_objects,
        bufctl_live + u64::from(s.objects_per_slab)
    );
    // the whole page is object space
    let first = objects[0].as_ptr() as usize;
    assert_eq!(first % PAGE, 0);
    assert_eq!(objects[1].as_ptr() as usize - first, 1000);

    for obj in objects {
        slabs.free_any(&mut backing, obj).unwrap();
    }
    assert_eq!(slabs.reap(&mut backing, ReapFlags::new().with_force(true)), Ok(1));
    assert_eq!(stats_of(&slabs, "kmem_slab").live_objects, slab_live);
    assert_eq!(stats_of(&slabs, "kmem_bufctl").live_objects, bufctl_live);
    slabs.check_invariants().unwrap();
}

#[test]
fn reap_skips_fresh_caches_once_and_spares_live_slabs() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs.create(&mut backing, &CacheConfig::new("r", 512)).unwrap();
    let per_slab = slabs.stats(&cache).objects_per_slab as usize;

    let objects: Vec<_> = (0..3 * per_slab)
        .map(|_| slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap())
        .collect();
    let survivor = objects[0];
    for &obj in &objects[1..] {
        slabs.free(&mut backing, &cache, obj).unwrap();
    }
    let s = slabs.stats(&cache);
    assert_eq!((s.free_slabs, s.partial_slabs), (2, 1));

    // just grown: skipped, flag cleared
    assert_eq!(slabs.reap(&mut backing, ReapFlags::new()), Ok(0));
    assert_eq!(slabs.reap(&mut backing, ReapFlags::new()), Ok(2));
    let s = slabs.stats(&cache);
    assert_eq!((s.free_slabs, s.partial_slabs, s.reaped_slabs), (0, 1, 2));

    unsafe { survivor.as_ptr().write_bytes(0xAB, 512) };
    slabs.free(&mut backing, &cache, survivor).unwrap();
    assert_eq!(slabs.reap(&mut backing, ReapFlags::new()), Ok(1));
    assert_eq!(slabs.reap(&mut backing, ReapFlags::new()), Ok(0));
    slabs.check_invariants().unwrap();
}

#[test]
fn no_reap_caches_need_brutal() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs
        .create(
            &mut backing,
            &CacheConfig::new("pinned", 128).with_flags(CacheFlags::new().with_no_reap(true)),
        )
        .unwrap();
    slabs.grow(&mut backing, &cache).unwrap();
    slabs.grow(&mut backing, &cache).unwrap();

    let force = ReapFlags::new().with_force(true);
    assert_eq!(slabs.reap(&mut backing, force), Ok(0));
    assert_eq!(slabs.stats(&cache).free_slabs, 2);
    assert_eq!(slabs.reap(&mut backing, force.with_brutal(true)), Ok(2));
    assert_eq!(slabs.stats(&cache).free_slabs, 0);
}

#[test]
fn reserve_is_kept_unless_suppressed() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs
        .create(&mut backing, &CacheConfig::new("reserved", 256).with_min_free_slabs(1))
        .unwrap();
    slabs
        .alloc(&mut backing, &cache, AllocFlags::new().with_no_reserve(true))
        .unwrap();
    assert_eq!(slabs.stats(&cache).free_slabs, 0);
    slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();
    assert_eq!(slabs.stats(&cache).free_slabs, 1);
}

#[test]
fn failed_reserve_top_up_keeps_the_object() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs
        .create(&mut backing, &CacheConfig::new("reserved", 256).with_min_free_slabs(2))
        .unwrap();
    slabs.grow(&mut backing, &cache).unwrap();
    backing.fail_alloc = true;
    assert!(slabs.alloc(&mut backing, &cache, AllocFlags::new()).is_ok());
    assert_eq!(slabs.stats(&cache).free_slabs, 0);
}

#[test]
fn growth_failure_is_reported() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs.create(&mut backing, &CacheConfig::new("c", 64)).unwrap();
    backing.fail_alloc = true;
    assert_eq!(
        slabs.alloc(&mut backing, &cache, AllocFlags::new()),
        Err(AllocError::OutOfMemory)
    );
    slabs.check_invariants().unwrap();
}

static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);
static DESTRUCTED: AtomicUsize = AtomicUsize::new(0);

#[test]
fn hooks_run_once_per_object_per_slab() {
    fn ctor(ptr: NonNull<u8>) {
        unsafe { ptr.as_ptr().write(0x5A) };
        CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
    }
    fn dtor(_: NonNull<u8>) {
        DESTRUCTED.fetch_add(1, Ordering::SeqCst);
    }

    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs
        .create(
            &mut backing,
            &CacheConfig::new("hooked", 96).with_ctor(ctor).with_dtor(dtor),
        )
        .unwrap();
    let per_slab = slabs.stats(&cache).objects_per_slab as usize;
    let obj = slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();
    assert_eq!(unsafe { obj.as_ptr().read() }, 0x5A);
    assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), per_slab);

    slabs.free(&mut backing, &cache, obj).unwrap();
    slabs.destroy(&mut backing, cache).unwrap();
    assert_eq!(DESTRUCTED.load(Ordering::SeqCst), per_slab);
}

#[test]
fn successive_slabs_are_colored() {
    let (mut slabs, mut backing) = self_hosting();
    let layout = SlabLayout::compute(100, 16).unwrap();
    assert!(layout.slack >= 16);
    let cache = slabs
        .create(&mut backing, &CacheConfig::new("colored", 100).with_align(16))
        .unwrap();
    let first = slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();
    for _ in 1..layout.capacity {
        slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();
    }
    let second = slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();
    assert_eq!(first.as_ptr() as usize % PAGE, layout.first);
    assert_eq!(second.as_ptr() as usize % PAGE, layout.first + 16);
}

#[test]
fn destroy_requires_an_empty_cache() {
    let (mut slabs, mut backing) = self_hosting();
    let cache = slabs.create(&mut backing, &CacheConfig::new("tmp", 40)).unwrap();
    let obj = slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();

    let err = slabs.destroy(&mut backing, cache).unwrap_err();
    assert_eq!(err.error, AllocError::CacheNotEmpty);
    let cache = err.cache;

    slabs.free(&mut backing, &cache, obj).unwrap();
    let regions = backing.regions.len();
    slabs.destroy(&mut backing, cache).unwrap();
    assert_eq!(backing.regions.len(), regions - 1);
    assert!(slabs.all_stats().all(|s| s.name != "tmp"));
    slabs.check_invariants().unwrap();
}

#[test]
fn bootstrap_growth_uses_window_pages_only() {
    let (mut slabs, mut backing, window) = seeded(8);
    let before = slabs.bootstrap_pages_free();
    let cache = slabs.create(&mut backing, &CacheConfig::new("early", 32)).unwrap();
    slabs.alloc(&mut backing, &cache, AllocFlags::new()).unwrap();
    assert_eq!(slabs.bootstrap_pages_free(), before - 1);
    assert!(backing.regions.is_empty());

    // window page 0 holds the cache of caches
    assert_eq!(
        slabs.grow_at(&mut backing, &cache, window),
        Err(AllocError::BootstrapExhaustion)
    );
    let outside = window + 8 * PAGE as u64;
    assert_eq!(
        slabs.grow_at(&mut backing, &cache, outside),
        Err(AllocError::InvalidAddress(outside.as_u64()))
    );
    let last = window + 7 * PAGE as u64;
    slabs.grow_at(&mut backing, &cache, last).unwrap();
    assert_eq!(slabs.bootstrap_pages_free(), before - 2);

    // bootstrap slabs hand their pages back to the window
    assert_eq!(
        slabs.reap(&mut backing, ReapFlags::new().with_force(true)),
        Ok(1)
    );
    assert_eq!(slabs.bootstrap_pages_free(), before - 1);
}

#[test]
fn tiny_window_runs_out() {
    let (mut slabs, mut backing, _) = seeded(2);
    let cache = slabs.create(&mut backing, &CacheConfig::new("early", 32)).unwrap();
    assert_eq!(
        slabs.alloc(&mut backing, &cache, AllocFlags::new()),
        Err(AllocError::BootstrapExhaustion)
    );
}

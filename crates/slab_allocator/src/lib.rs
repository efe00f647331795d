#![no_std]

//! A SLUB-flavored kernel heap: one [`cache::Cache`] per fixed size class,
//! each fronted by a per-CPU magazine and backed by per-NUMA-node
//! partial/empty/full slab-page lists, grounded on the donor
//! `SlabAllocator<T, A, SLAB_CACHE_COUNT>`'s size-class array but rebuilt
//! around [`buddy_allocator`] folios instead of a single generic
//! `PageAlloc`. See `cache`'s module doc for what's simplified relative to
//! a true lock-free SLUB fastpath and why.

extern crate alloc;

mod access;
mod cache;
mod meta;
mod rcu;
mod secret;

use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::vec::Vec;

use eonix_percpu::define_percpu;
use eonix_sync::{LazyLock, Spin};

pub use access::SlabPageAccess;
pub use cache::{Cache, CacheFlags};
pub use rcu::RcuDomain;

/// The concrete size classes every `kmalloc` request is rounded up into.
/// Matches the donor's `1 << (i + 3)` progression up to a page's worth of
/// bytes, then keeps going in power-of-two jumps so that multi-page slabs
/// (2/4/8/16 pages) stay viable before `vmalloc` takes over above
/// [`MAX_KMALLOC_SIZE`].
pub const SIZE_CLASSES: [usize; 17] = [
    8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072,
];
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();
pub const MAX_KMALLOC_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

fn size_class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| class >= size)
}

/// Total per-CPU magazine slots: one per fixed `kmalloc` size class, plus
/// headroom for caches a caller builds itself through [`cache_create`].
/// Fixed at compile time because the per-CPU magazine array
/// ([`CPU_CACHES`]) can't grow once `eonix_percpu` has laid it out.
pub const MAX_CACHES: usize = 64;

#[define_percpu]
pub(crate) static CPU_CACHES: [cache::CpuCache; MAX_CACHES] = [const { cache::CpuCache::new() }; MAX_CACHES];

struct Caches([cache::Cache; NUM_SIZE_CLASSES]);

unsafe impl Send for Caches {}
unsafe impl Sync for Caches {}

static CACHES: LazyLock<Caches> = LazyLock::new(|| {
    Caches(core::array::from_fn(|i| {
        cache::Cache::new(i, SIZE_CLASSES[i] as u32, default_flags())
    }))
});

/// Caches created through [`cache_create`], indexed starting right after
/// the fixed `kmalloc` size classes. Grounded on spec's "global
/// slab-caches list lock": one lock guarding the list of every named
/// cache a caller has ever created, searched for a mergeable match
/// before a new one is built. Entries are never removed, so a reference
/// handed out of the lock stays valid for as long as the allocator runs.
static REGISTRY: Spin<Vec<Box<cache::Cache>>> = Spin::new(Vec::new());

/// Return an existing cache with the same size, alignment, and flags
/// (and no poisoning/redzone, since those tie a cache to one exact
/// object layout) instead of creating a fresh one, the way the donor
/// kernel's cache creation merges same-shaped caches to cut down on
/// slab fragmentation. Creates a new cache under `name` when nothing
/// mergeable exists yet.
pub fn cache_create(name: &'static str, size: usize, align: usize, flags: CacheFlags) -> &'static cache::Cache {
    let size = size as u32;
    let align = align.max(1) as u32;

    let mut registry = REGISTRY.lock();
    let wants_merge = !flags.intersects(CacheFlags::POISON | CacheFlags::RED_ZONE);
    if wants_merge {
        let existing = registry
            .iter()
            .find(|c| c.is_mergeable() && c.flags() == flags && c.object_size() == size && c.align() == align);
        if let Some(existing) = existing {
            // SAFETY: `REGISTRY` only ever grows; a `Cache` already
            // pushed into it is never moved or dropped while the
            // allocator is running.
            return unsafe { &*(existing.as_ref() as *const cache::Cache) };
        }
    }

    let idx = NUM_SIZE_CLASSES + registry.len();
    debug_assert!(idx < MAX_CACHES, "ran out of per-CPU magazine slots for dynamically created slab caches");
    let cache = Box::new(cache::Cache::new_named(idx, Some(name), size, align, flags));
    registry.push(cache);
    // SAFETY: see above.
    unsafe { &*(registry.last().unwrap().as_ref() as *const cache::Cache) }
}

/// Allocate up to `out.len()` objects from `cache` in one call,
/// amortizing the per-CPU-magazine fastpath's cost over every object
/// instead of once per object. Returns how many slots were filled;
/// fewer than requested means the backing slabs ran dry, not an error.
pub fn cache_alloc_bulk(cache: &cache::Cache, node: u8, zero: bool, out: &mut [Option<NonNull<u8>>]) -> usize {
    cache.alloc_bulk(node, zero, out)
}

/// Free every pointer in `ptrs` back to `cache`.
pub fn cache_free_bulk(cache: &cache::Cache, ptrs: &[NonNull<u8>]) {
    cache.free_bulk(ptrs)
}

#[cfg(feature = "mm_hardening")]
fn default_flags() -> CacheFlags {
    CacheFlags::POISON | CacheFlags::RED_ZONE
}

#[cfg(not(feature = "mm_hardening"))]
fn default_flags() -> CacheFlags {
    CacheFlags::empty()
}

/// # Safety
/// Must be called exactly once at boot, before any `kmalloc`/`kfree`
/// call, after `buddy_allocator::init` has brought up the page allocator
/// these caches pull slab pages from. `base_pfn`/`len` should cover the
/// same PFN span `buddy_allocator::init` was given, so every page the
/// page allocator could ever hand a cache has a metadata slot here.
/// `secret_seed` should come from a boot-time entropy source, not a fixed
/// constant.
pub unsafe fn init(
    access: &'static dyn SlabPageAccess,
    rcu: &'static dyn RcuDomain,
    secret_seed: usize,
    base_pfn: eonix_mm::paging::PFN,
    len: usize,
    bump: &impl buddy_allocator::BumpAllocator,
) {
    let bytes = len * core::mem::size_of::<meta::SlabPageMeta>();
    let base = bump
        .bump_alloc(bytes, core::mem::align_of::<meta::SlabPageMeta>())
        .expect("out of boot memory for the slab metadata array")
        .cast::<meta::SlabPageMeta>();
    for i in 0..len {
        unsafe { base.as_ptr().add(i).write(meta::SlabPageMeta::new()) };
    }

    unsafe {
        meta::init(base, base_pfn, len);
        secret::init(secret_seed);
        access::init(access);
        rcu::init(rcu);
    }
    CACHES.get();
}

fn cache_for_size(size: usize) -> Option<&'static cache::Cache> {
    size_class_index(size).map(|idx| &CACHES.get().0[idx])
}

fn cache_by_idx(idx: u8) -> &'static cache::Cache {
    let idx = idx as usize;
    if idx < NUM_SIZE_CLASSES {
        return &CACHES.get().0[idx];
    }
    let registry = REGISTRY.lock();
    // SAFETY: see `cache_create`: entries are never moved or dropped.
    unsafe { &*(registry[idx - NUM_SIZE_CLASSES].as_ref() as *const cache::Cache) }
}

fn cache_for_ptr(ptr: NonNull<u8>) -> Option<&'static cache::Cache> {
    let pfn = access::ptr_to_pfn(ptr);
    if !meta::contains(pfn) {
        return None;
    }
    meta::get(pfn).cache_id().map(cache_by_idx)
}

/// Allocate at least `size` bytes of node-local memory, uninitialized.
/// Returns `None` above [`MAX_KMALLOC_SIZE`]; callers needing more should
/// go through the vmalloc subsystem instead.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    kmalloc_on(size, 0)
}

pub fn kmalloc_on(size: usize, node: u8) -> Option<NonNull<u8>> {
    cache_for_size(size)?.alloc(node)
}

/// Like [`kmalloc`] but zeroed, the way every kernel's `kzalloc` is just
/// `kmalloc` plus a `memset`.
pub fn kzalloc(size: usize) -> Option<NonNull<u8>> {
    let ptr = kmalloc(size)?;
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
    Some(ptr)
}

/// Allocate memory whose address is a multiple of `align`. Only supports
/// alignments up to the size class's own natural alignment (a power of
/// two no larger than the object size), since slab objects aren't
/// individually over-aligned.
pub fn kmalloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    let class = SIZE_CLASSES.iter().find(|&&c| c >= size && c % align == 0)?;
    kmalloc(*class)
}

/// Grow or shrink a previous `kmalloc` allocation, copying the overlap.
/// `old_size` must be the size originally requested (not [`ksize`]'s
/// rounded-up figure) so the copy doesn't read past a smaller object.
pub fn krealloc(ptr: Option<NonNull<u8>>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
    let Some(ptr) = ptr else {
        return kmalloc(new_size);
    };
    if new_size == 0 {
        kfree(ptr, old_size);
        return None;
    }
    if size_class_index(old_size) == size_class_index(new_size) {
        return Some(ptr);
    }
    let new_ptr = kmalloc(new_size)?;
    let copy_len = old_size.min(new_size);
    unsafe { core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len) };
    kfree(ptr, old_size);
    Some(new_ptr)
}

/// Free an object previously returned by `kmalloc`/`kzalloc`/`krealloc`.
/// `size` is accepted (rather than derived purely from page metadata) to
/// mirror the donor `SlabAllocator::dealloc`'s signature and because
/// callers virtually always already have it; it's only used as a
/// consistency check against the page's recorded cache.
pub fn kfree(ptr: NonNull<u8>, size: usize) {
    let Some(cache) = cache_for_ptr(ptr) else {
        debug_assert!(false, "kfree of a pointer not owned by any slab cache");
        return;
    };
    debug_assert!(
        size <= cache.object_size() as usize,
        "kfree size {size} larger than the {}-byte class this pointer belongs to",
        cache.object_size()
    );
    cache.free(ptr);
}

/// The usable size of a previously allocated object, i.e. the size class
/// it was rounded up into. Lets callers that over-allocate defensively
/// (a common pattern with variable-length trailing arrays) find out how
/// much slack they actually got for free.
pub fn ksize(ptr: NonNull<u8>) -> Option<usize> {
    cache_for_ptr(ptr).map(|cache| cache.ksize())
}

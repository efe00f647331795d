//! Per-slab-page metadata, kept in a flat array addressed by PFN the same
//! way `buddy_allocator::page_array` keeps `PageDescriptor`s. A slab page
//! is just a buddy folio the cache subsystem has claimed; this table is
//! where the object-level bookkeeping (freelist head, live count, which
//! cache/node owns it) lives, since none of that fits in `PageDescriptor`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use eonix_mm::paging::PFN;
use eonix_sync::Spin;
use intrusive_list::Link;

/// Sentinel meaning "this slab page's freelist is empty".
pub(crate) const FREELIST_NONE: usize = usize::MAX;
/// Sentinel meaning "not a slab page" / "no cache owns this slot".
pub(crate) const NO_CACHE: u8 = u8::MAX;

/// Which of a cache's three per-node lists currently holds this page, if
/// any. `intrusive_list::List` has no membership query, so we track this
/// ourselves rather than probe every list on every transition.
pub(crate) const LIST_NONE: u8 = 0;
pub(crate) const LIST_EMPTY: u8 = 1;
pub(crate) const LIST_PARTIAL: u8 = 2;
pub(crate) const LIST_FULL: u8 = 3;

pub(crate) struct SlabPageState {
    pub freelist: usize,
    pub free_count: u32,
    /// Which of a cache's empty/partial/full lists this page is on, if
    /// any (see the `LIST_*` constants). Lives under the same lock as
    /// `freelist`/`free_count` so a list transition decided from their
    /// value can't race another CPU deciding the same thing from the
    /// same shared slab page.
    pub list_kind: u8,
}

impl SlabPageState {
    const fn new() -> Self {
        Self {
            freelist: FREELIST_NONE,
            free_count: 0,
            list_kind: LIST_NONE,
        }
    }
}

/// One entry per physical page in the span this crate was told about at
/// [`init`]. Fields that never change after a slab page is carved out
/// (which cache owns it, its object size, its home node) sit outside the
/// per-page lock; `state` is the bit-spinlock-guarded mutable part the
/// donor's `SlabRawPage::{alloc_slot,dealloc_slot}` pair used to mutate
/// without any locking at all (single-threaded donor). `link` is a plain
/// field rather than part of `state`: list membership is serialized by
/// whichever node list's own lock is held while it's touched, mirroring
/// `buddy_allocator::PageDescriptor::link` sitting directly in its flat
/// array so `container_of!` can recover a pointer from a bare `&Link`.
pub(crate) struct SlabPageMeta {
    pub link: Link,
    pub state: Spin<SlabPageState>,
    cache_id: AtomicU8,
    object_size: AtomicU32,
    objects_per_slab: AtomicU32,
    node: AtomicU8,
}

unsafe impl Send for SlabPageMeta {}
unsafe impl Sync for SlabPageMeta {}

impl SlabPageMeta {
    pub(crate) const fn new() -> Self {
        Self {
            link: Link::new(),
            state: Spin::new(SlabPageState::new()),
            cache_id: AtomicU8::new(NO_CACHE),
            object_size: AtomicU32::new(0),
            objects_per_slab: AtomicU32::new(0),
            node: AtomicU8::new(0),
        }
    }

    pub fn cache_id(&self) -> Option<u8> {
        match self.cache_id.load(Ordering::Acquire) {
            NO_CACHE => None,
            id => Some(id),
        }
    }

    pub fn claim(&self, cache_id: u8, object_size: u32, objects_per_slab: u32, node: u8) {
        self.object_size.store(object_size, Ordering::Relaxed);
        self.objects_per_slab.store(objects_per_slab, Ordering::Relaxed);
        self.node.store(node, Ordering::Relaxed);
        self.cache_id.store(cache_id, Ordering::Release);
    }

    pub fn release(&self) {
        self.cache_id.store(NO_CACHE, Ordering::Release);
    }

    pub fn object_size(&self) -> u32 {
        self.object_size.load(Ordering::Relaxed)
    }

    pub fn objects_per_slab(&self) -> u32 {
        self.objects_per_slab.load(Ordering::Relaxed)
    }

    pub fn node(&self) -> u8 {
        self.node.load(Ordering::Relaxed)
    }
}

static BASE: AtomicUsize = AtomicUsize::new(0);
static BASE_PFN: AtomicUsize = AtomicUsize::new(0);
static LEN: AtomicUsize = AtomicUsize::new(0);
static READY: AtomicBool = AtomicBool::new(false);

/// # Safety
/// Must run exactly once, before any other function in this module, with
/// a `base` pointing at `len` zero-initialized, never-moved
/// `SlabPageMeta` entries covering PFNs `[base_pfn, base_pfn + len)`.
pub unsafe fn init(base: NonNull<SlabPageMeta>, base_pfn: PFN, len: usize) {
    BASE.store(base.as_ptr() as usize, Ordering::Relaxed);
    BASE_PFN.store(usize::from(base_pfn), Ordering::Relaxed);
    LEN.store(len, Ordering::Relaxed);
    READY.store(true, Ordering::Release);
}

fn index_of(pfn: PFN) -> usize {
    usize::from(pfn) - BASE_PFN.load(Ordering::Relaxed)
}

pub fn contains(pfn: PFN) -> bool {
    READY.load(Ordering::Acquire) && {
        let base_pfn = BASE_PFN.load(Ordering::Relaxed);
        let pfn = usize::from(pfn);
        pfn >= base_pfn && pfn - base_pfn < LEN.load(Ordering::Relaxed)
    }
}

pub fn get(pfn: PFN) -> &'static SlabPageMeta {
    debug_assert!(contains(pfn), "pfn outside the slab metadata span");
    let base = BASE.load(Ordering::Relaxed) as *const SlabPageMeta;
    unsafe { &*base.add(index_of(pfn)) }
}

/// # Safety
/// `link` must point at the `link` field of a `SlabPageMeta` inside this
/// module's flat array.
pub(crate) unsafe fn pfn_from_link(link: &Link) -> PFN {
    let meta = unsafe { intrusive_list::container_of!(link, SlabPageMeta, link) };
    let base = BASE.load(Ordering::Relaxed);
    let idx = (meta.as_ptr() as usize - base) / core::mem::size_of::<SlabPageMeta>();
    PFN::from(BASE_PFN.load(Ordering::Relaxed) + idx)
}

#![no_std]

mod free_area;
mod node;
mod page;
mod page_array;
mod pcp;
mod zone;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use eonix_mm::address::{AddrOps as _, PAddr, PRange};
use eonix_mm::paging::{FrameAlloc, GlobalFrameAlloc, Folio as FolioTrait, PFN, RawPage as _, PAGE_SIZE_BITS};
use eonix_sync::Spin;

pub use node::{nodes_by_distance, Node, NodeBuilder, MAX_NODES};
pub use page::{AtomicPageFlags, MigrateType, PageDescriptor, PageFlags, PagePtr};
pub use zone::{Watermark, Watermarks, Zone, ZoneKind, MAX_ORDER, ORDER_COUNT};

/// What `init()` needs in order to carve out the flat page-descriptor
/// array out of boot memory before any zone exists. Kept minimal and
/// owned by this crate (rather than a shared "collaborators" crate it
/// would have to depend on) since it's only needed transiently at boot;
/// `eonix_mm_core::collaborators` re-exports it so callers see one
/// coherent trait surface.
pub trait BumpAllocator {
    /// Allocate `size` zeroed bytes aligned to `align` bytes from boot
    /// memory that is never reclaimed by this allocator.
    fn bump_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>>;
}

/// One physically-contiguous region to seed a zone from.
pub struct ZoneRegion {
    pub node: u8,
    pub kind: ZoneKind,
    pub range: PRange,
}

static NODES: Spin<[Node; MAX_NODES]> = Spin::new([const { Node::absent() }; MAX_NODES]);
static TOTAL_FREE: AtomicUsize = AtomicUsize::new(0);

/// Bring the buddy allocator up: allocate the page-descriptor array
/// spanning every region's PFNs out of `bump`, then build each node's
/// zones and free lists.
///
/// # Safety
/// Must be called exactly once, before any other function in this crate,
/// with `regions` describing genuinely free, non-overlapping physical
/// memory.
pub unsafe fn init(regions: &[ZoneRegion], bump: &impl BumpAllocator) {
    let min_pfn = regions
        .iter()
        .map(|r| PFN::from(r.range.start()))
        .min()
        .expect("buddy_allocator::init called with no regions");
    let max_pfn = regions
        .iter()
        .map(|r| PFN::from(r.range.end()))
        .max()
        .unwrap();

    let count = usize::from(max_pfn) - usize::from(min_pfn);
    let bytes = count * core::mem::size_of::<PageDescriptor>();
    let base = bump
        .bump_alloc(bytes, core::mem::align_of::<PageDescriptor>())
        .expect("out of boot memory for the page descriptor array")
        .cast::<PageDescriptor>();

    for i in 0..count {
        unsafe { base.as_ptr().add(i).write(PageDescriptor::new()) };
    }

    unsafe { page_array::init(base, min_pfn, count) };

    let mut builders: [Option<NodeBuilder>; MAX_NODES] = core::array::from_fn(|_| None);
    for region in regions {
        let builder = builders[region.node as usize]
            .get_or_insert_with(|| NodeBuilder::new(region.node));
        builder.add_zone(region.kind, region.range);
    }

    let mut nodes = NODES.lock();
    for (id, builder) in builders.into_iter().enumerate() {
        if let Some(builder) = builder {
            nodes[id] = builder.build();
            TOTAL_FREE.fetch_add(nodes[id].free_pages_count(), Ordering::Relaxed);
        }
    }
    node::finalize_distances(&mut nodes);
}

pub fn total_free_pages() -> usize {
    NODES
        .lock()
        .iter()
        .map(|n| if n.is_present() { n.free_pages_count() } else { 0 })
        .sum()
}

/// A refcounted handle to a contiguous run of `2^order` physical pages.
/// Cloning bumps the shared refcount; dropping the last handle returns
/// the block to its zone. This is the folio type the rest of the mm core
/// (SLUB slab pages, vm_object pages) is built on.
pub struct BuddyFolio(PagePtr);

impl Clone for BuddyFolio {
    fn clone(&self) -> Self {
        self.0.refcount().fetch_add(1, Ordering::Relaxed);
        Self(self.0)
    }
}

impl Drop for BuddyFolio {
    fn drop(&mut self) {
        if self.0.refcount().fetch_sub(1, Ordering::AcqRel) == 1 {
            free_page_block(self.0);
        }
    }
}

impl FolioTrait for BuddyFolio {
    fn pfn(&self) -> PFN {
        self.0.pfn()
    }

    fn order(&self) -> u32 {
        self.0.order()
    }
}

impl BuddyFolio {
    /// # Safety
    /// `page` must be a present, exclusively-owned block not already
    /// tracked by another `BuddyFolio`.
    pub unsafe fn from_raw(page: PagePtr) -> Self {
        Self(page)
    }

    pub fn as_raw(&self) -> PagePtr {
        self.0
    }
}

/// Present node ids ordered by NUMA distance from `node`, nearest first.
/// Exposed so other mm-core crates built on top of this one (the slab
/// allocator's partial-list search, in particular) can follow the same
/// locality order as the page allocator's own PCP refill path without
/// reaching into its private node table.
pub fn nodes_by_distance_from(node: u8) -> [u8; MAX_NODES] {
    node::nodes_by_distance(&NODES.lock(), node)
}

fn pick_zone(node: u8, order: u32) -> Option<(&'static Spin<Zone>, u8, ZoneKind)> {
    let nodes = NODES.lock();
    for candidate in node::nodes_by_distance(&nodes, node) {
        let n = &nodes[candidate as usize];
        if !n.is_present() {
            continue;
        }
        for kind in [ZoneKind::Normal, ZoneKind::Dma32, ZoneKind::Dma] {
            if let Some(zone) = n.zone(kind) {
                if order <= MAX_ORDER
                    && zone.lock().max_free_order().is_some_and(|o| o >= order)
                {
                    // SAFETY: `zone` outlives `'static` (it lives in the
                    // `NODES` static forever once built).
                    let zone: &'static Spin<Zone> =
                        unsafe { &*(zone as *const Spin<Zone>) };
                    return Some((zone, candidate, kind));
                }
            }
        }
    }
    None
}

pub fn alloc_pages_on(node: u8, order: u32, migrate_type: MigrateType) -> Option<BuddyFolio> {
    if order == 0 {
        // Try the PCP fast path against the local node's normal zone first.
        if let Some((zone, found_node, kind)) = pick_zone(node, 0) {
            if let Some(page) = pcp::alloc_one(zone, found_node, kind) {
                page.refcount().fetch_add(1, Ordering::Relaxed);
                page.descriptor().flags().clear(PageFlags::FREE);
                page.descriptor().set_migrate_type(migrate_type);
                TOTAL_FREE.fetch_sub(1, Ordering::Relaxed);
                return Some(unsafe { BuddyFolio::from_raw(page) });
            }
        }
    }

    let (zone, _, _) = pick_zone(node, order)?;
    let page = zone.lock().get_free_pages(order, migrate_type)?;
    page.refcount().fetch_add(1, Ordering::Relaxed);
    TOTAL_FREE.fetch_sub(1usize << order, Ordering::Relaxed);
    Some(unsafe { BuddyFolio::from_raw(page) })
}

pub fn alloc_pages(order: u32, migrate_type: MigrateType) -> Option<BuddyFolio> {
    alloc_pages_on(0, order, migrate_type)
}

fn free_page_block(page: PagePtr) {
    let node = page.descriptor().node();
    let kind = ZoneKind::from_index(page.descriptor().zone_kind_raw());
    let order = page.descriptor().order_raw();

    let nodes = NODES.lock();
    let zone = nodes[node as usize]
        .zone(kind)
        .expect("page's recorded zone must exist");
    // SAFETY: zones live forever once built.
    let zone: &'static Spin<Zone> = unsafe { &*(zone as *const Spin<Zone>) };
    drop(nodes);

    TOTAL_FREE.fetch_add(1usize << order, Ordering::Relaxed);

    if order == 0 {
        pcp::free_one(zone, node, kind, page);
    } else {
        zone.lock().free_pages(page);
    }
}

impl ZoneKind {
    pub(crate) fn from_index(idx: u8) -> Self {
        match idx {
            0 => ZoneKind::Dma,
            1 => ZoneKind::Dma32,
            _ => ZoneKind::Normal,
        }
    }
}

/// Global handle implementing [`FrameAlloc`]/[`GlobalFrameAlloc`] so that
/// generic code elsewhere in the mm core (SLUB slab pages, vmalloc
/// backing pages) can allocate folios without depending on this crate's
/// concrete API.
#[derive(Clone, Copy)]
pub struct GlobalBuddyAlloc;

impl FrameAlloc for GlobalBuddyAlloc {
    type Folio = BuddyFolio;

    fn alloc_order(&self, order: u32) -> Option<Self::Folio> {
        alloc_pages(order, MigrateType::Unmovable)
    }
}

impl GlobalFrameAlloc for GlobalBuddyAlloc {
    const GLOBAL: Self = GlobalBuddyAlloc;
}

pub fn page_at(pfn: PFN) -> Option<PagePtr> {
    if page_array::contains(pfn) {
        Some(PagePtr::from(pfn))
    } else {
        None
    }
}

pub fn paddr_to_pfn(addr: PAddr) -> PFN {
    PFN::from(addr.floor())
}

pub const fn page_size_bits() -> u32 {
    PAGE_SIZE_BITS
}

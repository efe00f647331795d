use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use eonix_mm::paging::{PFN, RawPage};
use intrusive_list::Link;

bitflags::bitflags! {
    /// Per-page state. Mirrors the field names a reader of `struct page` in
    /// any buddy/SLUB-style allocator would expect; only the subset this
    /// core actually sets is used outside this crate.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFlags: u32 {
        const PRESENT        = 1 << 0;
        const BUDDY          = 1 << 1;
        const SLAB           = 1 << 2;
        const HEAD           = 1 << 3;
        const TAIL           = 1 << 4;
        const RESERVED       = 1 << 5;
        const LOCKED         = 1 << 6;
        const DIRTY          = 1 << 7;
        const LRU_ACTIVE     = 1 << 8;
        const LRU_UNEVICTABLE = 1 << 9;
        const WRITEBACK      = 1 << 10;
        const LOCAL          = 1 << 11;
        const FREE           = 1 << 12;
        const POISONED       = 1 << 13;
    }
}

/// Atomically-accessed [`PageFlags`], matching the `flags().has()/set()/clear()`
/// call shape the buddy and SLUB code both use on the fast paths.
#[derive(Debug, Default)]
pub struct AtomicPageFlags(AtomicU32);

impl AtomicPageFlags {
    pub const fn new(flags: PageFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    pub fn get(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub fn has(&self, flags: PageFlags) -> bool {
        self.get().contains(flags)
    }

    pub fn set(&self, flags: PageFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, flags: PageFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// Movability class used to group pages so that unmovable long-lived
/// allocations (page tables, slab pages) don't get scattered across the
/// same pageblocks as movable, reclaimable user memory, which would defeat
/// defragmentation and transparent-huge-page compaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MigrateType {
    Unmovable = 0,
    Reclaimable = 1,
    Movable = 2,
}

impl MigrateType {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        self as u8 as usize
    }

    pub const fn from_index(idx: usize) -> Self {
        match idx {
            0 => MigrateType::Unmovable,
            1 => MigrateType::Reclaimable,
            _ => MigrateType::Movable,
        }
    }

    /// Fallback search order when the requested migrate type's free lists
    /// are exhausted at every order, worst fit last (steal from `Movable`
    /// before stealing from `Unmovable`, since movable pages can be
    /// migrated back out later and unmovable ones can't).
    pub const fn fallback_order(self) -> [MigrateType; 3] {
        match self {
            MigrateType::Unmovable => [
                MigrateType::Unmovable,
                MigrateType::Reclaimable,
                MigrateType::Movable,
            ],
            MigrateType::Reclaimable => [
                MigrateType::Reclaimable,
                MigrateType::Movable,
                MigrateType::Unmovable,
            ],
            MigrateType::Movable => [
                MigrateType::Movable,
                MigrateType::Reclaimable,
                MigrateType::Unmovable,
            ],
        }
    }
}

/// The per-page metadata the buddy allocator and everything built on top
/// of it (SLUB, vm_object page cache) keys off of. Indexed by PFN inside
/// a single flat array allocated once at boot; never moved or resized.
pub struct PageDescriptor {
    pub(crate) link: Link,
    order: AtomicU32,
    refcount: AtomicUsize,
    flags: AtomicPageFlags,
    migrate_type: AtomicU8,
    node: AtomicU8,
    zone_kind: AtomicU8,
}

unsafe impl Send for PageDescriptor {}
unsafe impl Sync for PageDescriptor {}

impl PageDescriptor {
    pub const fn new() -> Self {
        Self {
            link: Link::new(),
            order: AtomicU32::new(0),
            refcount: AtomicUsize::new(0),
            flags: AtomicPageFlags::new(PageFlags::empty()),
            migrate_type: AtomicU8::new(MigrateType::Movable as u8),
            node: AtomicU8::new(0),
            zone_kind: AtomicU8::new(0),
        }
    }

    pub fn flags(&self) -> &AtomicPageFlags {
        &self.flags
    }

    pub fn order_raw(&self) -> u32 {
        self.order.load(Ordering::Relaxed)
    }

    pub fn set_order(&self, order: u32) {
        self.order.store(order, Ordering::Relaxed);
    }

    pub fn migrate_type(&self) -> MigrateType {
        MigrateType::from_index(self.migrate_type.load(Ordering::Relaxed) as usize)
    }

    pub fn set_migrate_type(&self, mt: MigrateType) {
        self.migrate_type.store(mt as u8, Ordering::Relaxed);
    }

    pub fn node(&self) -> u8 {
        self.node.load(Ordering::Relaxed)
    }

    pub fn set_node(&self, node: u8) {
        self.node.store(node, Ordering::Relaxed);
    }

    pub fn zone_kind_raw(&self) -> u8 {
        self.zone_kind.load(Ordering::Relaxed)
    }

    pub fn set_zone_kind(&self, kind: u8) {
        self.zone_kind.store(kind, Ordering::Relaxed);
    }
}

/// A `Copy` handle to a [`PageDescriptor`], addressed by PFN. All state
/// lives in the global page array; this type is the "pointer" into it,
/// mirroring the donor's `RawPagePtr` / `UnmanagedRawPage` shape.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PagePtr(PFN);

impl From<PFN> for PagePtr {
    fn from(pfn: PFN) -> Self {
        Self(pfn)
    }
}

impl From<PagePtr> for PFN {
    fn from(ptr: PagePtr) -> Self {
        ptr.0
    }
}

impl PagePtr {
    pub fn pfn(&self) -> PFN {
        self.0
    }

    pub fn descriptor(&self) -> &'static PageDescriptor {
        crate::page_array::get(self.0)
    }

    pub fn offset(&self, pages: usize) -> Self {
        Self(self.0 + pages)
    }

    /// # Safety
    /// The link pointed to must belong to this crate's global page array.
    pub unsafe fn from_link(link: &Link) -> Self {
        let descriptor = unsafe { intrusive_list::container_of!(link, PageDescriptor, link) };
        crate::page_array::ptr_from_descriptor(descriptor.as_ptr())
    }
}

impl RawPage for PagePtr {
    fn order(&self) -> u32 {
        self.descriptor().order_raw()
    }

    fn refcount(&self) -> &AtomicUsize {
        &self.descriptor().refcount
    }

    fn is_present(&self) -> bool {
        self.descriptor().flags().has(PageFlags::PRESENT)
    }
}

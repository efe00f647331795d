use core::sync::atomic::{AtomicUsize, Ordering};

use eonix_mm::address::{AddrOps as _, PAddr, PRange};
use eonix_mm::paging::PFN;

use crate::free_area::FreeArea;
use crate::page::{MigrateType, PageFlags, PagePtr};

/// Number of buddy orders tracked per migrate type, order 0..=10 inclusive.
pub const ORDER_COUNT: usize = 11;
pub const MAX_ORDER: u32 = ORDER_COUNT as u32 - 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ZoneKind {
    Dma,
    Dma32,
    Normal,
}

impl ZoneKind {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        self as u8 as usize
    }
}

trait PFNBuddyOps {
    fn buddy_pfn(self, order: u32) -> PFN;
    fn combined_pfn(self, buddy: PFN) -> PFN;
}

impl PFNBuddyOps for PFN {
    fn buddy_pfn(self, order: u32) -> PFN {
        PFN::from(usize::from(self) ^ (1 << order))
    }

    fn combined_pfn(self, buddy: PFN) -> PFN {
        PFN::from(usize::from(self) & usize::from(buddy))
    }
}

/// Watermarks a zone is checked against before an allocation is let
/// through without kicking off reclaim.
#[derive(Clone, Copy, Debug)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn from_total(total_pages: usize) -> Self {
        // A conservative, Linux-flavored split: min ~= 1/256 of the zone,
        // low 25% above min, high 50% above min.
        let min = (total_pages / 256).max(16);
        Self {
            min,
            low: min + min / 4,
            high: min + min / 2,
        }
    }
}

pub enum Watermark {
    Min,
    Low,
    High,
}

/// One physically-contiguous region of one NUMA node's address space,
/// grouped by the DMA/DMA32/Normal split every general-purpose buddy
/// allocator makes so that drivers which can only address 24/32 bits of
/// physical memory have somewhere to allocate from.
///
/// Grounded on `crates/buddy_allocator/src/zone.rs`'s single-migrate-type
/// `Zone<AREAS>` (buddy split/merge/`buddy_check`/`create_pages`); widened
/// to a `[FreeArea; ORDER_COUNT]` per migrate type plus watermark state.
pub struct Zone {
    kind: ZoneKind,
    node: u8,
    range: PRange,
    free_areas: [[FreeArea; ORDER_COUNT]; MigrateType::COUNT],
    free_count: AtomicUsize,
    watermarks: Watermarks,
}

impl Zone {
    pub fn new(kind: ZoneKind, node: u8, range: PRange) -> Self {
        let total_pages = range.len() >> eonix_mm::paging::PAGE_SIZE_BITS;
        Self {
            kind,
            node,
            range,
            free_areas: core::array::from_fn(|mt| {
                let migrate_type = MigrateType::from_index(mt);
                core::array::from_fn(|_| FreeArea::new(migrate_type))
            }),
            free_count: AtomicUsize::new(0),
            watermarks: Watermarks::from_total(total_pages),
        }
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn contains_prange(&self, range: PRange) -> bool {
        self.range.start() <= range.start() && range.end() <= self.range.end()
    }

    pub fn free_pages_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    pub fn above_watermark(&self, wm: Watermark) -> bool {
        let threshold = match wm {
            Watermark::Min => self.watermarks.min,
            Watermark::Low => self.watermarks.low,
            Watermark::High => self.watermarks.high,
        };
        self.free_pages_count() >= threshold
    }

    /// Highest order with at least one free block of any migrate type;
    /// used as a coalescing/fragmentation hint by callers deciding whether
    /// to attempt compaction before giving up.
    pub fn max_free_order(&self) -> Option<u32> {
        (0..ORDER_COUNT as u32)
            .rev()
            .find(|&order| {
                self.free_areas
                    .iter()
                    .any(|areas| !areas[order as usize].is_empty())
            })
    }

    /// Allocate a block of exactly `order`, preferring `migrate_type`'s own
    /// free lists and falling back to its fallback order (see
    /// [`MigrateType::fallback_order`]) only once the preferred type is
    /// exhausted at every order >= `order`.
    pub fn get_free_pages(&mut self, order: u32, migrate_type: MigrateType) -> Option<PagePtr> {
        for &mt in migrate_type.fallback_order().iter() {
            if let Some(page) = self.get_free_pages_of_type(order, mt) {
                return Some(page);
            }
        }
        None
    }

    fn get_free_pages_of_type(&mut self, order: u32, mt: MigrateType) -> Option<PagePtr> {
        for current_order in order..ORDER_COUNT as u32 {
            let area = &mut self.free_areas[mt.index()][current_order as usize];
            let Some(page) = area.get_free_page() else {
                continue;
            };

            page.descriptor().set_order(order);
            self.free_count
                .fetch_sub(1usize << current_order, Ordering::Relaxed);

            if current_order > order {
                self.expand(page, current_order, order, mt);
            }

            debug_assert!(page.descriptor().flags().has(PageFlags::PRESENT));
            debug_assert!(!page.descriptor().flags().has(PageFlags::FREE));

            return Some(page);
        }
        None
    }

    fn expand(&mut self, page: PagePtr, order: u32, target_order: u32, mt: MigrateType) {
        let mut offset = 1usize << order;

        for order in (target_order..order).rev() {
            offset >>= 1;
            let split_page = page.offset(offset);
            split_page.descriptor().set_order(order);
            split_page.descriptor().flags().set(PageFlags::BUDDY);
            self.free_areas[mt.index()][order as usize].add_page(split_page);
            self.free_count.fetch_add(1usize << order, Ordering::Relaxed);
        }
    }

    /// Return a block to the zone, coalescing with its buddy as long as
    /// the buddy is free, present, of the same order, and not pinned to a
    /// `LOCAL` (per-CPU cached) state.
    pub fn free_pages(&mut self, mut page: PagePtr) {
        debug_assert_eq!(page.descriptor().refcount().load(Ordering::Relaxed), 0);

        let mt = page.descriptor().migrate_type();
        let mut pfn = page.pfn();
        let mut current_order = page.descriptor().order_raw();
        self.free_count
            .fetch_add(1usize << current_order, Ordering::Relaxed);

        while current_order < MAX_ORDER {
            let buddy_pfn = pfn.buddy_pfn(current_order);
            let buddy_addr = PAddr::from(buddy_pfn);
            if !(self.range.start() <= buddy_addr && buddy_addr < self.range.end()) {
                break;
            }
            let buddy_page: PagePtr = buddy_pfn.into();

            if !self.buddy_check(buddy_page, current_order) {
                break;
            }

            page.descriptor().flags().clear(PageFlags::BUDDY);
            buddy_page.descriptor().flags().clear(PageFlags::BUDDY);
            self.free_areas[buddy_page.descriptor().migrate_type().index()][current_order as usize]
                .del_page(buddy_page);

            let combined_pfn = pfn.combined_pfn(buddy_pfn);
            page = combined_pfn.into();
            pfn = combined_pfn;

            page.descriptor().flags().set(PageFlags::BUDDY);
            current_order += 1;
        }

        page.descriptor().set_order(current_order);
        self.free_areas[mt.index()][current_order as usize].add_page(page);
    }

    fn buddy_check(&self, page: PagePtr, order: u32) -> bool {
        let descriptor = page.descriptor();
        if !descriptor.flags().has(PageFlags::PRESENT) {
            return false;
        }
        if !descriptor.flags().has(PageFlags::FREE) {
            return false;
        }
        if descriptor.flags().has(PageFlags::LOCAL) {
            return false;
        }
        if descriptor.order_raw() != order {
            return false;
        }
        debug_assert_eq!(descriptor.refcount().load(Ordering::Relaxed), 0);
        true
    }

    /// Only used while building the zone's initial free lists at boot.
    pub fn create_pages(&mut self, start: PAddr, end: PAddr, mt: MigrateType) {
        let mut start_pfn = PFN::from(start.ceil());
        let end_pfn = PFN::from(end.floor());

        while start_pfn < end_pfn {
            let mut order = usize::from(start_pfn)
                .trailing_zeros()
                .min(MAX_ORDER);

            while usize::from(start_pfn) + (1usize << order) > usize::from(end_pfn) {
                order -= 1;
            }

            let page: PagePtr = start_pfn.into();
            page.descriptor().flags().set(PageFlags::PRESENT | PageFlags::BUDDY);
            page.descriptor().set_order(order);
            page.descriptor().set_node(self.node);
            page.descriptor().set_zone_kind(self.kind.index() as u8);
            self.free_areas[mt.index()][order as usize].add_page(page);
            self.free_count.fetch_add(1usize << order, Ordering::Relaxed);

            start_pfn = start_pfn + (1usize << order);
        }
    }
}

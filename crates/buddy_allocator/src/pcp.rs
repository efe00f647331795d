//! Per-CPU page cache (PCP): a small per-CPU stack of already-split
//! order-0 pages per zone, so the common "give me one page" / "free one
//! page" path never has to take the zone spinlock.
//!
//! Grounded on `src/kernel/mem/page_alloc.rs`'s `PerCpuPageAlloc`
//! batch-refill/drain design (deleted along with the rest of the legacy
//! `src/kernel` tree, but its shape — a capped per-CPU freelist refilled
//! and drained in `PCP_BATCH`-sized chunks — is the direct model here),
//! implemented on top of `eonix_percpu` the way `eonix_preempt`'s own
//! `PREEMPT_COUNT` percpu cell is implemented.

use eonix_mm::paging::PFN;

use crate::node::MAX_NODES;
use crate::page::PagePtr;
use crate::zone::{Zone, ZoneKind};

pub const PCP_BATCH: usize = 64;
pub const PCP_HIGH: usize = 6 * PCP_BATCH;

const MAX_ZONES: usize = MAX_NODES * ZoneKind::COUNT;

fn zone_index(node: u8, kind: ZoneKind) -> usize {
    node as usize * ZoneKind::COUNT + kind.index()
}

struct PerCpuBin {
    count: usize,
    pfns: [usize; PCP_HIGH],
}

impl PerCpuBin {
    const fn empty() -> Self {
        Self {
            count: 0,
            pfns: [0; PCP_HIGH],
        }
    }
}

struct PerCpuPages {
    bins: [PerCpuBin; MAX_ZONES],
}

impl PerCpuPages {
    const fn new() -> Self {
        Self {
            bins: [const { PerCpuBin::empty() }; MAX_ZONES],
        }
    }
}

#[eonix_percpu::define_percpu]
static PCP: PerCpuPages = PerCpuPages::new();

/// Take one page from the per-CPU cache for `(node, kind)`, refilling from
/// the backing zone in batches of [`PCP_BATCH`] if the cache is empty.
pub fn alloc_one(zone: &eonix_sync::Spin<Zone>, node: u8, kind: ZoneKind) -> Option<PagePtr> {
    eonix_preempt::disable();
    let idx = zone_index(node, kind);
    let pcp = unsafe { PCP.as_mut() };
    let bin = &mut pcp.bins[idx];

    if bin.count == 0 {
        let mut z = zone.lock();
        for _ in 0..PCP_BATCH {
            let Some(page) = z.get_free_pages(0, crate::page::MigrateType::Movable) else {
                break;
            };
            if bin.count >= PCP_HIGH {
                z.free_pages(page);
                break;
            }
            bin.pfns[bin.count] = usize::from(page.pfn());
            bin.count += 1;
        }
    }

    let page = if bin.count > 0 {
        bin.count -= 1;
        Some(PagePtr::from(PFN::from(bin.pfns[bin.count])))
    } else {
        None
    };

    eonix_preempt::enable();
    page
}

/// Return a page to the per-CPU cache, draining half of it back to the
/// zone once the cache exceeds [`PCP_HIGH`].
pub fn free_one(zone: &eonix_sync::Spin<Zone>, node: u8, kind: ZoneKind, page: PagePtr) {
    eonix_preempt::disable();
    let idx = zone_index(node, kind);
    let pcp = unsafe { PCP.as_mut() };
    let bin = &mut pcp.bins[idx];

    if bin.count >= PCP_HIGH {
        let mut z = zone.lock();
        while bin.count > PCP_HIGH - PCP_BATCH {
            bin.count -= 1;
            z.free_pages(PagePtr::from(PFN::from(bin.pfns[bin.count])));
        }
    }

    bin.pfns[bin.count] = usize::from(page.pfn());
    bin.count += 1;
    eonix_preempt::enable();
}

pub fn drain_all(zone: &eonix_sync::Spin<Zone>, node: u8, kind: ZoneKind) {
    eonix_preempt::disable();
    let idx = zone_index(node, kind);
    let pcp = unsafe { PCP.as_mut() };
    let bin = &mut pcp.bins[idx];

    let mut z = zone.lock();
    while bin.count > 0 {
        bin.count -= 1;
        z.free_pages(PagePtr::from(PFN::from(bin.pfns[bin.count])));
    }
    drop(z);
    eonix_preempt::enable();
}

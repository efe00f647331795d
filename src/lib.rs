#![cfg_attr(not(test), no_std)]

//! The mm core: physical buddy allocator, SLUB-flavored kmalloc heap, and
//! (as the remaining modules land) the vm_object/fault-handling subsystem
//! that sits on top of them. Built as a library an embedding kernel links
//! against and drives through [`collaborators::Collaborators`], not a
//! bootable binary in its own right.

extern crate alloc;

pub mod collaborators;
pub mod error;
pub mod fault;
pub mod kref;
pub mod sync;
pub mod vm_object;
pub mod vma;
pub mod vmalloc;
pub mod workqueue;

pub use buddy_allocator;
pub use eonix_log;
pub use slab_allocator;

use eonix_mm::address::VRange;
use eonix_mm::paging::PFN;

/// One physically-contiguous region of genuinely free memory, as reported
/// by the embedding kernel's boot protocol.
pub struct ZoneRegion {
    pub node: u8,
    pub kind: buddy_allocator::ZoneKind,
    pub range: eonix_mm::address::PRange,
}

/// Bring the whole mm core up: the buddy allocator first (so the slab
/// metadata array and every slab page it ever hands out have somewhere to
/// come from), then the kmalloc heap on top of it.
///
/// # Safety
/// Must run exactly once at boot, single-threaded, before any other call
/// into this crate. `regions` must describe genuinely free, non-
/// overlapping physical memory; `secret_seed` should come from a boot-time
/// entropy source.
pub unsafe fn init(
    regions: &[ZoneRegion],
    slab_base_pfn: PFN,
    slab_len: usize,
    secret_seed: usize,
    slab_access: &'static dyn slab_allocator::SlabPageAccess,
    collaborators: &'static dyn collaborators::Collaborators,
    bump: &impl buddy_allocator::BumpAllocator,
    vmalloc_range: VRange,
    kernel_mm: collaborators::MmHandle,
) {
    let buddy_regions: alloc::vec::Vec<buddy_allocator::ZoneRegion> = regions
        .iter()
        .map(|r| buddy_allocator::ZoneRegion {
            node: r.node,
            kind: r.kind,
            range: r.range,
        })
        .collect();

    unsafe {
        buddy_allocator::init(&buddy_regions, bump);
        slab_allocator::init(slab_access, collaborators::rcu_bridge(), secret_seed, slab_base_pfn, slab_len, bump);
        collaborators::init(collaborators, slab_access);
    }
    vmalloc::init(vmalloc_range, kernel_mm);
}

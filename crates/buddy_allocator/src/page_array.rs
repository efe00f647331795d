//! The flat `PageDescriptor` table, indexed by PFN.
//!
//! Allocated once out of the boot bump allocator (see
//! `crate::collaborators_shim`/`eonix_mm_core::collaborators::BumpAllocator`)
//! and never moved afterwards, so handing out `&'static PageDescriptor`s is
//! sound without any further synchronization on the table shape itself —
//! only the per-descriptor fields are mutated concurrently.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use eonix_mm::paging::PFN;

use crate::page::{PageDescriptor, PagePtr};

static BASE: AtomicUsize = AtomicUsize::new(0);
static BASE_PFN: AtomicUsize = AtomicUsize::new(0);
static LEN: AtomicUsize = AtomicUsize::new(0);
static READY: AtomicBool = AtomicBool::new(false);

/// # Safety
/// `base` must point to `len` zero-or-properly-initialized, live-forever
/// `PageDescriptor`s, and must be called exactly once before any other
/// function in this module is used.
pub unsafe fn init(base: NonNull<PageDescriptor>, base_pfn: PFN, len: usize) {
    BASE.store(base.as_ptr() as usize, Ordering::Relaxed);
    BASE_PFN.store(usize::from(base_pfn), Ordering::Relaxed);
    LEN.store(len, Ordering::Relaxed);
    READY.store(true, Ordering::Release);
}

pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}

fn index_of(pfn: PFN) -> usize {
    debug_assert!(is_ready(), "page array used before init()");
    let idx = usize::from(pfn) - BASE_PFN.load(Ordering::Relaxed);
    debug_assert!(idx < LEN.load(Ordering::Relaxed), "pfn out of range");
    idx
}

pub fn get(pfn: PFN) -> &'static PageDescriptor {
    let base = BASE.load(Ordering::Relaxed) as *const PageDescriptor;
    let idx = index_of(pfn);
    unsafe { &*base.add(idx) }
}

pub fn contains(pfn: PFN) -> bool {
    if !is_ready() {
        return false;
    }
    let base_pfn = BASE_PFN.load(Ordering::Relaxed);
    let pfn = usize::from(pfn);
    pfn >= base_pfn && pfn - base_pfn < LEN.load(Ordering::Relaxed)
}

pub(crate) fn ptr_from_descriptor(descriptor: *const PageDescriptor) -> PagePtr {
    let base = BASE.load(Ordering::Relaxed) as *const PageDescriptor;
    let idx = unsafe { descriptor.offset_from(base) } as usize;
    PFN::from(BASE_PFN.load(Ordering::Relaxed) + idx).into()
}

pub fn len() -> usize {
    LEN.load(Ordering::Relaxed)
}

pub fn base_pfn() -> PFN {
    PFN::from(BASE_PFN.load(Ordering::Relaxed))
}

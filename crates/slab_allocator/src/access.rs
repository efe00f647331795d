//! The one thing this crate cannot derive on its own: a kernel-virtual
//! pointer to a physical page's contents. `eonix_mm::paging::PageAccess`
//! is the natural trait for this but requires `Clone`, which isn't
//! object-safe, and every cache here needs to share a single
//! dynamically-dispatched implementation set up once at boot. So this
//! crate declares its own narrow, object-safe equivalent and takes it as
//! a `&'static dyn` handed in by whoever owns the kernel's direct physical
//! map (the root crate's collaborators module).

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use eonix_mm::address::PAddr;
use eonix_mm::paging::PFN;

pub trait SlabPageAccess: Send + Sync {
    /// # Safety
    /// `pfn` must name a physical page this crate has been told is usable
    /// slab backing memory.
    unsafe fn get_ptr_for_pfn(&self, pfn: PFN) -> NonNull<u8>;

    fn phys_for_ptr(&self, ptr: NonNull<u8>) -> PAddr;
}

static mut ACCESS: Option<&'static dyn SlabPageAccess> = None;
static READY: AtomicBool = AtomicBool::new(false);

/// # Safety
/// Must be called exactly once, before any cache is used.
pub unsafe fn init(access: &'static dyn SlabPageAccess) {
    unsafe { ACCESS = Some(access) };
    READY.store(true, Ordering::Release);
}

pub(crate) fn access() -> &'static dyn SlabPageAccess {
    debug_assert!(READY.load(Ordering::Acquire), "slab_allocator used before access::init()");
    unsafe { ACCESS.expect("slab_allocator used before access::init()") }
}

pub(crate) fn ptr_to_pfn(ptr: NonNull<u8>) -> PFN {
    PFN::from(access().phys_for_ptr(ptr))
}

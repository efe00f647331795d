//! This crate has no notion of a grace period of its own: a
//! `TypesafeByRCU` cache's empty-slab release has to wait for every CPU
//! to pass through a quiescent state before the page goes back to the
//! buddy allocator, and only the embedding kernel knows when that's
//! happened. Same shape as [`crate::access::SlabPageAccess`]: a narrow,
//! object-safe trait installed once at boot and reached through
//! [`access`].

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

pub trait RcuDomain: Send + Sync {
    /// Queue `callback` to run once every CPU has passed through a
    /// quiescent state at least once after this call. `move_to_empty`
    /// calls this while holding a slab page's own state lock, so
    /// registering the callback must not itself block.
    fn call_rcu(&self, callback: Box<dyn FnOnce() + Send>);
}

static mut DOMAIN: Option<&'static dyn RcuDomain> = None;
static READY: AtomicBool = AtomicBool::new(false);

/// # Safety
/// Must be called exactly once, before any `TypesafeByRCU` cache frees
/// its first empty slab.
pub unsafe fn init(domain: &'static dyn RcuDomain) {
    unsafe { DOMAIN = Some(domain) };
    READY.store(true, Ordering::Release);
}

pub(crate) fn access() -> &'static dyn RcuDomain {
    debug_assert!(READY.load(Ordering::Acquire), "slab_allocator used before rcu::init()");
    unsafe { DOMAIN.expect("slab_allocator used before rcu::init()") }
}

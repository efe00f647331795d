#![no_std]

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(target_arch = "x86_64")]
pub use eonix_percpu_macros::define_percpu_x86_64 as define_percpu;

#[cfg(target_arch = "x86_64")]
pub use eonix_percpu_macros::define_percpu_shared_x86_64 as define_percpu_shared;

const MAX_CPUS: usize = 256;

#[allow(clippy::declare_interior_mutable_const)]
const NULL_BASE: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());

static PERCPU_BASES: [AtomicPtr<u8>; MAX_CPUS] = [NULL_BASE; MAX_CPUS];
static PERCPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Registry of per-CPU area base addresses, indexed by CPU id.
///
/// Populated once per CPU at SMP bring-up by the embedding kernel; every
/// `#[define_percpu_shared]` accessor consults it to reach another CPU's
/// copy of a shared percpu variable.
pub struct PercpuArea;

impl PercpuArea {
    /// # Safety
    /// `base` must point to a valid, live per-CPU data area for `cpu_id`
    /// that outlives every subsequent `get_for` call.
    pub unsafe fn register(cpu_id: usize, base: NonNull<u8>) {
        PERCPU_BASES[cpu_id].store(base.as_ptr(), Ordering::Release);
        PERCPU_COUNT.fetch_max(cpu_id + 1, Ordering::AcqRel);
    }

    pub fn get_for(cpu_id: usize) -> Option<NonNull<u8>> {
        if cpu_id >= PERCPU_COUNT.load(Ordering::Acquire) {
            return None;
        }

        NonNull::new(PERCPU_BASES[cpu_id].load(Ordering::Acquire))
    }
}

//! XOR obfuscation of intrusive freelist pointers, so that a heap overflow
//! that lets an attacker write an arbitrary "next" pointer into a freed
//! object has to also know `slab_secret()` to redirect the freelist
//! anywhere useful (the classic SLUB/`CONFIG_SLAB_FREELIST_HARDENED`
//! mitigation).

use core::sync::atomic::{AtomicUsize, Ordering};

static SECRET: AtomicUsize = AtomicUsize::new(0);

/// # Safety
/// Must be called exactly once at boot, before any cache is used, with a
/// value that is not attacker-predictable (derived from e.g. an RDRAND
/// boot seed by the caller).
pub unsafe fn init(seed: usize) {
    SECRET.store(seed | 1, Ordering::Relaxed);
}

fn secret() -> usize {
    let s = SECRET.load(Ordering::Relaxed);
    debug_assert_ne!(s, 0, "slab freelist secret used before init()");
    s
}

/// Encode a "next free object" pointer for storage inside a free object,
/// folding in the storage slot's own address the way SLUB's
/// `freelist_ptr_decode`/`encode` do, so copying an encoded pointer to a
/// different slot also breaks it.
pub fn encode(next: usize, slot_addr: usize) -> usize {
    next ^ secret() ^ slot_addr
}

pub fn decode(encoded: usize, slot_addr: usize) -> usize {
    encoded ^ secret() ^ slot_addr
}

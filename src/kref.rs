//! A bare reference count with no opinion on what it's attached to or how
//! the attached object gets torn down, for the handful of places in this
//! core that want shared ownership without `Arc`'s own drop glue (a
//! `TypesafeByRCU` slab page, in particular, needs the count to hit zero
//! and the actual free to happen at two different times, separated by a
//! grace period). Mirrors the refcount half of
//! [`buddy_allocator::BuddyFolio`]'s `Clone`/`Drop` pair, minus the part
//! that knows what to do when it reaches zero.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Starts at 1. `get` bumps the count; `put` drops it and tells the
/// caller whether this was the last reference, since a bare `Kref` has no
/// release callback of its own to call: it doesn't know what it's
/// embedded in.
pub struct Kref {
    count: AtomicUsize,
}

impl Kref {
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    pub fn get(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "kref::get on an object with no references left");
    }

    /// Returns `true` exactly once, the time the count reaches zero. The
    /// caller is the one who knows what to tear down; this type never
    /// frees anything on its own.
    #[must_use = "on true the caller must release the object, or it leaks"]
    pub fn put(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Kref {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `put`, and calls `release` if that was the last reference. The
/// common case: most callers don't need the bare `bool` from `put`.
pub fn kref_put(kref: &Kref, release: impl FnOnce()) {
    if kref.put() {
        release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_and_put_reports_the_last_release() {
        let kref = Kref::new();
        assert_eq!(kref.count(), 1);
        assert!(kref.put());
    }

    #[test]
    fn get_keeps_the_object_alive_across_two_puts() {
        let kref = Kref::new();
        kref.get();
        assert_eq!(kref.count(), 2);
        assert!(!kref.put());
        assert!(kref.put());
    }

    #[test]
    fn kref_put_only_invokes_release_on_the_last_reference() {
        let kref = Kref::new();
        kref.get();
        let mut released = 0;
        kref_put(&kref, || released += 1);
        assert_eq!(released, 0);
        kref_put(&kref, || released += 1);
        assert_eq!(released, 1);
    }
}

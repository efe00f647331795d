//! Concurrency aliases for this core's own internal state (the VMA map's
//! mmap lock, a vm_object's per-object lock, ...).
//!
//! There's no scheduler underneath this core to hand a blocked waiter off
//! to, so every wait strategy here is a busy spin
//! (`eonix_sync::rwlock::SpinWait`), not the donor's executor-tied `Yield`.

use eonix_sync::RwLockWait as Wait;

pub type RwLock<T> = eonix_sync::RwLock<T, eonix_sync::SpinWait>;

pub fn new_rwlock<T>(value: T) -> RwLock<T> {
    eonix_sync::RwLock::new(value, Wait::new())
}

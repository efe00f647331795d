#![no_std]

mod guard;
mod lazy_lock;
mod locked;
pub mod marker;
mod mutex;
mod rwlock;
mod spin;
mod wait_list;

pub use guard::{ForceUnlockableGuard, UnlockableGuard, UnlockedGuard};
pub use lazy_lock::LazyLock;
pub use locked::{AsProof, AsProofMut, Locked, Proof, ProofMut};
pub use mutex::{Mutex, MutexGuard, Wait as MutexWait};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard, SpinWait, Wait as RwLockWait};
pub use spin::{
    ContextUnlock, DisablePreemption, IrqContext, LoopRelax, NoContext, Relax, Spin, SpinContext,
    SpinGuard, SpinIrq, SpinRelax, UnlockedContext, UnlockedIrqContext, UnlockedSpinGuard,
};
pub use wait_list::{Prepare, WaitList};

use super::{ContextUnlock, Relax, Spin, SpinContext, SpinRelax, UnlockedContext};
use crate::{marker::NotSend, ForceUnlockableGuard, UnlockableGuard, UnlockedGuard};
use core::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

pub struct SpinGuard<'a, T, C, R = SpinRelax>
where
    T: ?Sized,
{
    pub(super) lock: &'a Spin<T, R>,
    pub(super) value: &'a mut T,
    pub(super) context: ManuallyDrop<C>,
    /// We don't want this to be `Send` because we don't want to allow the guard to be
    /// transferred to another thread since the lock's context (preemption/IRQ state) is
    /// tied to the local cpu.
    pub(super) _not_send: PhantomData<NotSend>,
}

pub struct UnlockedSpinGuard<'a, T, C, R>
where
    T: ?Sized,
{
    lock: &'a Spin<T, R>,
    context: C,
}

impl<'a, T, C, R> SpinGuard<'a, T, C, R>
where
    T: ?Sized,
{
    pub(super) fn new(lock: &'a Spin<T, R>, value: &'a mut T, context: C) -> Self {
        Self {
            lock,
            value,
            context: ManuallyDrop::new(context),
            _not_send: PhantomData,
        }
    }
}

// SAFETY: As long as the value protected by the lock is able to be shared between threads,
//         we can access the guard from multiple threads.
unsafe impl<T, C, R> Sync for SpinGuard<'_, T, C, R>
where
    T: ?Sized + Sync,
    C: Sync,
{
}

impl<T, C, R> Drop for SpinGuard<'_, T, C, R>
where
    T: ?Sized,
    C: SpinContext,
{
    fn drop(&mut self) {
        unsafe {
            // SAFETY: We are dropping the guard, so we are not holding the lock anymore.
            self.lock.do_unlock();

            // SAFETY: We are dropping the guard, so the context is never used again.
            ManuallyDrop::take(&mut self.context).restore();
        }
    }
}

impl<T, C, R> Deref for SpinGuard<'_, T, C, R>
where
    T: ?Sized,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We are holding the lock, so we can safely access the value.
        self.value
    }
}

impl<T, C, R> DerefMut for SpinGuard<'_, T, C, R>
where
    T: ?Sized,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We are holding the lock, so we can safely access the value.
        self.value
    }
}

impl<T, U, C, R> AsRef<U> for SpinGuard<'_, T, C, R>
where
    T: ?Sized,
    U: ?Sized,
    <Self as Deref>::Target: AsRef<U>,
{
    fn as_ref(&self) -> &U {
        self.deref().as_ref()
    }
}

impl<T, U, C, R> AsMut<U> for SpinGuard<'_, T, C, R>
where
    T: ?Sized,
    U: ?Sized,
    <Self as Deref>::Target: AsMut<U>,
{
    fn as_mut(&mut self) -> &mut U {
        self.deref_mut().as_mut()
    }
}

impl<'a, T, C, R> UnlockableGuard for SpinGuard<'a, T, C, R>
where
    T: ?Sized,
    C: ContextUnlock,
    R: Relax,
{
    type Unlocked = UnlockedSpinGuard<'a, T, C::Unlocked, R>;

    fn unlock(self) -> Self::Unlocked {
        let mut me = ManuallyDrop::new(self);
        unsafe {
            // SAFETY: No access is possible after unlocking.
            me.lock.do_unlock();
        }

        let context = unsafe {
            // SAFETY: `me` is going to be dropped so never used again.
            ManuallyDrop::take(&mut me.context)
        };

        UnlockedSpinGuard {
            lock: me.lock,
            context: context.unlock(),
        }
    }
}

// SAFETY: The guard is stateless so no more process needed.
unsafe impl<'a, T, C, R> UnlockedGuard for UnlockedSpinGuard<'a, T, C, R>
where
    T: ?Sized,
    C: UnlockedContext,
    R: Relax,
{
    type Guard = SpinGuard<'a, T, C::Relocked, R>;

    fn relock(self) -> Self::Guard {
        self.lock.lock_with_context(self.context.relock())
    }
}

impl<'a, T, C, R> ForceUnlockableGuard for SpinGuard<'a, T, C, R>
where
    T: ?Sized,
    R: Relax,
{
    unsafe fn force_unlock(&mut self) {
        unsafe {
            // SAFETY: The caller assures that the value is no longer accessed.
            self.lock.do_unlock();
        }

        // Context (e.g. IRQ state) is not restored.
    }

    unsafe fn force_relock(&mut self) {
        self.lock.do_lock();
    }
}

use super::Wait;
use crate::spin::{Relax, SpinRelax};
use core::{marker::PhantomData, sync::atomic::AtomicUsize, sync::atomic::Ordering};

/// A busy-spin [`Wait`] strategy: `*_wait` just spins `check` against `R::relax()`
/// until it goes true, and the waiting counts exist only so `has_write_waiting`
/// can make readers yield to a pending writer. There's no scheduler to hand
/// control to underneath this core, so this is the only `Wait` impl it needs.
#[derive(Debug, Default)]
pub struct SpinWait<R = SpinRelax> {
    writers_waiting: AtomicUsize,
    readers_waiting: AtomicUsize,
    _phantom: PhantomData<R>,
}

impl<R> Wait for SpinWait<R>
where
    R: Relax,
{
    fn new() -> Self {
        Self {
            writers_waiting: AtomicUsize::new(0),
            readers_waiting: AtomicUsize::new(0),
            _phantom: PhantomData,
        }
    }

    fn has_write_waiting(&self) -> bool {
        self.writers_waiting.load(Ordering::Acquire) != 0
    }

    fn has_read_waiting(&self) -> bool {
        self.readers_waiting.load(Ordering::Acquire) != 0
    }

    fn write_wait(&self, check: impl Fn() -> bool) {
        self.writers_waiting.fetch_add(1, Ordering::AcqRel);
        while !check() {
            R::relax();
        }
        self.writers_waiting.fetch_sub(1, Ordering::AcqRel);
    }

    fn read_wait(&self, check: impl Fn() -> bool) {
        self.readers_waiting.fetch_add(1, Ordering::AcqRel);
        while !check() {
            R::relax();
        }
        self.readers_waiting.fetch_sub(1, Ordering::AcqRel);
    }

    // Spinners re-check on their own; there's no waker to kick.
    fn write_notify(&self) {}
    fn read_notify(&self) {}
}

use super::{ContextUnlock, Relax, Spin, SpinContext, SpinGuard, UnlockedContext};
use core::arch::asm;

/// Saved `RFLAGS` from a `pushfq`/`cli` pair, restored on drop of the owning context.
///
/// Local interrupt masking is a CPU-local primitive the core manages itself; it is
/// never delegated through the collaborator boundary.
#[derive(Clone, Copy)]
pub struct IrqContext(u64);

pub struct UnlockedIrqContext(u64);

pub trait SpinIrq {
    type Value: ?Sized;
    type Relax;

    fn lock_irq(&self) -> SpinGuard<Self::Value, IrqContext, Self::Relax>;
}

#[inline(always)]
fn local_irq_disable_save() -> u64 {
    let flags: u64;
    unsafe {
        asm!("pushfq; pop {}; cli", out(reg) flags, options(nomem, preserves_flags));
    }
    flags
}

#[inline(always)]
fn local_irq_restore(flags: u64) {
    unsafe {
        asm!("push {}; popfq", in(reg) flags, options(nomem, preserves_flags));
    }
}

impl SpinContext for IrqContext {
    fn save() -> Self {
        IrqContext(local_irq_disable_save())
    }

    fn restore(self) {
        local_irq_restore(self.0);
    }
}

impl ContextUnlock for IrqContext {
    type Unlocked = UnlockedIrqContext;

    fn unlock(self) -> Self::Unlocked {
        UnlockedIrqContext(self.0)
    }
}

impl UnlockedContext for UnlockedIrqContext {
    type Relocked = IrqContext;

    fn relock(self) -> Self::Relocked {
        IrqContext(self.0)
    }
}

impl<T, R> SpinIrq for Spin<T, R>
where
    T: ?Sized,
    R: Relax,
{
    type Value = T;
    type Relax = R;

    fn lock_irq(&self) -> SpinGuard<Self::Value, IrqContext, Self::Relax> {
        self.lock_with_context(IrqContext::save())
    }
}

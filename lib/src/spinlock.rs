use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicPtr, Ordering};

/// Saves the interrupt state and masks interrupts. Returns the saved state.
pub type IrqSaveFn = fn() -> u64;
/// Restores an interrupt state previously returned by an [`IrqSaveFn`].
pub type IrqRestoreFn = fn(u64);

static IRQ_SAVE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static IRQ_RESTORE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install the platform's interrupt masking primitives.
///
/// Until this is called (hosted builds, early boot) the hooks are no-ops and
/// [`IrqMutex`] degrades to a plain spinlock.
pub fn register_irq_control(save: IrqSaveFn, restore: IrqRestoreFn) {
    IRQ_SAVE.store(save as *mut (), Ordering::Release);
    IRQ_RESTORE.store(restore as *mut (), Ordering::Release);
}

#[inline]
fn irq_save() -> u64 {
    let ptr = IRQ_SAVE.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only `register_irq_control` stores into IRQ_SAVE, always a valid `IrqSaveFn`.
    let save: IrqSaveFn = unsafe { core::mem::transmute(ptr) };
    save()
}

#[inline]
fn irq_restore(flags: u64) {
    let ptr = IRQ_RESTORE.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: only `register_irq_control` stores into IRQ_RESTORE, always a valid `IrqRestoreFn`.
    let restore: IrqRestoreFn = unsafe { core::mem::transmute(ptr) };
    restore(flags);
}

/// Mutex that masks interrupts while held.
/// Used for the few structures touched from both interrupt context and the
/// event loop (per-core task queues, event pending words).
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

pub struct IrqMutexGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    saved_flags: u64,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = irq_save();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            saved_flags,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_flags = irq_save();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqMutexGuard {
                guard: Some(guard),
                saved_flags,
            }),
            None => {
                irq_restore(saved_flags);
                None
            }
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Unlock before re-enabling interrupts.
        drop(self.guard.take());
        irq_restore(self.saved_flags);
    }
}

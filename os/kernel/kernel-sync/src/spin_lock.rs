use crate::irq::{InterruptControl, IrqGuard};
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Busy-waiting mutual exclusion for short critical sections.
///
/// Used for the paging-structures registry, window-pool bookkeeping and the
/// per-map invalidation state. None of these sections sleep, so spinning is
/// cheaper than parking. Paths that can race with interrupt handlers on the
/// same CPU take the lock through [`SpinLock::lock_irq`].
pub struct SpinLock<T> {
    held: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `held`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    fn claim(&self) -> bool {
        self.held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Single acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| SpinLockGuard { owner: self })
    }

    /// Spins until the lock is ours.
    ///
    /// Waiters only read the flag while it is set and retry the exchange once
    /// it clears, so a contended lock does not bounce its cache line.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while !self.claim() {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinLockGuard { owner: self }
    }

    /// Acquires the lock with interrupts disabled for the guard's lifetime.
    ///
    /// Interrupts go off before the first spin; the guard unlocks first and
    /// restores the saved interrupt state last.
    #[inline]
    pub fn lock_irq<'a>(&'a self, irq: &'a dyn InterruptControl) -> IrqSpinLockGuard<'a, T> {
        let irq = IrqGuard::new(irq);
        IrqSpinLockGuard {
            inner: self.lock(),
            _irq: irq,
        }
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    owner: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.held.store(false, Ordering::Release);
    }
}

/// A [`SpinLockGuard`] that also keeps interrupts disabled while held.
///
/// Field order matters: the lock guard drops before the interrupt guard.
pub struct IrqSpinLockGuard<'a, T> {
    inner: SpinLockGuard<'a, T>,
    _irq: IrqGuard<'a>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

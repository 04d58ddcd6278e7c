use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    num::NonZeroUsize,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Marker for "no owner".
const UNOWNED: usize = 0;

/// A lock the owning thread may acquire again while already holding it.
///
/// Ownership is identified by a caller-provided, non-zero token (typically
/// the current thread's id). Each successful lock increments a depth counter;
/// the lock is released when the outermost [`RecursiveGuard`] drops.
///
/// Because several guards of the same thread can coexist, only shared access
/// to the protected value is handed out. Use interior mutability
/// (`Cell`/`RefCell`) for state that changes under the lock.
pub struct RecursiveMutex<T> {
    owner: AtomicUsize,
    /// Only read or written by the current owner.
    depth: UnsafeCell<usize>,
    value: UnsafeCell<T>,
}

// Safety: the value is only reachable by the single owning thread at a time.
unsafe impl<T: Send> Sync for RecursiveMutex<T> {}

impl<T> RecursiveMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            depth: UnsafeCell::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for `owner`, calling `relax` while another owner
    /// holds it.
    ///
    /// If `owner` already holds the lock, this only increments the depth.
    #[inline]
    pub fn lock_with(&self, owner: NonZeroUsize, mut relax: impl FnMut()) -> RecursiveGuard<'_, T> {
        let me = owner.get();
        // Only `me` ever stores `me`, so a stale read cannot produce a false positive.
        if self.owner.load(Ordering::Relaxed) != me {
            while self
                .owner
                .compare_exchange_weak(UNOWNED, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                relax();
            }
        }
        self.enter()
    }

    /// Try once; returns `None` if a different owner holds the lock.
    #[inline]
    pub fn try_lock_with(&self, owner: NonZeroUsize) -> Option<RecursiveGuard<'_, T>> {
        let me = owner.get();
        if self.owner.load(Ordering::Relaxed) == me
            || self
                .owner
                .compare_exchange(UNOWNED, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            Some(self.enter())
        } else {
            None
        }
    }

    /// Returns `true` if any owner currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNOWNED
    }

    /// Returns `true` if `owner` currently holds the lock.
    #[inline]
    pub fn is_held_by(&self, owner: NonZeroUsize) -> bool {
        self.owner.load(Ordering::Relaxed) == owner.get()
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn enter(&self) -> RecursiveGuard<'_, T> {
        // Safety: we are the owner.
        let depth = unsafe { &mut *self.depth.get() };
        *depth += 1;
        RecursiveGuard {
            mutex: self,
            outermost: *depth == 1,
            _not_send: PhantomData,
        }
    }
}

/// Guard of one (possibly nested) acquisition of a [`RecursiveMutex`].
pub struct RecursiveGuard<'a, T> {
    mutex: &'a RecursiveMutex<T>,
    outermost: bool,
    /// Ownership is tied to the acquiring thread.
    _not_send: PhantomData<*const ()>,
}

impl<T> RecursiveGuard<'_, T> {
    /// `true` if dropping this guard releases the lock.
    #[inline]
    #[must_use]
    pub const fn is_outermost(&self) -> bool {
        self.outermost
    }
}

impl<T> Deref for RecursiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> Drop for RecursiveGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: we are the owner.
        let depth = unsafe { &mut *self.mutex.depth.get() };
        *depth -= 1;
        if *depth == 0 {
            self.mutex.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

use crate::SpinLock;
use core::sync::atomic::{AtomicBool, Ordering};

/// Single-use rendezvous that passes one value from a releaser to a waiter.
///
/// A waiter parks a `Handoff` in a queue owned by the resource and then
/// [`wait`](Self::wait)s on it; whoever frees the resource next
/// [`offer`](Self::offer)s it straight to the waiter instead of returning it
/// to the free pool. This way exactly one waiter is woken per release and a
/// newly arriving acquirer cannot steal the freed resource.
pub struct Handoff<T> {
    ready: AtomicBool,
    value: SpinLock<Option<T>>,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            value: SpinLock::new(None),
        }
    }

    /// Hands `value` to the waiter.
    ///
    /// Offering twice replaces the first value; callers pop the waiter from
    /// their queue before offering, so this does not happen in practice.
    #[inline]
    pub fn offer(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.store(true, Ordering::Release);
    }

    /// Returns `true` once a value was offered.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Takes the offered value without waiting.
    #[inline]
    pub fn try_take(&self) -> Option<T> {
        if self.is_ready() {
            self.value.lock().take()
        } else {
            None
        }
    }

    /// Waits until a value is offered, calling `relax` between polls.
    pub fn wait(&self, mut relax: impl FnMut()) -> T {
        loop {
            if let Some(value) = self.try_take() {
                return value;
            }
            relax();
        }
    }
}

use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FILLED: u8 = 2;

/// A slot that is written once during boot and read lock-free afterwards.
///
/// The paging method uses it for the kernel translation map and the frame
/// allocator, both of which only exist after a later boot phase.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    slot: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    /// `state` must be `FILLED`.
    #[inline]
    unsafe fn filled(&self) -> &T {
        // SAFETY: the caller observed FILLED with Acquire ordering.
        unsafe { (*self.slot.get()).assume_init_ref() }
    }

    /// Claims the slot for writing. Only one caller ever wins.
    #[inline]
    fn begin_write(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn finish_write(&self, value: T) -> &T {
        // SAFETY: `begin_write` made us the only writer.
        let stored = unsafe { (*self.slot.get()).write(value) };
        self.state.store(FILLED, Ordering::Release);
        stored
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == FILLED {
            // SAFETY: checked above.
            Some(unsafe { self.filled() })
        } else {
            None
        }
    }

    /// Stores `value` if the cell is still empty.
    ///
    /// Hands `value` back if the cell is filled or another writer got there first.
    pub fn set(&self, value: T) -> Result<(), T> {
        if !self.begin_write() {
            return Err(value);
        }
        self.finish_write(value);
        Ok(())
    }

    /// Returns the stored value, running `init` if the cell is empty.
    ///
    /// Callers that lose the race spin until the winner has published.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(value) = self.get() {
            return value;
        }
        if self.begin_write() {
            return self.finish_write(init());
        }
        while self.state.load(Ordering::Acquire) != FILLED {
            spin_loop();
        }
        // SAFETY: the loop exits only once FILLED.
        unsafe { self.filled() }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == FILLED {
            // SAFETY: FILLED and we own the cell exclusively.
            unsafe { self.slot.get_mut().assume_init_drop() };
        }
    }
}

// SAFETY: one writer before FILLED, shared reads after.
unsafe impl<T: Send + Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

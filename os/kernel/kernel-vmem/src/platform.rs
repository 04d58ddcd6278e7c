//! # Platform services
//!
//! Everything this crate needs from the surrounding kernel: CPU identity,
//! thread pinning, interrupt control, TLB maintenance, cross-CPU calls,
//! a deferred-work queue, and physical frames.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::error::VmemError;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroUsize;
use kernel_sync::InterruptControl;

/// Index of a CPU, `0..cpu_count()`.
pub type CpuId = usize;

/// Work to run later in a context where interrupts are enabled.
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// A set of up to 64 CPUs.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// Largest supported CPU count.
    pub const MAX_CPUS: usize = 64;

    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// CPUs `0..count`.
    #[inline]
    #[must_use]
    pub const fn all(count: usize) -> Self {
        if count >= Self::MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[inline]
    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu) != 0
    }

    #[inline]
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu))
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Member CPUs in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl core::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Whether a cross-CPU call waits for the targets to finish.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CallMode {
    /// Return only after every target CPU ran the function.
    Synchronous,
    /// Return once the request is posted.
    FireAndForget,
}

/// Kernel services the translation layer depends on.
///
/// All methods act on the *calling* CPU unless stated otherwise.
pub trait Platform: InterruptControl + Send + Sync {
    /// Number of CPUs; at most [`CpuSet::MAX_CPUS`].
    fn cpu_count(&self) -> usize;

    /// CPU the caller runs on. Only stable while pinned.
    fn current_cpu(&self) -> CpuId;

    /// Non-zero identity of the calling thread, used as lock owner token.
    fn current_thread(&self) -> NonZeroUsize;

    /// Prevents migration of the calling thread to another CPU. Nests.
    fn pin_current_thread(&self);

    fn unpin_current_thread(&self);

    /// Gives up the CPU while waiting for another thread.
    fn yield_now(&self);

    /// Drops the translation of one page from this CPU's TLB.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drops all translations from this CPU's TLB; global ones only if
    /// `include_global` is set.
    fn invalidate_all(&self, include_global: bool);

    /// Runs `f` on every CPU in `cpus`, the caller's included if it is a
    /// member. `f` receives the id of the CPU it runs on.
    fn call_on_cpus(&self, cpus: CpuSet, mode: CallMode, f: &(dyn Fn(CpuId) + Sync));

    /// Loads `root` as the active translation root of this CPU.
    fn set_translation_root(&self, root: PhysicalAddress);

    /// Queues `task` to run later with interrupts enabled.
    fn defer(&self, task: DeferredTask);

    /// Pointer through which the kernel accesses the mapped kernel address `va`.
    fn virt_ptr(&self, va: VirtualAddress) -> *mut u8;
}

/// RAII pin of the calling thread to its current CPU.
pub struct CpuPinner<'a> {
    platform: &'a dyn Platform,
}

impl<'a> CpuPinner<'a> {
    #[inline]
    #[must_use]
    pub fn new(platform: &'a dyn Platform) -> Self {
        platform.pin_current_thread();
        Self { platform }
    }
}

impl Drop for CpuPinner<'_> {
    fn drop(&mut self) {
        self.platform.unpin_current_thread();
    }
}

/// Source of physical pages for page tables and window pools.
pub trait FrameAllocator: Send + Sync {
    /// A zero-filled page that will not be paged out, or `None` if memory is
    /// exhausted.
    fn allocate_wired_zero_page(&self) -> Option<PhysicalAddress>;

    /// Returns a page obtained from [`allocate_wired_zero_page`](Self::allocate_wired_zero_page).
    fn free_page(&self, page: PhysicalAddress);
}

/// Pages set aside up front so a later mapping cannot fail for lack of
/// table memory. Unused pages are returned on drop.
pub struct FrameReservation {
    frames: Vec<PhysicalAddress>,
    allocator: Arc<dyn FrameAllocator>,
}

impl FrameReservation {
    /// Reserves `count` pages, all or nothing.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if fewer pages are available.
    pub fn reserve(allocator: &Arc<dyn FrameAllocator>, count: usize) -> Result<Self, VmemError> {
        let mut reservation = Self {
            frames: Vec::with_capacity(count),
            allocator: Arc::clone(allocator),
        };
        for _ in 0..count {
            // Dropping the partial reservation hands the pages back.
            let page = allocator
                .allocate_wired_zero_page()
                .ok_or(VmemError::OutOfMemory)?;
            reservation.frames.push(page);
        }
        Ok(reservation)
    }

    /// Takes one reserved page.
    pub fn take(&mut self) -> Option<PhysicalAddress> {
        self.frames.pop()
    }

    /// Returns a page taken from this reservation but not used after all.
    pub(crate) fn put_back(&mut self, page: PhysicalAddress) {
        self.frames.push(page);
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for FrameReservation {
    fn drop(&mut self) {
        for page in self.frames.drain(..) {
            self.allocator.free_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_set_iteration_and_removal() {
        let set = CpuSet::all(4).without(2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(set.len(), 3);
        assert!(!set.contains(2));
        assert!(CpuSet::single(5).contains(5));
        assert_eq!(CpuSet::all(64).bits(), u64::MAX);
    }
}

//! # Physical page windows
//!
//! A window is a kernel virtual address temporarily bound to an arbitrary
//! physical page. The kernel uses windows to touch memory it has no
//! permanent mapping for: page tables on systems without a direct map,
//! pages being zeroed or copied, descriptors in interrupt context.
//!
//! Windows come in three flavors:
//!
//! | Kind | Acquire/Release | Scope | Blocking |
//! |:-----|:----------------|:------|:---------|
//! | shared | [`acquire`](PhysicalWindowPool::acquire) / [`release`](PhysicalWindowPool::release) | any CPU | optional |
//! | per-CPU | [`acquire_current_cpu`](PhysicalWindowPool::acquire_current_cpu) | the pinned caller's CPU | never |
//! | debug | [`acquire_debug`](PhysicalWindowPool::acquire_debug) | one per CPU, lock-free | never |
//!
//! Two strategies implement the trait: [`coarse`] recycles multi-page chunks
//! in LRU order and keeps unreferenced chunks mapped, [`fine`] hands out
//! single pages and grows by allocating whole new pools.

pub(crate) mod coarse;
pub(crate) mod fine;
mod per_cpu;
pub(crate) mod region;

pub(crate) use per_cpu::PerCpuSlots;

use crate::PAGE_SIZE;
use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::error::VmemError;
use crate::platform::{CpuPinner, Platform};

/// A bound window. Must be handed back to the pool it came from.
#[derive(Debug)]
#[must_use = "windows must be released"]
pub struct Window {
    /// Kernel virtual address of the requested physical byte.
    pub address: VirtualAddress,
    /// Pool-internal slot identity.
    pub(crate) slot: usize,
}

impl Window {
    /// Bytes accessible through this window (up to the end of the page).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        PAGE_SIZE - self.address.page_offset()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Temporary kernel mappings of physical pages.
pub trait PhysicalWindowPool: Send + Sync {
    /// Binds a shared window to the page containing `physical`.
    ///
    /// The returned window's address carries the in-page offset of
    /// `physical`. Usable from any CPU until released.
    ///
    /// # Errors
    /// - [`VmemError::WouldBlock`] if nothing is free and `blocking` is unset.
    /// - [`VmemError::OutOfMemory`] if the pool had to grow and could not.
    fn acquire(&self, physical: PhysicalAddress, blocking: bool) -> Result<Window, VmemError>;

    /// Returns a shared window; wakes at most one waiter.
    fn release(&self, window: Window);

    /// Binds one of the calling CPU's private slots.
    ///
    /// The caller must stay pinned until the matching
    /// [`release_current_cpu`](Self::release_current_cpu).
    ///
    /// # Errors
    /// [`VmemError::WouldBlock`] if all of this CPU's slots are in use.
    fn acquire_current_cpu(&self, physical: PhysicalAddress) -> Result<Window, VmemError>;

    fn release_current_cpu(&self, window: Window);

    /// Moves a held private window to the page containing `physical`,
    /// keeping its slot.
    ///
    /// # Errors
    /// Only if the slot's entry cannot describe `physical`.
    fn rebind_current_cpu(&self, window: &mut Window, physical: PhysicalAddress) -> Result<(), VmemError>;

    /// Binds two private slots at once, or none.
    ///
    /// # Errors
    /// [`VmemError::WouldBlock`] if fewer than two slots are free.
    fn acquire_current_cpu_pair(
        &self,
        first: PhysicalAddress,
        second: PhysicalAddress,
    ) -> Result<(Window, Window), VmemError>;

    /// Binds the calling CPU's debug slot. Never waits on a lock.
    ///
    /// # Errors
    /// [`VmemError::WouldBlock`] if the debug slot is already in use.
    fn acquire_debug(&self, physical: PhysicalAddress) -> Result<Window, VmemError>;

    fn release_debug(&self, window: Window);

    /// Pointer to the first accessible byte of `window`.
    fn window_ptr(&self, window: &Window) -> *mut u8;

    /// Threads currently waiting in a blocking [`acquire`](Self::acquire).
    fn waiting(&self) -> usize;

    fn platform(&self) -> &dyn Platform;

    /// Fills `length` bytes starting at `address` with `value`.
    ///
    /// # Errors
    /// See [`acquire_current_cpu`](Self::acquire_current_cpu).
    #[allow(clippy::cast_possible_truncation)]
    fn memset_physical(&self, address: PhysicalAddress, value: u8, length: u64) -> Result<(), VmemError> {
        let _pin = CpuPinner::new(self.platform());
        let mut address = address;
        let mut remaining = length;
        while remaining > 0 {
            let window = self.acquire_current_cpu(address)?;
            let chunk = window.len().min(remaining);
            // Safety: the window maps at least `chunk` bytes.
            unsafe {
                core::ptr::write_bytes(self.window_ptr(&window), value, chunk as usize);
            }
            self.release_current_cpu(window);
            address += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Copies from physical memory at `source` into `destination`.
    ///
    /// # Errors
    /// See [`acquire_current_cpu`](Self::acquire_current_cpu).
    #[allow(clippy::cast_possible_truncation)]
    fn memcpy_from_physical(&self, destination: &mut [u8], source: PhysicalAddress) -> Result<(), VmemError> {
        let _pin = CpuPinner::new(self.platform());
        let mut source = source;
        let mut done = 0;
        while done < destination.len() {
            let window = self.acquire_current_cpu(source)?;
            let chunk = (window.len() as usize).min(destination.len() - done);
            // Safety: the window maps at least `chunk` bytes; `destination` is ordinary memory.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.window_ptr(&window),
                    destination[done..].as_mut_ptr(),
                    chunk,
                );
            }
            self.release_current_cpu(window);
            source += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `source` into physical memory at `destination`.
    ///
    /// # Errors
    /// See [`acquire_current_cpu`](Self::acquire_current_cpu).
    #[allow(clippy::cast_possible_truncation)]
    fn memcpy_to_physical(&self, destination: PhysicalAddress, source: &[u8]) -> Result<(), VmemError> {
        let _pin = CpuPinner::new(self.platform());
        let mut destination = destination;
        let mut done = 0;
        while done < source.len() {
            let window = self.acquire_current_cpu(destination)?;
            let chunk = (window.len() as usize).min(source.len() - done);
            // Safety: the window maps at least `chunk` bytes; `source` is ordinary memory.
            unsafe {
                core::ptr::copy_nonoverlapping(source[done..].as_ptr(), self.window_ptr(&window), chunk);
            }
            self.release_current_cpu(window);
            destination += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Copies one whole page. Both windows are taken in a single step, so
    /// concurrent copies in opposite directions cannot deadlock.
    ///
    /// # Errors
    /// See [`acquire_current_cpu_pair`](Self::acquire_current_cpu_pair).
    #[allow(clippy::cast_possible_truncation)]
    fn memcpy_physical_page(&self, to: PhysicalAddress, from: PhysicalAddress) -> Result<(), VmemError> {
        debug_assert!(to.page_offset() == 0 && from.page_offset() == 0);
        let _pin = CpuPinner::new(self.platform());
        let (to_window, from_window) = self.acquire_current_cpu_pair(to, from)?;
        // Safety: both windows map a full page; distinct slots never overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.window_ptr(&from_window),
                self.window_ptr(&to_window),
                PAGE_SIZE as usize,
            );
        }
        self.release_current_cpu(from_window);
        self.release_current_cpu(to_window);
        Ok(())
    }
}

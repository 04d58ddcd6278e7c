//! # Translation maps
//!
//! A [`TranslationMap`] is the interface to one address space. Mutating
//! operations take the map's reentrant lock; TLB invalidations they cause are
//! collected and performed once, when the outermost lock is released:
//!
//! ```text
//!  lock() ──► map / unmap / protect … (queue va) ──► drop outermost guard
//!                                                         │
//!                           ┌─────────────────────────────┘
//!                           ▼
//!        ≤ capacity pages: invalidate_page(va) for each queued page
//!        > capacity pages: invalidate_all(global = kernel map)
//!        on this CPU if targeted, then synchronously on the other targets
//! ```
//!
//! The kernel map targets every CPU; a user map only the CPUs it is
//! currently active on (see [`TranslationMap::activate_on_current_cpu`]).
//!
//! Queries take no lock; they read entries with single atomic loads.

use crate::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use crate::entry::{DescriptorLocation, Leaf, Mapping, MemoryType, PageFlags, PageTableEntry, Protection};
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::invalidation::InvalidationBuffer;
use crate::paging_structures::{PagingContext, PagingStructures};
use crate::platform::{CallMode, CpuId, CpuPinner, CpuSet, FrameAllocator, FrameReservation};
use crate::walk::{AllocatorSource, FrameSource, Walker};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use kernel_sync::{RecursiveGuard, RecursiveMutex};

struct MapState {
    mapped: Cell<usize>,
    pending: RefCell<InvalidationBuffer>,
}

impl MapState {
    fn queue(&self, va: VirtualAddress) {
        self.pending.borrow_mut().push(va);
    }

    fn count_mapped(&self) {
        self.mapped.set(self.mapped.get() + 1);
    }

    fn count_unmapped(&self) {
        self.mapped.set(self.mapped.get() - 1);
    }
}

/// What [`TranslationMap::clear_accessed_and_modified`] found.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AccessState {
    pub accessed: bool,
    pub modified: bool,
    /// The page had not been accessed and was unmapped on request.
    pub unmapped: bool,
}

/// One address space.
pub struct TranslationMap<G: Geometry> {
    structures: Arc<PagingStructures<G>>,
    state: RecursiveMutex<MapState>,
}

/// Holds a [`TranslationMap`]'s lock. Releasing the outermost guard
/// flushes pending invalidations.
pub struct MapGuard<'a, G: Geometry> {
    map: &'a TranslationMap<G>,
    guard: RecursiveGuard<'a, MapState>,
}

impl<G: Geometry> Drop for MapGuard<'_, G> {
    fn drop(&mut self) {
        if self.guard.is_outermost() {
            self.map.flush_pending(&self.guard);
        }
    }
}

/// The address space is loaded on a CPU. Dropping it switches that CPU
/// back to the kernel root.
pub struct Activation<G: Geometry> {
    structures: Arc<PagingStructures<G>>,
    cpu: CpuId,
}

impl<G: Geometry> Drop for Activation<G> {
    fn drop(&mut self) {
        let platform = &*self.structures.context().platform;
        debug_assert_eq!(platform.current_cpu(), self.cpu, "deactivated on another CPU");
        platform.set_translation_root(self.structures.context().kernel_root);
        self.structures.mark_inactive(self.cpu);
    }
}

impl<G: Geometry> TranslationMap<G> {
    pub(crate) fn new(structures: Arc<PagingStructures<G>>, mapped: usize) -> Self {
        let capacity = structures.context().invalidate_capacity;
        Self {
            structures,
            state: RecursiveMutex::new(MapState {
                mapped: Cell::new(mapped),
                pending: RefCell::new(InvalidationBuffer::new(capacity)),
            }),
        }
    }

    #[inline]
    fn context(&self) -> &PagingContext<G> {
        self.structures.context()
    }

    #[must_use]
    pub fn structures(&self) -> &Arc<PagingStructures<G>> {
        &self.structures
    }

    #[inline]
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.structures.is_kernel()
    }

    /// Takes the map lock. The calling thread may lock again while holding
    /// it; pending invalidations are flushed when the outermost guard drops.
    pub fn lock(&self) -> MapGuard<'_, G> {
        let platform = &*self.context().platform;
        let guard = self
            .state
            .lock_with(platform.current_thread(), || platform.yield_now());
        if guard.is_outermost() {
            guard.pending.borrow_mut().clear();
        }
        MapGuard { map: self, guard }
    }

    /// Performs the pending invalidations now instead of at unlock.
    pub fn flush(&self) {
        let guard = self.lock();
        self.flush_pending(&guard.guard);
    }

    /// Pages currently mapped.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.lock().guard.mapped.get()
    }

    fn flush_pending(&self, state: &MapState) {
        let mut pending = state.pending.borrow_mut();
        if pending.is_empty() {
            return;
        }

        let kernel = self.is_kernel();
        let platform = &*self.context().platform;
        let _pin = CpuPinner::new(platform);
        let targets = if kernel {
            CpuSet::all(platform.cpu_count())
        } else {
            self.structures.active_cpus()
        };

        let full = pending.overflowed();
        let addresses = pending.addresses();
        let invalidate = |_cpu: CpuId| {
            if full {
                platform.invalidate_all(kernel);
            } else {
                for &va in addresses {
                    platform.invalidate_page(va);
                }
            }
        };

        let current = platform.current_cpu();
        if targets.contains(current) {
            invalidate(current);
        }
        let others = targets.without(current);
        if !others.is_empty() {
            platform.call_on_cpus(others, CallMode::Synchronous, &invalidate);
        }

        log::trace!(
            "{}: flushed {} pending invalidations on {targets:?}{}",
            G::NAME,
            pending.count(),
            if full { " (full)" } else { "" }
        );
        pending.clear();
    }

    fn frames(&self) -> Result<&Arc<dyn FrameAllocator>, VmemError> {
        self.context().frames.get().ok_or(VmemError::OutOfMemory)
    }

    /// Rejects addresses this map must not change.
    fn check_mutable(&self, va: VirtualAddress) -> Result<(), VmemError> {
        if !G::is_canonical(va) {
            return Err(VmemError::NotSupported("non-canonical address"));
        }
        if !self.is_kernel() && G::is_kernel_address(va) {
            return Err(VmemError::NotSupported("kernel address in a user address space"));
        }
        Ok(())
    }

    /// The part of `[start, end)` this map may change.
    ///
    /// A user map's range is cut off at the kernel base.
    fn mutable_range(&self, start: VirtualAddress, end: VirtualAddress) -> Result<VirtualRange, VmemError> {
        self.check_mutable(start)?;
        let Some(last) = end.as_u64().checked_sub(1).filter(|&last| last >= start.as_u64()) else {
            return Ok(VirtualRange::new(start, start));
        };
        if !G::is_canonical_span(start, VirtualAddress::new(last)) {
            return Err(VmemError::NotSupported("non-canonical address"));
        }
        let end = if self.is_kernel() || !G::is_kernel_address(VirtualAddress::new(last)) {
            end
        } else {
            VirtualAddress::new(G::KERNEL_BASE)
        };
        Ok(VirtualRange::new(start, end))
    }

    /// Maps the page at `va` to the frame at `pa`.
    ///
    /// Intermediate tables are allocated as needed. Mapping over an existing
    /// entry replaces it (and is logged); the old translation is invalidated
    /// if it may be cached.
    ///
    /// # Errors
    /// - [`VmemError::OutOfMemory`] if a table could not be allocated.
    /// - [`VmemError::NotSupported`] for addresses outside this map.
    pub fn map(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        memory_type: MemoryType,
    ) -> Result<(), VmemError> {
        self.check_mutable(va)?;
        let guard = self.lock();
        let frames = self.frames()?;
        self.map_from(&guard, va, pa, protection, memory_type, &mut AllocatorSource(&**frames))
    }

    /// Like [`map`](Self::map), but takes table pages from `reservation`
    /// (see [`max_pages_needed_to_map`](Self::max_pages_needed_to_map)).
    ///
    /// # Errors
    /// As [`map`](Self::map); `OutOfMemory` only if the reservation was too
    /// small.
    pub fn map_reserved(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        memory_type: MemoryType,
        reservation: &mut FrameReservation,
    ) -> Result<(), VmemError> {
        self.check_mutable(va)?;
        let guard = self.lock();
        self.map_from(&guard, va, pa, protection, memory_type, reservation)
    }

    fn map_from(
        &self,
        guard: &MapGuard<'_, G>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        memory_type: MemoryType,
        source: &mut dyn FrameSource,
    ) -> Result<(), VmemError> {
        let global = self.is_kernel() && G::is_kernel_address(va);
        let leaf = Leaf::new(pa.page_base(), protection, memory_type).with_global(global);
        self.install_leaf(guard, va, &PageTableEntry::Leaf(leaf), source)
    }

    /// Points the page at `va` at a page descriptor stored elsewhere in
    /// physical memory, on geometries whose leaf level supports indirect
    /// entries.
    ///
    /// # Errors
    /// [`VmemError::NotSupported`] on other geometries, else as
    /// [`map`](Self::map).
    pub fn map_indirect(&self, va: VirtualAddress, descriptor: PhysicalAddress) -> Result<(), VmemError> {
        if !G::leaf_shape().indirect {
            return Err(VmemError::NotSupported("indirect entries"));
        }
        self.check_mutable(va)?;
        let guard = self.lock();
        let frames = self.frames()?;
        let entry = PageTableEntry::Indirect(DescriptorLocation::new(descriptor));
        self.install_leaf(&guard, va, &entry, &mut AllocatorSource(&**frames))
    }

    fn install_leaf(
        &self,
        guard: &MapGuard<'_, G>,
        va: VirtualAddress,
        entry: &PageTableEntry,
        source: &mut dyn FrameSource,
    ) -> Result<(), VmemError> {
        let walker = self.structures.walker();
        let slot = walker
            .leaf_entry(va, Some(source))?
            .ok_or(VmemError::NotSupported("large page in the way"))?;

        let state = &*guard.guard;
        match walker.swap(slot, entry)? {
            PageTableEntry::Invalid => state.count_mapped(),
            PageTableEntry::Leaf(old) => {
                log::warn!("{}: {va} was already mapped to {}", G::NAME, old.frame);
                if old.accessed {
                    state.queue(va);
                }
            }
            old => {
                log::warn!("{}: {va} replaced {old:?}", G::NAME);
                state.queue(va);
            }
        }
        Ok(())
    }

    /// Unmaps every page in `[start, end)`; returns how many were mapped.
    ///
    /// On a user map the range ends at the kernel base at the latest.
    ///
    /// # Errors
    /// - [`VmemError::NotSupported`] for ranges that start outside this map
    ///   or are not canonical throughout.
    /// - Otherwise only if a table could not be reached (window exhaustion).
    pub fn unmap(&self, start: VirtualAddress, end: VirtualAddress) -> Result<usize, VmemError> {
        let range = self.mutable_range(start, end)?;
        let guard = self.lock();
        let state = &*guard.guard;
        let walker = self.structures.walker();

        let mut removed = 0;
        walker.for_each_leaf(range, |va, slot| {
            match walker.swap(slot, &PageTableEntry::Invalid)? {
                PageTableEntry::Invalid => {}
                PageTableEntry::Leaf(old) => {
                    removed += 1;
                    state.count_unmapped();
                    if old.accessed {
                        state.queue(va);
                    }
                }
                PageTableEntry::Indirect(_) | PageTableEntry::Table(_) => {
                    removed += 1;
                    state.count_unmapped();
                    state.queue(va);
                }
            }
            Ok(())
        })?;

        log::trace!("{}: unmapped {removed} pages in {start}..{}", G::NAME, range.end);
        Ok(removed)
    }

    /// Unmaps the page at `va` and returns what it was mapped to.
    ///
    /// # Errors
    /// [`VmemError::EntryNotFound`] if nothing was mapped.
    pub fn unmap_page(&self, va: VirtualAddress) -> Result<Mapping, VmemError> {
        self.check_mutable(va)?;
        let guard = self.lock();
        let state = &*guard.guard;
        let walker = self.structures.walker();
        let slot = walker.leaf_entry(va, None)?.ok_or(VmemError::EntryNotFound(va))?;

        let (_, target) = walker.resolve(slot)?;
        match walker.swap(slot, &PageTableEntry::Invalid)? {
            PageTableEntry::Invalid => Err(VmemError::EntryNotFound(va)),
            PageTableEntry::Leaf(old) => {
                state.count_unmapped();
                if old.accessed {
                    state.queue(va);
                }
                Ok(Mapping::from(old))
            }
            _ => {
                state.count_unmapped();
                state.queue(va);
                target
                    .as_leaf()
                    .map(|leaf| Mapping::from(*leaf))
                    .ok_or(VmemError::EntryNotFound(va))
            }
        }
    }

    /// The mapping of the page containing `va`.
    ///
    /// # Errors
    /// [`VmemError::EntryNotFound`] if nothing is mapped there.
    pub fn query(&self, va: VirtualAddress) -> Result<Mapping, VmemError> {
        Self::lookup(&self.structures.walker(), va)
    }

    /// Like [`query`](Self::query), but safe to call from interrupt or
    /// debugger context: takes no lock and uses only the debug windows.
    ///
    /// # Errors
    /// As [`query`](Self::query); [`VmemError::WouldBlock`] if this CPU's
    /// debug window is busy.
    pub fn query_interrupt(&self, va: VirtualAddress) -> Result<Mapping, VmemError> {
        let walker = Walker::for_interrupt(self.context(), self.structures.root());
        Self::lookup(&walker, va)
    }

    fn lookup(walker: &Walker<'_, G>, va: VirtualAddress) -> Result<Mapping, VmemError> {
        let not_found = || {
            log::trace!("{}: nothing mapped at {va}", G::NAME);
            VmemError::EntryNotFound(va)
        };
        if !G::is_canonical(va) {
            return Err(not_found());
        }
        let slot = walker.leaf_entry(va, None)?.ok_or_else(not_found)?;
        match walker.resolve(slot)? {
            (_, PageTableEntry::Leaf(leaf)) => Ok(Mapping::from(leaf)),
            _ => Err(not_found()),
        }
    }

    /// Changes protection and memory type of every mapped page in
    /// `[start, end)`, keeping the accessed and dirty state. On a user map the
    /// range ends at the kernel base at the latest.
    ///
    /// # Errors
    /// As [`unmap`](Self::unmap).
    pub fn protect(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        protection: Protection,
        memory_type: MemoryType,
    ) -> Result<(), VmemError> {
        let range = self.mutable_range(start, end)?;
        let guard = self.lock();
        let state = &*guard.guard;
        let walker = self.structures.walker();

        walker.for_each_leaf(range, |va, slot| {
            let (target, _) = walker.resolve(slot)?;
            let (old, changed) = walker.update(target, |entry| {
                let leaf = entry.as_leaf()?;
                let new = Leaf {
                    protection,
                    memory_type,
                    ..*leaf
                };
                (new != *leaf).then_some(PageTableEntry::Leaf(new))
            })?;
            if changed && old.as_leaf().is_some_and(|leaf| leaf.accessed) {
                state.queue(va);
            }
            Ok(())
        })
    }

    /// Clears the given state flags of the page at `va`. Unmapped pages are
    /// ignored.
    ///
    /// # Errors
    /// Only if a table could not be reached.
    pub fn clear_flags(&self, va: VirtualAddress, flags: PageFlags) -> Result<(), VmemError> {
        self.check_mutable(va)?;
        let guard = self.lock();
        let walker = self.structures.walker();
        let Some(slot) = walker.leaf_entry(va, None)? else {
            return Ok(());
        };
        let (target, _) = walker.resolve(slot)?;
        let (_, changed) = walker.update(target, |entry| {
            let leaf = entry.as_leaf()?;
            let new = leaf.without_flags(flags);
            (new != *leaf).then_some(PageTableEntry::Leaf(new))
        })?;
        if changed {
            guard.guard.queue(va);
        }
        Ok(())
    }

    /// Clears the accessed and modified bits of the page at `va` in one
    /// atomic step and reports their previous state. With
    /// `unmap_if_unaccessed`, a page that was never accessed is unmapped
    /// instead.
    ///
    /// # Errors
    /// [`VmemError::EntryNotFound`] if nothing is mapped at `va`.
    pub fn clear_accessed_and_modified(
        &self,
        va: VirtualAddress,
        unmap_if_unaccessed: bool,
    ) -> Result<AccessState, VmemError> {
        self.check_mutable(va)?;
        let guard = self.lock();
        let state = &*guard.guard;
        let walker = self.structures.walker();
        let slot = walker.leaf_entry(va, None)?.ok_or(VmemError::EntryNotFound(va))?;
        let (target, _) = walker.resolve(slot)?;
        // An indirect entry can only be unmapped at the entry itself.
        let direct = target == slot;

        let (old, _) = walker.update(target, |entry| {
            let leaf = entry.as_leaf()?;
            if !leaf.accessed && unmap_if_unaccessed && direct {
                return Some(PageTableEntry::Invalid);
            }
            leaf.flags()
                .intersects(PageFlags::ACCESSED | PageFlags::MODIFIED)
                .then(|| PageTableEntry::Leaf(leaf.without_flags(PageFlags::all())))
        })?;
        let leaf = old.as_leaf().ok_or(VmemError::EntryNotFound(va))?;

        let unmapped = !leaf.accessed && unmap_if_unaccessed;
        if unmapped {
            if !direct {
                walker.swap(slot, &PageTableEntry::Invalid)?;
                state.queue(va);
            }
            state.count_unmapped();
        } else if leaf.accessed {
            state.queue(va);
        }

        Ok(AccessState {
            accessed: leaf.accessed,
            modified: leaf.dirty,
            unmapped,
        })
    }

    /// Upper bound on the table pages a mapping of `[start, end)` may need.
    #[must_use]
    pub fn max_pages_needed_to_map(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        G::max_table_pages(start, end)
    }

    /// Reserves [`max_pages_needed_to_map`](Self::max_pages_needed_to_map)
    /// pages for use with [`map_reserved`](Self::map_reserved).
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if the pages are not available.
    pub fn reserve_tables(&self, start: VirtualAddress, end: VirtualAddress) -> Result<FrameReservation, VmemError> {
        FrameReservation::reserve(self.frames()?, self.max_pages_needed_to_map(start, end))
    }

    /// Loads this address space on the calling CPU, which must stay pinned
    /// until the returned [`Activation`] is dropped.
    #[must_use]
    pub fn activate_on_current_cpu(&self) -> Activation<G> {
        let platform = &*self.context().platform;
        let cpu = platform.current_cpu();
        self.structures.mark_active(cpu);
        platform.set_translation_root(self.structures.root());
        Activation {
            structures: Arc::clone(&self.structures),
            cpu,
        }
    }

    /// Creates all leaf tables covering `range`; returns them in address
    /// order.
    pub(crate) fn prepare_leaf_tables(&self, range: VirtualRange) -> Result<Vec<PhysicalAddress>, VmemError> {
        let _guard = self.lock();
        let frames = self.frames()?;
        self.structures
            .walker()
            .prepare_leaf_tables(range, &mut AllocatorSource(&**frames))
    }

    /// The leaf slot of `va`, for tests that inspect raw entries.
    #[cfg(test)]
    pub(crate) fn leaf_slot(&self, va: VirtualAddress) -> Option<crate::walk::EntryRef> {
        self.structures.walker().leaf_entry(va, None).ok().flatten()
    }
}

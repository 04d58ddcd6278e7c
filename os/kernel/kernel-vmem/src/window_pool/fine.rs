//! # Fine window pool
//!
//! Shared windows are single pages. Slots come from one or more pools of
//! `slots_per_pool` pages each; when every slot is taken and fewer than
//! `max_pools` pools exist, a new pool is carved out of the window region
//! through the [`RegionSource`] attached once the frame allocator is up.
//! Every release unmaps nothing: the slot is simply rebound on its next use.

use super::region::{RegionSource, SlotRegion};
use super::{PerCpuSlots, PhysicalWindowPool, Window};
use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::platform::{CallMode, CpuSet, Platform};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::{Handoff, SpinLock, SyncOnceCell};

struct Pool<G: Geometry> {
    region: SlotRegion<G>,
    free: Vec<usize>,
}

struct FineState<G: Geometry> {
    pools: Vec<Pool<G>>,
    /// Indices of pools with at least one free slot.
    has_free: Vec<usize>,
    waiters: VecDeque<Arc<Handoff<usize>>>,
}

impl<G: Geometry> FineState<G> {
    fn take_free(&mut self, slots_per_pool: usize) -> Option<usize> {
        let &pool = self.has_free.last()?;
        let free = &mut self.pools[pool].free;
        let local = free.pop()?;
        if free.is_empty() {
            self.has_free.pop();
        }
        Some(pool * slots_per_pool + local)
    }

    fn recycle(&mut self, slot: usize, slots_per_pool: usize) {
        if let Some(waiter) = self.waiters.pop_front() {
            waiter.offer(slot);
            return;
        }
        let pool = slot / slots_per_pool;
        let free = &mut self.pools[pool].free;
        if free.is_empty() {
            self.has_free.push(pool);
        }
        free.push(slot % slots_per_pool);
    }

    fn add_pool(&mut self, region: SlotRegion<G>, slots_per_pool: usize) {
        let index = self.pools.len();
        self.pools.push(Pool {
            region,
            free: Vec::new(),
        });
        for local in (0..slots_per_pool).rev() {
            self.recycle(index * slots_per_pool + local, slots_per_pool);
        }
    }
}

pub(crate) struct FinePool<G: Geometry> {
    platform: Arc<dyn Platform>,
    per_cpu: PerCpuSlots<G>,
    slots_per_pool: usize,
    max_pools: usize,
    source: SyncOnceCell<Box<dyn RegionSource<G>>>,
    grow_lock: SpinLock<()>,
    state: SpinLock<FineState<G>>,
}

impl<G: Geometry> FinePool<G> {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        per_cpu: PerCpuSlots<G>,
        first: SlotRegion<G>,
        slots_per_pool: usize,
        max_pools: usize,
    ) -> Self {
        let mut state = FineState {
            pools: Vec::with_capacity(max_pools),
            has_free: Vec::with_capacity(max_pools),
            waiters: VecDeque::new(),
        };
        state.add_pool(first, slots_per_pool);
        Self {
            platform,
            per_cpu,
            slots_per_pool,
            max_pools,
            source: SyncOnceCell::new(),
            grow_lock: SpinLock::new(()),
            state: SpinLock::new(state),
        }
    }

    /// Enables growth beyond the first pool.
    pub(crate) fn attach_source(&self, source: Box<dyn RegionSource<G>>) {
        if self.source.set(source).is_err() {
            log::warn!("fine window pool already has a region source");
        }
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Points the entry of `slot`, which the caller owns, at `physical`.
    /// Hands the slot back if that fails.
    fn bind_entry(
        &self,
        state: &mut FineState<G>,
        slot: usize,
        physical: PhysicalAddress,
    ) -> Result<VirtualAddress, VmemError> {
        let region = &state.pools[slot / self.slots_per_pool].region;
        let local = slot % self.slots_per_pool;
        let bound = region
            .bind(&*self.platform, local, physical.page_base())
            .map(|()| region.slot_address(local));
        if bound.is_err() {
            state.recycle(slot, self.slots_per_pool);
        }
        bound
    }

    /// Invalidates the slot's old translation on every CPU. Called without
    /// the state lock, since the broadcast waits for the other CPUs.
    fn publish(&self, slot: usize, va: VirtualAddress, physical: PhysicalAddress) -> Window {
        let platform = &*self.platform;
        platform.call_on_cpus(
            CpuSet::all(platform.cpu_count()),
            CallMode::Synchronous,
            &|_| platform.invalidate_page(va),
        );
        Window {
            address: va + physical.page_offset(),
            slot,
        }
    }

    /// Adds one pool unless another thread already did.
    fn grow(&self) -> Result<(), VmemError> {
        let _growing = self.grow_lock.lock();
        {
            let state = self.state.lock();
            if !state.has_free.is_empty() || state.pools.len() >= self.max_pools {
                return Ok(());
            }
        }

        let Some(source) = self.source.get() else {
            log::warn!("fine window pool exhausted before growth was enabled");
            return Err(VmemError::OutOfMemory);
        };
        let region = source.allocate_region(self.slots_per_pool).map_err(|e| {
            log::warn!("fine window pool failed to grow: {e}");
            VmemError::OutOfMemory
        })?;

        let mut state = self.state.lock();
        state.add_pool(region, self.slots_per_pool);
        log::debug!("fine window pool grew to {} pools", state.pools.len());
        Ok(())
    }
}

impl<G: Geometry> PhysicalWindowPool for FinePool<G> {
    fn acquire(&self, physical: PhysicalAddress, blocking: bool) -> Result<Window, VmemError> {
        loop {
            let mut state = self.state.lock();
            if let Some(slot) = state.take_free(self.slots_per_pool) {
                let va = self.bind_entry(&mut state, slot, physical)?;
                drop(state);
                return Ok(self.publish(slot, va, physical));
            }

            if state.pools.len() < self.max_pools {
                drop(state);
                self.grow()?;
                continue;
            }

            if !blocking {
                return Err(VmemError::WouldBlock);
            }

            let handoff = Arc::new(Handoff::new());
            state.waiters.push_back(Arc::clone(&handoff));
            drop(state);

            let slot = handoff.wait(|| self.platform.yield_now());
            let va = self.bind_entry(&mut self.state.lock(), slot, physical)?;
            return Ok(self.publish(slot, va, physical));
        }
    }

    fn release(&self, window: Window) {
        self.state.lock().recycle(window.slot, self.slots_per_pool);
    }

    fn acquire_current_cpu(&self, physical: PhysicalAddress) -> Result<Window, VmemError> {
        self.per_cpu.acquire(&*self.platform, physical)
    }

    fn rebind_current_cpu(&self, window: &mut Window, physical: PhysicalAddress) -> Result<(), VmemError> {
        self.per_cpu.rebind(&*self.platform, window, physical)
    }

    fn release_current_cpu(&self, window: Window) {
        self.per_cpu.release(&*self.platform, window);
    }

    fn acquire_current_cpu_pair(
        &self,
        first: PhysicalAddress,
        second: PhysicalAddress,
    ) -> Result<(Window, Window), VmemError> {
        self.per_cpu.acquire_pair(&*self.platform, first, second)
    }

    fn acquire_debug(&self, physical: PhysicalAddress) -> Result<Window, VmemError> {
        self.per_cpu.acquire_debug(&*self.platform, physical)
    }

    fn release_debug(&self, window: Window) {
        self.per_cpu.release_debug(window);
    }

    fn window_ptr(&self, window: &Window) -> *mut u8 {
        self.platform.virt_ptr(window.address)
    }

    fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn platform(&self) -> &dyn Platform {
        &*self.platform
    }
}

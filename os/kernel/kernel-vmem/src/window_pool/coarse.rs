//! # Coarse window pool
//!
//! Shared windows are handed out in chunks of several pages. A chunk stays
//! mapped after its last user releases it and sits in an LRU queue; if the
//! same physical chunk is requested again before it is recycled, the
//! request is satisfied by bumping its reference count, without touching
//! page tables or TLBs.
//!
//! ```text
//!  free (never mapped) ─┐
//!                       ├─► bound (refs > 0) ─► LRU (refs == 0, still mapped)
//!  LRU front (evicted) ─┘         ▲                     │
//!                                 └──── re-acquired ────┘
//! ```
//!
//! When no chunk is free or unreferenced, blocking callers queue up in FIFO
//! order; the next release hands its chunk to the oldest waiter directly.

use super::region::SlotRegion;
use super::{PerCpuSlots, PhysicalWindowPool, Window};
use crate::PAGE_SIZE;
use crate::addresses::PhysicalAddress;
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::platform::{CallMode, CpuSet, Platform};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::{Handoff, SpinLock};

type ChunkId = usize;

#[derive(Debug, Default)]
struct Chunk {
    /// Chunk-aligned physical base while mapped.
    physical: Option<PhysicalAddress>,
    refs: u32,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
}

struct CoarseState {
    chunks: Vec<Chunk>,
    by_physical: BTreeMap<PhysicalAddress, ChunkId>,
    /// Chunks never mapped so far.
    unused: Vec<ChunkId>,
    /// Mapped but unreferenced chunks, least recently used first.
    lru_head: Option<ChunkId>,
    lru_tail: Option<ChunkId>,
    waiters: VecDeque<Arc<Handoff<ChunkId>>>,
}

impl CoarseState {
    fn lru_push_back(&mut self, id: ChunkId) {
        self.chunks[id].prev = self.lru_tail;
        self.chunks[id].next = None;
        match self.lru_tail {
            Some(tail) => self.chunks[tail].next = Some(id),
            None => self.lru_head = Some(id),
        }
        self.lru_tail = Some(id);
    }

    fn lru_remove(&mut self, id: ChunkId) {
        let (prev, next) = (self.chunks[id].prev.take(), self.chunks[id].next.take());
        match prev {
            Some(p) => self.chunks[p].next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.chunks[n].prev = prev,
            None => self.lru_tail = prev,
        }
    }

    /// Forgets the physical binding of an unreferenced chunk.
    fn detach(&mut self, id: ChunkId) {
        if let Some(physical) = self.chunks[id].physical.take() {
            self.by_physical.remove(&physical);
        }
    }

    /// A chunk that can be rebound: never used, else least recently used.
    fn take_unused(&mut self) -> Option<ChunkId> {
        if let Some(id) = self.unused.pop() {
            return Some(id);
        }
        let id = self.lru_head?;
        self.lru_remove(id);
        self.detach(id);
        Some(id)
    }

    /// Takes a reference on an already mapped chunk.
    fn reference(&mut self, id: ChunkId) {
        if self.chunks[id].refs == 0 {
            self.lru_remove(id);
        }
        self.chunks[id].refs += 1;
    }

    /// Gives a detached chunk to the next waiter, or parks it as unused.
    fn recycle(&mut self, id: ChunkId) {
        match self.waiters.pop_front() {
            Some(waiter) => waiter.offer(id),
            None => self.unused.push(id),
        }
    }
}

pub(crate) struct CoarsePool<G: Geometry> {
    platform: Arc<dyn Platform>,
    per_cpu: PerCpuSlots<G>,
    region: SlotRegion<G>,
    chunk_pages: usize,
    state: SpinLock<CoarseState>,
}

impl<G: Geometry> CoarsePool<G> {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        per_cpu: PerCpuSlots<G>,
        region: SlotRegion<G>,
        chunk_pages: usize,
    ) -> Self {
        let count = region.pages() / chunk_pages;
        log::debug!("coarse window pool: {count} chunks of {chunk_pages} pages");
        Self {
            platform,
            per_cpu,
            region,
            chunk_pages,
            state: SpinLock::new(CoarseState {
                chunks: (0..count).map(|_| Chunk::default()).collect(),
                by_physical: BTreeMap::new(),
                unused: (0..count).rev().collect(),
                lru_head: None,
                lru_tail: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    #[inline]
    fn chunk_bytes(&self) -> u64 {
        self.chunk_pages as u64 * PAGE_SIZE
    }

    fn window(&self, id: ChunkId, base: PhysicalAddress, physical: PhysicalAddress) -> Window {
        Window {
            address: self.region.slot_address(id * self.chunk_pages) + (physical - base),
            slot: id,
        }
    }

    /// Maps chunk `id`, which the caller owns, to the physical chunk at
    /// `base` and invalidates the old translations everywhere.
    ///
    /// Runs without the state lock, since the broadcast waits for the other
    /// CPUs.
    fn map_chunk(&self, id: ChunkId, base: PhysicalAddress) -> Result<(), VmemError> {
        let first = id * self.chunk_pages;
        for page in 0..self.chunk_pages {
            self.region
                .bind(&*self.platform, first + page, base + page as u64 * PAGE_SIZE)?;
        }

        let start = self.region.slot_address(first);
        let platform = &*self.platform;
        platform.call_on_cpus(
            CpuSet::all(platform.cpu_count()),
            CallMode::Synchronous,
            &|_| {
                for page in 0..self.chunk_pages {
                    platform.invalidate_page(start + page as u64 * PAGE_SIZE);
                }
            },
        );
        Ok(())
    }

    /// Maps an owned chunk and makes it findable by its physical address.
    ///
    /// If another thread mapped the same physical chunk in the meantime, that
    /// one is used and ours goes back to the pool.
    fn install(
        &self,
        id: ChunkId,
        base: PhysicalAddress,
        physical: PhysicalAddress,
    ) -> Result<Window, VmemError> {
        let mapped = self.map_chunk(id, base);
        let mut state = self.state.lock();
        if let Err(e) = mapped {
            state.recycle(id);
            return Err(e);
        }
        if let Some(&existing) = state.by_physical.get(&base) {
            state.reference(existing);
            state.recycle(id);
            return Ok(self.window(existing, base, physical));
        }

        let chunk = &mut state.chunks[id];
        chunk.physical = Some(base);
        chunk.refs = 1;
        state.by_physical.insert(base, id);
        Ok(self.window(id, base, physical))
    }
}

impl<G: Geometry> PhysicalWindowPool for CoarsePool<G> {
    fn acquire(&self, physical: PhysicalAddress, blocking: bool) -> Result<Window, VmemError> {
        let base = physical.align_down(self.chunk_bytes());
        let mut state = self.state.lock();

        if let Some(&id) = state.by_physical.get(&base) {
            state.reference(id);
            return Ok(self.window(id, base, physical));
        }

        let id = if let Some(id) = state.take_unused() {
            drop(state);
            id
        } else {
            if !blocking {
                return Err(VmemError::WouldBlock);
            }
            let handoff = Arc::new(Handoff::new());
            state.waiters.push_back(Arc::clone(&handoff));
            drop(state);
            handoff.wait(|| self.platform.yield_now())
        };
        self.install(id, base, physical)
    }

    fn release(&self, window: Window) {
        let id = window.slot;
        let mut state = self.state.lock();
        let chunk = &mut state.chunks[id];
        debug_assert!(chunk.refs > 0, "coarse chunk released too often");
        chunk.refs -= 1;
        if chunk.refs > 0 {
            return;
        }

        if let Some(waiter) = state.waiters.pop_front() {
            state.detach(id);
            waiter.offer(id);
        } else {
            state.lru_push_back(id);
        }
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

#[cfg(test)]
mod tests {
    use crate::config::{PoolConfig, PoolStrategy};
    use crate::error::VmemError;
    use crate::geometry::X86_64;
    use crate::sim::{Machine, Setup};
    use crate::window_pool::PhysicalWindowPool;
    use crate::PAGE_SIZE;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, mpsc};
    use std::time::{Duration, Instant};

    fn coarse(chunk_pages: usize, chunk_count: usize) -> Setup {
        Setup {
            pool: PoolConfig {
                strategy: PoolStrategy::Coarse {
                    chunk_pages,
                    chunk_count,
                },
                per_cpu_slots: 4,
            },
            ..Setup::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn neighbouring_pages_share_a_chunk() {
        let m = Machine::<X86_64>::boot(coarse(2, 4));
        let pool = m.method.physical_window_pool();

        let first = pool.acquire(m.ram.frame(2000), false).unwrap();
        let stats = m.platform.stats();
        let second = pool.acquire(m.ram.frame(2001), false).unwrap();
        assert_eq!(m.platform.stats(), stats);
        assert_eq!(second.address - first.address, PAGE_SIZE);

        pool.release(first);
        pool.release(second);
    }

    #[test]
    fn released_chunks_stay_mapped_until_recycled() {
        let m = Machine::<X86_64>::boot(coarse(1, 4));
        let pool = m.method.physical_window_pool();

        let window = pool.acquire(m.ram.frame(2000), false).unwrap();
        let address = window.address;
        pool.release(window);

        let stats = m.platform.stats();
        let again = pool.acquire(m.ram.frame(2000) + 0x20, false).unwrap();
        assert_eq!(again.address, address + 0x20);
        assert_eq!(m.platform.stats(), stats);
        pool.release(again);
    }

    #[test]
    fn recycled_chunk_shows_no_stale_translation() {
        let m = Machine::<X86_64>::boot(coarse(1, 1));
        let pool = m.method.physical_window_pool();
        m.ram.write_u8(m.ram.frame(2000), 0xa1);
        m.ram.write_u8(m.ram.frame(2001), 0xb2);

        let window = pool.acquire(m.ram.frame(2000), false).unwrap();
        assert_eq!(unsafe { pool.window_ptr(&window).read() }, 0xa1);
        let address = window.address;
        pool.release(window);

        let window = pool.acquire(m.ram.frame(2001), false).unwrap();
        assert_eq!(window.address, address);
        assert_eq!(unsafe { pool.window_ptr(&window).read() }, 0xb2);
        pool.release(window);
    }

    #[test]
    fn referenced_chunks_are_never_evicted() {
        let m = Machine::<X86_64>::boot(coarse(1, 2));
        let pool = m.method.physical_window_pool();

        let a = pool.acquire(m.ram.frame(2000), false).unwrap();
        pool.release(a);
        let a = pool.acquire(m.ram.frame(2000), false).unwrap();
        let b = pool.acquire(m.ram.frame(2001), false).unwrap();
        assert!(matches!(
            pool.acquire(m.ram.frame(2002), false),
            Err(VmemError::WouldBlock)
        ));

        // only the unreferenced chunk can be recycled
        let recycled = b.address;
        pool.release(b);
        let c = pool.acquire(m.ram.frame(2002), false).unwrap();
        assert_eq!(c.address, recycled);
        pool.release(a);
        pool.release(c);
    }

    #[test]
    fn each_release_wakes_one_waiter_in_arrival_order() {
        let m = Arc::new(Machine::<X86_64>::boot(coarse(1, 4)));
        let pool = Arc::clone(m.method.physical_window_pool());
        let mut held: Vec<_> = (0..4)
            .map(|i| pool.acquire(m.ram.frame(2000 + i), false).unwrap())
            .collect();

        let (woken, wakeups) = mpsc::channel();
        let mut waiters = Vec::new();
        for id in 0..2 {
            let (go, release) = mpsc::channel::<()>();
            let waiter_pool = Arc::clone(&pool);
            let frame = m.ram.frame(2010 + id);
            let woken = woken.clone();
            waiters.push((
                go,
                std::thread::spawn(move || {
                    let window = waiter_pool.acquire(frame, true).unwrap();
                    woken.send(id).unwrap();
                    release.recv().unwrap();
                    waiter_pool.release(window);
                }),
            ));
            wait_until(|| pool.waiting() == id + 1);
        }

        pool.release(held.remove(0));
        assert_eq!(wakeups.recv().unwrap(), 0);
        assert_eq!(pool.waiting(), 1);
        assert!(wakeups.try_recv().is_err());

        pool.release(held.remove(0));
        assert_eq!(wakeups.recv().unwrap(), 1);
        assert_eq!(pool.waiting(), 0);

        for (go, waiter) in waiters {
            go.send(()).unwrap();
            waiter.join().unwrap();
        }
        for window in held {
            pool.release(window);
        }
    }

    #[test]
    fn chunks_are_bound_without_holding_the_state_lock() {
        let m = Machine::<X86_64>::boot(coarse(1, 2));
        let pool = Arc::clone(m.method.physical_window_pool());
        let checked = m.check_pool_unlocked_during_cross_calls();

        let first = pool.acquire(m.ram.frame(2000), false).unwrap();
        let second = pool.acquire(m.ram.frame(2001), false).unwrap();
        pool.release(first);
        let evicting = pool.acquire(m.ram.frame(2002), false).unwrap();
        assert_eq!(checked.load(Ordering::SeqCst), 3);

        unsafe { *pool.window_ptr(&evicting) = 0x5a };
        assert_eq!(m.ram.read_u8(m.ram.frame(2002)), 0x5a);
        pool.release(second);
        pool.release(evicting);
    }
}

//! A simulated machine for host tests.
//!
//! - [`Ram`]: page-aligned host memory standing in for physical memory
//!   starting at [`PHYS_BASE`].
//! - [`SimFrames`]: a frame allocator over that RAM that can be told to fail.
//! - [`HostPlatform`]: CPU identity and interrupt state are thread-locals; a
//!   software MMU walks the real page tables (setting accessed and dirty
//!   bits like hardware does) and caches translations in per-CPU TLBs, so
//!   missing invalidations show up as stale reads.
//! - [`Machine`]: all of the above booted through [`PagingMethod`].

use crate::access::{DirectMap, TablePtr};
use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::{PoolConfig, PoolStrategy, TableAccessConfig, VmemConfig};
use crate::entry::{PageTableEntry, Protection};
use crate::geometry::Geometry;
use crate::paging_method::PagingMethod;
use crate::platform::{CallMode, CpuId, CpuSet, DeferredTask, FrameAllocator, Platform};
use crate::translation_map::TranslationMap;
use crate::window_pool::PhysicalWindowPool;
use crate::PAGE_SIZE;
use kernel_sync::InterruptControl;
use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// First simulated physical address.
pub(crate) const PHYS_BASE: u64 = 0x10_0000;

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// Simulated physical memory. Leaked, so copies stay valid forever.
#[derive(Copy, Clone)]
pub(crate) struct Ram {
    host: usize,
    frames: usize,
}

impl Ram {
    pub(crate) fn new(frames: usize) -> Self {
        let memory: Vec<Frame> = (0..frames).map(|_| Frame([0; 4096])).collect();
        let memory = Box::leak(memory.into_boxed_slice());
        Self {
            host: memory.as_mut_ptr() as usize,
            frames,
        }
    }

    pub(crate) fn direct_map(self) -> DirectMap {
        DirectMap::new((self.host as u64).wrapping_sub(PHYS_BASE))
    }

    pub(crate) fn contains(self, pa: PhysicalAddress) -> bool {
        (PHYS_BASE..PHYS_BASE + self.frames as u64 * PAGE_SIZE).contains(&pa.as_u64())
    }

    pub(crate) fn ptr(self, pa: PhysicalAddress) -> *mut u8 {
        assert!(self.contains(pa), "{pa} is outside simulated RAM");
        self.direct_map().ptr(pa)
    }

    pub(crate) fn frame(self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(PHYS_BASE + index as u64 * PAGE_SIZE)
    }

    pub(crate) fn read_u8(self, pa: PhysicalAddress) -> u8 {
        unsafe { self.ptr(pa).read_volatile() }
    }

    pub(crate) fn write_u8(self, pa: PhysicalAddress, value: u8) {
        unsafe { self.ptr(pa).write_volatile(value) }
    }

    fn entries(self, table: PhysicalAddress, width: crate::geometry::EntryWidth) -> TablePtr {
        unsafe { TablePtr::new(self.ptr(table), width) }
    }
}

/// Frame allocator over [`Ram`].
pub(crate) struct SimFrames {
    ram: Ram,
    free: Mutex<Vec<PhysicalAddress>>,
    /// Allocations left before the allocator starts failing.
    budget: AtomicUsize,
    outstanding: AtomicUsize,
}

impl SimFrames {
    pub(crate) fn new(ram: Ram) -> Self {
        Self {
            ram,
            free: Mutex::new((0..ram.frames).rev().map(|i| ram.frame(i)).collect()),
            budget: AtomicUsize::new(usize::MAX),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Lets the next `count` allocations succeed and fails the rest.
    pub(crate) fn fail_after(&self, count: usize) {
        self.budget.store(count, Ordering::SeqCst);
    }

    pub(crate) fn never_fail(&self) {
        self.budget.store(usize::MAX, Ordering::SeqCst);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// A data page for tests.
    pub(crate) fn page(&self) -> PhysicalAddress {
        self.allocate_wired_zero_page().expect("simulated RAM exhausted")
    }
}

impl FrameAllocator for SimFrames {
    fn allocate_wired_zero_page(&self) -> Option<PhysicalAddress> {
        if self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_err()
        {
            return None;
        }
        let page = self.free.lock().unwrap().pop()?;
        unsafe { self.ram.ptr(page).write_bytes(0, PAGE_SIZE as usize) };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(page)
    }

    fn free_page(&self, page: PhysicalAddress) {
        assert_eq!(page.page_offset(), 0, "freeing a sub-page address");
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.free.lock().unwrap().push(page);
    }
}

thread_local! {
    static CPU: Cell<CpuId> = const { Cell::new(0) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(true) };
    static PINNED: Cell<usize> = const { Cell::new(0) };
    static THREAD: Cell<usize> = const { Cell::new(0) };
}

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(1);

/// Moves the calling test thread to `cpu`.
pub(crate) fn set_current_cpu(cpu: CpuId) {
    CPU.with(|c| c.set(cpu));
}

pub(crate) fn pinned() -> usize {
    PINNED.with(Cell::get)
}

#[derive(Copy, Clone, Debug)]
struct TlbEntry {
    frame: PhysicalAddress,
    writable: bool,
    global: bool,
}

/// Counters of TLB maintenance, summed over all CPUs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct TlbStats {
    pub page: usize,
    pub full: usize,
    pub cross_calls: usize,
}

type CrossCallHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct HostPlatform<G: Geometry> {
    ram: Ram,
    cpus: usize,
    roots: Mutex<Vec<Option<PhysicalAddress>>>,
    kernel_root: Mutex<Option<PhysicalAddress>>,
    tlbs: Vec<Mutex<HashMap<u64, TlbEntry>>>,
    page_invalidations: AtomicUsize,
    full_invalidations: AtomicUsize,
    cross_calls: AtomicUsize,
    cross_call_hook: Mutex<Option<CrossCallHook>>,
    deferred: Mutex<Vec<DeferredTask>>,
    _geometry: PhantomData<G>,
}

impl<G: Geometry> HostPlatform<G> {
    pub(crate) fn new(ram: Ram, cpus: usize) -> Self {
        Self {
            ram,
            cpus,
            roots: Mutex::new(vec![None; cpus]),
            kernel_root: Mutex::new(None),
            tlbs: (0..cpus).map(|_| Mutex::new(HashMap::new())).collect(),
            page_invalidations: AtomicUsize::new(0),
            full_invalidations: AtomicUsize::new(0),
            cross_calls: AtomicUsize::new(0),
            cross_call_hook: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
            _geometry: PhantomData,
        }
    }

    pub(crate) fn stats(&self) -> TlbStats {
        TlbStats {
            page: self.page_invalidations.load(Ordering::SeqCst),
            full: self.full_invalidations.load(Ordering::SeqCst),
            cross_calls: self.cross_calls.load(Ordering::SeqCst),
        }
    }

    /// Runs `hook` on the calling thread at the start of every cross-CPU call.
    pub(crate) fn on_cross_call(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.cross_call_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub(crate) fn deferred_tasks(&self) -> usize {
        self.deferred.lock().unwrap().len()
    }

    pub(crate) fn run_deferred(&self) {
        let tasks: Vec<_> = self.deferred.lock().unwrap().drain(..).collect();
        for task in tasks {
            task();
        }
    }

    pub(crate) fn root_of(&self, cpu: CpuId) -> Option<PhysicalAddress> {
        self.roots.lock().unwrap()[cpu].or(*self.kernel_root.lock().unwrap())
    }

    pub(crate) fn tlb_has(&self, cpu: CpuId, va: VirtualAddress) -> bool {
        self.tlbs[cpu].lock().unwrap().contains_key(&(va.as_u64() >> 12))
    }

    /// Resolves `va` on `cpu` the way the MMU would, filling the TLB.
    pub(crate) fn translate(&self, cpu: CpuId, va: VirtualAddress, write: bool) -> Option<PhysicalAddress> {
        let vpn = va.as_u64() >> 12;
        if let Some(entry) = self.tlbs[cpu].lock().unwrap().get(&vpn) {
            if !write || entry.writable {
                return Some(entry.frame + va.page_offset());
            }
        }

        let leaf_level = G::leaf_level();
        let mut table = self.root_of(cpu)?;
        for level in 0..leaf_level {
            let width = G::LEVELS[level].width;
            let raw = self.ram.entries(table, width).load(G::index(level, va));
            match G::decode(level, raw) {
                PageTableEntry::Table(next) => table = next,
                _ => return None,
            }
        }

        let width = G::leaf_shape().width;
        let mut slot = (table, G::index(leaf_level, va));
        let mut raw = self.ram.entries(slot.0, width).load(slot.1);
        if let PageTableEntry::Indirect(location) = G::decode(leaf_level, raw) {
            slot = (location.address(), 0);
            raw = self.ram.entries(slot.0, width).load(0);
        }

        let entries = self.ram.entries(slot.0, width);
        let leaf = loop {
            let PageTableEntry::Leaf(leaf) = G::decode(leaf_level, raw) else {
                return None;
            };
            if write && !leaf.protection.contains(Protection::KERNEL_WRITE) {
                return None;
            }
            let mut updated = leaf;
            updated.accessed = true;
            updated.dirty |= write;
            if updated == leaf {
                break leaf;
            }
            let new = G::encode(leaf_level, &PageTableEntry::Leaf(updated)).ok()?;
            match entries.compare_exchange(slot.1, raw, new) {
                Ok(_) => break updated,
                Err(actual) => raw = actual,
            }
        };

        self.tlbs[cpu].lock().unwrap().insert(
            vpn,
            TlbEntry {
                frame: leaf.frame,
                writable: leaf.protection.contains(Protection::KERNEL_WRITE),
                global: leaf.global,
            },
        );
        Some(leaf.frame + va.page_offset())
    }
}

impl<G: Geometry> InterruptControl for HostPlatform<G> {
    fn disable(&self) -> bool {
        INTERRUPTS.with(|i| i.replace(false))
    }

    fn restore(&self, were_enabled: bool) {
        INTERRUPTS.with(|i| i.set(were_enabled));
    }

    fn are_enabled(&self) -> bool {
        INTERRUPTS.with(Cell::get)
    }
}

impl<G: Geometry> Platform for HostPlatform<G> {
    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> CpuId {
        CPU.with(Cell::get)
    }

    fn current_thread(&self) -> NonZeroUsize {
        let id = THREAD.with(|t| {
            if t.get() == 0 {
                t.set(NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
            }
            t.get()
        });
        NonZeroUsize::new(id).expect("thread ids start at 1")
    }

    fn pin_current_thread(&self) {
        PINNED.with(|p| p.set(p.get() + 1));
    }

    fn unpin_current_thread(&self) {
        PINNED.with(|p| p.set(p.get() - 1));
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        let cpu = self.current_cpu();
        self.tlbs[cpu].lock().unwrap().remove(&(va.as_u64() >> 12));
        self.page_invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn invalidate_all(&self, include_global: bool) {
        let cpu = self.current_cpu();
        self.tlbs[cpu]
            .lock()
            .unwrap()
            .retain(|_, entry| entry.global && !include_global);
        self.full_invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn call_on_cpus(&self, cpus: CpuSet, _mode: CallMode, f: &(dyn Fn(CpuId) + Sync)) {
        self.cross_calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.cross_call_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        let home = self.current_cpu();
        for cpu in cpus.iter() {
            set_current_cpu(cpu);
            f(cpu);
        }
        set_current_cpu(home);
    }

    fn set_translation_root(&self, root: PhysicalAddress) {
        let cpu = self.current_cpu();
        self.kernel_root.lock().unwrap().get_or_insert(root);
        self.roots.lock().unwrap()[cpu] = Some(root);
        self.tlbs[cpu].lock().unwrap().retain(|_, entry| entry.global);
    }

    fn defer(&self, task: DeferredTask) {
        self.deferred.lock().unwrap().push(task);
    }

    fn virt_ptr(&self, va: VirtualAddress) -> *mut u8 {
        let pa = self
            .translate(self.current_cpu(), va, false)
            .unwrap_or_else(|| panic!("kernel access to unmapped {va}"));
        self.ram.ptr(pa)
    }
}

/// Boot parameters for [`Machine`].
#[derive(Copy, Clone, Debug)]
pub(crate) struct Setup {
    pub cpus: usize,
    pub frames: usize,
    pub windowed: bool,
    pub pool: PoolConfig,
    pub invalidate_capacity: usize,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            cpus: 1,
            frames: 2048,
            windowed: false,
            pool: PoolConfig {
                strategy: PoolStrategy::Coarse {
                    chunk_pages: 2,
                    chunk_count: 8,
                },
                per_cpu_slots: 4,
            },
            invalidate_capacity: 64,
        }
    }
}

pub(crate) struct Machine<G: Geometry> {
    pub ram: Ram,
    pub frames: Arc<SimFrames>,
    pub platform: Arc<HostPlatform<G>>,
    pub method: PagingMethod<G>,
}

impl<G: Geometry> Machine<G> {
    /// Bootstraps without attaching the runtime allocator.
    pub(crate) fn boot_early(setup: Setup) -> Self {
        let ram = Ram::new(setup.frames);
        let frames = Arc::new(SimFrames::new(ram));
        let platform = Arc::new(HostPlatform::<G>::new(ram, setup.cpus));
        set_current_cpu(0);

        let access = if setup.windowed {
            TableAccessConfig::Windowed { boot: ram.direct_map() }
        } else {
            TableAccessConfig::Direct(ram.direct_map())
        };
        let config = VmemConfig::new::<G>(access)
            .with_pool(setup.pool)
            .with_invalidate_capacity(setup.invalidate_capacity);

        let early = Arc::clone(&frames);
        let method = PagingMethod::init(
            Arc::clone(&platform) as Arc<dyn Platform>,
            &config,
            &mut || early.allocate_wired_zero_page(),
        )
        .expect("paging bootstrap");

        Self {
            ram,
            frames,
            platform,
            method,
        }
    }

    pub(crate) fn boot(setup: Setup) -> Self {
        let machine = Self::boot_early(setup);
        machine
            .method
            .init_post_allocator(Arc::clone(&machine.frames) as Arc<dyn FrameAllocator>)
            .expect("allocator attach");
        machine
    }

    /// From now on, every cross-CPU call checks from another thread that the
    /// shared window pool is not locked. Returns the number of checks done.
    pub(crate) fn check_pool_unlocked_during_cross_calls(&self) -> Arc<AtomicUsize> {
        let checked = Arc::new(AtomicUsize::new(0));
        let pool = Arc::downgrade(self.method.physical_window_pool());
        let count = Arc::clone(&checked);
        self.platform.on_cross_call(move || {
            let Some(pool) = pool.upgrade() else { return };
            let (done, finished) = std::sync::mpsc::channel();
            std::thread::spawn(move || done.send(pool.waiting()).unwrap());
            assert!(
                finished.recv_timeout(std::time::Duration::from_secs(5)).is_ok(),
                "window pool locked across a cross-CPU call"
            );
            count.fetch_add(1, Ordering::SeqCst);
        });
        checked
    }

    pub(crate) fn kernel(&self) -> Arc<TranslationMap<G>> {
        self.method.create_translation_map(true).expect("kernel map")
    }

    pub(crate) fn user(&self) -> Arc<TranslationMap<G>> {
        self.method.create_translation_map(false).expect("user map")
    }

    /// Touches `va` on the current CPU; returns the physical address used.
    pub(crate) fn touch(&self, va: VirtualAddress, write: bool) -> Option<PhysicalAddress> {
        self.platform.translate(CPU.with(Cell::get), va, write)
    }

    /// Reads one byte through the simulated MMU of the current CPU.
    pub(crate) fn load(&self, va: VirtualAddress) -> Option<u8> {
        self.touch(va, false).map(|pa| self.ram.read_u8(pa))
    }
}

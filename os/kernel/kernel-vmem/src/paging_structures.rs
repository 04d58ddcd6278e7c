//! # Paging structures
//!
//! [`PagingStructures`] owns the root table of one address space. User
//! address spaces share the kernel half of the root with every other
//! address space: when the kernel installs a table under a kernel-range root
//! slot, the same raw entry is written into every live root. The
//! [`StructuresRegistry`] keeps track of the live roots for that purpose.
//!
//! ```text
//!   kernel root      user root A      user root B
//!  ┌──────────┐     ┌──────────┐     ┌──────────┐
//!  │ user …   │     │ user …   │     │ user …   │   private
//!  ├──────────┤     ├──────────┤     ├──────────┤
//!  │ kernel ──┼──┬──┼─ kernel  │  ┌──┼─ kernel  │   identical raw entries
//!  └──────────┘  │  └──────────┘  │  └──────────┘
//!                └───── same level-1 tables ─────
//! ```

use crate::access::{TableAccess, TableCursor};
use crate::addresses::PhysicalAddress;
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::platform::{CpuId, CpuSet, FrameAllocator, Platform};
use crate::walk::Walker;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{SpinLock, SyncOnceCell};

/// Services shared by every address space of one paging method.
pub(crate) struct PagingContext<G: Geometry> {
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) access: TableAccess,
    pub(crate) registry: StructuresRegistry<G>,
    pub(crate) frames: SyncOnceCell<Arc<dyn FrameAllocator>>,
    pub(crate) kernel_root: PhysicalAddress,
    pub(crate) invalidate_capacity: usize,
}

/// The root table of one address space.
///
/// Shared through [`Arc`]; dropping the last reference unregisters a user
/// address space and frees its tables.
pub struct PagingStructures<G: Geometry> {
    root: PhysicalAddress,
    kernel: bool,
    active: AtomicU64,
    link: UnsafeCell<Link<G>>,
    context: Arc<PagingContext<G>>,
}

// Safety: `link` is only touched under the registry lock; everything else is
// immutable or atomic.
unsafe impl<G: Geometry> Send for PagingStructures<G> {}
unsafe impl<G: Geometry> Sync for PagingStructures<G> {}

impl<G: Geometry> PagingStructures<G> {
    pub(crate) fn new_kernel(context: Arc<PagingContext<G>>) -> Arc<Self> {
        Arc::new(Self {
            root: context.kernel_root,
            kernel: true,
            active: AtomicU64::new(0),
            link: UnsafeCell::new(Link::default()),
            context,
        })
    }

    /// A fresh user address space with the current kernel half.
    pub(crate) fn new_user(context: Arc<PagingContext<G>>) -> Result<Arc<Self>, VmemError> {
        let frames = context.frames.get().ok_or(VmemError::OutOfMemory)?;
        let root = frames.allocate_wired_zero_page().ok_or(VmemError::OutOfMemory)?;
        if let Err(e) = context.access.zero_page(root) {
            frames.free_page(root);
            return Err(e);
        }

        let structures = Arc::new(Self {
            root,
            kernel: false,
            active: AtomicU64::new(0),
            link: UnsafeCell::new(Link::default()),
            context,
        });
        structures.context.registry.register(&structures.context, &structures)?;
        log::debug!("{}: user paging structures at {root}", G::NAME);
        Ok(structures)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// CPUs this address space is currently loaded on.
    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active.load(Ordering::Acquire))
    }

    pub(crate) fn mark_active(&self, cpu: CpuId) {
        self.active.fetch_or(CpuSet::single(cpu).bits(), Ordering::AcqRel);
    }

    pub(crate) fn mark_inactive(&self, cpu: CpuId) {
        self.active.fetch_and(!CpuSet::single(cpu).bits(), Ordering::AcqRel);
    }

    pub(crate) fn context(&self) -> &PagingContext<G> {
        &self.context
    }

    pub(crate) fn walker(&self) -> Walker<'_, G> {
        Walker::new(&self.context, self.root, self.kernel)
    }
}

impl<G: Geometry> Drop for PagingStructures<G> {
    fn drop(&mut self) {
        if self.kernel {
            return;
        }

        let context = &self.context;
        context.registry.unregister(context, self);

        let Some(frames) = context.frames.get().cloned() else {
            log::warn!("{}: no allocator to free tables of {}", G::NAME, self.root);
            return;
        };
        let root = self.root;
        let free = {
            let context = Arc::clone(context);
            move || {
                if let Err(e) = Walker::new(&context, root, false).free_user_tables(&*frames) {
                    log::warn!("{}: freeing tables of {root} failed: {e}", G::NAME);
                }
            }
        };

        if context.platform.are_enabled() {
            free();
        } else {
            log::trace!("{}: deferring release of {root}", G::NAME);
            context.platform.defer(alloc::boxed::Box::new(free));
        }
    }
}

struct Link<G: Geometry> {
    prev: Option<NonNull<PagingStructures<G>>>,
    next: Option<NonNull<PagingStructures<G>>>,
}

impl<G: Geometry> Default for Link<G> {
    fn default() -> Self {
        Self { prev: None, next: None }
    }
}

struct RegistryList<G: Geometry> {
    head: Option<NonNull<PagingStructures<G>>>,
    len: usize,
}

// Safety: the list only points at `PagingStructures`, which are Send + Sync.
unsafe impl<G: Geometry> Send for RegistryList<G> {}

/// Intrusive list of the live user address spaces.
///
/// Every operation runs with interrupts disabled and never allocates.
pub(crate) struct StructuresRegistry<G: Geometry> {
    list: SpinLock<RegistryList<G>>,
}

impl<G: Geometry> StructuresRegistry<G> {
    pub(crate) const fn new() -> Self {
        Self {
            list: SpinLock::new(RegistryList { head: None, len: 0 }),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self, platform: &dyn Platform) -> usize {
        self.list.lock_irq(platform).len
    }

    /// Copies the kernel half of the kernel root into `structures` and links
    /// it, in one critical section.
    fn register(&self, context: &PagingContext<G>, structures: &Arc<PagingStructures<G>>) -> Result<(), VmemError> {
        let kernel = G::kernel_root_indices();
        let width = G::LEVELS[0].width;
        let mut list = self.list.lock_irq(&*context.platform);

        context.access.with_table(context.kernel_root, width, |source| {
            context.access.with_table(structures.root, width, |target| {
                for i in kernel {
                    target.store(i, source.load(i));
                }
            })
        })??;

        let node = NonNull::from(&**structures);
        // Safety: the registry lock is held; linked nodes are alive until
        // they unregister themselves.
        unsafe {
            (*structures.link.get()).next = list.head;
            if let Some(head) = list.head {
                (*head.as_ref().link.get()).prev = Some(node);
            }
        }
        list.head = Some(node);
        list.len += 1;
        Ok(())
    }

    fn unregister(&self, context: &PagingContext<G>, structures: &PagingStructures<G>) {
        let mut list = self.list.lock_irq(&*context.platform);
        // Safety: as in `register`.
        unsafe {
            let link = &mut *structures.link.get();
            if link.prev.is_none() && list.head != Some(NonNull::from(structures)) {
                // never made it into the list
                return;
            }
            match link.prev {
                Some(prev) => (*prev.as_ref().link.get()).next = link.next,
                None => list.head = link.next,
            }
            if let Some(next) = link.next {
                (*next.as_ref().link.get()).prev = link.prev;
            }
            link.prev = None;
            link.next = None;
        }
        list.len -= 1;
    }

    /// Writes kernel-range root entries starting at `first` into the kernel
    /// root and every registered root.
    pub(crate) fn install_kernel_entries(
        &self,
        context: &PagingContext<G>,
        kernel_root: PhysicalAddress,
        first: usize,
        raws: &[u64],
    ) -> Result<(), VmemError> {
        let width = G::LEVELS[0].width;
        // The window is claimed before anything is written, so every live
        // root gets the entries or none does.
        let updated = context.access.with_tables(kernel_root, width, |cursor| {
            let list = self.list.lock_irq(&*context.platform);
            store_root_entries(cursor, kernel_root, first, raws)?;
            let mut next = list.head;
            let mut updated = 0;
            while let Some(node) = next {
                // Safety: as in `register`.
                let node = unsafe { node.as_ref() };
                store_root_entries(cursor, node.root, first, raws)?;
                updated += 1;
                // Safety: as in `register`.
                next = unsafe { (*node.link.get()).next };
            }
            Ok::<usize, VmemError>(updated)
        })??;
        log::trace!(
            "{}: kernel root slots {first}..{} propagated to {updated} address spaces",
            G::NAME,
            first + raws.len()
        );
        Ok(())
    }
}

fn store_root_entries(
    cursor: &mut TableCursor<'_>,
    root: PhysicalAddress,
    first: usize,
    raws: &[u64],
) -> Result<(), VmemError> {
    let table = cursor.at(root)?;
    for (j, &raw) in raws.iter().enumerate() {
        table.store(first + j, raw);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::addresses::VirtualAddress;
    use crate::entry::{MemoryType, Protection};
    use crate::error::VmemError;
    use crate::geometry::{EntryWidth, Geometry, X86_64};
    use crate::sim::{Machine, Setup};
    use kernel_sync::InterruptControl;

    const FRESH_SLOT: u64 = 0xffff_c000_0000_0000;

    fn root_entry(m: &Machine<X86_64>, root: crate::PhysicalAddress, index: usize) -> u64 {
        m.method
            .context()
            .access
            .with_table(root, EntryWidth::U64, |t| t.load(index))
            .unwrap()
    }

    #[test]
    fn kernel_tables_reach_address_spaces_created_before_and_after() {
        let m = Machine::<X86_64>::boot(Setup::default());
        let kernel = m.kernel();
        let before = m.user();
        let va = VirtualAddress::new(FRESH_SLOT);

        kernel
            .map(va, m.ram.frame(2000), Protection::kernel_rw(), MemoryType::WriteBack)
            .unwrap();
        let after = m.user();

        for user in [&before, &after] {
            assert_eq!(user.query(va).unwrap().physical, m.ram.frame(2000));
        }

        // the user space sees it through the MMU, too
        m.ram.write_u8(m.ram.frame(2000), 0x42);
        let activation = before.activate_on_current_cpu();
        assert_eq!(m.load(va), Some(0x42));
        drop(activation);
    }

    #[test]
    fn kernel_half_of_every_root_is_identical() {
        let m = Machine::<X86_64>::boot(Setup::default());
        let kernel = m.kernel();
        let users = [m.user(), m.user()];
        for slot in 0..4u64 {
            let va = VirtualAddress::new(FRESH_SLOT + (slot << 39));
            kernel
                .map(va, m.ram.frame(2000), Protection::kernel_rw(), MemoryType::WriteBack)
                .unwrap();
        }

        let kernel_root = m.method.kernel_root();
        for user in &users {
            let root = user.structures().root();
            for index in X86_64::kernel_root_indices() {
                assert_eq!(root_entry(&m, root, index), root_entry(&m, kernel_root, index));
            }
        }
        assert_eq!(m.method.context().registry.len(&*m.platform), 2);
    }

    #[test]
    fn user_tables_are_freed_on_drop() {
        let m = Machine::<X86_64>::boot(Setup::default());
        let outstanding = m.frames.outstanding();

        let user = m.user();
        user.map(
            VirtualAddress::new(0x40_0000),
            m.ram.frame(2000),
            Protection::user_rw(),
            MemoryType::WriteBack,
        )
        .unwrap();
        // root, PDPT, PD, PT
        assert_eq!(m.frames.outstanding(), outstanding + 4);

        drop(user);
        assert_eq!(m.frames.outstanding(), outstanding);
        assert_eq!(m.platform.deferred_tasks(), 0);
        assert_eq!(m.method.context().registry.len(&*m.platform), 0);
    }

    #[test]
    fn release_with_interrupts_disabled_is_deferred() {
        let m = Machine::<X86_64>::boot(Setup::default());
        let outstanding = m.frames.outstanding();
        let user = m.user();
        user.map(
            VirtualAddress::new(0x40_0000),
            m.ram.frame(2000),
            Protection::user_rw(),
            MemoryType::WriteBack,
        )
        .unwrap();

        let were_enabled = m.platform.disable();
        drop(user);
        m.platform.restore(were_enabled);

        // unlinked right away, freed later
        assert_eq!(m.method.context().registry.len(&*m.platform), 0);
        assert_eq!(m.platform.deferred_tasks(), 1);
        assert_eq!(m.frames.outstanding(), outstanding + 4);

        m.platform.run_deferred();
        assert_eq!(m.frames.outstanding(), outstanding);
    }

    #[test]
    fn unlinking_from_the_middle_keeps_the_rest() {
        let m = Machine::<X86_64>::boot(Setup::default());
        let kernel = m.kernel();
        let (first, middle, last) = (m.user(), m.user(), m.user());
        drop(middle);
        assert_eq!(m.method.context().registry.len(&*m.platform), 2);

        let va = VirtualAddress::new(FRESH_SLOT);
        kernel
            .map(va, m.ram.frame(2000), Protection::kernel_rw(), MemoryType::WriteBack)
            .unwrap();
        assert!(first.query(va).is_ok());
        assert!(last.query(va).is_ok());
    }

    #[test]
    fn propagation_with_busy_windows_is_all_or_nothing() {
        let m = Machine::<X86_64>::boot(Setup {
            windowed: true,
            ..Setup::default()
        });
        let kernel = m.kernel();
        let users = [m.user(), m.user()];
        let pool = m.method.physical_window_pool();
        let va = VirtualAddress::new(FRESH_SLOT);
        let map = || kernel.map(va, m.ram.frame(2000), Protection::kernel_rw(), MemoryType::WriteBack);

        // no slot left: nothing is written anywhere
        let held: Vec<_> = (0..4)
            .map(|i| pool.acquire_current_cpu(m.ram.frame(i)).unwrap())
            .collect();
        assert_eq!(map(), Err(VmemError::WouldBlock));
        for window in held {
            pool.release_current_cpu(window);
        }
        let index = X86_64::index(0, va);
        assert_eq!(root_entry(&m, m.method.kernel_root(), index), 0);

        // a single free slot is enough to reach every root
        let held: Vec<_> = (0..3)
            .map(|i| pool.acquire_current_cpu(m.ram.frame(i)).unwrap())
            .collect();
        map().unwrap();
        for window in held {
            pool.release_current_cpu(window);
        }

        let expected = root_entry(&m, m.method.kernel_root(), index);
        assert_ne!(expected, 0);
        for user in &users {
            assert_eq!(root_entry(&m, user.structures().root(), index), expected);
            assert_eq!(user.query(va).unwrap().physical, m.ram.frame(2000));
        }
    }
}

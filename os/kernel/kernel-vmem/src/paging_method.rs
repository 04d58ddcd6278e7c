//! # Paging method
//!
//! [`PagingMethod`] is created once per boot for one [`Geometry`]. Boot runs
//! in two phases:
//!
//! 1. [`PagingMethod::init`], before any allocator exists: allocates the
//!    kernel root and the window pool's backing through a "give me a free
//!    page" callback. [`PagingMethod::map_early`] maps boot-known ranges the
//!    same way.
//! 2. [`PagingMethod::init_post_allocator`], once the frame allocator runs:
//!    builds the kernel [`TranslationMap`] and lets pools grow.
//!
//! From then on [`PagingMethod::create_translation_map`] hands out the
//! kernel map or fresh user maps.

use crate::access::TableAccess;
use crate::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use crate::config::{PoolStrategy, VmemConfig};
use crate::entry::{Leaf, MemoryType, PageTableEntry, Protection};
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::paging_structures::{PagingContext, PagingStructures, StructuresRegistry};
use crate::platform::{FrameAllocator, Platform};
use crate::translation_map::TranslationMap;
use crate::walk::{EarlySource, Walker};
use crate::window_pool::coarse::CoarsePool;
use crate::window_pool::fine::FinePool;
use crate::window_pool::region::{KernelRegionSource, RegionMapper, VaAllocator, provision_region};
use crate::window_pool::{PerCpuSlots, PhysicalWindowPool};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::{SpinLock, SyncOnceCell};

/// Boot-time mapper: walks the kernel structures with pages from the early
/// callback and counts what it maps.
struct EarlyMapper<'w, 's, G: Geometry> {
    walker: Walker<'w, G>,
    source: EarlySource<'s>,
    platform: &'w dyn Platform,
    mapped: usize,
}

impl<G: Geometry> EarlyMapper<'_, '_, G> {
    fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        memory_type: MemoryType,
    ) -> Result<(), VmemError> {
        let slot = self
            .walker
            .leaf_entry(va, Some(&mut self.source))?
            .ok_or(VmemError::NotSupported("large page in the way"))?;
        let leaf = Leaf::new(pa.page_base(), protection, memory_type).with_global(G::is_kernel_address(va));
        match self.walker.swap(slot, &PageTableEntry::Leaf(leaf))? {
            PageTableEntry::Invalid => self.mapped += 1,
            old => {
                log::warn!("{}: early mapping at {va} replaced {old:?}", G::NAME);
                self.platform.invalidate_page(va);
            }
        }
        Ok(())
    }
}

impl<G: Geometry> RegionMapper for EarlyMapper<'_, '_, G> {
    fn prepare_leaf_tables(&mut self, range: VirtualRange) -> Result<Vec<PhysicalAddress>, VmemError> {
        self.walker.prepare_leaf_tables(range, &mut self.source)
    }

    fn map_kernel_page(&mut self, va: VirtualAddress, pa: PhysicalAddress) -> Result<(), VmemError> {
        self.map_page(va, pa, Protection::kernel_rw(), MemoryType::WriteBack)
    }
}

/// The translation layer of one boot.
pub struct PagingMethod<G: Geometry> {
    context: Arc<PagingContext<G>>,
    kernel: Arc<PagingStructures<G>>,
    early_lock: SpinLock<()>,
    early_mappings: AtomicUsize,
    windows: Arc<VaAllocator>,
    pool: Arc<dyn PhysicalWindowPool>,
    fine: Option<Arc<FinePool<G>>>,
    kernel_map: SyncOnceCell<Arc<TranslationMap<G>>>,
}

impl<G: Geometry> PagingMethod<G> {
    /// Bootstraps the kernel address space and the window pool, and loads
    /// the new kernel root on the calling CPU.
    ///
    /// # Panics
    /// If `G` fails [`Geometry::validate`]; such a kernel cannot run.
    ///
    /// # Errors
    /// - [`VmemError::NotSupported`] for an invalid `config`.
    /// - [`VmemError::OutOfMemory`] if `get_free_page` ran dry.
    /// - [`VmemError::AddressSpaceExhausted`] if the window region is too small.
    pub fn init(
        platform: Arc<dyn Platform>,
        config: &VmemConfig,
        get_free_page: &mut dyn FnMut() -> Option<PhysicalAddress>,
    ) -> Result<Self, VmemError> {
        if let Err(e) = G::validate() {
            panic!("{}: {}", G::NAME, VmemError::from(e));
        }
        let cpu_count = platform.cpu_count();
        config.validate::<G>(cpu_count)?;

        let kernel_root = get_free_page().ok_or(VmemError::OutOfMemory)?;
        let access = TableAccess::new(&config.table_access, Arc::clone(&platform));
        access.zero_page(kernel_root)?;

        let context = Arc::new(PagingContext {
            platform,
            access,
            registry: StructuresRegistry::new(),
            frames: SyncOnceCell::new(),
            kernel_root,
            invalidate_capacity: config.invalidate_capacity,
        });
        let kernel = PagingStructures::new_kernel(Arc::clone(&context));
        let windows = Arc::new(VaAllocator::new(config.window_region));
        let per_cpu_slots = config.pool.per_cpu_slots;

        let mut mapper = EarlyMapper {
            walker: kernel.walker(),
            source: EarlySource(&mut *get_free_page),
            platform: &*context.platform,
            mapped: 0,
        };

        let per_cpu_region = provision_region::<G>(
            &mut mapper,
            &windows,
            PerCpuSlots::<G>::pages_needed(cpu_count, per_cpu_slots),
        )?;
        let per_cpu = PerCpuSlots::new(per_cpu_region, cpu_count, per_cpu_slots);

        let platform = Arc::clone(&context.platform);
        let (pool, fine): (Arc<dyn PhysicalWindowPool>, _) = match config.pool.strategy {
            PoolStrategy::Coarse {
                chunk_pages,
                chunk_count,
            } => {
                let region = provision_region::<G>(&mut mapper, &windows, chunk_pages * chunk_count)?;
                (Arc::new(CoarsePool::new(platform, per_cpu, region, chunk_pages)), None)
            }
            PoolStrategy::Fine {
                slots_per_pool,
                max_pools,
            } => {
                let region = provision_region::<G>(&mut mapper, &windows, slots_per_pool)?;
                let fine = Arc::new(FinePool::new(platform, per_cpu, region, slots_per_pool, max_pools));
                (Arc::clone(&fine) as Arc<dyn PhysicalWindowPool>, Some(fine))
            }
        };
        let early_mappings = mapper.mapped;

        context.access.attach_pool(&pool);
        context.platform.set_translation_root(kernel_root);
        log::debug!(
            "{}: kernel root {kernel_root}, {early_mappings} pages mapped for windows",
            G::NAME
        );

        Ok(Self {
            context,
            kernel,
            early_lock: SpinLock::new(()),
            early_mappings: AtomicUsize::new(early_mappings),
            windows,
            pool,
            fine,
            kernel_map: SyncOnceCell::new(),
        })
    }

    /// Maps one kernel page before the frame allocator is available; table
    /// pages come from `get_free_page`. Once
    /// [`init_post_allocator`](Self::init_post_allocator) ran this is the
    /// same as mapping through the kernel map.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if `get_free_page` ran dry.
    pub fn map_early(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        memory_type: MemoryType,
        get_free_page: &mut dyn FnMut() -> Option<PhysicalAddress>,
    ) -> Result<(), VmemError> {
        if let Some(map) = self.kernel_map.get() {
            return map.map(va, pa, protection, memory_type);
        }

        let _guard = self.early_lock.lock();
        let mut mapper = EarlyMapper {
            walker: self.kernel.walker(),
            source: EarlySource(get_free_page),
            platform: &*self.context.platform,
            mapped: 0,
        };
        let result = mapper.map_page(va, pa, protection, memory_type);
        self.early_mappings.fetch_add(mapper.mapped, Ordering::Relaxed);
        result
    }

    /// Switches to the runtime frame allocator: creates the kernel
    /// translation map and enables window pool growth.
    ///
    /// # Errors
    /// [`VmemError::NotSupported`] if called twice.
    pub fn init_post_allocator(&self, frames: Arc<dyn FrameAllocator>) -> Result<(), VmemError> {
        let _guard = self.early_lock.lock();
        if self.context.frames.set(frames).is_err() {
            return Err(VmemError::NotSupported("frame allocator already attached"));
        }

        let early = self.early_mappings.load(Ordering::Relaxed);
        let map = Arc::new(TranslationMap::new(Arc::clone(&self.kernel), early));
        if let Some(fine) = &self.fine {
            fine.attach_source(Box::new(KernelRegionSource::new(
                Arc::downgrade(&map),
                Arc::clone(&self.windows),
            )));
        }
        if self.kernel_map.set(map).is_err() {
            return Err(VmemError::NotSupported("kernel translation map already created"));
        }

        log::debug!("{}: kernel translation map up with {early} early pages", G::NAME);
        Ok(())
    }

    /// The kernel translation map, or a new user address space.
    ///
    /// # Errors
    /// - [`VmemError::NotSupported`] before
    ///   [`init_post_allocator`](Self::init_post_allocator).
    /// - [`VmemError::OutOfMemory`] if a user root could not be allocated.
    pub fn create_translation_map(&self, is_kernel: bool) -> Result<Arc<TranslationMap<G>>, VmemError> {
        if is_kernel {
            return self
                .kernel_map
                .get()
                .cloned()
                .ok_or(VmemError::NotSupported("no frame allocator attached yet"));
        }
        if self.context.frames.get().is_none() {
            return Err(VmemError::NotSupported("no frame allocator attached yet"));
        }
        let structures = PagingStructures::new_user(Arc::clone(&self.context))?;
        Ok(Arc::new(TranslationMap::new(structures, 0)))
    }

    #[must_use]
    pub fn kernel_translation_map(&self) -> Option<&Arc<TranslationMap<G>>> {
        self.kernel_map.get()
    }

    #[must_use]
    pub fn physical_window_pool(&self) -> &Arc<dyn PhysicalWindowPool> {
        &self.pool
    }

    #[must_use]
    pub fn kernel_root(&self) -> PhysicalAddress {
        self.context.kernel_root
    }

    /// Pages mapped before the kernel translation map existed.
    #[must_use]
    pub fn early_mapped_pages(&self) -> usize {
        self.early_mappings.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &PagingContext<G> {
        &self.context
    }

    #[cfg(test)]
    pub(crate) fn fine_pool(&self) -> Option<&Arc<FinePool<G>>> {
        self.fine.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DirectMap;
    use crate::config::{PoolConfig, TableAccessConfig};
    use crate::geometry::{EntryWidth, LevelShape, Mc68040, X86, X86_64};
    use crate::sim::{HostPlatform, Machine, Ram, Setup};
    use crate::{GeometryError, PAGE_SIZE};
    use core::ops::Range;

    /// The leaf level starts one bit too high for the root above it.
    struct Lopsided;

    impl Geometry for Lopsided {
        const NAME: &'static str = "lopsided";
        const LEVELS: &'static [LevelShape] = &[
            LevelShape::new(22, 1024, EntryWidth::U32, false),
            LevelShape::new(13, 1024, EntryWidth::U32, false),
        ];
        const ADDRESS_BITS: u32 = 32;
        const SIGN_EXTENDED: bool = false;
        const KERNEL_BASE: u64 = 0x8000_0000;
        const WINDOW_REGION: Range<u64> = 0xe000_0000..0xf000_0000;

        fn encode(_level: usize, _entry: &PageTableEntry) -> Result<u64, VmemError> {
            Ok(0)
        }

        fn decode(_level: usize, _raw: u64) -> PageTableEntry {
            PageTableEntry::Invalid
        }
    }

    fn init_with<G: Geometry>(config: &VmemConfig, ram: Ram) -> Result<PagingMethod<G>, VmemError> {
        let platform = Arc::new(HostPlatform::<G>::new(ram, 1));
        let mut next = 0;
        PagingMethod::init(platform, config, &mut || {
            next += 1;
            Some(ram.frame(next - 1))
        })
    }

    #[test]
    #[should_panic(expected = "lopsided")]
    fn inconsistent_geometry_refuses_to_boot() {
        assert_eq!(Lopsided::validate(), Err(GeometryError::Shift(0)));
        let ram = Ram::new(16);
        let config = VmemConfig::new::<Lopsided>(TableAccessConfig::Direct(ram.direct_map()));
        let _ = init_with::<Lopsided>(&config, ram);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let ram = Ram::new(64);
        let mut config = VmemConfig::new::<X86_64>(TableAccessConfig::Direct(ram.direct_map()));
        config.pool = PoolConfig {
            per_cpu_slots: 1,
            ..PoolConfig::default()
        };
        assert!(matches!(
            init_with::<X86_64>(&config, ram),
            Err(VmemError::NotSupported("per-CPU slot count"))
        ));
    }

    #[test]
    fn tiny_window_region_is_exhausted() {
        let ram = Ram::new(64);
        let start = VirtualAddress::new(X86_64::WINDOW_REGION.start);
        let config = VmemConfig::new::<X86_64>(TableAccessConfig::Direct(ram.direct_map()))
            .with_window_region(VirtualRange::pages(start, 4));
        assert!(matches!(
            init_with::<X86_64>(&config, ram),
            Err(VmemError::AddressSpaceExhausted)
        ));
    }

    #[test]
    fn bootstrap_without_free_pages_fails() {
        let ram = Ram::new(4);
        let platform = Arc::new(HostPlatform::<X86>::new(ram, 1));
        let config = VmemConfig::new::<X86>(TableAccessConfig::Direct(DirectMap::new(0)));
        assert!(matches!(
            PagingMethod::<X86>::init(platform, &config, &mut || None),
            Err(VmemError::OutOfMemory)
        ));
    }

    #[test]
    fn init_loads_the_kernel_root() {
        let m = Machine::<X86_64>::boot_early(Setup::default());
        assert_eq!(m.platform.root_of(0), Some(m.method.kernel_root()));
        assert!(m.method.early_mapped_pages() > 0);
        assert!(m.method.kernel_translation_map().is_none());
    }

    #[test]
    fn maps_are_only_handed_out_after_the_allocator_is_attached() {
        let m = Machine::<X86_64>::boot_early(Setup::default());
        assert!(matches!(m.method.create_translation_map(true), Err(VmemError::NotSupported(_))));
        assert!(matches!(m.method.create_translation_map(false), Err(VmemError::NotSupported(_))));

        m.method
            .init_post_allocator(Arc::clone(&m.frames) as Arc<dyn FrameAllocator>)
            .unwrap();
        let kernel = m.method.create_translation_map(true).unwrap();
        assert!(kernel.is_kernel());
        assert!(Arc::ptr_eq(&kernel, &m.kernel()));
        assert!(!m.method.create_translation_map(false).unwrap().is_kernel());

        assert_eq!(
            m.method.init_post_allocator(Arc::clone(&m.frames) as Arc<dyn FrameAllocator>),
            Err(VmemError::NotSupported("frame allocator already attached"))
        );
    }

    #[test]
    fn early_mappings_are_counted_by_the_kernel_map() {
        let m = Machine::<X86_64>::boot_early(Setup::default());
        let va = VirtualAddress::new(0xffff_8000_0010_0000);
        let frames = Arc::clone(&m.frames);
        let mut get_free_page = || frames.allocate_wired_zero_page();

        let windows = m.method.early_mapped_pages();
        for page in 0..3 {
            m.method
                .map_early(
                    va + page * PAGE_SIZE,
                    m.ram.frame(2000),
                    Protection::kernel_rw(),
                    MemoryType::WriteBack,
                    &mut get_free_page,
                )
                .unwrap();
        }
        assert_eq!(m.method.early_mapped_pages(), windows + 3);
        assert!(m.touch(va, false).is_some());

        m.method
            .init_post_allocator(Arc::clone(&m.frames) as Arc<dyn FrameAllocator>)
            .unwrap();
        let kernel = m.kernel();
        assert_eq!(kernel.mapped_pages(), windows + 3);
        assert_eq!(kernel.query(va).unwrap().physical, m.ram.frame(2000));

        // afterwards this goes through the kernel map
        m.method
            .map_early(
                va + 3 * PAGE_SIZE,
                m.ram.frame(2001),
                Protection::kernel_rw(),
                MemoryType::WriteBack,
                &mut get_free_page,
            )
            .unwrap();
        assert_eq!(kernel.mapped_pages(), windows + 4);
        assert_eq!(m.method.early_mapped_pages(), windows + 3);
    }

    fn exercise_windowed<G: Geometry>(user_va: u64) {
        let m = Machine::<G>::boot(Setup {
            windowed: true,
            ..Setup::default()
        });
        let user = m.user();
        let va = VirtualAddress::new(user_va);
        for page in 0..40 {
            user.map(
                va + page * 64 * PAGE_SIZE,
                m.ram.frame(1900 + page as usize),
                Protection::user_rw(),
                MemoryType::WriteBack,
            )
            .unwrap();
        }

        m.ram.write_u8(m.ram.frame(1939) + 5, 0x77);
        let activation = user.activate_on_current_cpu();
        assert_eq!(m.load(va + 39 * 64 * PAGE_SIZE + 5), Some(0x77));
        drop(activation);

        assert_eq!(user.unmap(va, va + 40 * 64 * PAGE_SIZE).unwrap(), 40);
        assert_eq!(user.mapped_pages(), 0);

        // every table access gave its per-CPU window back
        let pool = m.method.physical_window_pool();
        let held: Vec<_> = (0..4)
            .map(|i| pool.acquire_current_cpu(m.ram.frame(i)).unwrap())
            .collect();
        for window in held {
            pool.release_current_cpu(window);
        }
    }

    #[test]
    fn windowed_x86_reaches_tables_through_windows() {
        exercise_windowed::<X86>(0x0040_0000);
    }

    #[test]
    fn windowed_mc68040_reaches_tables_through_windows() {
        exercise_windowed::<Mc68040>(0x0040_0000);
    }
}

//! # Slot regions
//!
//! A [`SlotRegion`] is a run of kernel pages reserved for window slots,
//! together with kernel-virtual pointers to the leaf tables that map them.
//! Binding a slot is then a single atomic store into that leaf table, with no
//! page walk and no allocation.
//!
//! Regions are carved from the configured window range by [`VaAllocator`].
//! During bootstrap the leaf tables are built with early pages; afterwards
//! [`KernelRegionSource`] builds them through the kernel translation map.

use crate::access::TablePtr;
use crate::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use crate::entry::{Leaf, MemoryType, PageTableEntry, Protection};
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::platform::Platform;
use crate::translation_map::TranslationMap;
use crate::{PAGE_SIZE, align_down};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::marker::PhantomData;
use kernel_sync::SpinLock;

/// Bump allocator over the window range. Never frees.
pub(crate) struct VaAllocator {
    next: SpinLock<u64>,
    end: u64,
}

impl VaAllocator {
    pub(crate) const fn new(range: VirtualRange) -> Self {
        Self {
            next: SpinLock::new(range.start.as_u64()),
            end: range.end.as_u64(),
        }
    }

    /// Reserves `pages` consecutive pages.
    pub(crate) fn allocate(&self, pages: usize) -> Result<VirtualAddress, VmemError> {
        let mut next = self.next.lock();
        let start = *next;
        let end = start
            .checked_add(pages as u64 * PAGE_SIZE)
            .filter(|&end| end <= self.end)
            .ok_or(VmemError::AddressSpaceExhausted)?;
        *next = end;
        Ok(VirtualAddress::new(start))
    }
}

/// Builds the page-table side of a region.
pub(crate) trait RegionMapper {
    /// Ensures leaf tables exist for `range`; returns one physical table
    /// address per leaf-table span touched, in address order.
    fn prepare_leaf_tables(&mut self, range: VirtualRange) -> Result<Vec<PhysicalAddress>, VmemError>;

    /// Maps the kernel page `va` to `pa`.
    fn map_kernel_page(&mut self, va: VirtualAddress, pa: PhysicalAddress) -> Result<(), VmemError>;
}

/// Pages of kernel space whose leaf entries can be rewritten directly.
pub(crate) struct SlotRegion<G: Geometry> {
    base: VirtualAddress,
    pages: usize,
    /// Kernel-virtual address of each leaf table covering the region.
    tables: Vec<VirtualAddress>,
    _geometry: PhantomData<G>,
}

impl<G: Geometry> SlotRegion<G> {
    #[inline]
    pub(crate) const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub(crate) fn slot_address(&self, slot: usize) -> VirtualAddress {
        debug_assert!(slot < self.pages);
        self.base + slot as u64 * PAGE_SIZE
    }

    /// Writes the leaf entry of `slot` to map `page` read/write for the kernel.
    ///
    /// Does not invalidate; that is the caller's business.
    pub(crate) fn bind(&self, platform: &dyn Platform, slot: usize, page: PhysicalAddress) -> Result<(), VmemError> {
        let entry = PageTableEntry::Leaf(Leaf::new(
            page.page_base(),
            Protection::kernel_rw(),
            MemoryType::WriteBack,
        ));
        let raw = G::encode(G::leaf_level(), &entry)?;
        self.leaf_entries(platform, slot).store(G::index(G::leaf_level(), self.slot_address(slot)), raw);
        Ok(())
    }

    fn leaf_entries(&self, platform: &dyn Platform, slot: usize) -> TablePtr {
        let span = G::leaf_shape().table_span();
        let va = self.slot_address(slot);
        let first = align_down(self.base.as_u64(), span);
        #[allow(clippy::cast_possible_truncation)]
        let table = self.tables[((va.as_u64() - first) / span) as usize];
        // Safety: leaf tables of a region are permanently mapped at `table`.
        unsafe { TablePtr::new(platform.virt_ptr(table), G::leaf_shape().width) }
    }
}

/// Reserves `pages` of window space and prepares their leaf tables.
///
/// Each distinct page holding one of those leaf tables is mapped once more
/// into the window range so that binding can reach it by kernel address.
pub(crate) fn provision_region<G: Geometry>(
    mapper: &mut dyn RegionMapper,
    va: &VaAllocator,
    pages: usize,
) -> Result<SlotRegion<G>, VmemError> {
    let base = va.allocate(pages)?;
    let table_addresses = mapper.prepare_leaf_tables(VirtualRange::pages(base, pages as u64))?;

    let mut mapped: Vec<(PhysicalAddress, VirtualAddress)> = Vec::new();
    let mut tables = Vec::with_capacity(table_addresses.len());
    for table in table_addresses {
        let page = table.page_base();
        let page_va = if let Some(&(_, va)) = mapped.iter().find(|(p, _)| *p == page) {
            va
        } else {
            let page_va = va.allocate(1)?;
            mapper.map_kernel_page(page_va, page)?;
            mapped.push((page, page_va));
            page_va
        };
        tables.push(page_va + table.page_offset());
    }

    log::debug!(
        "window region {base}: {pages} slots behind {} leaf tables",
        tables.len()
    );
    Ok(SlotRegion {
        base,
        pages,
        tables,
        _geometry: PhantomData,
    })
}

/// Supplies new regions to a growing pool.
pub(crate) trait RegionSource<G: Geometry>: Send + Sync {
    fn allocate_region(&self, pages: usize) -> Result<SlotRegion<G>, VmemError>;
}

/// Regions built through the kernel translation map once the frame
/// allocator is up.
pub(crate) struct KernelRegionSource<G: Geometry> {
    kernel_map: Weak<TranslationMap<G>>,
    va: Arc<VaAllocator>,
}

impl<G: Geometry> KernelRegionSource<G> {
    pub(crate) const fn new(kernel_map: Weak<TranslationMap<G>>, va: Arc<VaAllocator>) -> Self {
        Self { kernel_map, va }
    }
}

impl<G: Geometry> RegionSource<G> for KernelRegionSource<G> {
    fn allocate_region(&self, pages: usize) -> Result<SlotRegion<G>, VmemError> {
        let map = self
            .kernel_map
            .upgrade()
            .ok_or(VmemError::NotSupported("kernel translation map is gone"))?;
        let _guard = map.lock();
        provision_region(&mut KernelMapper { map: &map }, &self.va, pages)
    }
}

struct KernelMapper<'a, G: Geometry> {
    map: &'a TranslationMap<G>,
}

impl<G: Geometry> RegionMapper for KernelMapper<'_, G> {
    fn prepare_leaf_tables(&mut self, range: VirtualRange) -> Result<Vec<PhysicalAddress>, VmemError> {
        self.map.prepare_leaf_tables(range)
    }

    fn map_kernel_page(&mut self, va: VirtualAddress, pa: PhysicalAddress) -> Result<(), VmemError> {
        self.map.map(va, pa, Protection::kernel_rw(), MemoryType::WriteBack)
    }
}

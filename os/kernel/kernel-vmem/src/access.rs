//! # Table access
//!
//! Page tables live in physical memory. Depending on the platform they are
//! reached through a permanent direct map of physical memory or, on systems
//! without one, through short-lived per-CPU windows from the
//! [`PhysicalWindowPool`]. Either way callers get a [`TablePtr`] for the
//! duration of a closure and operate on entries atomically.

use crate::addresses::PhysicalAddress;
use crate::config::TableAccessConfig;
use crate::error::VmemError;
use crate::geometry::EntryWidth;
use crate::platform::{CpuPinner, Platform};
use crate::window_pool::{PhysicalWindowPool, Window};
use crate::PAGE_SIZE;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_sync::SyncOnceCell;

/// A linear mapping of all physical memory: `va = pa + offset` (wrapping).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Pointer to the byte at physical address `pa`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        pa.as_u64().wrapping_add(self.offset) as usize as *mut u8
    }
}

/// Atomic view of one table (or any run of entries) in memory.
#[derive(Copy, Clone)]
pub(crate) struct TablePtr {
    base: *mut u8,
    width: EntryWidth,
}

impl TablePtr {
    /// # Safety
    /// `base` must point at mapped, suitably aligned table memory that stays
    /// valid while this value is used.
    pub(crate) const unsafe fn new(base: *mut u8, width: EntryWidth) -> Self {
        Self { base, width }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn offset(&self, index: usize) -> usize {
        index * self.width.bytes() as usize
    }

    #[inline]
    fn u32_at(&self, index: usize) -> &AtomicU32 {
        // Safety: guaranteed by the constructor; entries are naturally aligned.
        unsafe { AtomicU32::from_ptr(self.base.add(self.offset(index)).cast()) }
    }

    #[inline]
    fn u64_at(&self, index: usize) -> &AtomicU64 {
        // Safety: guaranteed by the constructor; entries are naturally aligned.
        unsafe { AtomicU64::from_ptr(self.base.add(self.offset(index)).cast()) }
    }

    #[inline]
    pub(crate) fn load(&self, index: usize) -> u64 {
        match self.width {
            EntryWidth::U32 => u64::from(self.u32_at(index).load(Ordering::Acquire)),
            EntryWidth::U64 => self.u64_at(index).load(Ordering::Acquire),
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn store(&self, index: usize, raw: u64) {
        match self.width {
            EntryWidth::U32 => self.u32_at(index).store(raw as u32, Ordering::Release),
            EntryWidth::U64 => self.u64_at(index).store(raw, Ordering::Release),
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn swap(&self, index: usize, raw: u64) -> u64 {
        match self.width {
            EntryWidth::U32 => u64::from(self.u32_at(index).swap(raw as u32, Ordering::AcqRel)),
            EntryWidth::U64 => self.u64_at(index).swap(raw, Ordering::AcqRel),
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn compare_exchange(&self, index: usize, current: u64, new: u64) -> Result<u64, u64> {
        match self.width {
            EntryWidth::U32 => self
                .u32_at(index)
                .compare_exchange(current as u32, new as u32, Ordering::AcqRel, Ordering::Acquire)
                .map(u64::from)
                .map_err(u64::from),
            EntryWidth::U64 => {
                self.u64_at(index)
                    .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            }
        }
    }
}

/// One reusable route to page tables; see [`TableAccess::with_tables`].
pub(crate) struct TableCursor<'a> {
    boot: DirectMap,
    width: EntryWidth,
    window: Option<(&'a dyn PhysicalWindowPool, Window)>,
}

impl TableCursor<'_> {
    /// Moves the cursor to `table`. The returned pointer is valid until the
    /// next call.
    pub(crate) fn at(&mut self, table: PhysicalAddress) -> Result<TablePtr, VmemError> {
        match &mut self.window {
            Some((pool, window)) => {
                pool.rebind_current_cpu(window, table)?;
                // Safety: the window maps the page containing `table` until it
                // is moved again.
                Ok(unsafe { TablePtr::new(pool.window_ptr(window), self.width) })
            }
            // Safety: the direct map covers all of physical memory.
            None => Ok(unsafe { TablePtr::new(self.boot.ptr(table), self.width) }),
        }
    }
}

/// Strategy for reaching page-table memory.
pub(crate) struct TableAccess {
    boot: DirectMap,
    windowed: bool,
    pool: SyncOnceCell<Arc<dyn PhysicalWindowPool>>,
    platform: Arc<dyn Platform>,
}

impl TableAccess {
    pub(crate) fn new(config: &TableAccessConfig, platform: Arc<dyn Platform>) -> Self {
        let (boot, windowed) = match *config {
            TableAccessConfig::Direct(map) => (map, false),
            TableAccessConfig::Windowed { boot } => (boot, true),
        };
        Self {
            boot,
            windowed,
            pool: SyncOnceCell::new(),
            platform,
        }
    }

    /// Switches a windowed configuration from the boot mapping to the pool.
    pub(crate) fn attach_pool(&self, pool: &Arc<dyn PhysicalWindowPool>) {
        if self.windowed && self.pool.set(Arc::clone(pool)).is_err() {
            log::warn!("table access pool attached twice");
        }
    }

    fn window_pool(&self) -> Option<&Arc<dyn PhysicalWindowPool>> {
        if self.windowed { self.pool.get() } else { None }
    }

    /// Runs `f` with the table at `table` (any alignment inside a page).
    pub(crate) fn with_table<R>(
        &self,
        table: PhysicalAddress,
        width: EntryWidth,
        f: impl FnOnce(TablePtr) -> R,
    ) -> Result<R, VmemError> {
        let Some(pool) = self.window_pool() else {
            // Safety: the direct map covers all of physical memory.
            return Ok(f(unsafe { TablePtr::new(self.boot.ptr(table), width) }));
        };

        let _pin = CpuPinner::new(&*self.platform);
        let window = pool.acquire_current_cpu(table)?;
        // Safety: the window maps the page containing `table` until released.
        let result = f(unsafe { TablePtr::new(pool.window_ptr(&window), width) });
        pool.release_current_cpu(window);
        Ok(result)
    }

    /// Runs `f` with a [`TableCursor`] that can visit any number of tables
    /// one after another.
    ///
    /// In windowed mode the cursor's slot is claimed here, before `f` runs;
    /// moving it to another table afterwards cannot run out of slots.
    pub(crate) fn with_tables<R>(
        &self,
        first: PhysicalAddress,
        width: EntryWidth,
        f: impl FnOnce(&mut TableCursor<'_>) -> R,
    ) -> Result<R, VmemError> {
        let Some(pool) = self.window_pool() else {
            return Ok(f(&mut TableCursor {
                boot: self.boot,
                width,
                window: None,
            }));
        };

        let _pin = CpuPinner::new(&*self.platform);
        let window = pool.acquire_current_cpu(first)?;
        let mut cursor = TableCursor {
            boot: self.boot,
            width,
            window: Some((&**pool, window)),
        };
        let result = f(&mut cursor);
        if let Some((pool, window)) = cursor.window.take() {
            pool.release_current_cpu(window);
        }
        Ok(result)
    }

    /// Like [`with_table`](Self::with_table) but lock-free, for interrupt and
    /// debugger context.
    pub(crate) fn with_table_debug<R>(
        &self,
        table: PhysicalAddress,
        width: EntryWidth,
        f: impl FnOnce(TablePtr) -> R,
    ) -> Result<R, VmemError> {
        let Some(pool) = self.window_pool() else {
            // Safety: the direct map covers all of physical memory.
            return Ok(f(unsafe { TablePtr::new(self.boot.ptr(table), width) }));
        };

        let _pin = CpuPinner::new(&*self.platform);
        let window = pool.acquire_debug(table)?;
        // Safety: the window maps the page containing `table` until released.
        let result = f(unsafe { TablePtr::new(pool.window_ptr(&window), width) });
        pool.release_debug(window);
        Ok(result)
    }

    /// Fills the page at `page` with zeroes.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn zero_page(&self, page: PhysicalAddress) -> Result<(), VmemError> {
        debug_assert!(page.page_offset() == 0);
        self.with_table(page, EntryWidth::U64, |t| {
            for i in 0..(PAGE_SIZE / 8) as usize {
                t.store(i, 0);
            }
        })
    }
}

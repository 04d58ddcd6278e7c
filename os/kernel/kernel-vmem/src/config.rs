//! # Configuration
//!
//! Boot-time knobs of the translation layer. [`VmemConfig::new`] fills in the
//! defaults below for a geometry; individual fields can then be adjusted.

use crate::access::DirectMap;
use crate::addresses::{VirtualAddress, VirtualRange};
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::platform::CpuSet;

/// Pending TLB invalidations buffered per translation map before a flush
/// falls back to invalidating everything.
pub const DEFAULT_INVALIDATE_CAPACITY: usize = 64;

/// Window slots reserved for each CPU (excluding its debug slot).
pub const DEFAULT_PER_CPU_SLOTS: usize = 16;

/// Pages per chunk in the coarse strategy.
pub const DEFAULT_CHUNK_PAGES: usize = 4;

/// Chunks of the coarse strategy.
pub const DEFAULT_CHUNK_COUNT: usize = 256;

/// Slots per backing pool in the fine strategy.
pub const DEFAULT_SLOTS_PER_POOL: usize = 1024;

/// Upper bound on fine-strategy pools.
pub const DEFAULT_MAX_POOLS: usize = 8;

/// How page-table pages are reached by the kernel.
#[derive(Copy, Clone, Debug)]
pub enum TableAccessConfig {
    /// All physical memory is permanently mapped (e.g. x86-64).
    Direct(DirectMap),
    /// Tables are reached through per-CPU window slots once the pools are
    /// up; `boot` is the loader's mapping used until then.
    Windowed { boot: DirectMap },
}

/// Which shared-window strategy to run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolStrategy {
    /// Multi-page chunks, kept mapped while unreferenced and recycled LRU.
    Coarse {
        chunk_pages: usize,
        chunk_count: usize,
    },
    /// Single-page slots; grows by whole pools of `slots_per_pool`.
    Fine {
        slots_per_pool: usize,
        max_pools: usize,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    pub strategy: PoolStrategy,
    /// 2..=64; each CPU also gets one debug slot on top.
    pub per_cpu_slots: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: PoolStrategy::Coarse {
                chunk_pages: DEFAULT_CHUNK_PAGES,
                chunk_count: DEFAULT_CHUNK_COUNT,
            },
            per_cpu_slots: DEFAULT_PER_CPU_SLOTS,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct VmemConfig {
    pub table_access: TableAccessConfig,
    /// Kernel virtual range for window slots and the tables behind them.
    pub window_region: VirtualRange,
    pub pool: PoolConfig,
    pub invalidate_capacity: usize,
}

impl VmemConfig {
    /// Defaults for geometry `G`.
    #[must_use]
    pub const fn new<G: Geometry>(table_access: TableAccessConfig) -> Self {
        Self {
            table_access,
            window_region: VirtualRange::new(
                VirtualAddress::new(G::WINDOW_REGION.start),
                VirtualAddress::new(G::WINDOW_REGION.end),
            ),
            pool: PoolConfig {
                strategy: PoolStrategy::Coarse {
                    chunk_pages: DEFAULT_CHUNK_PAGES,
                    chunk_count: DEFAULT_CHUNK_COUNT,
                },
                per_cpu_slots: DEFAULT_PER_CPU_SLOTS,
            },
            invalidate_capacity: DEFAULT_INVALIDATE_CAPACITY,
        }
    }

    #[must_use]
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub const fn with_window_region(mut self, region: VirtualRange) -> Self {
        self.window_region = region;
        self
    }

    #[must_use]
    pub const fn with_invalidate_capacity(mut self, capacity: usize) -> Self {
        self.invalidate_capacity = capacity;
        self
    }

    /// Checks the configuration against geometry `G` and `cpu_count`.
    ///
    /// # Errors
    /// [`VmemError::NotSupported`] naming the offending setting.
    pub fn validate<G: Geometry>(&self, cpu_count: usize) -> Result<(), VmemError> {
        if cpu_count == 0 || cpu_count > CpuSet::MAX_CPUS {
            return Err(VmemError::NotSupported("cpu count"));
        }
        if !(2..=64).contains(&self.pool.per_cpu_slots) {
            return Err(VmemError::NotSupported("per-CPU slot count"));
        }
        if self.invalidate_capacity == 0 {
            return Err(VmemError::NotSupported("invalidation buffer capacity"));
        }

        let region = self.window_region;
        if region.is_empty()
            || !region.start.is_aligned(crate::PAGE_SIZE)
            || !G::is_kernel_address(region.start)
            || !G::is_canonical(VirtualAddress::new(region.end.as_u64() - 1))
        {
            return Err(VmemError::NotSupported("window region"));
        }

        match self.pool.strategy {
            PoolStrategy::Coarse {
                chunk_pages,
                chunk_count,
            } => {
                if !chunk_pages.is_power_of_two() || chunk_count == 0 {
                    return Err(VmemError::NotSupported("coarse pool shape"));
                }
            }
            PoolStrategy::Fine {
                slots_per_pool,
                max_pools,
            } => {
                if slots_per_pool == 0 || max_pools == 0 {
                    return Err(VmemError::NotSupported("fine pool shape"));
                }
            }
        }
        Ok(())
    }
}

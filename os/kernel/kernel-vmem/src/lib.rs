//! # Virtual Memory Translation
//!
//! Architecture-parameterized page tables ("translation maps") for a
//! preemptive multi-core kernel, plus a pool of temporary kernel windows onto
//! arbitrary physical pages.
//!
//! ## What you get
//! - [`Geometry`]: a page-table format (levels, entry width, bit packing).
//!   [`X86_64`], [`X86`] and [`Mc68040`] ship with the crate.
//! - [`PagingMethod`]: the per-boot singleton. It bootstraps the kernel
//!   address space before an allocator exists and creates translation maps.
//! - [`TranslationMap`]: one address space. Map, unmap, query and protect
//!   pages; TLB invalidations are batched and flushed when the outermost
//!   lock is released.
//! - [`PhysicalWindowPool`]: short-lived windows onto physical pages, plus
//!   `memset`/`memcpy` helpers built on them.
//! - [`Platform`] / [`FrameAllocator`]: what the kernel has to provide.
//!
//! ## Walk
//!
//! ```text
//!  root ─► level 1 ─► … ─► leaf table ─► page
//!   │         │                 │
//!   │         │                 └─ Leaf / Indirect entry
//!   │         └─ Table entries, allocated lazily
//!   └─ kernel-range slots shared by every address space
//! ```
//!
//! Entries are only ever changed with a single atomic store or
//! compare-and-swap of the entry's width, so a hardware walker running
//! concurrently always sees either the old or the new entry.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod access;
mod addresses;
mod config;
mod entry;
mod error;
mod geometry;
mod invalidation;
mod paging_method;
mod paging_structures;
mod platform;
mod translation_map;
mod walk;
mod window_pool;

#[cfg(test)]
mod sim;

pub use crate::access::DirectMap;
pub use crate::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
pub use crate::config::{PoolConfig, PoolStrategy, TableAccessConfig, VmemConfig};
pub use crate::entry::{
    DescriptorLocation, Leaf, Mapping, MemoryType, PageFlags, PageTableEntry, Protection,
};
pub use crate::error::{GeometryError, VmemError};
pub use crate::geometry::{EntryWidth, Geometry, LevelShape, Mc68040, X86, X86_64};
pub use crate::paging_method::PagingMethod;
pub use crate::paging_structures::PagingStructures;
pub use crate::platform::{
    CallMode, CpuId, CpuPinner, CpuSet, DeferredTask, FrameAllocator, FrameReservation, Platform,
};
pub use crate::translation_map::{AccessState, Activation, MapGuard, TranslationMap};
pub use crate::window_pool::{PhysicalWindowPool, Window};

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// The (only) page size: 4 KiB.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

//! # Page-table geometries
//!
//! A [`Geometry`] describes one hardware translation format: how many radix
//! levels there are, how many entries each level's table holds, how wide an
//! entry is, and how a [`PageTableEntry`] is packed into that width. The rest
//! of the crate is written against this trait only.
//!
//! Three geometries ship with the crate:
//!
//! | Geometry | Levels (entries) | Entry | Notes |
//! |:---------|:-----------------|:------|:------|
//! | [`X86_64`] | 512 / 512 / 512 / 512 | 8 bytes | execute-disable, 48-bit canonical addresses |
//! | [`X86`] | 1024 / 1024 | 4 bytes | no execute-disable |
//! | [`Mc68040`] | 128 / 128 / 64 | 4 bytes | sub-page tables, indirect page descriptors |
//!
//! ```text
//!  root ─► level 1 ─► … ─► leaf table ─► page
//!   │                          │
//!   └ index = (va >> shift) & (entries - 1) at every level
//! ```
//!
//! When a level's tables are smaller than a page, several sibling tables are
//! packed into one page and always installed into the parent as an aligned
//! group (see [`LevelShape::tables_per_page`]).

mod mc68040;
mod x86;
mod x86_64;

pub use mc68040::Mc68040;
pub use x86::X86;
pub use x86_64::X86_64;

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::entry::{Leaf, MemoryType, PageTableEntry, Protection};
use crate::error::{GeometryError, VmemError};
use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::ops::Range;

/// Width of one packed entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryWidth {
    U32,
    U64,
}

impl EntryWidth {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// Shape of the tables at one radix level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LevelShape {
    /// Lowest virtual-address bit indexing this level.
    pub shift: u32,
    /// Entries per table; a power of two.
    pub entries: usize,
    pub width: EntryWidth,
    /// Whether entries at this level may be indirect descriptors.
    pub indirect: bool,
}

impl LevelShape {
    #[must_use]
    pub const fn new(shift: u32, entries: usize, width: EntryWidth, indirect: bool) -> Self {
        Self {
            shift,
            entries,
            width,
            indirect,
        }
    }

    /// Size of one table of this level in bytes.
    #[inline]
    #[must_use]
    pub const fn table_bytes(&self) -> u64 {
        self.entries as u64 * self.width.bytes()
    }

    /// How many tables of this level share one physical page.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tables_per_page(&self) -> usize {
        (PAGE_SIZE / self.table_bytes()) as usize
    }

    /// Bytes of virtual address space one entry of this level spans.
    #[inline]
    #[must_use]
    pub const fn entry_span(&self) -> u64 {
        1 << self.shift
    }

    /// Bytes of virtual address space one table of this level spans.
    #[inline]
    #[must_use]
    pub const fn table_span(&self) -> u64 {
        (self.entries as u64) << self.shift
    }
}

/// A page-table format.
///
/// Implementors supply the constants and the two packing functions; the
/// provided methods derive everything else. Level `0` is the root, level
/// `LEVELS.len() - 1` holds the page mappings.
pub trait Geometry: Send + Sync + 'static {
    /// Human-readable name, used in logs.
    const NAME: &'static str;

    /// Radix levels, root first.
    const LEVELS: &'static [LevelShape];

    /// Number of significant virtual-address bits.
    const ADDRESS_BITS: u32;

    /// Whether addresses above `ADDRESS_BITS` are a sign extension of the top
    /// significant bit (x86-64 style canonical addresses).
    const SIGN_EXTENDED: bool;

    /// First kernel address; everything below belongs to user space.
    const KERNEL_BASE: u64;

    /// Default kernel region for physical page windows.
    const WINDOW_REGION: Range<u64>;

    /// Packs `entry` for a table of `level`.
    ///
    /// # Errors
    /// [`VmemError::NotSupported`] if the entry kind cannot be expressed at
    /// that level (e.g. an indirect entry on a geometry without them).
    fn encode(level: usize, entry: &PageTableEntry) -> Result<u64, VmemError>;

    /// Unpacks a raw entry read from a table of `level`.
    fn decode(level: usize, raw: u64) -> PageTableEntry;

    /// Index of the leaf level.
    #[inline]
    #[must_use]
    fn leaf_level() -> usize {
        Self::LEVELS.len() - 1
    }

    /// Shape of the leaf tables.
    #[inline]
    #[must_use]
    fn leaf_shape() -> &'static LevelShape {
        &Self::LEVELS[Self::leaf_level()]
    }

    /// Checks the level description for internal consistency.
    ///
    /// # Errors
    /// The first inconsistency found.
    fn validate() -> Result<(), GeometryError> {
        let levels = Self::LEVELS;
        if levels.len() < 2 {
            return Err(GeometryError::TooFewLevels);
        }

        for (i, level) in levels.iter().enumerate() {
            if !level.entries.is_power_of_two() {
                return Err(GeometryError::EntryCount(i));
            }
            if level.table_bytes() > PAGE_SIZE || PAGE_SIZE % level.table_bytes() != 0 {
                return Err(GeometryError::TableSize(i));
            }
            if level.indirect && i != levels.len() - 1 {
                return Err(GeometryError::IndirectLevel(i));
            }

            let expected_shift = match levels.get(i + 1) {
                Some(below) => below.shift + below.entries.trailing_zeros(),
                None => PAGE_SHIFT,
            };
            if level.shift != expected_shift {
                return Err(GeometryError::Shift(i));
            }
        }

        let root = &levels[0];
        if root.shift + root.entries.trailing_zeros() != Self::ADDRESS_BITS {
            return Err(GeometryError::AddressBits);
        }

        if Self::KERNEL_BASE % root.entry_span() != 0 {
            return Err(GeometryError::KernelBase);
        }

        Ok(())
    }

    /// Table index of `va` at `level`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn index(level: usize, va: VirtualAddress) -> usize {
        let shape = &Self::LEVELS[level];
        ((va.as_u64() >> shape.shift) as usize) & (shape.entries - 1)
    }

    #[inline]
    #[must_use]
    fn is_kernel_address(va: VirtualAddress) -> bool {
        va.as_u64() >= Self::KERNEL_BASE
    }

    /// Whether `va` is representable at all.
    #[must_use]
    fn is_canonical(va: VirtualAddress) -> bool {
        if Self::ADDRESS_BITS >= 64 {
            return true;
        }
        let raw = va.as_u64();
        if Self::SIGN_EXTENDED {
            let high = raw >> (Self::ADDRESS_BITS - 1);
            high == 0 || high == (u64::MAX >> (Self::ADDRESS_BITS - 1))
        } else {
            raw >> Self::ADDRESS_BITS == 0
        }
    }

    /// Whether every address from `first` through `last` is canonical.
    #[must_use]
    fn is_canonical_span(first: VirtualAddress, last: VirtualAddress) -> bool {
        if !Self::is_canonical(first) || !Self::is_canonical(last) {
            return false;
        }
        // both ends must sit on the same side of the sign-extension hole
        !Self::SIGN_EXTENDED
            || Self::ADDRESS_BITS >= 64
            || first.as_u64() >> (Self::ADDRESS_BITS - 1) == last.as_u64() >> (Self::ADDRESS_BITS - 1)
    }

    /// Root-table slots that belong to the shared kernel range.
    #[must_use]
    fn kernel_root_indices() -> Range<usize> {
        Self::index(0, VirtualAddress::new(Self::KERNEL_BASE))..Self::LEVELS[0].entries
    }

    /// The protection a mapping created with `protection` reports back.
    ///
    /// Geometries widen rights they cannot withhold (e.g. execute permission
    /// without an execute-disable bit); canonical protections such as
    /// [`Protection::kernel_rw`] on x86-64 come back unchanged.
    #[must_use]
    fn effective_protection(protection: Protection) -> Protection {
        let leaf = PageTableEntry::Leaf(Leaf::new(
            PhysicalAddress::new(0),
            protection,
            MemoryType::WriteBack,
        ));
        match Self::encode(Self::leaf_level(), &leaf).map(|raw| Self::decode(Self::leaf_level(), raw)) {
            Ok(PageTableEntry::Leaf(decoded)) => decoded.protection,
            _ => protection,
        }
    }

    /// Upper bound on the table pages needed to map `[start, end)` into an
    /// empty address space, ignoring the root.
    #[must_use]
    fn max_table_pages(start: VirtualAddress, end: VirtualAddress) -> usize {
        if end <= start {
            return 0;
        }
        let last = end.as_u64() - 1;
        Self::LEVELS[1..]
            .iter()
            .map(|level| {
                let span = level.table_span() * level.tables_per_page() as u64;
                #[allow(clippy::cast_possible_truncation)]
                let pages = (last / span - start.as_u64() / span + 1) as usize;
                pages
            })
            .sum()
    }
}

/// Protection decoded from x86-style `U/S`, `R/W` and execute bits.
///
/// The kernel can always read user pages, and `R/W` applies to both
/// privilege levels.
pub(crate) const fn x86_protection(user: bool, writable: bool, executable: bool) -> Protection {
    let mut p = Protection::KERNEL_READ;
    if writable {
        p = p.union(Protection::KERNEL_WRITE);
    }
    if executable {
        p = p.union(Protection::KERNEL_EXECUTE);
    }
    if user {
        p = p.union(Protection::USER_READ);
        if writable {
            p = p.union(Protection::USER_WRITE);
        }
        if executable {
            p = p.union(Protection::USER_EXECUTE);
        }
    }
    p
}

/// `(PWT, PCD, PAT)` for a memory type, assuming PAT entry 4 is programmed
/// as write-combining.
pub(crate) const fn x86_cache_bits(memory_type: MemoryType) -> (bool, bool, bool) {
    match memory_type {
        MemoryType::WriteBack => (false, false, false),
        MemoryType::WriteThrough => (true, false, false),
        MemoryType::Uncached => (true, true, false),
        MemoryType::WriteCombining => (false, false, true),
    }
}

/// Inverse of [`x86_cache_bits`].
pub(crate) const fn x86_memory_type(pwt: bool, pcd: bool, pat: bool) -> MemoryType {
    match (pwt, pcd, pat) {
        (_, _, true) => MemoryType::WriteCombining,
        (_, true, false) => MemoryType::Uncached,
        (true, false, false) => MemoryType::WriteThrough,
        (false, false, false) => MemoryType::WriteBack,
    }
}

//! # Architecture-neutral page-table entries
//!
//! Every geometry decodes its packed hardware descriptors into a
//! [`PageTableEntry`] and encodes them back only when writing a table. All
//! walking and mapping logic matches on this closed sum type and never looks
//! at raw bits.

use crate::addresses::PhysicalAddress;

bitflags::bitflags! {
    /// Access rights of a mapping, split by privilege level.
    ///
    /// A geometry may not be able to represent every combination (32-bit x86
    /// has no execute-disable bit, for example); see
    /// [`Geometry::effective_protection`](crate::Geometry::effective_protection).
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct Protection: u8 {
        const USER_READ = 1 << 0;
        const USER_WRITE = 1 << 1;
        const USER_EXECUTE = 1 << 2;
        const KERNEL_READ = 1 << 3;
        const KERNEL_WRITE = 1 << 4;
        const KERNEL_EXECUTE = 1 << 5;

        const USER = Self::USER_READ.bits() | Self::USER_WRITE.bits() | Self::USER_EXECUTE.bits();
    }
}

impl Protection {
    /// Kernel data: read/write, not executable, invisible to user mode.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::KERNEL_READ.union(Self::KERNEL_WRITE)
    }

    /// User data. The kernel can always access what user mode can.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::USER_READ
            .union(Self::USER_WRITE)
            .union(Self::KERNEL_READ)
            .union(Self::KERNEL_WRITE)
    }

    /// `true` if any user-mode access is requested.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.intersects(Self::USER)
    }

    /// Write permission for the privilege level the mapping is meant for.
    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        if self.is_user() {
            self.contains(Self::USER_WRITE)
        } else {
            self.contains(Self::KERNEL_WRITE)
        }
    }

    /// Execute permission for the privilege level the mapping is meant for.
    #[inline]
    #[must_use]
    pub const fn is_executable(self) -> bool {
        if self.is_user() {
            self.contains(Self::USER_EXECUTE)
        } else {
            self.contains(Self::KERNEL_EXECUTE)
        }
    }
}

bitflags::bitflags! {
    /// Hardware-maintained state bits of a leaf mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct PageFlags: u8 {
        const ACCESSED = 1 << 0;
        const MODIFIED = 1 << 1;
    }
}

/// Caching behavior of a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum MemoryType {
    /// Normal cached RAM.
    #[default]
    WriteBack,
    WriteThrough,
    /// Write-combining, for frame buffers.
    WriteCombining,
    /// Strongly ordered, for MMIO.
    Uncached,
}

/// A leaf mapping of one page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Leaf {
    /// Page-aligned physical frame.
    pub frame: PhysicalAddress,
    pub protection: Protection,
    pub memory_type: MemoryType,
    pub accessed: bool,
    pub dirty: bool,
    /// Survives non-global TLB flushes (kernel mappings).
    pub global: bool,
}

impl Leaf {
    #[inline]
    #[must_use]
    pub const fn new(frame: PhysicalAddress, protection: Protection, memory_type: MemoryType) -> Self {
        Self {
            frame,
            protection,
            memory_type,
            accessed: false,
            dirty: false,
            global: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    /// The accessed/modified bits as flags.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        let mut f = PageFlags::empty();
        if self.accessed {
            f = f.union(PageFlags::ACCESSED);
        }
        if self.dirty {
            f = f.union(PageFlags::MODIFIED);
        }
        f
    }

    /// Copy with the given state bits cleared.
    #[inline]
    #[must_use]
    pub const fn without_flags(mut self, flags: PageFlags) -> Self {
        if flags.contains(PageFlags::ACCESSED) {
            self.accessed = false;
        }
        if flags.contains(PageFlags::MODIFIED) {
            self.dirty = false;
        }
        self
    }
}

/// Physical location of a page descriptor an indirect entry points at.
///
/// The descriptor lives at `page + offset`; the pair is kept separate so the
/// owning page can be found without knowing the descriptor layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DescriptorLocation {
    pub page: PhysicalAddress,
    pub offset: u16,
}

impl DescriptorLocation {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(address: PhysicalAddress) -> Self {
        Self {
            page: address.page_base(),
            offset: address.page_offset() as u16,
        }
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.page.as_u64() + self.offset as u64)
    }
}

/// One decoded page-table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageTableEntry {
    /// Not present.
    Invalid,
    /// Points at the next-level table (possibly a sub-page table).
    Table(PhysicalAddress),
    /// Maps a page.
    Leaf(Leaf),
    /// Points at a page descriptor stored elsewhere; the hardware walker
    /// follows it and uses that descriptor as the leaf.
    Indirect(DescriptorLocation),
}

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !matches!(self, Self::Invalid)
    }

    #[inline]
    #[must_use]
    pub const fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }
}

/// The state of a resident mapping as reported by queries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// Page-aligned physical frame.
    pub physical: PhysicalAddress,
    /// Protection as the geometry can represent it.
    pub protection: Protection,
    pub memory_type: MemoryType,
    pub accessed: bool,
    pub modified: bool,
}

impl From<Leaf> for Mapping {
    fn from(leaf: Leaf) -> Self {
        Self {
            physical: leaf.frame,
            protection: leaf.protection,
            memory_type: leaf.memory_type,
            accessed: leaf.accessed,
            modified: leaf.dirty,
        }
    }
}

//! # Legacy 32-bit x86 paging
//!
//! Two levels of 1024 four-byte entries: a page directory indexed by VA bits
//! `[31:22]` and page tables indexed by `[21:12]`. There is no execute-disable
//! bit, so every readable page is also executable.

use super::{EntryWidth, Geometry, LevelShape, x86_cache_bits, x86_memory_type, x86_protection};
use crate::addresses::PhysicalAddress;
use crate::entry::{Leaf, PageTableEntry};
use crate::error::VmemError;
use bitfield_struct::bitfield;
use core::ops::Range;

/// 32-bit non-PAE paging with 4 KiB leaves.
#[derive(Debug, Copy, Clone, Default)]
pub struct X86;

#[bitfield(u32)]
struct Entry {
    present: bool,
    writable: bool,
    user: bool,
    write_through: bool,
    cache_disable: bool,
    accessed: bool,
    /// Leaf only.
    dirty: bool,
    /// PAT in a PTE, PS in a PDE.
    pat_or_large: bool,
    global: bool,
    #[bits(3)]
    __os_available: u8,
    #[bits(20)]
    frame_31_12: u32,
}

const LEAF: usize = 1;

impl Geometry for X86 {
    const NAME: &'static str = "x86";
    const LEVELS: &'static [LevelShape] = &[
        LevelShape::new(22, 1024, EntryWidth::U32, false),
        LevelShape::new(12, 1024, EntryWidth::U32, false),
    ];
    const ADDRESS_BITS: u32 = 32;
    const SIGN_EXTENDED: bool = false;
    const KERNEL_BASE: u64 = 0x8000_0000;
    const WINDOW_REGION: Range<u64> = 0xe000_0000..0xf000_0000;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(level: usize, entry: &PageTableEntry) -> Result<u64, VmemError> {
        let e = match *entry {
            PageTableEntry::Invalid => Entry::new(),
            PageTableEntry::Table(table) => {
                debug_assert!(level < LEAF && table.page_offset() == 0);
                Entry::new()
                    .with_present(true)
                    .with_writable(true)
                    .with_user(true)
                    .with_frame_31_12((table.as_u64() >> 12) as u32)
            }
            PageTableEntry::Leaf(leaf) if level == LEAF => {
                debug_assert!(leaf.frame.as_u64() >> 32 == 0);
                let (pwt, pcd, pat) = x86_cache_bits(leaf.memory_type);
                Entry::new()
                    .with_present(true)
                    .with_writable(leaf.protection.is_writable())
                    .with_user(leaf.protection.is_user())
                    .with_write_through(pwt)
                    .with_cache_disable(pcd)
                    .with_pat_or_large(pat)
                    .with_accessed(leaf.accessed)
                    .with_dirty(leaf.dirty)
                    .with_global(leaf.global)
                    .with_frame_31_12((leaf.frame.as_u64() >> 12) as u32)
            }
            PageTableEntry::Leaf(_) => return Err(VmemError::NotSupported("large pages")),
            PageTableEntry::Indirect(_) => return Err(VmemError::NotSupported("indirect entries")),
        };
        Ok(u64::from(e.into_bits()))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode(level: usize, raw: u64) -> PageTableEntry {
        let e = Entry::from_bits(raw as u32);
        if !e.present() {
            return PageTableEntry::Invalid;
        }

        let frame = PhysicalAddress::new(u64::from(e.frame_31_12()) << 12);
        if level < LEAF && !e.pat_or_large() {
            return PageTableEntry::Table(frame);
        }

        let pat = level == LEAF && e.pat_or_large();
        PageTableEntry::Leaf(Leaf {
            frame,
            protection: x86_protection(e.user(), e.writable(), true),
            memory_type: x86_memory_type(e.write_through(), e.cache_disable(), pat),
            accessed: e.accessed(),
            dirty: e.dirty(),
            global: e.global(),
        })
    }
}

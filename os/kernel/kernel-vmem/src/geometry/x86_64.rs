//! # x86-64 four-level paging
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Every table holds 512 eight-byte entries. Non-leaf entries are always
//! created `present | writable | user`; the leaf decides the effective rights.
//! Entries with `PS=1` above the leaf level (huge pages) decode as leaves so
//! walks stop there, but this crate never creates them.

use super::{EntryWidth, Geometry, LevelShape, x86_cache_bits, x86_memory_type, x86_protection};
use crate::addresses::PhysicalAddress;
use crate::entry::{Leaf, PageTableEntry};
use crate::error::VmemError;
use bitfield_struct::bitfield;
use core::ops::Range;

/// x86-64 4-level paging with 4 KiB leaves.
#[derive(Debug, Copy, Clone, Default)]
pub struct X86_64;

/// Shared layout of PML4E/PDPTE/PDE/PTE.
#[bitfield(u64)]
struct Entry {
    /// Present (bit 0).
    present: bool,
    /// Writable (bit 1).
    writable: bool,
    /// User accessible (bit 2).
    user: bool,
    /// Page write-through (bit 3).
    write_through: bool,
    /// Page cache disable (bit 4).
    cache_disable: bool,
    /// Accessed (bit 5), set by the CPU.
    accessed: bool,
    /// Dirty (bit 6), set by the CPU on write; leaf only.
    dirty: bool,
    /// PAT (bit 7) in a PTE, PS in the levels above.
    pat_or_large: bool,
    /// Global (bit 8); leaf only.
    global: bool,
    /// OS-available (bits 9..11).
    #[bits(3)]
    __os_available: u8,
    /// Frame number (bits 12..51).
    #[bits(40)]
    frame_51_12: u64,
    /// Ignored / protection key (bits 52..62).
    #[bits(11)]
    __reserved: u16,
    /// Execute-disable (bit 63).
    no_execute: bool,
}

const LEAF: usize = 3;

impl Geometry for X86_64 {
    const NAME: &'static str = "x86-64";
    const LEVELS: &'static [LevelShape] = &[
        LevelShape::new(39, 512, EntryWidth::U64, false),
        LevelShape::new(30, 512, EntryWidth::U64, false),
        LevelShape::new(21, 512, EntryWidth::U64, false),
        LevelShape::new(12, 512, EntryWidth::U64, false),
    ];
    const ADDRESS_BITS: u32 = 48;
    const SIGN_EXTENDED: bool = true;
    const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;
    const WINDOW_REGION: Range<u64> = 0xffff_fe00_0000_0000..0xffff_fe80_0000_0000;

    fn encode(level: usize, entry: &PageTableEntry) -> Result<u64, VmemError> {
        let e = match *entry {
            PageTableEntry::Invalid => Entry::new(),
            PageTableEntry::Table(table) => {
                debug_assert!(level < LEAF);
                debug_assert!(table.page_offset() == 0, "x86-64 tables are page aligned");
                Entry::new()
                    .with_present(true)
                    .with_writable(true)
                    .with_user(true)
                    .with_frame_51_12(table.as_u64() >> 12)
            }
            PageTableEntry::Leaf(leaf) if level == LEAF => encode_leaf(&leaf),
            PageTableEntry::Leaf(_) => return Err(VmemError::NotSupported("large pages")),
            PageTableEntry::Indirect(_) => return Err(VmemError::NotSupported("indirect entries")),
        };
        Ok(e.into_bits())
    }

    fn decode(level: usize, raw: u64) -> PageTableEntry {
        let e = Entry::from_bits(raw);
        if !e.present() {
            return PageTableEntry::Invalid;
        }

        let frame = PhysicalAddress::new(e.frame_51_12() << 12);
        if level < LEAF && !e.pat_or_large() {
            return PageTableEntry::Table(frame);
        }

        // PAT moves to bit 12 in huge pages; report those as plain cached memory types.
        let pat = level == LEAF && e.pat_or_large();
        PageTableEntry::Leaf(Leaf {
            frame,
            protection: x86_protection(e.user(), e.writable(), !e.no_execute()),
            memory_type: x86_memory_type(e.write_through(), e.cache_disable(), pat),
            accessed: e.accessed(),
            dirty: e.dirty(),
            global: e.global(),
        })
    }
}

fn encode_leaf(leaf: &Leaf) -> Entry {
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
        .with_frame_51_12(leaf.frame.as_u64() >> 12)
        .with_no_execute(!leaf.protection.is_executable())
}

//! # Motorola 68040 paging (4 KiB pages)
//!
//! ```text
//! | 31‒25 | 24‒18 | 17‒12 | 11‒0   |
//! |  root |  ptr  |  page | Offset |
//! ```
//!
//! Tables are smaller than a page: root and pointer tables hold 128 entries
//! (512 bytes), page tables hold 64 entries (256 bytes). Eight pointer tables
//! or sixteen page tables share one physical page and are installed into the
//! parent as one aligned group.
//!
//! Page tables may contain *indirect* descriptors (`PDT=10`) that point at a
//! page descriptor stored elsewhere; the table walker follows them once.

use super::{EntryWidth, Geometry, LevelShape};
use crate::addresses::PhysicalAddress;
use crate::entry::{DescriptorLocation, Leaf, MemoryType, PageTableEntry, Protection};
use crate::error::VmemError;
use bitfield_struct::bitfield;
use core::ops::Range;

/// 68040 three-level paging with 4 KiB pages.
#[derive(Debug, Copy, Clone, Default)]
pub struct Mc68040;

/// Upper-level (root / pointer) table descriptor.
#[bitfield(u32)]
struct TableDescriptor {
    /// `UDT`; `1x` is resident.
    #[bits(2)]
    descriptor_type: u8,
    write_protect: bool,
    used: bool,
    #[bits(4)]
    __unused: u8,
    /// Table address bits `[31:8]`.
    #[bits(24)]
    table_31_8: u32,
}

/// Page descriptor.
#[bitfield(u32)]
struct PageDescriptor {
    /// `PDT`; `01`/`11` resident, `10` indirect.
    #[bits(2)]
    descriptor_type: u8,
    write_protect: bool,
    used: bool,
    modified: bool,
    #[bits(2)]
    cache_mode: u8,
    supervisor: bool,
    #[bits(2)]
    __user_attributes: u8,
    global: bool,
    #[bits(1)]
    __ur: u8,
    #[bits(20)]
    frame_31_12: u32,
}

/// Indirect descriptor: address of the real page descriptor.
#[bitfield(u32)]
struct IndirectDescriptor {
    #[bits(2)]
    descriptor_type: u8,
    #[bits(30)]
    descriptor_31_2: u32,
}

const LEAF: usize = 2;

const UDT_RESIDENT: u8 = 0b11;
const PDT_RESIDENT: u8 = 0b01;
const PDT_INDIRECT: u8 = 0b10;

const CM_WRITE_THROUGH: u8 = 0b00;
const CM_COPYBACK: u8 = 0b01;
const CM_SERIALIZED: u8 = 0b10;
const CM_NONCACHEABLE: u8 = 0b11;

impl Geometry for Mc68040 {
    const NAME: &'static str = "mc68040";
    const LEVELS: &'static [LevelShape] = &[
        LevelShape::new(25, 128, EntryWidth::U32, false),
        LevelShape::new(18, 128, EntryWidth::U32, false),
        LevelShape::new(12, 64, EntryWidth::U32, true),
    ];
    const ADDRESS_BITS: u32 = 32;
    const SIGN_EXTENDED: bool = false;
    const KERNEL_BASE: u64 = 0x8000_0000;
    const WINDOW_REGION: Range<u64> = 0xe000_0000..0xf000_0000;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(level: usize, entry: &PageTableEntry) -> Result<u64, VmemError> {
        let raw = match *entry {
            PageTableEntry::Invalid => 0,
            PageTableEntry::Table(table) if level < LEAF => {
                debug_assert!(table.is_aligned(256));
                TableDescriptor::new()
                    .with_descriptor_type(UDT_RESIDENT)
                    .with_table_31_8((table.as_u64() >> 8) as u32)
                    .into_bits()
            }
            PageTableEntry::Leaf(leaf) if level == LEAF => encode_page(&leaf).into_bits(),
            PageTableEntry::Indirect(location) if level == LEAF => {
                let address = location.address();
                debug_assert!(address.is_aligned(4));
                IndirectDescriptor::new()
                    .with_descriptor_type(PDT_INDIRECT)
                    .with_descriptor_31_2((address.as_u64() >> 2) as u32)
                    .into_bits()
            }
            PageTableEntry::Table(_) => return Err(VmemError::NotSupported("table below the page level")),
            PageTableEntry::Leaf(_) => return Err(VmemError::NotSupported("early termination")),
            PageTableEntry::Indirect(_) => {
                return Err(VmemError::NotSupported("indirect descriptors above the page level"));
            }
        };
        Ok(u64::from(raw))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode(level: usize, raw: u64) -> PageTableEntry {
        let raw = raw as u32;
        if level < LEAF {
            let d = TableDescriptor::from_bits(raw);
            return if d.descriptor_type() & 0b10 == 0 {
                PageTableEntry::Invalid
            } else {
                PageTableEntry::Table(PhysicalAddress::new(u64::from(d.table_31_8()) << 8))
            };
        }

        let d = PageDescriptor::from_bits(raw);
        match d.descriptor_type() {
            0b00 => PageTableEntry::Invalid,
            PDT_INDIRECT => {
                let i = IndirectDescriptor::from_bits(raw);
                let address = PhysicalAddress::new(u64::from(i.descriptor_31_2()) << 2);
                PageTableEntry::Indirect(DescriptorLocation::new(address))
            }
            _ => PageTableEntry::Leaf(Leaf {
                frame: PhysicalAddress::new(u64::from(d.frame_31_12()) << 12),
                protection: decode_protection(d.supervisor(), !d.write_protect()),
                memory_type: match d.cache_mode() {
                    CM_WRITE_THROUGH => MemoryType::WriteThrough,
                    CM_COPYBACK => MemoryType::WriteBack,
                    CM_SERIALIZED => MemoryType::Uncached,
                    _ => MemoryType::WriteCombining,
                },
                accessed: d.used(),
                dirty: d.modified(),
                global: d.global(),
            }),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_page(leaf: &Leaf) -> PageDescriptor {
    debug_assert!(leaf.frame.as_u64() >> 32 == 0);
    let cache_mode = match leaf.memory_type {
        MemoryType::WriteThrough => CM_WRITE_THROUGH,
        MemoryType::WriteBack => CM_COPYBACK,
        MemoryType::Uncached => CM_SERIALIZED,
        MemoryType::WriteCombining => CM_NONCACHEABLE,
    };
    PageDescriptor::new()
        .with_descriptor_type(PDT_RESIDENT)
        .with_write_protect(!leaf.protection.is_writable())
        .with_used(leaf.accessed)
        .with_modified(leaf.dirty)
        .with_cache_mode(cache_mode)
        .with_supervisor(!leaf.protection.is_user())
        .with_global(leaf.global)
        .with_frame_31_12((leaf.frame.as_u64() >> 12) as u32)
}

/// No execute control; supervisor pages are invisible to user mode.
const fn decode_protection(supervisor: bool, writable: bool) -> Protection {
    let mut p = Protection::KERNEL_READ.union(Protection::KERNEL_EXECUTE);
    if writable {
        p = p.union(Protection::KERNEL_WRITE);
    }
    if !supervisor {
        p = p.union(Protection::USER_READ).union(Protection::USER_EXECUTE);
        if writable {
            p = p.union(Protection::USER_WRITE);
        }
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_page_table_pointers_keep_their_offset() {
        let table = PhysicalAddress::new(0x0004_3700);
        let raw = Mc68040::encode(1, &PageTableEntry::Table(table)).unwrap();
        assert_eq!(raw, 0x0004_3703);
        assert_eq!(Mc68040::decode(1, raw), PageTableEntry::Table(table));
    }

    #[test]
    fn indirect_descriptor_round_trip() {
        let location = DescriptorLocation::new(PhysicalAddress::new(0x0009_1a48));
        let raw = Mc68040::encode(LEAF, &PageTableEntry::Indirect(location)).unwrap();
        assert_eq!(raw & 0b11, 0b10);
        assert_eq!(Mc68040::decode(LEAF, raw), PageTableEntry::Indirect(location));

        // only the page level may hold them
        assert!(Mc68040::encode(1, &PageTableEntry::Indirect(location)).is_err());
    }

    #[test]
    fn supervisor_and_write_protect_bits() {
        let leaf = Leaf::new(
            PhysicalAddress::new(0x0010_0000),
            Protection::KERNEL_READ,
            MemoryType::WriteBack,
        );
        let raw = Mc68040::encode(LEAF, &PageTableEntry::Leaf(leaf)).unwrap();
        // PDT=01 | WP | CM=copyback | S
        assert_eq!(raw, 0x0010_0000 | 0b01 | 0b100 | 0b10_0000 | 0b1000_0000);

        let PageTableEntry::Leaf(decoded) = Mc68040::decode(LEAF, raw) else {
            panic!("expected a page descriptor");
        };
        assert_eq!(decoded.protection, Protection::KERNEL_READ | Protection::KERNEL_EXECUTE);
        assert_eq!(decoded.memory_type, MemoryType::WriteBack);
    }
}

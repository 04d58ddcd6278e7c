//! # Virtual and Physical Memory Addresses

use crate::PAGE_SIZE;
use core::ops::{Add, AddAssign, Sub};

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u64` to prevent mixing with virtual addresses.
/// No alignment guarantees by itself.
///
/// ### Notes
/// - Page-table entries store page-aligned frames; table pointers of
///   geometries with sub-page tables may carry a smaller alignment.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PhysicalAddress(u64);

/// A **virtual** memory address (process/kernel address space).
///
/// Newtype over `u64` to prevent mixing with physical addresses.
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VirtualAddress(u64);

macro_rules! address_common {
    ($ty:ident) => {
        impl $ty {
            #[inline]
            #[must_use]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Round down to the start of the containing 4 KiB page.
            #[inline]
            #[must_use]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_SIZE - 1))
            }

            /// Byte offset inside the containing 4 KiB page.
            #[inline]
            #[must_use]
            pub const fn page_offset(self) -> u64 {
                self.0 & (PAGE_SIZE - 1)
            }

            /// `true` if the address is a multiple of `align` (a power of two).
            #[inline]
            #[must_use]
            pub const fn is_aligned(self, align: u64) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn align_down(self, align: u64) -> Self {
                Self(crate::align_down(self.0, align))
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl Add<u64> for $ty {
            type Output = Self;

            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $ty {
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<$ty> for $ty {
            type Output = u64;

            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl core::fmt::Display for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

address_common!(PhysicalAddress);
address_common!(VirtualAddress);

impl core::fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#018x} (Virtual)", self.0)
    }
}

impl core::fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#018x} (Physical @{} MiB)", self.0, self.0 / 1024 / 1024)
    }
}

/// Half-open range of virtual addresses, `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    /// Range of `pages` 4 KiB pages starting at `start`.
    #[inline]
    #[must_use]
    pub const fn pages(start: VirtualAddress, pages: u64) -> Self {
        Self {
            start,
            end: VirtualAddress::new(start.as_u64() + pages * PAGE_SIZE),
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers() {
        let pa = PhysicalAddress::new(0x1234_5678);
        assert_eq!(pa.page_base().as_u64(), 0x1234_5000);
        assert_eq!(pa.page_offset(), 0x678);
        assert!(!pa.is_aligned(PAGE_SIZE));
        assert!(pa.page_base().is_aligned(PAGE_SIZE));
    }

    #[test]
    fn display_is_fixed_width_hex() {
        let va = VirtualAddress::new(0xffff_8000_0000_1000);
        assert_eq!(format!("{va}"), "0xffff800000001000");
        assert_eq!(format!("{}", PhysicalAddress::new(0x1000)), "0x0000000000001000");
    }

    #[test]
    fn range_len_and_contains() {
        let r = VirtualRange::pages(VirtualAddress::new(0x4000), 3);
        assert_eq!(r.len(), 3 * PAGE_SIZE);
        assert!(r.contains(VirtualAddress::new(0x6fff)));
        assert!(!r.contains(VirtualAddress::new(0x7000)));
        assert!(VirtualRange::new(r.end, r.end).is_empty());
    }
}

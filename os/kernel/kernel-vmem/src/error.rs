//! # Errors

use crate::addresses::VirtualAddress;

/// Failures reported by translation maps and window pools.
///
/// A failed operation always leaves the paging structures consistent:
/// intermediate tables it already installed stay in place (they are empty
/// and harmless), nothing else is changed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmemError {
    /// A page for a table, a window pool or a reservation could not be
    /// allocated. Transient; the caller may retry.
    #[error("out of memory")]
    OutOfMemory,
    /// No window slot is free and the caller asked not to wait.
    #[error("operation would block")]
    WouldBlock,
    /// Nothing is mapped at the given address.
    #[error("no mapping at {0}")]
    EntryNotFound(VirtualAddress),
    /// The configured geometry failed its boot-time validation.
    #[error("unsupported paging geometry: {0}")]
    UnsupportedGeometry(#[from] GeometryError),
    /// The geometry cannot express the requested operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// The kernel virtual region reserved for windows is used up.
    #[error("window address space exhausted")]
    AddressSpaceExhausted,
}

/// Reasons a [`Geometry`](crate::Geometry) description is rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("a geometry needs at least two levels")]
    TooFewLevels,
    #[error("level {0} does not have a power-of-two entry count")]
    EntryCount(usize),
    #[error("level {0} tables do not evenly divide a page")]
    TableSize(usize),
    #[error("level {0} shift does not match the levels below it")]
    Shift(usize),
    #[error("the address bits are not fully covered by the levels")]
    AddressBits,
    #[error("only the leaf level may hold indirect entries (level {0})")]
    IndirectLevel(usize),
    #[error("kernel base is not aligned to a top-level entry")]
    KernelBase,
}

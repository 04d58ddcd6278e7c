//! # Radix walks
//!
//! [`Walker`] descends from a root to the leaf entry of a virtual address,
//! optionally installing missing intermediate tables on the way. Fresh
//! tables are taken from a [`FrameSource`], zeroed, and installed into the
//! parent as a whole aligned group when several of them share a page:
//!
//! ```text
//!  parent slots:  … | i&!(k-1) | … | i | … | (i&!(k-1))+k-1 | …
//!                        │             │               │
//!  fresh page:      [ table 0 ] … [ table j ] … [ table k-1 ]
//! ```
//!
//! Mutation through a walker requires the owning map's lock; reads do not.

use crate::access::TablePtr;
use crate::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use crate::entry::PageTableEntry;
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::paging_structures::PagingContext;
use crate::platform::{FrameAllocator, FrameReservation};
use crate::{PAGE_SIZE, align_down};
use alloc::vec::Vec;

/// Where new table pages come from.
pub(crate) trait FrameSource {
    /// A page for new tables.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if none is left.
    fn next_table_page(&mut self) -> Result<PhysicalAddress, VmemError>;

    /// Takes back a page from [`next_table_page`](Self::next_table_page)
    /// that ended up unused.
    fn give_back(&mut self, page: PhysicalAddress);
}

/// Pages straight from the runtime allocator.
pub(crate) struct AllocatorSource<'a>(pub &'a dyn FrameAllocator);

impl FrameSource for AllocatorSource<'_> {
    fn next_table_page(&mut self) -> Result<PhysicalAddress, VmemError> {
        self.0.allocate_wired_zero_page().ok_or(VmemError::OutOfMemory)
    }

    fn give_back(&mut self, page: PhysicalAddress) {
        self.0.free_page(page);
    }
}

impl FrameSource for FrameReservation {
    fn next_table_page(&mut self) -> Result<PhysicalAddress, VmemError> {
        self.take().ok_or(VmemError::OutOfMemory)
    }

    fn give_back(&mut self, page: PhysicalAddress) {
        self.put_back(page);
    }
}

/// Pages from the boot-time callback, before any allocator exists.
pub(crate) struct EarlySource<'a>(pub &'a mut dyn FnMut() -> Option<PhysicalAddress>);

impl FrameSource for EarlySource<'_> {
    fn next_table_page(&mut self) -> Result<PhysicalAddress, VmemError> {
        (self.0)().ok_or(VmemError::OutOfMemory)
    }

    fn give_back(&mut self, page: PhysicalAddress) {
        log::warn!("early table page {page} leaked");
    }
}

/// One entry slot in one table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct EntryRef {
    pub table: PhysicalAddress,
    pub index: usize,
    pub level: usize,
}

/// Outcome of [`Walker::find_leaf`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LeafSearch {
    Found(EntryRef),
    /// The entry at `level` is not a table.
    Absent { level: usize },
}

pub(crate) struct Walker<'a, G: Geometry> {
    context: &'a PagingContext<G>,
    root: PhysicalAddress,
    kernel: bool,
    debug: bool,
}

impl<'a, G: Geometry> Walker<'a, G> {
    pub(crate) const fn new(context: &'a PagingContext<G>, root: PhysicalAddress, kernel: bool) -> Self {
        Self {
            context,
            root,
            kernel,
            debug: false,
        }
    }

    /// A read-only walker that reaches tables through the debug windows.
    pub(crate) const fn for_interrupt(context: &'a PagingContext<G>, root: PhysicalAddress) -> Self {
        Self {
            context,
            root,
            kernel: false,
            debug: true,
        }
    }

    fn with_table<R>(&self, table: PhysicalAddress, level: usize, f: impl FnOnce(TablePtr) -> R) -> Result<R, VmemError> {
        let width = G::LEVELS[level].width;
        if self.debug {
            self.context.access.with_table_debug(table, width, f)
        } else {
            self.context.access.with_table(table, width, f)
        }
    }

    pub(crate) fn read(&self, entry: EntryRef) -> Result<PageTableEntry, VmemError> {
        let raw = self.with_table(entry.table, entry.level, |t| t.load(entry.index))?;
        Ok(G::decode(entry.level, raw))
    }

    /// Replaces the entry and returns what was there.
    pub(crate) fn swap(&self, entry: EntryRef, new: &PageTableEntry) -> Result<PageTableEntry, VmemError> {
        let raw = G::encode(entry.level, new)?;
        let old = self.with_table(entry.table, entry.level, |t| t.swap(entry.index, raw))?;
        Ok(G::decode(entry.level, old))
    }

    /// Compare-and-swap loop: `f` sees the current entry and returns the
    /// replacement, or `None` to leave it alone.
    ///
    /// Returns the entry as it was before the (possible) change, and whether
    /// it was changed.
    pub(crate) fn update(
        &self,
        entry: EntryRef,
        mut f: impl FnMut(&PageTableEntry) -> Option<PageTableEntry>,
    ) -> Result<(PageTableEntry, bool), VmemError> {
        self.with_table(entry.table, entry.level, |t| {
            let mut current = t.load(entry.index);
            loop {
                let decoded = G::decode(entry.level, current);
                let Some(new) = f(&decoded) else {
                    return Ok((decoded, false));
                };
                let raw = G::encode(entry.level, &new)?;
                match t.compare_exchange(entry.index, current, raw) {
                    Ok(_) => return Ok((decoded, true)),
                    Err(actual) => current = actual,
                }
            }
        })?
    }

    /// The leaf entry for `va`.
    ///
    /// Missing tables are installed from `source` if one is given; without a
    /// source, or if the walk ends early at an entry that is not a table,
    /// returns `None`.
    pub(crate) fn leaf_entry(
        &self,
        va: VirtualAddress,
        mut source: Option<&mut dyn FrameSource>,
    ) -> Result<Option<EntryRef>, VmemError> {
        let mut table = self.root;
        for level in 0..G::leaf_level() {
            let entry = EntryRef {
                table,
                index: G::index(level, va),
                level,
            };
            table = match self.read(entry)? {
                PageTableEntry::Table(next) => next,
                PageTableEntry::Invalid => match source.as_deref_mut() {
                    Some(source) => self.install(entry, source)?,
                    None => return Ok(None),
                },
                PageTableEntry::Leaf(_) | PageTableEntry::Indirect(_) => return Ok(None),
            };
        }

        Ok(Some(EntryRef {
            table,
            index: G::index(G::leaf_level(), va),
            level: G::leaf_level(),
        }))
    }

    /// Like [`leaf_entry`](Self::leaf_entry) without a source, but reports
    /// the level at which the walk stopped if there is no leaf table.
    pub(crate) fn find_leaf(&self, va: VirtualAddress) -> Result<LeafSearch, VmemError> {
        let mut table = self.root;
        for level in 0..G::leaf_level() {
            let entry = EntryRef {
                table,
                index: G::index(level, va),
                level,
            };
            match self.read(entry)? {
                PageTableEntry::Table(next) => table = next,
                _ => return Ok(LeafSearch::Absent { level }),
            }
        }
        Ok(LeafSearch::Found(EntryRef {
            table,
            index: G::index(G::leaf_level(), va),
            level: G::leaf_level(),
        }))
    }

    /// Calls `f` with the leaf slot of every page in `range` that has one.
    ///
    /// Where an upper-level entry is not a table, everything it spans is
    /// skipped in one step.
    pub(crate) fn for_each_leaf(
        &self,
        range: VirtualRange,
        mut f: impl FnMut(VirtualAddress, EntryRef) -> Result<(), VmemError>,
    ) -> Result<(), VmemError> {
        let mut va = range.start.page_base();
        while va < range.end {
            let step = match self.find_leaf(va)? {
                LeafSearch::Found(slot) => {
                    f(va, slot)?;
                    PAGE_SIZE
                }
                LeafSearch::Absent { level } => G::LEVELS[level].entry_span(),
            };
            match align_down(va.as_u64(), step).checked_add(step) {
                Some(next) => va = VirtualAddress::new(next),
                None => break,
            }
        }
        Ok(())
    }

    /// Follows an indirect leaf to the descriptor it points at.
    ///
    /// Returns the entry that holds the page mapping (the leaf itself if it is
    /// not indirect) together with its contents.
    pub(crate) fn resolve(&self, leaf: EntryRef) -> Result<(EntryRef, PageTableEntry), VmemError> {
        match self.read(leaf)? {
            PageTableEntry::Indirect(location) => {
                let target = EntryRef {
                    table: location.address(),
                    index: 0,
                    level: G::leaf_level(),
                };
                Ok((target, self.read(target)?))
            }
            entry => Ok((leaf, entry)),
        }
    }

    /// Allocates, zeroes and installs the table group below `parent`;
    /// returns the table that `parent` now points at.
    fn install(&self, parent: EntryRef, source: &mut dyn FrameSource) -> Result<PhysicalAddress, VmemError> {
        let child = &G::LEVELS[parent.level + 1];
        let group = child.tables_per_page();
        let first = parent.index & !(group - 1);

        let page = source.next_table_page()?;
        let raws = (0..group)
            .map(|j| G::encode(parent.level, &PageTableEntry::Table(page + j as u64 * child.table_bytes())))
            .collect::<Result<Vec<_>, _>>();
        let raws = match raws.and_then(|raws| self.context.access.zero_page(page).map(|()| raws)) {
            Ok(raws) => raws,
            Err(e) => {
                source.give_back(page);
                return Err(e);
            }
        };

        if parent.level == 0 && self.kernel && G::kernel_root_indices().contains(&first) {
            self.context
                .registry
                .install_kernel_entries(self.context, parent.table, first, &raws)?;
        } else {
            self.with_table(parent.table, parent.level, |t| {
                for (j, &raw) in raws.iter().enumerate() {
                    t.store(first + j, raw);
                }
            })?;
        }

        log::trace!(
            "{}: level {} table page {page} installed at slots {first}..{}",
            G::NAME,
            parent.level + 1,
            first + group
        );
        Ok(page + (parent.index - first) as u64 * child.table_bytes())
    }

    /// Makes sure every leaf table covering `range` exists; returns their
    /// physical addresses in address order.
    pub(crate) fn prepare_leaf_tables(
        &self,
        range: VirtualRange,
        source: &mut dyn FrameSource,
    ) -> Result<Vec<PhysicalAddress>, VmemError> {
        let span = G::leaf_shape().table_span();
        let mut tables = Vec::new();
        let mut base = align_down(range.start.as_u64(), span);
        while base < range.end.as_u64() {
            let va = VirtualAddress::new(base.max(range.start.as_u64()));
            let entry = self
                .leaf_entry(va, Some(&mut *source))?
                .ok_or(VmemError::NotSupported("large page inside a window region"))?;
            tables.push(entry.table);
            let Some(next) = base.checked_add(span) else { break };
            base = next;
        }
        Ok(tables)
    }

    /// Frees every user-range table below the root, then the root itself.
    pub(crate) fn free_user_tables(&self, frames: &dyn FrameAllocator) -> Result<(), VmemError> {
        let user = 0..G::kernel_root_indices().start;
        self.free_children(self.root, 0, user, frames)?;
        frames.free_page(self.root.page_base());
        Ok(())
    }

    fn free_children(
        &self,
        table: PhysicalAddress,
        level: usize,
        indices: core::ops::Range<usize>,
        frames: &dyn FrameAllocator,
    ) -> Result<(), VmemError> {
        if level >= G::leaf_level() {
            return Ok(());
        }
        let group = G::LEVELS[level + 1].tables_per_page();
        for first in indices.step_by(group) {
            let mut page = None;
            for index in first..first + group {
                if let PageTableEntry::Table(child) = self.read(EntryRef { table, index, level })? {
                    let all = 0..G::LEVELS[level + 1].entries;
                    self.free_children(child, level + 1, all, frames)?;
                    page = Some(child.page_base());
                }
            }
            if let Some(page) = page {
                frames.free_page(page);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::addresses::VirtualAddress;
    use crate::entry::{MemoryType, Protection};
    use crate::geometry::Mc68040;
    use crate::sim::{Machine, Setup};

    #[test]
    fn packed_table_groups_are_freed_once() {
        let m = Machine::<Mc68040>::boot(Setup::default());
        let outstanding = m.frames.outstanding();
        let user = m.user();

        for va in [0x0040_0000, 0x0044_0000, 0x0400_0000] {
            user.map(
                VirtualAddress::new(va),
                m.ram.frame(2000),
                Protection::user_rw(),
                MemoryType::WriteBack,
            )
            .unwrap();
        }
        // root, one pointer-table group, two page-table groups
        assert_eq!(m.frames.outstanding(), outstanding + 4);

        drop(user);
        assert_eq!(m.frames.outstanding(), outstanding);
    }
}

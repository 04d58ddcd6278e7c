use super::Window;
use super::region::SlotRegion;
use crate::addresses::PhysicalAddress;
use crate::error::VmemError;
use crate::geometry::Geometry;
use crate::platform::{CpuId, Platform};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Private window slots of every CPU, plus one debug slot each.
///
/// Slot state is a per-CPU bitmask (bit set = free) changed by CAS, so
/// nested use from interrupt handlers on the same CPU is safe without
/// disabling interrupts. Bindings are only ever visible to the owning CPU,
/// so only the local TLB is invalidated.
pub(crate) struct PerCpuSlots<G: Geometry> {
    region: SlotRegion<G>,
    per_cpu: usize,
    free: Vec<AtomicU64>,
    debug_busy: Vec<AtomicBool>,
}

impl<G: Geometry> PerCpuSlots<G> {
    /// Pages a region for `cpu_count` CPUs must provide.
    pub(crate) const fn pages_needed(cpu_count: usize, per_cpu: usize) -> usize {
        cpu_count * (per_cpu + 1)
    }

    pub(crate) fn new(region: SlotRegion<G>, cpu_count: usize, per_cpu: usize) -> Self {
        debug_assert!((1..=64).contains(&per_cpu));
        debug_assert!(region.pages() >= Self::pages_needed(cpu_count, per_cpu));
        let all_free = if per_cpu == 64 { u64::MAX } else { (1 << per_cpu) - 1 };
        Self {
            region,
            per_cpu,
            free: (0..cpu_count).map(|_| AtomicU64::new(all_free)).collect(),
            debug_busy: (0..cpu_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    #[inline]
    const fn stride(&self) -> usize {
        self.per_cpu + 1
    }

    #[inline]
    const fn debug_slot(&self, cpu: CpuId) -> usize {
        cpu * self.stride() + self.per_cpu
    }

    /// Claims `count` free bits of `cpu`'s mask in one step.
    fn claim(&self, cpu: CpuId, count: u32) -> Result<u64, VmemError> {
        let mask = &self.free[cpu];
        let mut current = mask.load(Ordering::Relaxed);
        loop {
            if current.count_ones() < count {
                return Err(VmemError::WouldBlock);
            }
            let mut claimed = 0;
            let mut rest = current;
            for _ in 0..count {
                claimed |= rest & rest.wrapping_neg();
                rest &= rest - 1;
            }
            match mask.compare_exchange_weak(current, current & !claimed, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Ok(claimed),
                Err(actual) => current = actual,
            }
        }
    }

    fn bind_local(
        &self,
        platform: &dyn Platform,
        slot: usize,
        physical: PhysicalAddress,
    ) -> Result<Window, VmemError> {
        self.region.bind(platform, slot, physical)?;
        let va = self.region.slot_address(slot);
        platform.invalidate_page(va);
        Ok(Window {
            address: va + physical.page_offset(),
            slot,
        })
    }

    pub(crate) fn acquire(&self, platform: &dyn Platform, physical: PhysicalAddress) -> Result<Window, VmemError> {
        let cpu = platform.current_cpu();
        let bits = self.claim(cpu, 1)?;
        let slot = cpu * self.stride() + bits.trailing_zeros() as usize;
        self.bind_local(platform, slot, physical).inspect_err(|_| {
            self.free[cpu].fetch_or(bits, Ordering::Release);
        })
    }

    pub(crate) fn acquire_pair(
        &self,
        platform: &dyn Platform,
        first: PhysicalAddress,
        second: PhysicalAddress,
    ) -> Result<(Window, Window), VmemError> {
        let cpu = platform.current_cpu();
        let bits = self.claim(cpu, 2)?;
        let low = bits.trailing_zeros() as usize;
        let high = 63 - bits.leading_zeros() as usize;
        let base = cpu * self.stride();

        let bound = self.bind_local(platform, base + low, first).and_then(|a| {
            self.bind_local(platform, base + high, second).map(|b| (a, b))
        });
        bound.inspect_err(|_| {
            self.free[cpu].fetch_or(bits, Ordering::Release);
        })
    }

    /// Points a held slot at another page.
    pub(crate) fn rebind(
        &self,
        platform: &dyn Platform,
        window: &mut Window,
        physical: PhysicalAddress,
    ) -> Result<(), VmemError> {
        debug_assert_eq!(window.slot / self.stride(), platform.current_cpu());
        *window = self.bind_local(platform, window.slot, physical)?;
        Ok(())
    }

    pub(crate) fn release(&self, platform: &dyn Platform, window: Window) {
        let cpu = window.slot / self.stride();
        let bit = window.slot % self.stride();
        debug_assert_eq!(cpu, platform.current_cpu(), "per-CPU window released on another CPU");
        debug_assert!(bit < self.per_cpu);
        self.free[cpu].fetch_or(1 << bit, Ordering::Release);
    }

    pub(crate) fn acquire_debug(&self, platform: &dyn Platform, physical: PhysicalAddress) -> Result<Window, VmemError> {
        let cpu = platform.current_cpu();
        if self.debug_busy[cpu]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(VmemError::WouldBlock);
        }
        self.bind_local(platform, self.debug_slot(cpu), physical).inspect_err(|_| {
            self.debug_busy[cpu].store(false, Ordering::Release);
        })
    }

    pub(crate) fn release_debug(&self, window: Window) {
        let cpu = window.slot / self.stride();
        debug_assert_eq!(window.slot, self.debug_slot(cpu));
        self.debug_busy[cpu].store(false, Ordering::Release);
    }
}

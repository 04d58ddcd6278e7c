//! # Interrupt control
//!
//! The memory subsystem never touches the interrupt flag directly; it goes
//! through an [`InterruptControl`] implementation supplied by the platform.
//! On `x86_64` targets [`NativeInterrupts`] provides the `cli`/`sti` based
//! implementation.

/// Save/disable/restore of the local CPU's interrupt state.
pub trait InterruptControl {
    /// Disables interrupts on the current CPU and returns whether they were
    /// enabled before the call.
    fn disable(&self) -> bool;

    /// Re-enables interrupts if `were_enabled` is `true`; otherwise leaves
    /// them disabled.
    fn restore(&self, were_enabled: bool);

    /// Returns `true` if interrupts are currently enabled on this CPU.
    fn are_enabled(&self) -> bool;
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// The previous state is snapshotted, so nesting guards is safe: only the
/// outermost guard re-enables interrupts.
///
/// # Examples
///
/// ```no_run
/// use kernel_sync::irq::{InterruptControl, IrqGuard};
///
/// fn critical(irq: &dyn InterruptControl) {
///     let _g = IrqGuard::new(irq); // interrupts disabled here
///     // critical section
/// } // restored to the prior state
/// ```
pub struct IrqGuard<'a> {
    control: &'a dyn InterruptControl,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new(control: &'a dyn InterruptControl) -> Self {
        let were_enabled = control.disable();
        Self {
            control,
            were_enabled,
        }
    }

    /// Whether interrupts were enabled before this guard disabled them.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard<'_> {
    /// Restores interrupts only if they were previously enabled.
    fn drop(&mut self) {
        self.control.restore(self.were_enabled);
    }
}

#[cfg(target_arch = "x86_64")]
pub use native::NativeInterrupts;

#[cfg(target_arch = "x86_64")]
mod native {
    use super::InterruptControl;

    /// `IF` flag in `RFLAGS`.
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    fn cli() {
        // SAFETY: callers run at a privilege level that permits `cli`.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn sti() {
        // SAFETY: as for `cli`.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn interrupts_enabled() -> bool {
        let flags: u64;
        // SAFETY: reads RFLAGS through the stack only.
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) flags, options(nostack, preserves_flags)) }
        flags & RFLAGS_IF != 0
    }

    /// Interrupt control of the executing `x86_64` CPU.
    ///
    /// Requires a privileged context permitting `cli/sti`.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct NativeInterrupts;

    impl InterruptControl for NativeInterrupts {
        #[inline]
        fn disable(&self) -> bool {
            let enabled = interrupts_enabled();
            if enabled {
                cli();
            }
            enabled
        }

        #[inline]
        fn restore(&self, were_enabled: bool) {
            if were_enabled {
                sti();
            }
        }

        #[inline]
        fn are_enabled(&self) -> bool {
            interrupts_enabled()
        }
    }
}

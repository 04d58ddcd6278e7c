//! # Kernel synchronization primitives
//!
//! Small, allocation-free building blocks used by the memory subsystem:
//!
//! - [`SpinLock`]: a TATAS spin lock, optionally held with interrupts disabled
//!   (see [`SpinLock::lock_irq`]).
//! - [`RecursiveMutex`]: a lock the owning thread may re-enter; the guard
//!   reports whether it is the outermost one.
//! - [`Handoff`]: a single-use rendezvous through which a releaser passes a
//!   resource directly to one waiter.
//! - [`SyncOnceCell`]: set-once storage for late-initialized singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod handoff;
pub mod irq;
mod recursive;
mod spin_lock;
mod sync_once_cell;

pub use handoff::Handoff;
pub use irq::{InterruptControl, IrqGuard};
pub use recursive::{RecursiveGuard, RecursiveMutex};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

//! # Kernel synchronization primitives
//!
//! - [`SpinLock`]: a short-critical-section spin lock with an RAII guard.
//! - [`OrderedLock`]: a spin lock bound to a level of a lock hierarchy declared
//!   with [`lock_order!`]; acquiring locks out of order is a compile error.
//! - [`SyncOnceCell`]: a write-once cell for globals installed at boot.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod ordered;
mod spin_lock;
mod sync_once_cell;

pub use ordered::{LockAfter, LockContext, LockLevel, OrderedLock, Unlocked};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

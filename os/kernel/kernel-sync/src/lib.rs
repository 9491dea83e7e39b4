//! # Kernel synchronization primitives
//!
//! Only what the memory subsystem needs:
//!
//! - [`SpinLock`] guards short critical sections, such as the free stack of a
//!   frame allocator.
//! - [`SyncOnceCell`] publishes a process-wide service exactly once, such as the
//!   shared node pool of the segment tables.
//! - [`Backoff`] is the bounded exponential spin used by both of the above and by
//!   lock-free compare-and-swap retry loops.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod backoff;
mod spin_lock;
mod sync_once_cell;

pub use backoff::Backoff;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

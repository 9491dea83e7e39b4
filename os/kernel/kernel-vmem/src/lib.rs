//! # Segment-Table Virtual Memory
//!
//! Machine-independent page-table storage for a two-tier translation scheme:
//! a tree of fixed-size **segment-table nodes** whose last level points at
//! **leaf tables** of 32-bit translation entries.
//!
//! ## What you get
//! - An [`AddressSpace`] that owns one tree and answers [`lookup`](AddressSpace::lookup),
//!   [`reserve`](AddressSpace::reserve) and [`process`](AddressSpace::process).
//! - A lock-free [`NodePool`] that hands out sub-page node chunks carved from 4 KiB frames.
//! - The [`Pte`] translation entry and the 4 KiB [`PageTable`] leaf.
//! - Per-CPU [`CpuRoot`] slots for publishing the active tree.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## Virtual Address → Translation Entry
//!
//! Every leaf holds 1024 entries of 4 bytes, so one leaf spans a 4 MiB
//! *segment*. The bits above the segment are split into node indices by the
//! chosen [`Geometry`]:
//!
//! ```text
//! Flat32   | 31‒22 | 21‒12 | 11‒0   |
//!          |  seg  |  pte  | offset |
//!
//! Tiered39 | 38‒31 | 30‒22 | 21‒12 | 11‒0   |
//!          |  top  |  seg  |  pte  | offset |
//! ```
//!
//! ```text
//!  root node  →  …  →  last node  →  leaf  →  Pte
//!   (pool)            (pool)        (4 KiB frame)
//! ```
//!
//! Nodes are installed lazily. Two CPUs racing to fill the same empty slot
//! each prepare a zeroed table and publish it with a single compare-and-swap;
//! the loser gives its table back and continues with the winner's.
//!
//! ## Safety
//!
//! Translation storage is reached through a [`PhysMapper`]. The mapper must
//! return addresses that stay valid for as long as the frame allocator keeps
//! the frame alive.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod activation;
pub mod address_space;
pub mod config;
pub mod geometry;
mod node;
pub mod node_pool;
mod page_table;

#[cfg(test)]
mod test_support;

extern crate alloc;

use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

pub use crate::activation::{ActiveRoot, CpuId, CpuRoot, KERNEL_ROOT_SENTINEL};
pub use crate::address_space::{
    AddressSpace, ReserveError, SpaceKind, SpaceStats, Tables, TeardownReport,
};
pub use crate::config::{DEFAULT_NODE_CAPACITY, LiveEntryCheck, PmapConfig};
pub use crate::geometry::{Flat32, Geometry, KernelGeometry, Tiered39};
pub use crate::node_pool::{NodeId, NodePool, PoolError, PoolStats, init_node_pool, node_pool};
pub use crate::page_table::{PageTable, Pte, PteBits};

/// Source of 4 KiB physical frames for leaves and node chunks.
///
/// Implementations must be callable from several CPUs at once.
pub trait FrameAlloc {
    /// Take one zeroed-or-not 4 KiB frame, or `None` if none is available right now.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously handed out by [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, page: PhysicalPage<Size4K>);

    /// Wait until frames may be available again.
    ///
    /// Returns `false` when waiting cannot make progress, in which case a
    /// blocking caller treats the shortage as fatal.
    fn wait_for_frames(&self) -> bool {
        false
    }
}

/// Minimal physical-to-virtual mapping used to touch table memory.
pub trait PhysMapper {
    /// Map a physical address to a writable pointer in the current address space.
    ///
    /// # Safety
    /// The caller must ensure `pa` refers to memory owned by the frame
    /// allocator and suitably aligned for `T`.
    unsafe fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> NonNull<T>;

    /// Borrow the `T` stored at `pa`.
    ///
    /// # Safety
    /// As for [`phys_to_ptr`](Self::phys_to_ptr); additionally the memory must
    /// hold a valid `T` for the whole lifetime `'a`.
    #[inline]
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        unsafe { self.phys_to_ptr::<T>(pa).as_ref() }
    }

    /// Borrow `len` consecutive `T`s starting at `pa`.
    ///
    /// # Safety
    /// As for [`phys_to_ref`](Self::phys_to_ref), for every element.
    #[inline]
    unsafe fn phys_to_slice<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a [T] {
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr::<T>(pa).as_ptr(), len) }
    }
}

/// What to do when the frame allocator runs dry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Exhaustion {
    /// Wait for frames; fatal if waiting cannot make progress.
    Wait,
    /// Report the shortage to the caller.
    Fail,
}

/// Allocate one frame, honoring `mode` on exhaustion.
pub(crate) fn alloc_frame<A: FrameAlloc + ?Sized>(
    alloc: &A,
    mode: Exhaustion,
) -> Option<PhysicalPage<Size4K>> {
    loop {
        if let Some(page) = alloc.alloc_4k() {
            return Some(page);
        }
        match mode {
            Exhaustion::Fail => return None,
            Exhaustion::Wait => {
                if !alloc.wait_for_frames() {
                    out_of_table_memory();
                }
            }
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn out_of_table_memory() -> ! {
    panic!("out of memory for page tables and the frame allocator cannot make progress")
}

//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! segment-table code in `kernel-vmem` and by the physical frame allocator in
//! `kernel-alloc`.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | An address that must be translated through a segment table. |
//! | [`PhysicalAddress`] | An address in physical memory (RAM or table pages). |
//! | [`PhysicalPage<S>`] | The aligned base of a physical page of size `S`. |
//!
//! ## Page Sizes
//!
//! Two granularities matter to the translation tree and are provided as
//! marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: one 4 KiB page, the unit mapped by a single translation entry
//!   and the size of every table page handed out by the frame allocator.
//! - [`Size4M`]: one 4 MiB **segment**, the span of virtual memory covered by a
//!   single leaf of 1024 translation entries.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.align_down::<Size4M>().as_u64(), 0x0040_0000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//!
//! let frame = PhysicalPage::<Size4K>::from_frame_number(0x123);
//! assert_eq!(frame.base().as_u64(), 0x0012_3000);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` over `u64` and `Copy`.
//! - Alignment helpers are `const fn`; the page size is carried at the type
//!   level so conversions between granularities are always explicit.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;

use core::fmt;
use core::hash::Hash;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 4 MiB segment (`4_194_304` bytes), the span of one leaf table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4M;
impl sealed::Sealed for Size4M {}
impl PageSize for Size4M {
    const SIZE: u64 = 4 * 1024 * 1024;
    const SHIFT: u32 = 22;

    fn as_str() -> &'static str {
        "4M"
    }
}

impl fmt::Display for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Display for Size4M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

impl fmt::Debug for Size4M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

const _: () = {
    assert!(Size4K::SIZE == 1 << Size4K::SHIFT);
    assert!(Size4M::SIZE == 1 << Size4M::SHIFT);
};

//! # Physical Frame Allocation
//!
//! Frame providers for the segment-table code in `kernel-vmem`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              kernel-vmem (AddressSpace)             │
//! │    • lookup / reserve / process / teardown          │
//! └──────────────┬──────────────────────┬───────────────┘
//!                │ FrameAlloc           │ PhysMapper
//! ┌──────────────▼──────────────────────▼───────────────┐
//! │                    FrameArena                       │
//! │    • fixed set of 4 KiB frames                      │
//! │    • LIFO free stack behind a spin lock             │
//! │    • configurable behavior when exhausted           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Frame Arena ([`frame_alloc`])
//!
//! A heap-backed stand-in for physical memory: a contiguous run of 4 KiB
//! frames at a configurable physical base. Freed frames are poisoned so that
//! code relying on fresh frames being zero shows up quickly.
//!
//! ### Physical Mappers ([`phys_mapper`])
//!
//! - [`FrameArena`] maps its own physical range onto its backing storage.
//! - [`HhdmPhysMapper`](phys_mapper::HhdmPhysMapper) adds a fixed direct-map offset, as a kernel
//!   with a higher-half direct map would.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::{FrameArena, FrameArenaConfig};
//! use kernel_vmem::{AddressSpace, NodePool, Tables, Tiered39};
//! use kernel_memory_addresses::VirtualAddress;
//!
//! let arena = FrameArena::new(FrameArenaConfig::new(64)).unwrap();
//! let pool = NodePool::<Tiered39>::new(64);
//! let space = AddressSpace::new(Tables::new(&pool, &arena, &arena));
//!
//! let pte = space.reserve(VirtualAddress::new(0x0040_1000));
//! assert!(!pte.is_valid());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;

pub use frame_alloc::{FrameArena, FrameArenaConfig, FrameArenaError, FrameStats, WaitPolicy};

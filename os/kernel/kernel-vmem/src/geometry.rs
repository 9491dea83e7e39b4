//! # Tree Geometry
//!
//! A [`Geometry`] fixes how many virtual-address bits the tree translates and
//! how wide each segment-table node is. The leaf level is not configurable:
//! a leaf is always one 4 KiB frame of 1024 four-byte entries, i.e. it spans
//! one 4 MiB segment.
//!
//! From `VA_BITS` and `NODE_SHIFT` every other constant is derived:
//!
//! | Constant         | Meaning                                      |
//! |:-----------------|:---------------------------------------------|
//! | `NODE_SLOTS`     | slots per node (`1 << NODE_SHIFT`)           |
//! | `NODE_BYTES`     | bytes per node (4 bytes per slot)            |
//! | `NODES_PER_PAGE` | node chunks carved from one 4 KiB frame      |
//! | `LEVELS`         | node levels between the root and the leaves  |
//!
//! The top level may use fewer than `NODE_SHIFT` bits; its upper slots are
//! then never indexed.

use kernel_memory_addresses::{PageSize, Size4K, Size4M, VirtualAddress};

/// Size of one translation entry in bytes.
pub const PTE_BYTES: usize = 4;

/// Translation entries per leaf table.
pub const PTES_PER_LEAF: usize = Size4K::SIZE as usize / PTE_BYTES;

/// Address bits resolved by one leaf (page offset + entry index).
pub const SEGMENT_SHIFT: u32 = Size4M::SHIFT;

/// Size of one segment-table slot in bytes.
pub const SLOT_BYTES: usize = 4;

const _: () = {
    assert!(PTES_PER_LEAF == 1024);
    assert!(Size4K::SHIFT + PTES_PER_LEAF.trailing_zeros() == SEGMENT_SHIFT);
};

/// Shape of the segment-table tree.
pub trait Geometry: Send + Sync + 'static {
    /// Human-readable name, used in log output.
    const NAME: &'static str;

    /// Number of translated virtual-address bits.
    const VA_BITS: u32;

    /// log2 of the number of slots per node.
    const NODE_SHIFT: u32;

    /// Slots per node.
    const NODE_SLOTS: usize = 1 << Self::NODE_SHIFT;

    /// Bytes per node.
    const NODE_BYTES: usize = Self::NODE_SLOTS * SLOT_BYTES;

    /// Nodes carved out of one 4 KiB frame.
    const NODES_PER_PAGE: usize = Size4K::SIZE as usize / Self::NODE_BYTES;

    /// Node levels from the root down to (and including) the level that points at leaves.
    const LEVELS: usize = (Self::VA_BITS - SEGMENT_SHIFT).div_ceil(Self::NODE_SHIFT) as usize;

    /// First virtual address the tree cannot translate.
    const VA_LIMIT: u64 = 1 << Self::VA_BITS;

    /// Compile-time sanity check; referenced by every constructor.
    const CHECK: () = {
        assert!(Self::VA_BITS > SEGMENT_SHIFT, "tree must translate more than one segment");
        assert!(Self::VA_BITS <= 63, "virtual limit must fit in u64");
        assert!(Self::NODE_SHIFT >= 1, "nodes need at least two slots");
        assert!(
            Self::NODE_BYTES <= Size4K::SIZE as usize,
            "a node must fit in one frame"
        );
        assert!(Self::LEVELS >= 1);
    };

    /// Whether `va` lies inside the translated range.
    #[inline(always)]
    #[must_use]
    fn contains(va: VirtualAddress) -> bool {
        va.as_u64() < Self::VA_LIMIT
    }

    /// Lowest address bit consumed by the node at `level` (0 = root).
    ///
    /// One slot at `level` covers `1 << level_shift(level)` bytes.
    #[inline(always)]
    #[must_use]
    fn level_shift(level: usize) -> u32 {
        debug_assert!(level < Self::LEVELS);
        SEGMENT_SHIFT + Self::NODE_SHIFT * (Self::LEVELS - 1 - level) as u32
    }

    /// Slot index for `va` in the node at `level`.
    #[inline(always)]
    #[must_use]
    fn slot_index(va: VirtualAddress, level: usize) -> usize {
        (va.as_u64() >> Self::level_shift(level)) as usize & (Self::NODE_SLOTS - 1)
    }
}

/// Entry index for `va` inside its leaf (VA bits `[21:12]`).
#[inline(always)]
#[must_use]
pub const fn pte_index(va: VirtualAddress) -> usize {
    (va.as_u64() >> Size4K::SHIFT) as usize & (PTES_PER_LEAF - 1)
}

/// Segment number of `va`, i.e. which leaf covers it.
#[inline(always)]
#[must_use]
pub const fn segment_of(va: VirtualAddress) -> u64 {
    va.as_u64() >> SEGMENT_SHIFT
}

/// Single-level tree over a 32-bit address space: one 4 KiB root of 1024 slots.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Flat32;

impl Geometry for Flat32 {
    const NAME: &'static str = "flat32";
    const VA_BITS: u32 = 32;
    const NODE_SHIFT: u32 = 10;
}

/// Two-level tree over a 39-bit address space with 2 KiB nodes (two per frame).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Tiered39;

impl Geometry for Tiered39 {
    const NAME: &'static str = "tiered39";
    const VA_BITS: u32 = 39;
    const NODE_SHIFT: u32 = 9;
}

/// Geometry of the global node pool.
pub type KernelGeometry = Tiered39;

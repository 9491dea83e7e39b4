//! Segment-table nodes and their slots.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU32, Ordering};

/// One slot of a segment-table node.
///
/// A present slot links to the next level: a pool node id on interior
/// levels, a leaf frame number on the last level. An all-zero slot is empty.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TableSlot {
    pub present: bool,
    #[bits(31)]
    pub link: u32,
}

impl TableSlot {
    /// Largest value a slot can link to.
    pub const MAX_LINK: u32 = (1 << 31) - 1;

    /// A present slot linking to `link`.
    #[inline]
    #[must_use]
    pub const fn linking(link: u32) -> Self {
        debug_assert!(link <= Self::MAX_LINK);
        Self::new().with_present(true).with_link(link)
    }

    /// The link if present.
    #[inline]
    #[must_use]
    pub const fn target(self) -> Option<u32> {
        if self.present() {
            Some(self.link())
        } else {
            None
        }
    }
}

/// View onto the slots of one node chunk.
#[derive(Copy, Clone)]
pub struct Node<'a> {
    slots: &'a [AtomicU32],
}

impl<'a> Node<'a> {
    #[inline]
    pub const fn new(slots: &'a [AtomicU32]) -> Self {
        Self { slots }
    }

    #[inline]
    pub fn load(&self, index: usize) -> TableSlot {
        TableSlot::from_bits(self.slots[index].load(Ordering::Acquire))
    }

    /// Publish `slot` into an empty slot.
    ///
    /// The release half orders the caller's initialization of the child
    /// before the link becomes visible.
    ///
    /// # Errors
    /// Returns the slot that is already installed.
    #[inline]
    pub fn install(&self, index: usize, slot: TableSlot) -> Result<(), TableSlot> {
        self.slots[index]
            .compare_exchange(0, slot.into_bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TableSlot::from_bits)
    }

    /// Empty the slot, returning what it held.
    #[inline]
    pub fn take(&self, index: usize) -> TableSlot {
        TableSlot::from_bits(self.slots[index].swap(0, Ordering::AcqRel))
    }

    /// Empty every slot. Only valid before the node is published.
    pub fn clear(&self) {
        for slot in self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.slots.len()
    }
}

//! # Leaf Tables and Translation Entries
//!
//! - [`PteBits`]: the 32-bit layout of one translation entry.
//! - [`Pte`]: an atomically accessed entry, as stored in memory.
//! - [`PageTable`]: a 4 KiB-aligned leaf of 1024 entries covering one 4 MiB segment.
//!
//! Only the `valid` bit has meaning to the tree itself: teardown uses it to
//! detect mappings that were left behind. Everything else is owned by the
//! machine-dependent layer that fills entries in.

use crate::geometry::{PTES_PER_LEAF, pte_index};
use bitfield_struct::bitfield;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress};

const FRAME_BITS: u32 = 20;

/// Layout of a translation entry.
///
/// | Bits   | Field        |
/// |:-------|:-------------|
/// | 0      | `valid`      |
/// | 1      | `wired`      |
/// | 2..12  | `attributes` |
/// | 12..32 | `frame`      |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PteBits {
    /// The entry maps a page.
    pub valid: bool,
    /// The mapping must not be reclaimed.
    pub wired: bool,
    /// Machine-dependent protection and cache bits.
    #[bits(10)]
    pub attributes: u16,
    /// Physical frame number of the mapped page.
    #[bits(20)]
    pub frame: u32,
}

impl PteBits {
    /// A valid entry mapping `page`.
    ///
    /// ### Panics
    /// If the frame number does not fit in 20 bits.
    #[must_use]
    pub fn mapping(page: PhysicalPage<Size4K>) -> Self {
        let frame = u32::try_from(page.frame_number())
            .ok()
            .filter(|&f| f < 1 << FRAME_BITS)
            .unwrap_or_else(|| panic!("{page:?} is beyond the entry's frame range"));
        Self::new().with_valid(true).with_frame(frame)
    }

    /// The mapped page, regardless of `valid`.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame() as u64)
    }

    /// All bits clear.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }
}

/// One translation entry.
///
/// Entries are read and written concurrently by different CPUs, so every
/// access goes through an atomic.
#[doc(alias = "PTE")]
#[repr(transparent)]
pub struct Pte(AtomicU32);

impl Pte {
    /// An invalid, all-zero entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> PteBits {
        PteBits::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, bits: PteBits) {
        self.0.store(bits.into_bits(), Ordering::Release);
    }

    /// Replace the entry and return the previous contents.
    #[inline]
    pub fn swap(&self, bits: PteBits) -> PteBits {
        PteBits::from_bits(self.0.swap(bits.into_bits(), Ordering::AcqRel))
    }

    /// Install `new` if the entry still holds `current`.
    ///
    /// # Errors
    /// Returns the actual contents if they differ from `current`.
    #[inline]
    pub fn compare_exchange(&self, current: PteBits, new: PteBits) -> Result<PteBits, PteBits> {
        self.0
            .compare_exchange(
                current.into_bits(),
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(PteBits::from_bits)
            .map_err(PteBits::from_bits)
    }

    /// Invalidate the entry, returning what it held.
    #[inline]
    pub fn clear(&self) -> PteBits {
        self.swap(PteBits::new())
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.load().valid()
    }
}

impl Default for Pte {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pte").field(&self.load()).finish()
    }
}

/// A leaf table: 1024 entries, 4 KiB-aligned, one per 4 MiB segment.
///
/// Leaves are never constructed by value; they are views onto frames
/// obtained from the frame allocator.
#[doc(alias = "Leaf")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Pte; PTES_PER_LEAF],
}

const _: () = assert!(size_of::<PageTable>() == Size4K::SIZE as usize);

impl PageTable {
    /// Entry at `index`.
    ///
    /// ### Panics
    /// If `index >= 1024`.
    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> &Pte {
        &self.entries[index]
    }

    /// Entry translating `va`.
    #[inline]
    #[must_use]
    pub fn entry_for(&self, va: VirtualAddress) -> &Pte {
        self.entry(pte_index(va))
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &[Pte] {
        &self.entries
    }

    /// Number of entries with the `valid` bit set.
    #[must_use]
    pub fn live_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_valid()).count()
    }

    /// Clear every entry. Only valid before the leaf is published.
    pub(crate) fn zero(&self) {
        for e in &self.entries {
            e.0.store(0, Ordering::Relaxed);
        }
    }
}

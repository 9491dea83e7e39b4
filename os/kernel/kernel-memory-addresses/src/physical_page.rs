use crate::{PageSize, PhysicalAddress};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pp = PhysicalAddress::new(0x0030_0042).page::<Size4K>();
/// assert_eq!(pp.base().as_u64(), 0x0030_0000);
/// assert_eq!(pp.frame_number(), 0x300);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// Page that contains `pa` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self {
            base: pa.as_u64() & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Page with frame number `n`, i.e. base `n << S::SHIFT`.
    #[inline]
    #[must_use]
    pub const fn from_frame_number(n: u64) -> Self {
        Self {
            base: n << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.base >> S::SHIFT
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::as_str(), self.base)
    }
}

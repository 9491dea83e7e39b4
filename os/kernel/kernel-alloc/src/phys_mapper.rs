//! # Physical Mappers
//!
//! Table memory is identified by physical address; code can only dereference
//! virtual ones. A [`PhysMapper`] bridges the two.
//!
//! - [`FrameArena`] resolves its own physical range onto its backing buffers.
//! - [`HhdmPhysMapper`] adds a fixed offset, for kernels that map all of
//!   physical memory at a higher-half direct map.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::{FrameArena, FrameArenaConfig};
//! use kernel_vmem::{FrameAlloc, PhysMapper};
//!
//! let arena = FrameArena::new(FrameArenaConfig::new(1)).unwrap();
//! let page = arena.alloc_4k().unwrap();
//! unsafe {
//!     let word = arena.phys_to_ptr::<u32>(page.base() + 4);
//!     word.write(7);
//!     assert_eq!(arena.phys_to_slice::<u32>(page.base(), 2)[1], 7);
//! }
//! ```

use crate::frame_alloc::FrameArena;
use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

impl PhysMapper for FrameArena {
    /// ### Panics
    /// If `pa` is outside the arena.
    unsafe fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> NonNull<T> {
        let Some((index, offset)) = self.locate(pa) else {
            panic!("{pa} is outside the frame arena");
        };
        // SAFETY: `offset` is below the frame size, so the result stays inside
        // the frame's buffer, which is never null.
        unsafe {
            let byte = self.frames[index].0.get().cast::<u8>().add(offset);
            NonNull::new_unchecked(byte.cast::<T>())
        }
    }
}

/// Default direct-map base of the higher half.
pub const DEFAULT_HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// # Safety
/// - The direct map must be present and cover every referenced frame.
/// - The returned pointers must only be used for mapped, writable memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(DEFAULT_HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    /// ### Panics
    /// If `base + pa` overflows or is null.
    unsafe fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> NonNull<T> {
        let va = self
            .base
            .checked_add(pa.as_u64())
            .unwrap_or_else(|| panic!("{pa} is beyond the direct map"));
        #[allow(clippy::cast_possible_truncation)]
        NonNull::new(core::ptr::with_exposed_provenance_mut::<T>(va as usize))
            .unwrap_or_else(|| panic!("{pa} maps to a null pointer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameArenaConfig;
    use kernel_memory_addresses::{PageSize, Size4K};
    use kernel_vmem::FrameAlloc;

    #[test]
    fn arena_mapping_follows_offsets() {
        let arena = FrameArena::new(FrameArenaConfig::new(2)).unwrap();
        let a = arena.alloc_4k().unwrap();
        let b = arena.alloc_4k().unwrap();
        unsafe {
            let pa = arena.phys_to_ptr::<u8>(a.base());
            let pb = arena.phys_to_ptr::<u8>(b.base());
            assert_eq!(pa.as_ptr().align_offset(Size4K::SIZE as usize), 0);
            assert_ne!(pa, pb);
            let inner = arena.phys_to_ptr::<u8>(a.base() + 100);
            assert_eq!(inner.as_ptr(), pa.as_ptr().add(100));
        }
    }

    #[test]
    #[should_panic(expected = "outside the frame arena")]
    fn arena_rejects_foreign_addresses() {
        let arena = FrameArena::new(FrameArenaConfig::new(1)).unwrap();
        let _ = unsafe { arena.phys_to_ptr::<u8>(PhysicalAddress::new(0x10)) };
    }

    #[test]
    fn poison_marks_freed_frames() {
        let arena = FrameArena::new(FrameArenaConfig::new(1).with_poison(Some(0x5A))).unwrap();
        let page = arena.alloc_4k().unwrap();
        arena.free_4k(page);
        let bytes = unsafe { arena.phys_to_slice::<u8>(page.base(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn hhdm_adds_its_base() {
        let mapper = HhdmPhysMapper::new(0xffff_8000_0000_0000);
        let ptr = unsafe { mapper.phys_to_ptr::<u64>(PhysicalAddress::new(0x1000)) };
        assert_eq!(ptr.as_ptr().addr(), 0xffff_8000_0000_1000);
        assert_eq!(HhdmPhysMapper::default().base(), DEFAULT_HHDM_BASE);
    }
}

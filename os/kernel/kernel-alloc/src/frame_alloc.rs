//! Heap-backed physical frame arena.
//!
//! The arena owns `frames` page-aligned 4 KiB buffers and pretends they sit
//! at consecutive physical addresses starting at `phys_base`. It implements
//! [`FrameAlloc`] for the segment-table code and, in [`phys_mapper`](crate::phys_mapper),
//! [`PhysMapper`](kernel_vmem::PhysMapper) to reach the frames it hands out.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::{Backoff, SpinLock};
use kernel_vmem::FrameAlloc;
use log::{debug, trace};

const FRAME_SIZE: usize = Size4K::SIZE as usize;

/// Default physical base of an arena (1 MiB).
pub const DEFAULT_PHYS_BASE: PhysicalAddress = PhysicalAddress::new(0x0010_0000);

/// Byte pattern written over freed frames in debug builds.
pub const POISON: u8 = 0xA5;

/// Reaction of [`FrameAlloc::wait_for_frames`] when the arena is empty.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitPolicy {
    /// Never wait; blocking callers treat exhaustion as fatal.
    FailFast,
    /// Spin with backoff for up to `rounds` checks, then give up.
    Spin { rounds: u32 },
    /// Spin until another thread frees a frame.
    Forever,
}

/// Arena parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameArenaConfig {
    /// Number of 4 KiB frames.
    pub frames: usize,
    /// Physical address of the first frame. Must be page aligned and non-zero.
    pub phys_base: PhysicalAddress,
    /// Behavior when empty.
    pub wait: WaitPolicy,
    /// Pattern written over freed frames, if any.
    pub poison: Option<u8>,
}

impl FrameArenaConfig {
    #[must_use]
    pub const fn new(frames: usize) -> Self {
        Self {
            frames,
            phys_base: DEFAULT_PHYS_BASE,
            wait: WaitPolicy::FailFast,
            poison: if cfg!(debug_assertions) {
                Some(POISON)
            } else {
                None
            },
        }
    }

    #[must_use]
    pub const fn with_phys_base(mut self, phys_base: PhysicalAddress) -> Self {
        self.phys_base = phys_base;
        self
    }

    #[must_use]
    pub const fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub const fn with_poison(mut self, poison: Option<u8>) -> Self {
        self.poison = poison;
        self
    }
}

/// Rejected arena configurations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameArenaError {
    #[error("a frame arena needs at least one frame")]
    Empty,
    #[error("physical base {0} is not 4 KiB aligned")]
    UnalignedBase(PhysicalAddress),
    #[error("physical base must not be zero")]
    NullBase,
    #[error("{frames} frames do not fit below the 4 GiB frame-number limit")]
    TooLarge { frames: usize },
}

/// Snapshot of arena counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    pub allocated: u64,
    pub freed: u64,
    /// Frames currently handed out.
    pub outstanding: u64,
    /// Frames on the free stack.
    pub free: usize,
}

#[repr(C, align(4096))]
pub(crate) struct Frame(pub(crate) UnsafeCell<[u8; FRAME_SIZE]>);

impl Frame {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; FRAME_SIZE]))
    }
}

/// A fixed pool of 4 KiB frames.
pub struct FrameArena {
    pub(crate) frames: Box<[Frame]>,
    owned: Box<[AtomicBool]>,
    free: SpinLock<Vec<u32>>,
    allocated: AtomicU64,
    freed: AtomicU64,
    config: FrameArenaConfig,
}

// SAFETY: frame contents are only reached through pointers handed out by the
// mapper; each frame has a single owner at a time, tracked by `owned`.
unsafe impl Sync for FrameArena {}

impl FrameArena {
    /// Allocate the backing storage for `config`.
    ///
    /// # Errors
    /// See [`FrameArenaError`].
    pub fn new(config: FrameArenaConfig) -> Result<Self, FrameArenaError> {
        if config.frames == 0 {
            return Err(FrameArenaError::Empty);
        }
        if config.phys_base.as_u64() == 0 {
            return Err(FrameArenaError::NullBase);
        }
        if config.phys_base.offset::<Size4K>() != 0 {
            return Err(FrameArenaError::UnalignedBase(config.phys_base));
        }
        let frames_u32 = u32::try_from(config.frames).map_err(|_| FrameArenaError::TooLarge {
            frames: config.frames,
        })?;
        let last_frame = config.phys_base.page::<Size4K>().frame_number() + u64::from(frames_u32);
        if last_frame > u64::from(u32::MAX) {
            return Err(FrameArenaError::TooLarge {
                frames: config.frames,
            });
        }

        let frames = (0..config.frames).map(|_| Frame::new()).collect();
        let owned = (0..config.frames).map(|_| AtomicBool::new(false)).collect();
        let free = (0..frames_u32).rev().collect();
        debug!(
            "frame arena: {} frames at {}, wait policy {:?}",
            config.frames, config.phys_base, config.wait
        );

        Ok(Self {
            frames,
            owned,
            free: SpinLock::new(free),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            config,
        })
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &FrameArenaConfig {
        &self.config
    }

    /// Total number of frames.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.with_lock(|free| free.len())
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let freed = self.freed.load(Ordering::Relaxed);
        FrameStats {
            allocated,
            freed,
            outstanding: allocated.saturating_sub(freed),
            free: self.available(),
        }
    }

    /// Whether `pa` lies inside the arena.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.locate(pa).is_some()
    }

    /// Whether the frame containing `pa` is currently handed out.
    #[must_use]
    pub fn is_allocated(&self, pa: PhysicalAddress) -> bool {
        self.locate(pa)
            .is_some_and(|(index, _)| self.owned[index].load(Ordering::Acquire))
    }

    /// Frame index and byte offset of `pa`.
    pub(crate) fn locate(&self, pa: PhysicalAddress) -> Option<(usize, usize)> {
        let offset = pa.as_u64().checked_sub(self.config.phys_base.as_u64())?;
        let index = usize::try_from(offset >> Size4K::SHIFT).ok()?;
        (index < self.frames.len()).then_some((index, (offset % Size4K::SIZE) as usize))
    }

    fn page_of(&self, index: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.config.phys_base + u64::from(index) * Size4K::SIZE)
    }
}

impl FrameAlloc for FrameArena {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let index = self.free.with_lock(Vec::pop)?;
        let was_owned = self.owned[index as usize].swap(true, Ordering::AcqRel);
        debug_assert!(!was_owned, "frame {index} on the free stack while owned");
        self.allocated.fetch_add(1, Ordering::Relaxed);

        let page = self.page_of(index);
        trace!("alloc {page:?}");
        Some(page)
    }

    fn free_4k(&self, page: PhysicalPage<Size4K>) {
        let Some((index, 0)) = self.locate(page.base()) else {
            panic!("{page:?} does not belong to this arena");
        };
        assert!(
            self.owned[index].swap(false, Ordering::AcqRel),
            "{page:?} freed twice"
        );

        if let Some(pattern) = self.config.poison {
            // SAFETY: the caller gave up the frame; nobody else holds it.
            unsafe { self.frames[index].0.get().write_bytes(pattern, 1) };
        }

        #[allow(clippy::cast_possible_truncation)]
        self.free.with_lock(|free| free.push(index as u32));
        self.freed.fetch_add(1, Ordering::Relaxed);
        trace!("free {page:?}");
    }

    fn wait_for_frames(&self) -> bool {
        let mut backoff = Backoff::new();
        match self.config.wait {
            WaitPolicy::FailFast => false,
            WaitPolicy::Spin { rounds } => {
                for _ in 0..rounds {
                    if self.available() > 0 {
                        return true;
                    }
                    backoff.spin();
                }
                self.available() > 0
            }
            WaitPolicy::Forever => {
                while self.available() == 0 {
                    backoff.spin();
                }
                true
            }
        }
    }
}

impl core::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameArena")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_configs() {
        assert_eq!(
            FrameArena::new(FrameArenaConfig::new(0)).err(),
            Some(FrameArenaError::Empty)
        );
        assert_eq!(
            FrameArena::new(FrameArenaConfig::new(1).with_phys_base(PhysicalAddress::zero())).err(),
            Some(FrameArenaError::NullBase)
        );
        let odd = PhysicalAddress::new(0x1234);
        assert_eq!(
            FrameArena::new(FrameArenaConfig::new(1).with_phys_base(odd)).err(),
            Some(FrameArenaError::UnalignedBase(odd))
        );
    }

    #[test]
    fn hands_out_ascending_addresses_first() {
        let arena = FrameArena::new(FrameArenaConfig::new(3)).unwrap();
        let a = arena.alloc_4k().unwrap();
        let b = arena.alloc_4k().unwrap();
        assert_eq!(a.base(), DEFAULT_PHYS_BASE);
        assert_eq!(b.base().as_u64(), DEFAULT_PHYS_BASE.as_u64() + 4096);
        assert!(arena.is_allocated(a.base()));
        assert_eq!(
            arena.stats(),
            FrameStats {
                allocated: 2,
                freed: 0,
                outstanding: 2,
                free: 1
            }
        );
    }

    #[test]
    fn freed_frames_are_reused_lifo() {
        let arena = FrameArena::new(FrameArenaConfig::new(4)).unwrap();
        let a = arena.alloc_4k().unwrap();
        let b = arena.alloc_4k().unwrap();
        arena.free_4k(a);
        arena.free_4k(b);
        assert_eq!(arena.alloc_4k(), Some(b));
        assert_eq!(arena.alloc_4k(), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = FrameArena::new(FrameArenaConfig::new(1)).unwrap();
        assert!(arena.alloc_4k().is_some());
        assert!(arena.alloc_4k().is_none());
        assert!(!arena.wait_for_frames());
    }

    #[test]
    fn bounded_spin_gives_up() {
        let arena = FrameArena::new(
            FrameArenaConfig::new(1).with_wait(WaitPolicy::Spin { rounds: 8 }),
        )
        .unwrap();
        let page = arena.alloc_4k().unwrap();
        assert!(!arena.wait_for_frames());
        arena.free_4k(page);
        assert!(arena.wait_for_frames());
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let arena = FrameArena::new(FrameArenaConfig::new(1)).unwrap();
        let page = arena.alloc_4k().unwrap();
        arena.free_4k(page);
        arena.free_4k(page);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn foreign_frames_are_rejected() {
        let arena = FrameArena::new(FrameArenaConfig::new(1)).unwrap();
        arena.free_4k(PhysicalPage::from_frame_number(1));
    }
}

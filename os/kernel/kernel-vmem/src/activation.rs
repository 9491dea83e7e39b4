//! # Activation
//!
//! Each CPU owns a [`CpuRoot`] slot naming the tree it currently translates
//! with. The machine-dependent context-switch code reads it; [`AddressSpace::activate`]
//! is the only writer besides [`CpuRoot::deactivate`].
//!
//! The kernel space is published as [`KERNEL_ROOT_SENTINEL`] rather than a
//! table address: kernel addresses are resolved through the kernel's own
//! tree, so the per-CPU slot only has to say "no user tree".

use crate::address_space::{AddressSpace, SpaceKind};
use crate::geometry::Geometry;
use crate::{FrameAlloc, PhysMapper};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PhysicalAddress;
use log::trace;

/// Raw value published for the kernel address space.
pub const KERNEL_ROOT_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_F000;

const UNSET: u64 = 0;

/// Logical CPU number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct CpuId(pub u32);

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Decoded content of a [`CpuRoot`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActiveRoot {
    /// Nothing activated yet.
    Unset,
    /// The kernel address space.
    Kernel,
    /// A user tree rooted at this physical address.
    Table(PhysicalAddress),
}

impl ActiveRoot {
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        match self {
            Self::Unset => UNSET,
            Self::Kernel => KERNEL_ROOT_SENTINEL,
            Self::Table(pa) => pa.as_u64(),
        }
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        match raw {
            UNSET => Self::Unset,
            KERNEL_ROOT_SENTINEL => Self::Kernel,
            pa => Self::Table(PhysicalAddress::new(pa)),
        }
    }
}

/// Per-CPU active-root slot.
#[repr(C, align(64))]
pub struct CpuRoot {
    cpu: CpuId,
    active: AtomicU64,
}

impl CpuRoot {
    #[must_use]
    pub const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            active: AtomicU64::new(UNSET),
        }
    }

    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// The currently published root.
    #[inline]
    #[must_use]
    pub fn active(&self) -> ActiveRoot {
        ActiveRoot::from_raw(self.active.load(Ordering::Acquire))
    }

    /// Clear the slot. Only the owning CPU may do this.
    ///
    /// Returns `false` (and changes nothing) when called from another CPU.
    pub fn deactivate(&self, running_on: CpuId) -> bool {
        if running_on != self.cpu {
            return false;
        }
        self.active.store(UNSET, Ordering::Release);
        true
    }

    fn publish(&self, root: ActiveRoot) {
        self.active.store(root.into_raw(), Ordering::Release);
    }
}

impl fmt::Debug for CpuRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuRoot")
            .field("cpu", &self.cpu)
            .field("active", &self.active())
            .finish()
    }
}

impl<G, A, M> AddressSpace<'_, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    /// Publish this space as `cpu`'s active tree.
    ///
    /// Only the CPU that owns the slot may activate; a call from any other
    /// CPU returns `false` and leaves the slot untouched.
    pub fn activate(&self, cpu: &CpuRoot, running_on: CpuId) -> bool {
        if cpu.cpu() != running_on {
            return false;
        }
        let root = match self.kind() {
            SpaceKind::Kernel => ActiveRoot::Kernel,
            SpaceKind::User => ActiveRoot::Table(self.root_base()),
        };
        debug_assert_ne!(root, ActiveRoot::Unset, "root node at physical address zero");
        cpu.publish(root);
        trace!("{running_on:?}: activated {root:?}");
        true
    }

    /// Whether this space is what `cpu` currently publishes.
    #[must_use]
    pub fn is_active_on(&self, cpu: &CpuRoot) -> bool {
        match cpu.active() {
            ActiveRoot::Kernel => self.kind() == SpaceKind::Kernel,
            ActiveRoot::Table(pa) => self.kind() == SpaceKind::User && pa == self.root_base(),
            ActiveRoot::Unset => false,
        }
    }
}

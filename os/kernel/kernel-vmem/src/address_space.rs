//! # Address Space (segment-table rooted)
//!
//! One translation tree: a root node from the [`NodePool`], interior nodes
//! installed on demand, and leaf [`PageTable`]s taken straight from the frame
//! allocator.
//!
//! ## Highlights
//!
//! - [`AddressSpace::lookup`] walks without allocating.
//! - [`AddressSpace::reserve`] walks and fills in missing levels; concurrent
//!   reservations of the same segment resolve through a single
//!   compare-and-swap per slot.
//! - [`AddressSpace::process`] visits every populated segment of a range.
//! - Dropping (or [`destroy`](AddressSpace::destroy)ing) the space returns
//!   every node and leaf it owns.
//!
//! ## Design
//!
//! - A slot only ever goes from empty to linked while the space is shared.
//!   Links are cleared during teardown, which requires ownership.
//! - Any [`Pte`] reference handed out borrows the space, so it cannot outlive
//!   the leaf it points into.
//! - The tree never touches entry contents except to zero fresh leaves and
//!   to check for leftovers at teardown.
//!
//! ## Safety
//!
//! - Changing entries of an active space requires the caller's TLB maintenance.
//! - The provided [`PhysMapper`] must map every frame the allocator hands out.

mod process;
mod teardown;

pub use crate::address_space::teardown::TeardownReport;
use crate::config::PmapConfig;
use crate::geometry::Geometry;
use crate::node::{Node, TableSlot};
use crate::node_pool::{NodeId, NodePool};
use crate::page_table::{PageTable, Pte};
use crate::{Exhaustion, FrameAlloc, PhysMapper, alloc_frame};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{debug, trace};

/// Errors from [`AddressSpace::try_reserve`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ReserveError {
    #[error("out of memory for page tables")]
    OutOfMemory,
    #[error("virtual address {0} is outside the translated range")]
    AddressOutOfRange(VirtualAddress),
    /// The allocator handed out a frame a table slot cannot link to.
    #[error("leaf frame {0} is beyond the range of a table slot")]
    FrameOutOfRange(PhysicalAddress),
}

impl From<crate::node_pool::PoolError> for ReserveError {
    fn from(_: crate::node_pool::PoolError) -> Self {
        Self::OutOfMemory
    }
}

/// Whether a space is the kernel's shared space or a per-process one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// The collaborators an address space allocates from.
pub struct Tables<'t, G: Geometry, A: FrameAlloc + ?Sized, M: PhysMapper + ?Sized> {
    pool: &'t NodePool<G>,
    alloc: &'t A,
    mapper: &'t M,
    config: PmapConfig,
}

impl<G: Geometry, A: FrameAlloc + ?Sized, M: PhysMapper + ?Sized> Clone for Tables<'_, G, A, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<G: Geometry, A: FrameAlloc + ?Sized, M: PhysMapper + ?Sized> Copy for Tables<'_, G, A, M> {}

impl<'t, G: Geometry, A: FrameAlloc + ?Sized, M: PhysMapper + ?Sized> Tables<'t, G, A, M> {
    #[must_use]
    pub const fn new(pool: &'t NodePool<G>, alloc: &'t A, mapper: &'t M) -> Self {
        Self {
            pool,
            alloc,
            mapper,
            config: PmapConfig::new(),
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: PmapConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    #[must_use]
    pub const fn pool(&self) -> &'t NodePool<G> {
        self.pool
    }

    #[inline]
    #[must_use]
    pub const fn alloc(&self) -> &'t A {
        self.alloc
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'t M {
        self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PmapConfig {
        &self.config
    }
}

/// Counters of one address space.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SpaceStats {
    /// Leaves installed.
    pub leaves: u64,
    /// Interior nodes installed (the root is not counted).
    pub nodes: u64,
    /// Installs abandoned because another CPU filled the slot first.
    pub races_lost: u64,
}

#[derive(Default)]
struct Counters {
    leaves: AtomicU64,
    nodes: AtomicU64,
    races_lost: AtomicU64,
}

/// Handle to a single translation tree.
pub struct AddressSpace<'t, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    tables: Tables<'t, G, A, M>,
    root: NodeId,
    kind: SpaceKind,
    counters: Counters,
}

/// Outcome of a non-allocating walk.
pub(crate) enum Walk<'a> {
    /// The leaf covering the address.
    Leaf(&'a PageTable),
    /// The slot at `level` is empty.
    Hole { level: usize },
    /// The address lies beyond the tree.
    OutOfRange,
}

impl<'t, G, A, M> AddressSpace<'t, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    /// Create an empty user address space.
    ///
    /// ### Panics
    /// If no root node can be obtained (see [`NodePool::acquire`]).
    pub fn new(tables: Tables<'t, G, A, M>) -> Self {
        Self::create(tables, SpaceKind::User)
    }

    /// Create the kernel address space.
    ///
    /// ### Panics
    /// As for [`new`](Self::new).
    pub fn kernel(tables: Tables<'t, G, A, M>) -> Self {
        Self::create(tables, SpaceKind::Kernel)
    }

    fn create(tables: Tables<'t, G, A, M>, kind: SpaceKind) -> Self {
        let root = tables.pool.acquire(tables.alloc);
        tables.pool.node(tables.mapper, root).clear();
        debug!(
            "created {kind:?} address space ({}), root {root:?} at {}",
            G::NAME,
            tables.pool.base(root)
        );
        Self {
            tables,
            root,
            kind,
            counters: Counters::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Physical address of the root node.
    #[inline]
    #[must_use]
    pub fn root_base(&self) -> PhysicalAddress {
        self.tables.pool.base(self.root)
    }

    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        SpaceStats {
            leaves: self.counters.leaves.load(Ordering::Relaxed),
            nodes: self.counters.nodes.load(Ordering::Relaxed),
            races_lost: self.counters.races_lost.load(Ordering::Relaxed),
        }
    }

    /// Entry translating `va`, if its leaf exists.
    ///
    /// Never allocates. Addresses beyond the tree yield `None`.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<&Pte> {
        match self.walk(va) {
            Walk::Leaf(leaf) => Some(leaf.entry_for(va)),
            Walk::Hole { .. } | Walk::OutOfRange => None,
        }
    }

    /// Entry translating `va`, creating missing levels on the way.
    ///
    /// Waits for the frame allocator when it is exhausted.
    ///
    /// ### Panics
    /// If `va` is beyond the tree, if a leaf frame cannot be linked, or if
    /// table memory cannot be obtained even by waiting.
    pub fn reserve(&self, va: VirtualAddress) -> &Pte {
        match self.reserve_with(va, Exhaustion::Wait) {
            Ok(pte) => pte,
            Err(e) => panic!("cannot reserve a translation entry: {e}"),
        }
    }

    /// Entry translating `va`, creating missing levels without waiting.
    ///
    /// # Errors
    /// [`ReserveError::OutOfMemory`] if a level could not be allocated; levels
    /// installed before the failure stay in place.
    /// [`ReserveError::AddressOutOfRange`] if `va` is beyond the tree.
    /// [`ReserveError::FrameOutOfRange`] if the allocator returned a frame
    /// a slot cannot link to; the frame is given back.
    pub fn try_reserve(&self, va: VirtualAddress) -> Result<&Pte, ReserveError> {
        self.reserve_with(va, Exhaustion::Fail)
    }

    fn reserve_with(&self, va: VirtualAddress, mode: Exhaustion) -> Result<&Pte, ReserveError> {
        if !G::contains(va) {
            return Err(ReserveError::AddressOutOfRange(va));
        }

        let mut node = self.node(self.root);
        let mut level = 0;
        loop {
            let index = G::slot_index(va, level);
            let last = level + 1 == G::LEVELS;
            let link = match node.load(index).target() {
                Some(link) => link,
                None if last => self.install_leaf(node, index, mode)?,
                None => self.install_node(node, index, mode)?,
            };
            if last {
                return Ok(self.leaf(link).entry_for(va));
            }
            node = self.node(NodeId::from_raw(link));
            level += 1;
        }
    }

    /// Walk to the leaf covering `va` without allocating.
    pub(crate) fn walk(&self, va: VirtualAddress) -> Walk<'_> {
        if !G::contains(va) {
            return Walk::OutOfRange;
        }

        let mut node = self.node(self.root);
        let mut level = 0;
        loop {
            let Some(link) = node.load(G::slot_index(va, level)).target() else {
                return Walk::Hole { level };
            };
            if level + 1 == G::LEVELS {
                return Walk::Leaf(self.leaf(link));
            }
            node = self.node(NodeId::from_raw(link));
            level += 1;
        }
    }

    /// Fill an empty last-level slot with a fresh leaf; returns the winning link.
    fn install_leaf(
        &self,
        parent: Node<'_>,
        index: usize,
        mode: Exhaustion,
    ) -> Result<u32, ReserveError> {
        let page = alloc_frame(self.tables.alloc, mode).ok_or(ReserveError::OutOfMemory)?;
        let Some(frame) = leaf_link(page) else {
            self.tables.alloc.free_4k(page);
            return Err(ReserveError::FrameOutOfRange(page.base()));
        };
        self.leaf(frame).zero();

        match parent.install(index, TableSlot::linking(frame)) {
            Ok(()) => {
                self.counters.leaves.fetch_add(1, Ordering::Relaxed);
                trace!("installed leaf {page:?} in slot {index}");
                Ok(frame)
            }
            Err(winner) => {
                self.tables.alloc.free_4k(page);
                self.counters.races_lost.fetch_add(1, Ordering::Relaxed);
                debug!("lost leaf race for slot {index}, returned {page:?}");
                debug_assert!(winner.present());
                Ok(winner.link())
            }
        }
    }

    /// Fill an empty interior slot with a fresh node; returns the winning link.
    fn install_node(
        &self,
        parent: Node<'_>,
        index: usize,
        mode: Exhaustion,
    ) -> Result<u32, ReserveError> {
        let pool = self.tables.pool;
        let id = match mode {
            Exhaustion::Wait => pool.acquire(self.tables.alloc),
            Exhaustion::Fail => pool.try_acquire(self.tables.alloc)?,
        };
        self.node(id).clear();

        match parent.install(index, TableSlot::linking(id.as_u32())) {
            Ok(()) => {
                self.counters.nodes.fetch_add(1, Ordering::Relaxed);
                trace!("installed {id:?} in slot {index}");
                Ok(id.as_u32())
            }
            Err(winner) => {
                pool.release(id);
                self.counters.races_lost.fetch_add(1, Ordering::Relaxed);
                debug!("lost node race for slot {index}, released {id:?}");
                debug_assert!(winner.present());
                Ok(winner.link())
            }
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> Node<'t> {
        self.tables.pool.node(self.tables.mapper, id)
    }

    #[inline]
    fn leaf(&self, link: u32) -> &PageTable {
        let page = PhysicalPage::<Size4K>::from_frame_number(u64::from(link));
        // SAFETY: `link` was installed from a frame this space allocated; the
        // frame stays alive until teardown, which needs `&mut self`.
        unsafe { self.tables.mapper.phys_to_ref::<PageTable>(page.base()) }
    }
}

/// Slot link for a leaf frame.
fn leaf_link(page: PhysicalPage<Size4K>) -> Option<u32> {
    u32::try_from(page.frame_number())
        .ok()
        .filter(|&frame| frame <= TableSlot::MAX_LINK)
}

impl<G, A, M> fmt::Debug for AddressSpace<'_, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("geometry", &G::NAME)
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

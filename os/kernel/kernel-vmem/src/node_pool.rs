//! # Node Pool
//!
//! Segment-table nodes are smaller than a frame (2 KiB for [`Tiered39`]),
//! so they are carved out of 4 KiB frames and recycled through a lock-free
//! LIFO free list shared by all address spaces.
//!
//! ## Layout
//!
//! The pool keeps an arena of [`NodeRecord`]s indexed by [`NodeId`]. A record
//! stores the physical base of its chunk and its [`NodeState`]; the free-list
//! link lives in the record, not in the chunk, so a node's memory only ever
//! holds slots.
//!
//! ```text
//!  head ─► [tag | top]         records[top].state = Free { next }
//!                                  │
//!                                  ▼
//!                             records[next] … ─► Free { next: None }
//! ```
//!
//! The head packs a 32-bit generation tag next to the top id. Every
//! successful push or pop bumps the tag, so a pop that read a stale
//! `(top, next)` pair fails its compare-and-swap even if `top` was popped
//! and pushed back in the meantime.
//!
//! ## Growth
//!
//! When the list is empty, the caller takes a fresh frame, claims
//! `NODES_PER_PAGE` consecutive record ids, keeps the first chunk and pushes
//! the rest. Carved frames are never returned to the frame allocator. Once
//! every id is carved, blocking callers spin until some node is released.
//!
//! ## Progress
//!
//! Push and pop are lock-free, not wait-free: a thread can in principle lose
//! every compare-and-swap to other threads. Contended retries back off
//! exponentially.
//!
//! [`Tiered39`]: crate::Tiered39

use crate::config::PmapConfig;
use crate::geometry::{Geometry, KernelGeometry};
use crate::node::{Node, TableSlot};
use crate::{Exhaustion, FrameAlloc, PhysMapper, out_of_table_memory};
use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::{Backoff, SyncOnceCell};
use log::{debug, trace};

/// Handle of one node chunk in a [`NodePool`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node#{}", self.0)
    }
}

/// Lifecycle of a node chunk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// On the free list, linking to the next free node.
    Free { next: Option<NodeId> },
    /// Handed out to an address space (or not yet carved).
    InUse,
}

const STATE_IN_USE: u32 = u32::MAX;

impl NodeState {
    const fn encode(self) -> u32 {
        match self {
            Self::Free { next: None } => 0,
            Self::Free { next: Some(id) } => id.0 + 1,
            Self::InUse => STATE_IN_USE,
        }
    }

    const fn decode(raw: u32) -> Self {
        match raw {
            STATE_IN_USE => Self::InUse,
            0 => Self::Free { next: None },
            n => Self::Free {
                next: Some(NodeId(n - 1)),
            },
        }
    }
}

/// Bookkeeping for one node chunk.
struct NodeRecord {
    base: AtomicU64,
    state: AtomicU32,
}

impl NodeRecord {
    const fn new() -> Self {
        Self {
            base: AtomicU64::new(0),
            state: AtomicU32::new(STATE_IN_USE),
        }
    }

    fn state(&self) -> NodeState {
        NodeState::decode(self.state.load(Ordering::Relaxed))
    }
}

#[inline]
const fn pack(tag: u32, top: Option<NodeId>) -> u64 {
    let top = match top {
        Some(id) => id.0 + 1,
        None => 0,
    };
    ((tag as u64) << 32) | top as u64
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(head: u64) -> (u32, Option<NodeId>) {
    let tag = (head >> 32) as u32;
    let top = match head as u32 {
        0 => None,
        n => Some(NodeId(n - 1)),
    };
    (tag, top)
}

/// Errors from the non-blocking pool paths.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("no frame available to carve page-table nodes from")]
    OutOfMemory,
    #[error("node arena exhausted ({capacity} nodes)")]
    ArenaExhausted { capacity: usize },
}

/// Snapshot of pool counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    /// Successful acquisitions.
    pub acquired: u64,
    /// Releases back onto the free list.
    pub released: u64,
    /// Frames taken from the frame allocator.
    pub pages_carved: u64,
    /// Node ids handed out of the arena so far.
    pub carved_nodes: u64,
    /// Nodes currently on the free list.
    pub free_nodes: u64,
}

impl PoolStats {
    /// Nodes currently held by address spaces.
    #[must_use]
    pub const fn in_use(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// Lock-free pool of segment-table nodes for geometry `G`.
pub struct NodePool<G: Geometry = KernelGeometry> {
    head: AtomicU64,
    records: Box<[NodeRecord]>,
    carved: AtomicU32,
    acquired: AtomicU64,
    released: AtomicU64,
    pages_carved: AtomicU64,
    _geometry: PhantomData<fn() -> G>,
}

impl<G: Geometry> NodePool<G> {
    /// Create an empty pool able to track up to `capacity` nodes.
    ///
    /// ### Panics
    /// If `capacity` exceeds the range a table slot can link to.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let () = G::CHECK;
        assert!(
            capacity <= TableSlot::MAX_LINK as usize,
            "node capacity {capacity} exceeds the slot link range"
        );
        let records = (0..capacity).map(|_| NodeRecord::new()).collect();
        debug!(
            "node pool for {}: {capacity} nodes of {} bytes, {} per frame",
            G::NAME,
            G::NODE_BYTES,
            G::NODES_PER_PAGE
        );
        Self {
            head: AtomicU64::new(pack(0, None)),
            records,
            carved: AtomicU32::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            pages_carved: AtomicU64::new(0),
            _geometry: PhantomData,
        }
    }

    /// Create a pool sized by `config`.
    #[must_use]
    pub fn with_config(config: &PmapConfig) -> Self {
        Self::new(config.node_capacity)
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Take a node, growing the pool from `alloc` if the free list is empty.
    ///
    /// Waits for frames if the allocator is exhausted, and for a release if
    /// every id of the arena is carved and in use.
    ///
    /// ### Panics
    /// If the allocator cannot make progress.
    pub fn acquire<A: FrameAlloc + ?Sized>(&self, alloc: &A) -> NodeId {
        self.acquire_with(alloc, Exhaustion::Wait)
            .unwrap_or_else(|_| out_of_table_memory())
    }

    /// Take a node without waiting.
    ///
    /// # Errors
    /// [`PoolError::OutOfMemory`] if no frame is available right now,
    /// [`PoolError::ArenaExhausted`] if the arena has no ids left.
    pub fn try_acquire<A: FrameAlloc + ?Sized>(&self, alloc: &A) -> Result<NodeId, PoolError> {
        self.acquire_with(alloc, Exhaustion::Fail)
    }

    fn acquire_with<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        mode: Exhaustion,
    ) -> Result<NodeId, PoolError> {
        let mut backoff = Backoff::new();
        let mut waiting_for_release = false;
        loop {
            if let Some(id) = self.pop() {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }

            let carved = if self.is_full() {
                Err(PoolError::ArenaExhausted {
                    capacity: self.capacity(),
                })
            } else if let Some(page) = alloc.alloc_4k() {
                self.carve(alloc, page)
            } else {
                // Nodes released while waiting are picked up on the next pass.
                match mode {
                    Exhaustion::Fail => return Err(PoolError::OutOfMemory),
                    Exhaustion::Wait if alloc.wait_for_frames() => continue,
                    Exhaustion::Wait => out_of_table_memory(),
                }
            };

            match (carved, mode) {
                (Ok(id), _) => {
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(id);
                }
                (Err(e), Exhaustion::Fail) => return Err(e),
                // Only a release can help now.
                (Err(_), Exhaustion::Wait) => {
                    if !waiting_for_release {
                        waiting_for_release = true;
                        debug!(
                            "node arena full ({} nodes), waiting for a release",
                            self.capacity()
                        );
                    }
                    backoff.spin();
                }
            }
        }
    }

    /// Whether every id of the arena has been carved.
    fn is_full(&self) -> bool {
        self.carved.load(Ordering::Acquire) as usize + G::NODES_PER_PAGE > self.capacity()
    }

    /// Put a node back on the free list.
    ///
    /// The caller must not touch the node afterwards.
    ///
    /// ### Panics
    /// On a double release or an id this pool never handed out.
    pub fn release(&self, id: NodeId) {
        assert!(
            id.as_u32() < self.carved.load(Ordering::Acquire),
            "{id:?} was never carved from this pool"
        );
        let previous = self.records[id.index()]
            .state
            .swap(NodeState::Free { next: None }.encode(), Ordering::Relaxed);
        assert_eq!(
            NodeState::decode(previous),
            NodeState::InUse,
            "{id:?} released twice"
        );
        self.push(id);
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Physical base of the node chunk.
    #[inline]
    #[must_use]
    pub fn base(&self, id: NodeId) -> PhysicalAddress {
        PhysicalAddress::new(self.records[id.index()].base.load(Ordering::Relaxed))
    }

    /// Whether `id` is currently on the free list.
    #[must_use]
    pub fn is_free(&self, id: NodeId) -> bool {
        id.as_u32() < self.carved.load(Ordering::Acquire)
            && matches!(self.records[id.index()].state(), NodeState::Free { .. })
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let acquired = self.acquired.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        let carved_nodes = u64::from(self.carved.load(Ordering::Relaxed));
        PoolStats {
            acquired,
            released,
            pages_carved: self.pages_carved.load(Ordering::Relaxed),
            carved_nodes,
            free_nodes: (carved_nodes + released).saturating_sub(acquired),
        }
    }

    /// View the slots of `id`.
    pub(crate) fn node<'a, M: PhysMapper + ?Sized>(&'a self, mapper: &M, id: NodeId) -> Node<'a> {
        // SAFETY: `base` names a chunk inside a frame the pool owns for its
        // whole lifetime; chunks are NODE_BYTES long and 4-byte aligned.
        let slots = unsafe { mapper.phys_to_slice::<AtomicU32>(self.base(id), G::NODE_SLOTS) };
        Node::new(slots)
    }

    /// Split a fresh frame into nodes; keep the first, free the rest.
    fn carve<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        page: PhysicalPage<Size4K>,
    ) -> Result<NodeId, PoolError> {
        #[allow(clippy::cast_possible_truncation)]
        let per_page = G::NODES_PER_PAGE as u32;
        let capacity = self.capacity();

        let Ok(first) = self
            .carved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |carved| {
                carved
                    .checked_add(per_page)
                    .filter(|&end| end as usize <= capacity)
            })
        else {
            alloc.free_4k(page);
            return Err(PoolError::ArenaExhausted { capacity });
        };

        for k in 0..per_page {
            let base = page.base().as_u64() + u64::from(k) * G::NODE_BYTES as u64;
            self.records[(first + k) as usize]
                .base
                .store(base, Ordering::Relaxed);
        }
        self.pages_carved.fetch_add(1, Ordering::Relaxed);
        trace!(
            "carved {page:?} into {per_page} nodes starting at {:?}",
            NodeId(first)
        );

        for k in 1..per_page {
            self.push(NodeId(first + k));
        }
        Ok(NodeId(first))
    }

    fn push(&self, id: NodeId) {
        let record = &self.records[id.index()];
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let (tag, top) = unpack(head);
            record
                .state
                .store(NodeState::Free { next: top }.encode(), Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(tag.wrapping_add(1), Some(id)),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    fn pop(&self) -> Option<NodeId> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (tag, top) = unpack(head);
            let id = top?;
            // A stale head may point at a node that was popped meanwhile;
            // the tag makes the exchange below fail in that case.
            let NodeState::Free { next } = self.records[id.index()].state() else {
                backoff.spin();
                continue;
            };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(tag.wrapping_add(1), next),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.records[id.index()]
                    .state
                    .store(STATE_IN_USE, Ordering::Relaxed);
                return Some(id);
            }
            backoff.spin();
        }
    }
}

impl<G: Geometry> fmt::Debug for NodePool<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("geometry", &G::NAME)
            .field("capacity", &self.capacity())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

static NODE_POOL: SyncOnceCell<NodePool<KernelGeometry>> = SyncOnceCell::new();

/// Initialize the global node pool. Later calls return the existing pool.
pub fn init_node_pool(config: &PmapConfig) -> &'static NodePool<KernelGeometry> {
    NODE_POOL.get_or_init(|| NodePool::with_config(config))
}

/// The global node pool, if initialized.
#[must_use]
pub fn node_pool() -> Option<&'static NodePool<KernelGeometry>> {
    NODE_POOL.get()
}

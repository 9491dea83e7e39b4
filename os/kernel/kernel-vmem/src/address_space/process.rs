//! Range processing over populated segments.

use crate::address_space::{AddressSpace, Walk};
use crate::geometry::{Geometry, SEGMENT_SHIFT, pte_index};
use crate::page_table::Pte;
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::VirtualAddress;

impl<G, A, M> AddressSpace<'_, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    /// Call `f` once for every populated segment overlapping `[start, end)`.
    ///
    /// `f` receives the space, the sub-range `[sva, eva)` inside the segment,
    /// and the leaf entries translating exactly that sub-range. Segments
    /// are visited in ascending order. Whole subtrees behind an empty
    /// interior slot are skipped in one step.
    ///
    /// The range is clamped to the translated range; an empty range calls
    /// nothing.
    pub fn process<F>(&self, start: VirtualAddress, end: VirtualAddress, mut f: F)
    where
        F: FnMut(&Self, VirtualAddress, VirtualAddress, &[Pte]),
    {
        let end = end.as_u64().min(G::VA_LIMIT);
        let mut sva = start.as_u64();

        while sva < end {
            let va = VirtualAddress::new(sva);
            let (shift, leaf) = match self.walk(va) {
                Walk::Leaf(leaf) => (SEGMENT_SHIFT, Some(leaf)),
                Walk::Hole { level } => (G::level_shift(level), None),
                Walk::OutOfRange => break,
            };

            let span_end = ((sva >> shift) + 1) << shift;
            let eva = span_end.min(end);
            if let Some(leaf) = leaf {
                let first = pte_index(va);
                let last = pte_index(VirtualAddress::new(eva - 1));
                f(
                    self,
                    va,
                    VirtualAddress::new(eva),
                    &leaf.entries()[first..=last],
                );
            }
            sva = span_end;
        }
    }

    /// Number of valid entries in `[start, end)`.
    #[must_use]
    pub fn count_valid(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        let mut count = 0;
        self.process(start, end, |_, _, _, entries| {
            count += entries.iter().filter(|e| e.is_valid()).count();
        });
        count
    }
}

//! Returning a tree's storage.

use crate::address_space::AddressSpace;
use crate::config::LiveEntryCheck;
use crate::geometry::Geometry;
use crate::node_pool::NodeId;
use crate::{FrameAlloc, PhysMapper};
use core::mem::ManuallyDrop;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use log::{debug, warn};

/// What a teardown gave back.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TeardownReport {
    /// Leaf frames returned to the frame allocator.
    pub leaves_freed: u64,
    /// Nodes returned to the pool, root included.
    pub nodes_released: u64,
    /// Valid entries found in freed leaves (zero under [`LiveEntryCheck::Trust`]).
    pub live_entries: u64,
}

impl<G, A, M> AddressSpace<'_, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    /// Tear the space down and report what was returned.
    ///
    /// Equivalent to dropping the space, except for the report and for
    /// [`LiveEntryCheck::Deny`], which only `destroy` enforces. A dropped
    /// space logs leftover entries as under [`LiveEntryCheck::Warn`].
    ///
    /// ### Panics
    /// Under [`LiveEntryCheck::Deny`], if any leaf still holds a valid entry.
    pub fn destroy(self) -> TeardownReport {
        let mut this = ManuallyDrop::new(self);
        let check = this.tables.config.live_entry_check;
        this.teardown(check)
    }

    fn teardown(&mut self, check: LiveEntryCheck) -> TeardownReport {
        let mut report = TeardownReport::default();
        self.release_subtree(self.root, 0, check, &mut report);
        self.tables.pool.release(self.root);
        report.nodes_released += 1;
        debug!(
            "tore down {:?} address space: {} leaves, {} nodes",
            self.kind, report.leaves_freed, report.nodes_released
        );
        report
    }

    /// Release everything below `id`, leaving `id` itself to the caller.
    fn release_subtree(
        &self,
        id: NodeId,
        level: usize,
        check: LiveEntryCheck,
        report: &mut TeardownReport,
    ) {
        let node = self.node(id);
        let last = level + 1 == G::LEVELS;
        for index in 0..node.len() {
            let Some(link) = node.take(index).target() else {
                continue;
            };
            if last {
                self.free_leaf(link, check, report);
            } else {
                let child = NodeId::from_raw(link);
                self.release_subtree(child, level + 1, check, report);
                self.tables.pool.release(child);
                report.nodes_released += 1;
            }
        }
    }

    fn free_leaf(&self, link: u32, check: LiveEntryCheck, report: &mut TeardownReport) {
        if check != LiveEntryCheck::Trust {
            let live = self.leaf(link).live_entries();
            if live > 0 {
                report.live_entries += live as u64;
                let page = PhysicalPage::<Size4K>::from_frame_number(u64::from(link));
                match check {
                    LiveEntryCheck::Deny => {
                        panic!("leaf {page:?} still holds {live} valid entries at teardown")
                    }
                    LiveEntryCheck::Warn => {
                        warn!("leaf {page:?} still holds {live} valid entries at teardown");
                    }
                    LiveEntryCheck::Trust => {}
                }
            }
        }
        self.tables
            .alloc
            .free_4k(PhysicalPage::from_frame_number(u64::from(link)));
        report.leaves_freed += 1;
    }
}

impl<G, A, M> Drop for AddressSpace<'_, G, A, M>
where
    G: Geometry,
    A: FrameAlloc + ?Sized,
    M: PhysMapper + ?Sized,
{
    fn drop(&mut self) {
        // Panicking here would abort a thread that is already unwinding.
        let check = match self.tables.config.live_entry_check {
            LiveEntryCheck::Deny => LiveEntryCheck::Warn,
            check => check,
        };
        self.teardown(check);
    }
}

#[cfg(test)]
mod tests {
    use crate::address_space::{AddressSpace, Tables};
    use crate::config::{LiveEntryCheck, PmapConfig};
    use crate::geometry::Tiered39;
    use crate::node_pool::NodePool;
    use crate::page_table::PteBits;
    use crate::test_support::TestRam;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn report_counts_every_level() {
        let ram = TestRam::new(16);
        let pool = NodePool::<Tiered39>::new(16);
        let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
        for top in 0..3u64 {
            space.reserve(VirtualAddress::new(top << 31));
            space.reserve(VirtualAddress::new((top << 31) | (1 << 22)));
        }
        let report = space.destroy();
        assert_eq!(report.leaves_freed, 6);
        assert_eq!(report.nodes_released, 4);
        assert_eq!(report.live_entries, 0);
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[test]
    fn warn_policy_frees_live_leaves() {
        let ram = TestRam::new(8);
        let pool = NodePool::<Tiered39>::new(8);
        let config = PmapConfig::new().with_live_entry_check(LiveEntryCheck::Warn);
        let space = AddressSpace::new(Tables::new(&pool, &ram, &ram).with_config(config));
        let bits = PteBits::new().with_valid(true).with_frame(3);
        space.reserve(VirtualAddress::new(0x5000)).store(bits);
        space.reserve(VirtualAddress::new(0x6000)).store(bits);

        let report = space.destroy();
        assert_eq!(report.live_entries, 2);
        assert_eq!(report.leaves_freed, 1);
    }

    #[test]
    #[should_panic(expected = "valid entries at teardown")]
    fn deny_policy_is_fatal() {
        let ram = TestRam::new(8);
        let pool = NodePool::<Tiered39>::new(8);
        let config = PmapConfig::new().with_live_entry_check(LiveEntryCheck::Deny);
        let space = AddressSpace::new(Tables::new(&pool, &ram, &ram).with_config(config));
        space
            .reserve(VirtualAddress::new(0x5000))
            .store(PteBits::new().with_valid(true));
        let _ = space.destroy();
    }
}

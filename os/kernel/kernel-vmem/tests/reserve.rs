use kernel_alloc::{FrameArena, FrameArenaConfig, WaitPolicy};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    AddressSpace, Flat32, FrameAlloc, NodePool, PteBits, ReserveError, SpaceStats, Tables,
    Tiered39,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn arena(frames: usize) -> FrameArena {
    FrameArena::new(FrameArenaConfig::new(frames)).unwrap()
}

#[test]
fn reserve_is_idempotent() {
    let ram = arena(16);
    let pool = NodePool::<Tiered39>::new(16);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let va = VirtualAddress::new(0x0040_1000);

    let first: *const _ = space.reserve(va);
    let stats = space.stats();
    let outstanding = ram.stats().outstanding;

    let second: *const _ = space.reserve(va);
    assert_eq!(first, second);
    assert_eq!(space.stats(), stats);
    assert_eq!(ram.stats().outstanding, outstanding);
    assert_eq!(space.lookup(va).map(|p| p as *const _), Some(first));
}

#[test]
fn segment_example_on_a_flat_tree() {
    let ram = arena(8);
    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let a = VirtualAddress::new(0x0040_1000);
    let b = VirtualAddress::new(0x0080_0000);

    assert!(space.lookup(a).is_none());

    let pte_a: *const _ = space.reserve(a);
    assert_eq!(space.stats().leaves, 1);
    assert_eq!(space.lookup(a).map(|p| p as *const _), Some(pte_a));
    assert!(space.lookup(b).is_none(), "segment 2 is still empty");

    space.reserve(b);
    assert_eq!(space.stats().leaves, 2);

    let mut visited = Vec::new();
    space.process(
        VirtualAddress::zero(),
        VirtualAddress::new(0x00C0_0000),
        |_, sva, eva, entries| {
            visited.push((sva.as_u64(), eva.as_u64(), entries.len()));
        },
    );
    assert_eq!(
        visited,
        [(0x0040_0000, 0x0080_0000, 1024), (0x0080_0000, 0x00C0_0000, 1024)]
    );

    // Entry 1 of the segment-1 leaf.
    let mut second_entry = None;
    space.process(a, a + 1, |_, _, _, entries| {
        second_entry = Some(&entries[0] as *const _);
    });
    assert_eq!(second_entry, Some(pte_a));
}

#[test]
fn fresh_leaves_are_zeroed_even_over_poisoned_frames() {
    let ram = FrameArena::new(FrameArenaConfig::new(4).with_poison(Some(0xFF))).unwrap();
    let held: Vec<_> = (0..4).map(|_| ram.alloc_4k().unwrap()).collect();
    for page in held {
        ram.free_4k(page);
    }

    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    space.reserve(VirtualAddress::new(0x0100_0000));

    let mut entries_seen = 0;
    space.process(
        VirtualAddress::zero(),
        VirtualAddress::new(u64::MAX),
        |_, _, _, entries| {
            entries_seen += entries.len();
            assert!(entries.iter().all(|e| e.load().is_zero()));
        },
    );
    assert_eq!(entries_seen, 1024);
    assert!(space.lookup(VirtualAddress::new(0x0040_0000)).is_none());
}

#[test]
fn try_reserve_reports_out_of_memory_and_keeps_installed_levels() {
    // One frame: carved into the root and one spare node, nothing left for a leaf.
    let ram = arena(1);
    let pool = NodePool::<Tiered39>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let va = VirtualAddress::new(0x0040_0000);

    assert_eq!(space.try_reserve(va).err(), Some(ReserveError::OutOfMemory));
    assert_eq!(
        space.stats(),
        SpaceStats {
            leaves: 0,
            nodes: 1,
            races_lost: 0
        }
    );
    assert!(space.lookup(va).is_none());

    let report = space.destroy();
    assert_eq!(report.nodes_released, 2);
    assert_eq!(report.leaves_freed, 0);
    assert_eq!(pool.stats().in_use(), 0);
}

#[test]
fn try_reserve_rejects_addresses_beyond_the_tree() {
    let ram = arena(2);
    let pool = NodePool::<Tiered39>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let va = VirtualAddress::new(1 << 39);
    assert_eq!(
        space.try_reserve(va).err(),
        Some(ReserveError::AddressOutOfRange(va))
    );
    assert_eq!(space.stats(), SpaceStats::default());
}

#[test]
#[should_panic(expected = "out of memory for page tables")]
fn blocking_reserve_is_fatal_when_waiting_cannot_help() {
    let ram = arena(1);
    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    space.reserve(VirtualAddress::new(0x0040_0000));
}

#[test]
#[should_panic(expected = "outside the translated range")]
fn blocking_reserve_rejects_addresses_beyond_the_tree() {
    let ram = arena(2);
    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    space.reserve(VirtualAddress::new(1 << 32));
}

#[test]
fn blocking_reserve_waits_for_a_free_frame() {
    let ram = FrameArena::new(FrameArenaConfig::new(2).with_wait(WaitPolicy::Forever)).unwrap();
    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let hostage = ram.alloc_4k().unwrap();
    let done = AtomicBool::new(false);
    let va = VirtualAddress::new(0x0040_0000);

    thread::scope(|s| {
        s.spawn(|| {
            space.reserve(va);
            done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst), "reserve must wait for memory");
        ram.free_4k(hostage);
    });

    assert!(done.load(Ordering::SeqCst));
    assert!(space.lookup(va).is_some());
    assert_eq!(space.stats().leaves, 1);
}

#[test]
fn entries_are_left_to_the_caller() {
    let ram = arena(4);
    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let va = VirtualAddress::new(0x0040_2000);
    let target = ram.alloc_4k().unwrap();

    space.reserve(va).store(PteBits::mapping(target));
    assert_eq!(space.lookup(va).unwrap().load().page(), target);
    assert_eq!(space.count_valid(VirtualAddress::zero(), VirtualAddress::new(1 << 32)), 1);

    space.lookup(va).unwrap().clear();
    ram.free_4k(target);
}

#[test]
fn new_space_waits_for_a_root_when_the_node_arena_is_full() {
    let ram = FrameArena::new(FrameArenaConfig::new(8).with_wait(WaitPolicy::Forever)).unwrap();
    let pool = NodePool::<Flat32>::new(1);
    let first = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    first.reserve(VirtualAddress::new(0x0040_0000));
    let created = AtomicBool::new(false);

    thread::scope(|s| {
        let second = s.spawn(|| {
            let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
            created.store(true, Ordering::SeqCst);
            space.reserve(VirtualAddress::new(0x0080_0000)).load().is_zero()
        });

        thread::sleep(Duration::from_millis(20));
        assert!(
            !created.load(Ordering::SeqCst),
            "the only node is still the first root"
        );
        drop(first);
        assert!(second.join().unwrap());
    });

    assert_eq!(pool.stats().pages_carved, 1);
    assert_eq!(pool.stats().in_use(), 0);
    assert_eq!(ram.stats().outstanding, 1);
}

#[test]
fn leaf_frames_beyond_the_slot_range_are_given_back() {
    let high = PhysicalAddress::new(1 << 43);
    let ram = FrameArena::new(FrameArenaConfig::new(4).with_phys_base(high)).unwrap();
    let pool = NodePool::<Flat32>::new(4);
    let space = AddressSpace::new(Tables::new(&pool, &ram, &ram));
    let va = VirtualAddress::new(0x0040_0000);
    let outstanding = ram.stats().outstanding;

    let Err(ReserveError::FrameOutOfRange(frame)) = space.try_reserve(va) else {
        panic!("a frame above the link range must be rejected");
    };
    assert!(frame >= high);
    assert_eq!(ram.stats().outstanding, outstanding);
    assert_eq!(space.stats(), SpaceStats::default());
    assert!(space.lookup(va).is_none());
}

use kernel_alloc::{FrameArena, FrameArenaConfig};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, PmapConfig, Tables, Tiered39, init_node_pool, node_pool};

#[test]
fn global_pool_is_initialized_once() {
    assert!(node_pool().is_none());

    let pool = init_node_pool(&PmapConfig::new().with_node_capacity(32));
    assert_eq!(pool.capacity(), 32);

    // Later configurations are ignored.
    let again = init_node_pool(&PmapConfig::new().with_node_capacity(8));
    assert!(std::ptr::eq(pool, again));
    assert!(std::ptr::eq(node_pool().unwrap(), pool));

    let ram = FrameArena::new(FrameArenaConfig::new(8)).unwrap();
    let space = AddressSpace::<Tiered39, _, _>::new(Tables::new(pool, &ram, &ram));
    space.reserve(VirtualAddress::new(0x0040_0000));
    drop(space);
    assert_eq!(pool.stats().in_use(), 0);
}

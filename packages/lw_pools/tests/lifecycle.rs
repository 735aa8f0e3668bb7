//! End-to-end tests of the acquire, release and cleanup lifecycle through the public API.

use std::num::NonZero;

use lw_pools::{
    ControlPanel, Error, MAX_POOLED_LENGTH, POOL_OVERHEAD_BYTES, PoolRegistry, SizeClass,
};

#[test]
fn two_blocks_of_one_class() {
    let panel = ControlPanel::new(PoolRegistry::new());
    let class = SizeClass::for_length(10).unwrap();

    let h1 = panel.acquire(10);
    let h2 = panel.acquire(10);

    panel.release(h1, 10);
    assert_eq!(
        panel.total_pool_mem_used(),
        class.block_size() + POOL_OVERHEAD_BYTES
    );

    panel.release(h2, 10);
    assert_eq!(panel.total_pool_mem_used(), POOL_OVERHEAD_BYTES);

    // At least one slab stays allocated until cleanup.
    assert!(panel.total_pool_mem_allocated() > POOL_OVERHEAD_BYTES);
    assert!(panel.mem_unused_but_allocated_in_pools() > 0);

    panel.release_all_held_memory();
    assert_eq!(panel.total_pool_mem_allocated(), 0);
    assert_eq!(panel.total_pool_mem_used(), 0);
}

#[test]
fn lazy_rebuild_after_cleanup() {
    let registry = PoolRegistry::new();

    for round in 0..3_u8 {
        let mut blocks: Vec<_> = (1..=200).map(|len| (registry.acquire(len), len)).collect();

        for (block, _) in &mut blocks {
            block.fill(round);
        }

        for (block, len) in blocks {
            assert!(block.iter().all(|b| *b == round));
            registry.release(block, len);
        }

        registry.cleanup();

        assert_eq!(registry.total_allocated(), 0);
        assert_eq!(registry.total_used(), 0);
        assert_eq!(registry.installed_pool_count(), 0);
        assert_eq!(registry.epoch(), u64::from(round) + 1);
    }
}

#[test]
fn every_pooled_length_fits_its_block() {
    let registry = PoolRegistry::new();
    let mut previous = 0;

    for length in 1..=MAX_POOLED_LENGTH {
        let class = SizeClass::for_length(length).unwrap();
        assert!(class.block_size() >= length);
        assert!(class.block_size() >= previous);
        previous = class.block_size();

        let block = registry.acquire(length);
        assert_eq!(block.size_class(), Some(class));
        assert_eq!(block.as_ptr() as usize % lw_pools::BLOCK_ALIGN, 0);
        registry.release(block, length);
    }
}

#[test]
fn zero_length_requests_are_served() {
    let registry = PoolRegistry::new();

    let block = registry.acquire(0);
    assert!(block.is_empty());
    assert!(block.is_pooled());

    registry.release(block, 0);
    assert_eq!(registry.outstanding_blocks(), 0);
}

#[test]
fn oversized_requests_are_consistent() {
    let registry = PoolRegistry::new();
    let before = registry.stats();

    for length in [MAX_POOLED_LENGTH + 1, MAX_POOLED_LENGTH * 2, 1024 * 1024] {
        assert!(matches!(
            registry.try_acquire_pooled(length),
            Err(Error::Oversized { .. })
        ));

        let mut block = registry.acquire(length);
        assert!(!block.is_pooled());
        assert_eq!(block.size_class(), None);
        assert!(block.iter().all(|b| *b == 0));
        block.fill(0xFF);

        registry.release(block, length);
    }

    assert_eq!(registry.stats(), before);
}

#[test]
fn native_backend_serves_everything_directly() {
    let panel = ControlPanel::new(PoolRegistry::new());
    panel.set_native_backend_enabled(true);

    let blocks: Vec<_> = [1, 100, 4096, 10_000]
        .into_iter()
        .map(|len| (panel.acquire(len), len))
        .collect();

    assert!(blocks.iter().all(|(block, _)| !block.is_pooled()));
    assert_eq!(panel.stats().installed_pools, 0);
    assert_eq!(panel.total_pool_mem_allocated(), 0);
    assert!(panel.pool_waste_fraction().abs() < f64::EPSILON);

    for (block, len) in blocks {
        panel.release(block, len);
    }

    assert_eq!(panel.registry().direct_bytes_outstanding(), 0);
}

#[test]
fn blocks_outstanding_at_cleanup_are_orphaned() {
    let registry = PoolRegistry::new();

    let survivors: Vec<_> = (0..10).map(|_| registry.acquire(64)).collect();
    registry.cleanup();

    let fresh = registry.acquire(64);

    for block in survivors {
        registry.release(block, 64);
    }

    assert_eq!(registry.orphaned_releases(), 10);
    assert_eq!(registry.outstanding_blocks(), 1);

    registry.release(fresh, 64);
    assert_eq!(registry.outstanding_blocks(), 0);
    assert_eq!(registry.orphaned_releases(), 10);
}

#[test]
fn custom_configuration() {
    let registry = PoolRegistry::builder()
        .chunk_bytes(NonZero::new(MAX_POOLED_LENGTH * 2).unwrap())
        .slab_bytes_target(NonZero::new(256).unwrap())
        .min_blocks_per_slab(NonZero::new(1).unwrap())
        .build()
        .unwrap();

    let blocks: Vec<_> = (0..64).map(|_| registry.acquire(MAX_POOLED_LENGTH)).collect();
    assert!(registry.total_allocated() >= 64 * MAX_POOLED_LENGTH);

    for block in blocks {
        registry.release(block, MAX_POOLED_LENGTH);
    }
}

#[test]
fn invalid_configuration_is_rejected() {
    let result = PoolRegistry::builder()
        .chunk_bytes(NonZero::new(16).unwrap())
        .build();

    assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
}

#[test]
fn conversion_finished_follows_policy() {
    let panel = ControlPanel::new(PoolRegistry::new());

    let block = panel.acquire(32);
    panel.release(block, 32);

    panel.set_cleanup_on_conversion(false);
    assert!(!panel.conversion_finished());
    assert_eq!(panel.stats().epoch, 0);

    panel.set_cleanup_on_conversion(true);
    assert!(panel.conversion_finished());
    assert_eq!(panel.stats().epoch, 1);
    assert_eq!(panel.total_pool_mem_allocated(), 0);
}

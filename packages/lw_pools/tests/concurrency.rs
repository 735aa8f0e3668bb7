//! Multithreaded stress tests for the pool registry.
//!
//! Ignored under Miri because the workloads are far too large for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use lw_pools::{MAX_POOLED_LENGTH, POOL_OVERHEAD_BYTES, PoolRegistry, SizeClass};
use testing::{race, random_lengths, with_watchdog};

const THREADS: usize = 8;
const CYCLES_PER_THREAD: usize = 5_000;

/// Bytes in blocks handed out, excluding the fixed overhead of the installed pools.
fn bytes_dished_out(registry: &PoolRegistry) -> usize {
    let stats = registry.stats();

    stats.total_used - stats.installed_pools * POOL_OVERHEAD_BYTES
}

#[cfg_attr(miri, ignore)]
#[test]
fn random_churn_balances_out() {
    with_watchdog(|| {
        let registry = Arc::new(PoolRegistry::new());

        race(THREADS, |thread_index| {
            let lengths = random_lengths(thread_index as u64, CYCLES_PER_THREAD, MAX_POOLED_LENGTH);

            // Keep a handful of blocks alive at any time, so pools have to grow.
            let mut held = Vec::new();

            for (cycle, length) in lengths.into_iter().enumerate() {
                let mut block = registry.acquire(length);
                assert_eq!(block.len(), length);

                let marker = (thread_index as u8).wrapping_add(cycle as u8);
                block.fill(marker);
                held.push((block, length, marker));

                if held.len() > 16 {
                    let (block, length, marker) = held.swap_remove(cycle % held.len());
                    assert!(block.iter().all(|b| *b == marker));
                    registry.release(block, length);
                }
            }

            for (block, length, marker) in held {
                assert!(block.iter().all(|b| *b == marker));
                registry.release(block, length);
            }
        });

        assert_eq!(bytes_dished_out(&registry), 0);
        assert_eq!(registry.outstanding_blocks(), 0);
        assert!(registry.total_allocated() >= registry.total_used());

        registry.cleanup();
        assert_eq!(registry.total_used(), 0);
        assert_eq!(registry.total_allocated(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn allocated_never_decreases_without_cleanup() {
    with_watchdog(|| {
        let registry = Arc::new(PoolRegistry::new());
        let done = Arc::new(AtomicBool::new(false));

        let observer = thread::spawn({
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);

            move || {
                let mut previous = 0;

                while !done.load(Ordering::Acquire) {
                    let stats = registry.stats();

                    assert!(stats.total_allocated >= previous);
                    assert!(stats.waste_fraction() < 1.0);
                    previous = stats.total_allocated;

                    thread::yield_now();
                }
            }
        });

        race(THREADS, |thread_index| {
            let lengths = random_lengths(1000 + thread_index as u64, CYCLES_PER_THREAD, 512);

            for length in lengths {
                let block = registry.acquire(length);
                registry.release(block, length);
            }
        });

        done.store(true, Ordering::Release);
        observer.join().unwrap();

        assert_eq!(bytes_dished_out(&registry), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn racing_threads_share_one_pool_per_class() {
    with_watchdog(|| {
        let registry = PoolRegistry::new();

        // Every thread requests every size class, all starting at the same moment.
        let blocks = race(THREADS, |_| {
            SizeClass::all()
                .map(|class| (registry.acquire(class.block_size()), class.block_size()))
                .collect::<Vec<_>>()
        });

        assert_eq!(registry.installed_pool_count(), lw_pools::SIZE_CLASS_COUNT);
        assert_eq!(
            registry.outstanding_blocks(),
            THREADS * lw_pools::SIZE_CLASS_COUNT
        );

        for (block, length) in blocks.into_iter().flatten() {
            registry.release(block, length);
        }

        assert_eq!(registry.outstanding_blocks(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn oversized_churn_leaves_pools_alone() {
    with_watchdog(|| {
        let registry = PoolRegistry::new();

        race(THREADS, |thread_index| {
            let lengths = random_lengths(
                2000 + thread_index as u64,
                200,
                MAX_POOLED_LENGTH * 4,
            );

            for length in lengths {
                let block = registry.acquire(length);
                assert_eq!(block.is_pooled(), length <= MAX_POOLED_LENGTH);
                registry.release(block, length);
            }
        });

        assert_eq!(registry.direct_bytes_outstanding(), 0);
        assert_eq!(registry.outstanding_blocks(), 0);
        assert_eq!(bytes_dished_out(&registry), 0);
    });
}

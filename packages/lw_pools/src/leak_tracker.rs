//! Debug instrumentation that tracks every outstanding block. Only compiled with the
//! `leak_check` feature.
//!
//! Through the public API an invalid release cannot reach a pool: `release` consumes the
//! `Block` and the registry verifies the pool identity first. The invalid release counter
//! guards the pool internals against regressions in that bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use foldhash::{HashSet, HashSetExt};
use parking_lot::Mutex;
use tracing::warn;

use crate::SizeClass;

/// Registry-wide totals of the problems found by the [`LeakTracker`]s of all its pools.
#[derive(Debug, Default)]
pub(crate) struct LeakLedger {
    leaked_blocks: AtomicUsize,
    invalid_releases: AtomicUsize,
}

impl LeakLedger {
    pub(crate) fn leaked_blocks(&self) -> usize {
        self.leaked_blocks.load(Ordering::Relaxed)
    }

    pub(crate) fn invalid_releases(&self) -> usize {
        self.invalid_releases.load(Ordering::Relaxed)
    }
}

/// Tracks the blocks of one pool that are currently handed out.
#[derive(Debug)]
pub(crate) struct LeakTracker {
    size_class: SizeClass,

    // We use foldhash for better performance with small hash tables.
    outstanding: Mutex<HashSet<usize>>,

    ledger: Arc<LeakLedger>,
}

impl LeakTracker {
    pub(crate) fn new(size_class: SizeClass, ledger: Arc<LeakLedger>) -> Self {
        Self {
            size_class,
            outstanding: Mutex::new(HashSet::new()),
            ledger,
        }
    }

    pub(crate) fn on_acquire(&self, index: usize) {
        let inserted = self.outstanding.lock().insert(index);

        // The pool handed out a block that was still outstanding. This is a bug in the pool
        // itself, not in the caller, so there is nothing sensible to continue with.
        assert!(
            inserted,
            "block {index} of size class {} was handed out twice",
            self.size_class
        );
    }

    /// Records the release of a block.
    ///
    /// Returns `false` if the block was not outstanding, in which case it must not be
    /// returned to the free list.
    pub(crate) fn on_release(&self, index: usize) -> bool {
        if self.outstanding.lock().remove(&index) {
            return true;
        }

        self.ledger.invalid_releases.fetch_add(1, Ordering::Relaxed);
        warn!(
            index,
            size_class = %self.size_class,
            "released a block that was not outstanding; ignoring the release"
        );

        false
    }

    /// Reports the blocks that were never released, adding them to the ledger.
    pub(crate) fn report_leaks(&self) -> usize {
        let leaked = self.outstanding.lock().len();

        if leaked > 0 {
            self.ledger.leaked_blocks.fetch_add(leaked, Ordering::Relaxed);
            warn!(
                leaked,
                size_class = %self.size_class,
                "pool destroyed while blocks were still outstanding"
            );
        }

        leaked
    }
}

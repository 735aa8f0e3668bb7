use std::iter;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::{ArcSwapOption, Guard};
use nm::Event;
use tracing::{debug, trace, warn};

use crate::metrics::{
    CLEANUPS, DIRECT_ALLOC_BYTES, LOST_INSTALL_RACES, ORPHANED_RELEASES, POOL_INSTALLS,
};
#[cfg(feature = "leak_check")]
use crate::LeakLedger;
use crate::{
    Arena, Backing, Block, DirectAllocation, Pool, PoolConfig, PoolOwner, PoolRegistryBuilder,
    PoolStats, PooledOrigin, Result, SIZE_CLASS_COUNT, SizeClass,
};

/// Bookkeeping overhead of one installed pool, counted in both
/// [`PoolRegistry::total_allocated()`] and [`PoolRegistry::total_used()`].
pub const POOL_OVERHEAD_BYTES: usize = size_of::<Pool>();

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// A fixed set of lazily constructed pools, one per [`SizeClass`], backed by one shared arena.
///
/// This is the allocation engine behind the [`ControlPanel`][crate::ControlPanel]. Most code
/// uses the process-wide instance via [`ControlPanel::global()`][crate::ControlPanel::global];
/// independent registries are useful for tests and for isolating unrelated workloads.
///
/// # Acquire and release
///
/// [`acquire()`](Self::acquire) maps the requested length to a size class and hands out a block
/// from the pool of that class, creating the pool on first use. Requests longer than
/// [`MAX_POOLED_LENGTH`][crate::MAX_POOLED_LENGTH] are served by a direct allocation instead,
/// accounted separately from the pool statistics.
///
/// [`release()`](Self::release) must be called exactly once per block, with the same length
/// that was requested. The length (not the block) determines which pool the block is returned
/// to, and a length that maps to a different size class is treated as a protocol violation.
///
/// # Cleanup
///
/// [`cleanup()`](Self::cleanup) destroys every pool and releases all arena memory. Afterwards
/// the registry transparently rebuilds pools on demand. Cleanup must not run concurrently with
/// acquire or release calls on the same registry. Doing so is memory-safe but leaves the
/// statistics inaccurate.
///
/// # Thread safety
///
/// The registry is thread-safe. Pools are installed with a single compare-and-swap per slot,
/// so concurrent first requests for a size class end up sharing one pool.
///
/// # Example
///
/// ```
/// use lw_pools::PoolRegistry;
///
/// let registry = PoolRegistry::new();
///
/// let block = registry.acquire(40);
/// assert_eq!(block.len(), 40);
/// assert!(registry.total_used() > 0);
///
/// registry.release(block, 40);
///
/// registry.cleanup();
/// assert_eq!(registry.total_allocated(), 0);
/// assert_eq!(registry.total_used(), 0);
/// ```
#[derive(Debug)]
pub struct PoolRegistry {
    /// Process-unique identity, used to detect blocks released into the wrong registry.
    id: u64,

    config: PoolConfig,

    /// One slot per size class, indexed by [`SizeClass::index()`].
    slots: Box<[ArcSwapOption<Pool>]>,

    arena: Arena,

    /// Incremented by every cleanup. Pools and their blocks remember the epoch they were
    /// created in, which identifies blocks whose pool no longer exists.
    epoch: AtomicU64,

    direct_blocks: AtomicUsize,
    direct_bytes: AtomicUsize,
    orphaned_releases: AtomicUsize,

    #[cfg(feature = "leak_check")]
    leak_ledger: Arc<LeakLedger>,
}

impl PoolRegistry {
    /// Creates a registry with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder()
            .build()
            .expect("the default configuration is always valid")
    }

    /// Returns a builder for creating a registry with custom tuning.
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::new()
    }

    pub(crate) fn new_inner(config: PoolConfig) -> Self {
        let slots = iter::repeat_with(ArcSwapOption::empty)
            .take(SIZE_CLASS_COUNT)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            arena: Arena::new(config.chunk_bytes),
            config,
            slots,
            epoch: AtomicU64::new(0),
            direct_blocks: AtomicUsize::new(0),
            direct_bytes: AtomicUsize::new(0),
            orphaned_releases: AtomicUsize::new(0),
            #[cfg(feature = "leak_check")]
            leak_ledger: Arc::new(LeakLedger::default()),
        }
    }

    /// Hands out a block of `length` bytes.
    ///
    /// Requests up to [`MAX_POOLED_LENGTH`][crate::MAX_POOLED_LENGTH] bytes are served from the
    /// pool of the matching size class. Longer requests are served by a direct allocation.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds `isize::MAX`, which no allocation can satisfy. The registry
    /// state is unchanged by such a request.
    pub fn acquire(&self, length: usize) -> Block {
        match SizeClass::for_length(length) {
            Ok(class) => self.acquire_pooled(class, length),
            Err(_) => self.acquire_direct(length),
        }
    }

    /// Hands out a block of `length` bytes from a pool, refusing requests that no pool serves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oversized`][crate::Error::Oversized] if `length` exceeds
    /// [`MAX_POOLED_LENGTH`][crate::MAX_POOLED_LENGTH].
    pub fn try_acquire_pooled(&self, length: usize) -> Result<Block> {
        let class = SizeClass::for_length(length)?;
        Ok(self.acquire_pooled(class, length))
    }

    fn acquire_pooled(&self, class: SizeClass, length: usize) -> Block {
        let slot = self.slot(class);
        let current = slot.load();

        if let Some(pool) = &*current {
            return pool.acquire(length, &self.arena);
        }

        self.install_and_acquire(slot, &current, class, length)
    }

    #[cold]
    fn install_and_acquire(
        &self,
        slot: &ArcSwapOption<Pool>,
        current: &Guard<Option<Arc<Pool>>>,
        class: SizeClass,
        length: usize,
    ) -> Block {
        let candidate = Arc::new(Pool::new(
            class,
            self.config.blocks_per_slab(class),
            self.pool_owner(),
        ));

        // Only succeeds if the slot is still empty. If another thread got there first, we get
        // back its pool and our candidate is simply dropped. It never obtained any slabs.
        let previous = slot.compare_and_swap(current, Some(Arc::clone(&candidate)));

        match &*previous {
            None => {
                POOL_INSTALLS.with(Event::observe_once);
                debug!(size_class = %class, pool_id = candidate.id(), "installed pool");

                candidate.acquire(length, &self.arena)
            }
            Some(winner) => {
                LOST_INSTALL_RACES.with(Event::observe_once);
                debug!(
                    size_class = %class,
                    pool_id = winner.id(),
                    discarded_pool_id = candidate.id(),
                    "another thread installed the pool first"
                );

                winner.acquire(length, &self.arena)
            }
        }
    }

    pub(crate) fn acquire_direct(&self, length: usize) -> Block {
        assert!(
            isize::try_from(length).is_ok(),
            "requested length of {length} bytes exceeds the largest possible allocation"
        );

        // Allocate before counting, so a failed allocation leaves the statistics untouched.
        let block = Block::direct(length, self.id);

        self.direct_blocks.fetch_add(1, Ordering::Relaxed);
        self.direct_bytes.fetch_add(length, Ordering::Relaxed);

        DIRECT_ALLOC_BYTES.with(|e| e.observe(length));
        trace!(length, "serving request via direct allocation");

        block
    }

    /// Returns a block to the registry that handed it out.
    ///
    /// `length` must be the length passed to the acquire call that produced the block.
    ///
    /// If the registry was cleaned up after the block was acquired, the block is an orphan: its
    /// memory is freed and the release is counted in [`orphaned_releases()`](Self::orphaned_releases).
    ///
    /// # Panics
    ///
    /// Panics if the block was handed out by a different registry or if `length` maps to a
    /// different size class than the one the block was served from.
    pub fn release(&self, block: Block, length: usize) {
        debug_assert_eq!(
            block.len(),
            length,
            "blocks must be released with the length they were acquired with"
        );

        match block.into_backing() {
            Backing::Pooled(origin) => self.release_pooled(origin, length),
            Backing::Direct(allocation) => self.release_direct(&allocation),
        }
    }

    fn release_pooled(&self, origin: PooledOrigin, length: usize) {
        assert_eq!(
            origin.registry_id, self.id,
            "block was released into a registry that did not hand it out"
        );

        let class = match SizeClass::for_length(length) {
            Ok(class) => class,
            Err(e) => panic!(
                "block of size class {} released with a length that no pool serves: {e}",
                origin.size_class
            ),
        };

        assert_eq!(
            class, origin.size_class,
            "block released with length {length}, which maps to a different size class than the one it was acquired from"
        );

        if origin.epoch != self.epoch.load(Ordering::Acquire) {
            self.orphaned_releases.fetch_add(1, Ordering::Relaxed);
            ORPHANED_RELEASES.with(Event::observe_once);
            warn!(
                size_class = %class,
                block_epoch = origin.epoch,
                "released a block whose pool was destroyed by a cleanup; freeing it directly"
            );

            // Dropping the origin releases our claim on the chunk.
            return;
        }

        let current = self.slot(class).load();

        let Some(pool) = &*current else {
            panic!("no pool installed for size class {class} even though it has an outstanding block");
        };

        assert_eq!(
            pool.id(),
            origin.pool_id,
            "block was not handed out by the pool installed for its size class"
        );

        pool.release(origin.index);
    }

    fn release_direct(&self, allocation: &DirectAllocation) {
        assert_eq!(
            allocation.registry_id(),
            self.id,
            "block was released into a registry that did not hand it out"
        );

        self.direct_blocks.fetch_sub(1, Ordering::Relaxed);
        self.direct_bytes
            .fetch_sub(allocation.len(), Ordering::Relaxed);
    }

    /// Destroys every pool and releases all memory held by the arena.
    ///
    /// Subsequent acquire calls transparently rebuild the pools they need. Blocks still
    /// outstanding stay valid until released, at which point they are freed as orphans.
    ///
    /// Must not be called concurrently with acquire or release calls on this registry.
    #[cfg_attr(test, mutants::skip)] // Statistics tests would pass by accident on a fresh registry.
    pub fn cleanup(&self) {
        // New epoch first, so anything acquired from here on is distinguishable from the
        // blocks of the pools we are about to destroy.
        let epoch = self
            .epoch
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);

        let mut pools_destroyed = 0_usize;
        let mut blocks_abandoned = 0_usize;

        for slot in &self.slots {
            if let Some(pool) = slot.swap(None) {
                pools_destroyed = pools_destroyed.saturating_add(1);
                blocks_abandoned = blocks_abandoned.saturating_add(pool.blocks_handed_out());
            }
        }

        let bytes_released = self.arena.force_cleanup_all();

        CLEANUPS.with(Event::observe_once);
        debug!(
            epoch,
            pools_destroyed,
            blocks_abandoned,
            bytes_released,
            "pool registry cleaned up"
        );
    }

    /// Bytes owned by the arena plus the bookkeeping overhead of every installed pool.
    #[must_use]
    pub fn total_allocated(&self) -> usize {
        let overhead = self
            .installed_pool_count()
            .saturating_mul(POOL_OVERHEAD_BYTES);

        self.arena.bytes_owned().saturating_add(overhead)
    }

    /// Bytes in blocks currently handed out plus the bookkeeping overhead of every installed pool.
    ///
    /// Installing a pool on the first acquire for its size class adds [`POOL_OVERHEAD_BYTES`],
    /// which stays counted until [`cleanup()`](Self::cleanup), even after every block of the
    /// pool has been released.
    #[must_use]
    pub fn total_used(&self) -> usize {
        self.installed_pools()
            .map(|pool| pool.bytes_dished_out().saturating_add(POOL_OVERHEAD_BYTES))
            .fold(0, usize::saturating_add)
    }

    /// Number of size classes that currently have a pool.
    #[must_use]
    pub fn installed_pool_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.load().is_some()).count()
    }

    /// Number of blocks currently handed out, pooled and direct.
    #[must_use]
    pub fn outstanding_blocks(&self) -> usize {
        self.installed_pools()
            .map(|pool| pool.blocks_handed_out())
            .fold(self.direct_blocks.load(Ordering::Relaxed), usize::saturating_add)
    }

    /// Bytes in outstanding blocks served by the direct allocation path.
    #[must_use]
    pub fn direct_bytes_outstanding(&self) -> usize {
        self.direct_bytes.load(Ordering::Relaxed)
    }

    /// Number of releases of blocks whose pool had already been destroyed by a cleanup.
    #[must_use]
    pub fn orphaned_releases(&self) -> usize {
        self.orphaned_releases.load(Ordering::Relaxed)
    }

    /// Number of cleanups the registry has gone through.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Number of blocks that were still outstanding when their pool was destroyed.
    #[cfg(feature = "leak_check")]
    #[must_use]
    pub fn leaked_blocks(&self) -> usize {
        self.leak_ledger.leaked_blocks()
    }

    /// Number of releases of blocks that their pool did not consider outstanding.
    #[cfg(feature = "leak_check")]
    #[must_use]
    pub fn invalid_releases(&self) -> usize {
        self.leak_ledger.invalid_releases()
    }

    /// Takes a snapshot of all statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        // Used before allocated: anything counted as used was allocated before it was counted,
        // so this order never reports more used than allocated memory.
        let total_used = self.total_used();
        let total_allocated = self.total_allocated();

        PoolStats {
            total_allocated,
            total_used,
            installed_pools: self.installed_pool_count(),
            outstanding_blocks: self.outstanding_blocks(),
            direct_bytes_outstanding: self.direct_bytes_outstanding(),
            orphaned_releases: self.orphaned_releases(),
            epoch: self.epoch(),
        }
    }

    fn slot(&self, class: SizeClass) -> &ArcSwapOption<Pool> {
        self.slots
            .get(class.index())
            .expect("the registry has one slot for every size class")
    }

    fn installed_pools(&self) -> impl Iterator<Item = Arc<Pool>> + '_ {
        self.slots.iter().filter_map(ArcSwapOption::load_full)
    }

    fn pool_owner(&self) -> PoolOwner {
        PoolOwner {
            registry_id: self.id,
            epoch: self.epoch.load(Ordering::Acquire),
            #[cfg(feature = "leak_check")]
            leak_ledger: Arc::clone(&self.leak_ledger),
        }
    }

    #[cfg(test)]
    pub(crate) fn installed_pool(&self, class: SizeClass) -> Option<Arc<Pool>> {
        self.slot(class).load_full()
    }

    #[cfg(test)]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

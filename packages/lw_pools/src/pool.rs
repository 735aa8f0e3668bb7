use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

#[cfg(feature = "leak_check")]
use crate::{LeakLedger, LeakTracker};
use crate::{Arena, Block, Chunk, PooledOrigin, SizeClass, Slab};

/// Source of process-unique pool identities, so a block can always be matched to the exact
/// pool instance that handed it out.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the registry (and the registry epoch) a pool is installed in.
#[derive(Clone, Debug)]
pub(crate) struct PoolOwner {
    pub(crate) registry_id: u64,
    pub(crate) epoch: u64,

    #[cfg(feature = "leak_check")]
    pub(crate) leak_ledger: Arc<LeakLedger>,
}

/// Serves fixed-size blocks of one size class.
///
/// The pool owns the slabs it has obtained from the arena and keeps the indices of all blocks
/// that are not handed out in a free list. Block `n` lives in slab `n / blocks_per_slab` at
/// offset `(n % blocks_per_slab) * block_size`.
///
/// # Thread safety
///
/// All methods take `&self`. The free list is protected by a mutex that is held only for a
/// push or pop (plus, rarely, a slab request). The handed-out counter can be read without
/// taking the lock.
#[derive(Debug)]
pub(crate) struct Pool {
    id: u64,
    owner: PoolOwner,
    size_class: SizeClass,
    blocks_per_slab: NonZero<usize>,

    state: Mutex<PoolState>,

    /// Number of blocks currently not in the free list.
    blocks_handed_out: AtomicUsize,

    #[cfg(feature = "leak_check")]
    leak_tracker: LeakTracker,
}

#[derive(Debug, Default)]
struct PoolState {
    slabs: Vec<Slab>,

    /// Indices of the blocks available for reuse. We pop from the end, so the most recently
    /// released block (the one most likely to still be in cache) is handed out first.
    free_list: Vec<usize>,
}

impl Pool {
    pub(crate) fn new(
        size_class: SizeClass,
        blocks_per_slab: NonZero<usize>,
        owner: PoolOwner,
    ) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            #[cfg(feature = "leak_check")]
            leak_tracker: LeakTracker::new(size_class, Arc::clone(&owner.leak_ledger)),
            owner,
            size_class,
            blocks_per_slab,
            state: Mutex::new(PoolState::default()),
            blocks_handed_out: AtomicUsize::new(0),
        }
    }

    /// Hands out one block, growing the pool by a slab from `arena` if no block is free.
    ///
    /// The returned block exposes `length` bytes, which must not exceed the block size.
    pub(crate) fn acquire(&self, length: usize, arena: &Arena) -> Block {
        assert!(
            length <= self.size_class.block_size(),
            "requested {length} bytes from pool of size class {}",
            self.size_class
        );

        let (index, ptr, chunk) = {
            let mut state = self.state.lock();

            let index = match state.free_list.pop() {
                Some(index) => index,
                None => self.grow(&mut state, arena),
            };

            let (ptr, chunk) = self.locate(&state, index);
            (index, ptr, chunk)
        };

        // Release pairs with the Acquire in bytes_dished_out(), so a reader that sees this
        // block as handed out also sees the arena growth that made room for it.
        self.blocks_handed_out.fetch_add(1, Ordering::Release);

        #[cfg(feature = "leak_check")]
        self.leak_tracker.on_acquire(index);

        Block::pooled(
            ptr,
            length,
            PooledOrigin {
                registry_id: self.owner.registry_id,
                epoch: self.owner.epoch,
                pool_id: self.id,
                size_class: self.size_class,
                index,
                _chunk: chunk,
            },
        )
    }

    /// Returns the block with the given index to the free list.
    ///
    /// The caller has verified that the block was handed out by this pool.
    pub(crate) fn release(&self, index: usize) {
        #[cfg(feature = "leak_check")]
        if !self.leak_tracker.on_release(index) {
            return;
        }

        {
            let mut state = self.state.lock();

            debug_assert!(
                index < state.slabs.len().saturating_mul(self.blocks_per_slab.get()),
                "released block index {index} does not belong to this pool"
            );

            state.free_list.push(index);
        }

        self.blocks_handed_out.fetch_sub(1, Ordering::Release);
    }

    /// Obtains a new slab from the arena, adds all of its blocks except one to the free list
    /// and returns the index of the remaining block.
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    fn grow(&self, state: &mut PoolState, arena: &Arena) -> usize {
        let blocks_per_slab = self.blocks_per_slab.get();

        let slab_bytes = blocks_per_slab
            .checked_mul(self.size_class.block_size())
            .expect("slab size was validated when the registry was configured");

        let slab = arena.obtain_slab(slab_bytes);

        let first_index = state
            .slabs
            .len()
            .checked_mul(blocks_per_slab)
            .expect("block indices cannot exceed the address space");

        state.slabs.push(slab);

        // Cannot overflow because that would imply more blocks than the address space holds.
        let end_index = first_index.wrapping_add(blocks_per_slab);

        // In reverse, so the blocks of a fresh slab are handed out in address order.
        state
            .free_list
            .extend((first_index.wrapping_add(1)..end_index).rev());

        trace!(
            size_class = %self.size_class,
            slab_bytes,
            slab_count = state.slabs.len(),
            "pool obtained new slab"
        );

        first_index
    }

    #[expect(
        clippy::integer_division,
        reason = "block indices are deliberately split into slab index and position in slab"
    )]
    fn locate(&self, state: &PoolState, index: usize) -> (NonNull<u8>, Arc<Chunk>) {
        let blocks_per_slab = self.blocks_per_slab.get();

        let slab = state
            .slabs
            .get(index / blocks_per_slab)
            .expect("every block index on the free list belongs to one of our slabs");

        // Cannot overflow because the result is an offset within the slab.
        let offset = (index % blocks_per_slab).wrapping_mul(self.size_class.block_size());

        (slab.ptr_at(offset), Arc::clone(slab.chunk()))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn blocks_handed_out(&self) -> usize {
        self.blocks_handed_out.load(Ordering::Acquire)
    }

    /// Number of bytes in blocks that are currently handed out.
    pub(crate) fn bytes_dished_out(&self) -> usize {
        self.blocks_handed_out()
            .saturating_mul(self.size_class.block_size())
    }

    #[cfg_attr(not(test), expect(dead_code, reason = "only inspected by tests"))]
    pub(crate) fn slab_count(&self) -> usize {
        self.state.lock().slabs.len()
    }

    /// Number of bytes in all slabs of the pool, handed out or not.
    #[cfg_attr(not(test), expect(dead_code, reason = "only inspected by tests"))]
    pub(crate) fn slab_bytes(&self) -> usize {
        self.state
            .lock()
            .slabs
            .iter()
            .map(Slab::len)
            .fold(0, usize::saturating_add)
    }
}

#[cfg(feature = "leak_check")]
impl Drop for Pool {
    fn drop(&mut self) {
        self.leak_tracker.report_leaks();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Pool: Send, Sync);

    fn owner() -> PoolOwner {
        PoolOwner {
            registry_id: 1,
            epoch: 0,
            #[cfg(feature = "leak_check")]
            leak_ledger: Arc::new(LeakLedger::default()),
        }
    }

    fn pool(length: usize, blocks_per_slab: NonZero<usize>) -> Pool {
        Pool::new(
            SizeClass::for_length(length).unwrap(),
            blocks_per_slab,
            owner(),
        )
    }

    fn index_of(block: &Block) -> usize {
        block.origin().unwrap().index
    }

    fn give_back(pool: &Pool, block: Block) {
        let index = index_of(&block);
        drop(block);
        pool.release(index);
    }

    #[test]
    fn starts_without_slabs() {
        let pool = pool(16, nz!(4));

        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.blocks_handed_out(), 0);
        assert_eq!(pool.bytes_dished_out(), 0);
        assert_eq!(pool.slab_bytes(), 0);
    }

    #[test]
    fn first_acquire_obtains_one_slab() {
        let arena = Arena::new(nz!(4096));
        let pool = pool(16, nz!(4));

        let block = pool.acquire(10, &arena);

        assert_eq!(block.len(), 10);
        assert_eq!(index_of(&block), 0);
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.slab_bytes(), 64);
        assert_eq!(pool.bytes_dished_out(), 16);
        assert_eq!(arena.bytes_owned(), 4096);

        give_back(&pool, block);
    }

    #[test]
    fn grows_one_slab_at_a_time() {
        let arena = Arena::new(nz!(4096));
        let pool = pool(16, nz!(4));

        let blocks: Vec<_> = (0..5).map(|_| pool.acquire(16, &arena)).collect();

        let indices: Vec<_> = blocks.iter().map(index_of).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.slab_count(), 2);
        assert_eq!(pool.blocks_handed_out(), 5);
        assert_eq!(pool.bytes_dished_out(), 5 * 16);

        for block in blocks {
            give_back(&pool, block);
        }

        assert_eq!(pool.blocks_handed_out(), 0);
        assert_eq!(pool.slab_count(), 2);
    }

    #[test]
    fn most_recently_released_block_is_reused_first() {
        let arena = Arena::new(nz!(4096));
        let pool = pool(16, nz!(4));

        let first = pool.acquire(16, &arena);
        let second = pool.acquire(16, &arena);
        let first_ptr = first.as_ptr();

        give_back(&pool, first);
        let again = pool.acquire(16, &arena);

        assert_eq!(again.as_ptr(), first_ptr);

        give_back(&pool, again);
        give_back(&pool, second);
    }

    #[test]
    fn blocks_are_adjacent_and_independent() {
        let arena = Arena::new(nz!(4096));
        let pool = pool(24, nz!(8));

        let mut first = pool.acquire(24, &arena);
        let mut second = pool.acquire(24, &arena);

        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 24);

        first.fill(1);
        second.fill(2);

        assert!(first.iter().all(|b| *b == 1));
        assert!(second.iter().all(|b| *b == 2));

        give_back(&pool, first);
        give_back(&pool, second);
    }

    #[test]
    #[should_panic]
    fn acquire_longer_than_block_panics() {
        let arena = Arena::new(nz!(4096));
        let pool = pool(16, nz!(4));

        drop(pool.acquire(17, &arena));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_acquire_release_balances() {
        let arena = Arena::new(nz!(65_536));
        let pool = pool(64, nz!(16));

        thread::scope(|s| {
            for thread_index in 0..4_u8 {
                let pool = &pool;
                let arena = &arena;

                s.spawn(move || {
                    for _ in 0..500 {
                        let mut block = pool.acquire(64, arena);
                        block.fill(thread_index);
                        assert!(block.iter().all(|b| *b == thread_index));
                        give_back(pool, block);
                    }
                });
            }
        });

        assert_eq!(pool.blocks_handed_out(), 0);
        assert!(pool.slab_count() >= 1);
    }
}

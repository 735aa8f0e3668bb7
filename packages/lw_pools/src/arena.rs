use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::{CHUNK_BYTES, SLAB_BYTES};
use crate::{BLOCK_ALIGN, Slab};

/// Alignment of every chunk allocated from the system.
const CHUNK_ALIGN: usize = 64;

/// The single shared, growable byte source that backs every pool of a registry.
///
/// The arena allocates large chunks from the system and carves them into slabs on request,
/// so many small pools do not each perform their own system allocations. A slab that does not
/// fit into the remaining space of the current chunk starts a new chunk (the remainder of the
/// previous chunk is abandoned). A slab larger than the configured chunk size receives a
/// dedicated chunk of exactly its size.
///
/// The arena never shrinks incrementally. [`force_cleanup_all()`][Self::force_cleanup_all]
/// forgets every chunk at once.
#[derive(Debug)]
pub(crate) struct Arena {
    chunk_bytes: NonZero<usize>,

    state: Mutex<ArenaState>,

    /// Sum of the sizes of all chunks currently tracked by the arena.
    ///
    /// Only modified while holding the state lock but readable without it.
    bytes_owned: AtomicUsize,
}

#[derive(Debug, Default)]
struct ArenaState {
    chunks: Vec<Arc<Chunk>>,

    /// The chunk that slabs are currently being carved from, if any.
    current: Option<Arc<Chunk>>,

    /// Offset of the first unused byte in `current`.
    cursor: usize,
}

impl Arena {
    pub(crate) fn new(chunk_bytes: NonZero<usize>) -> Self {
        Self {
            chunk_bytes,
            state: Mutex::new(ArenaState::default()),
            bytes_owned: AtomicUsize::new(0),
        }
    }

    /// Hands out a slab of exactly `bytes` bytes, exclusively owned by the caller.
    ///
    /// The slab memory is zero-initialized when first obtained from the system.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is zero. Aborts the process if the system cannot provide memory.
    pub(crate) fn obtain_slab(&self, bytes: usize) -> Slab {
        assert!(bytes > 0, "slabs must not be zero-sized");

        SLAB_BYTES.with(|e| e.observe(bytes));

        let mut state = self.state.lock();

        if bytes > self.chunk_bytes.get() {
            // Dedicated chunk, does not disturb carving from the current chunk.
            let chunk = self.allocate_chunk(&mut state, bytes);
            return Slab::new(chunk, 0, bytes);
        }

        // Keep every slab start aligned, so every block start stays aligned.
        let cursor = state.cursor.next_multiple_of(BLOCK_ALIGN);

        let fits = state
            .current
            .as_ref()
            .is_some_and(|chunk| chunk.len().saturating_sub(cursor) >= bytes);

        if !fits {
            let chunk = self.allocate_chunk(&mut state, self.chunk_bytes.get());
            state.current = Some(Arc::clone(&chunk));
            state.cursor = bytes;

            trace!(bytes, "carved slab from start of new chunk");
            return Slab::new(chunk, 0, bytes);
        }

        let chunk = Arc::clone(
            state
                .current
                .as_ref()
                .expect("we just verified that the current chunk exists"),
        );

        // Cannot overflow because we verified above that the slab fits into the chunk.
        state.cursor = cursor.wrapping_add(bytes);

        trace!(bytes, offset = cursor, "carved slab from current chunk");
        Slab::new(chunk, cursor, bytes)
    }

    fn allocate_chunk(&self, state: &mut ArenaState, bytes: usize) -> Arc<Chunk> {
        let chunk = Arc::new(Chunk::allocate(bytes));
        state.chunks.push(Arc::clone(&chunk));

        // Release pairs with the Acquire in bytes_owned(): anyone who observes a block carved
        // from this chunk as handed out also observes the chunk in the arena total.
        let bytes_owned = self
            .bytes_owned
            .fetch_add(bytes, Ordering::Release)
            .saturating_add(bytes);

        CHUNK_BYTES.with(|e| e.observe(bytes));
        debug!(
            chunk_bytes = bytes,
            bytes_owned,
            chunk_count = state.chunks.len(),
            "arena allocated chunk"
        );

        chunk
    }

    /// Forgets every chunk the arena has ever handed out slabs from.
    ///
    /// Memory of chunks that no block references any more is returned to the system
    /// immediately. Chunks still referenced by outstanding blocks are returned when the last
    /// such block is dropped.
    ///
    /// Returns the number of bytes the arena owned before the cleanup.
    pub(crate) fn force_cleanup_all(&self) -> usize {
        let mut state = self.state.lock();

        let chunk_count = state.chunks.len();
        let outlived = state
            .chunks
            .iter()
            .filter(|chunk| {
                // One reference is ours, one may be the `current` field.
                let is_current = state
                    .current
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, chunk));

                Arc::strong_count(chunk) > if is_current { 2 } else { 1 }
            })
            .count();

        *state = ArenaState::default();
        let released = self.bytes_owned.swap(0, Ordering::AcqRel);

        debug!(
            released,
            chunk_count,
            chunks_still_referenced = outlived,
            "arena released all chunks"
        );

        released
    }

    pub(crate) fn bytes_owned(&self) -> usize {
        self.bytes_owned.load(Ordering::Acquire)
    }

    #[cfg_attr(not(test), expect(dead_code, reason = "diagnostics used by tests"))]
    pub(crate) fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }
}

/// One contiguous allocation obtained from the system by the [`Arena`].
///
/// The memory is zero-initialized on allocation and returned to the system when the last
/// reference to the chunk is dropped. The chunk never creates references to its memory,
/// so disjoint ranges of it may be accessed concurrently through raw pointers.
#[derive(Debug)]
pub(crate) struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Chunk {
    fn allocate(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes, CHUNK_ALIGN)
            .expect("chunk size is bounded by the registry configuration and cannot overflow");

        // SAFETY: `bytes` is non-zero (enforced by `obtain_slab` and the registry builder).
        let ptr = unsafe { alloc_zeroed(layout) };

        let Some(ptr) = NonNull::new(ptr) else {
            // Continuing with a half-grown allocator is worse than terminating.
            handle_alloc_error(layout);
        };

        Self { ptr, layout }
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// Pointer to the first byte of the chunk.
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: The pointer was allocated in `allocate()` with the same layout and is
        // only deallocated here, once, when the last reference is dropped.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// SAFETY: The chunk is only an owner of raw memory. It never reads or writes the memory
// itself, so it can be dropped on any thread and referenced from any thread.
unsafe impl Send for Chunk {}
// SAFETY: See above. Access to the memory is coordinated by the pools that hand out
// disjoint blocks of it.
unsafe impl Sync for Chunk {}

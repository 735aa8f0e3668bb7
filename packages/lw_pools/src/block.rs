use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::{Chunk, SizeClass};

/// Exclusive ownership of one block of memory handed out by a
/// [`PoolRegistry`][crate::PoolRegistry].
///
/// The block dereferences to a byte slice of exactly the length that was requested. Pooled
/// blocks may contain bytes left behind by a previous owner; blocks are never zeroed on reuse.
///
/// Return the block via [`PoolRegistry::release()`][crate::PoolRegistry::release] (or the
/// [`ControlPanel`][crate::ControlPanel] equivalent), passing the same length that was
/// requested. Dropping a block without releasing it leaks the block: its pool keeps counting
/// it as handed out until the next cleanup.
///
/// # Example
///
/// ```
/// use lw_pools::PoolRegistry;
///
/// let registry = PoolRegistry::new();
///
/// let mut block = registry.acquire(10);
/// block.copy_from_slice(b"0123456789");
/// assert_eq!(&block[..4], b"0123");
///
/// registry.release(block, 10);
/// ```
pub struct Block {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

/// Where the memory of a [`Block`] comes from.
pub(crate) enum Backing {
    Pooled(PooledOrigin),
    Direct(DirectAllocation),
}

/// Identifies the pool slot a pooled block must be returned to.
#[derive(Debug)]
pub(crate) struct PooledOrigin {
    pub(crate) registry_id: u64,
    pub(crate) epoch: u64,
    pub(crate) pool_id: u64,
    pub(crate) size_class: SizeClass,

    /// Index of the block within its pool.
    pub(crate) index: usize,

    /// Keeps the memory valid even if the pool is cleaned up while the block is outstanding.
    pub(crate) _chunk: Arc<Chunk>,
}

/// Memory obtained directly from the system allocator, bypassing the pools.
pub(crate) struct DirectAllocation {
    ptr: NonNull<u8>,
    len: usize,
    registry_id: u64,
}

impl DirectAllocation {
    pub(crate) fn new(len: usize, registry_id: u64) -> Self {
        let boxed: Box<[u8]> = vec![0_u8; len].into_boxed_slice();

        // We take over the allocation; it is reconstituted and freed in `drop()`.
        let ptr = NonNull::new(Box::into_raw(boxed).cast::<u8>())
            .expect("Box never returns a null pointer");

        Self {
            ptr,
            len,
            registry_id,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.registry_id
    }
}

impl Drop for DirectAllocation {
    fn drop(&mut self) {
        let slice = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);

        // SAFETY: The pointer and length came from `Box::into_raw` in `new()` and this is
        // the only place the allocation is reconstituted.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl fmt::Debug for DirectAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectAllocation")
            .field("len", &self.len)
            .field("registry_id", &self.registry_id)
            .finish_non_exhaustive()
    }
}

impl Block {
    /// Creates a block over `len` bytes at `ptr` inside a pooled slab.
    ///
    /// The caller (the pool) guarantees that the range is part of the chunk referenced by the
    /// origin and that no other live block covers any byte of it.
    pub(crate) fn pooled(ptr: NonNull<u8>, len: usize, origin: PooledOrigin) -> Self {
        debug_assert!(len <= origin.size_class.block_size());

        Self {
            ptr,
            len,
            backing: Backing::Pooled(origin),
        }
    }

    pub(crate) fn direct(len: usize, registry_id: u64) -> Self {
        let allocation = DirectAllocation::new(len, registry_id);

        Self {
            ptr: allocation.ptr,
            len,
            backing: Backing::Direct(allocation),
        }
    }

    /// Consumes the block, giving up access to its memory.
    pub(crate) fn into_backing(self) -> Backing {
        self.backing
    }

    /// The number of bytes that were requested when the block was acquired.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block is zero bytes long.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The size class the block was served from, or `None` if the block was served by the
    /// direct allocation path (oversized request or native backend enabled).
    #[must_use]
    pub fn size_class(&self) -> Option<SizeClass> {
        match &self.backing {
            Backing::Pooled(origin) => Some(origin.size_class),
            Backing::Direct(_) => None,
        }
    }

    /// Whether the block was served by a pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled(_))
    }

    /// Pointer to the first byte of the block.
    ///
    /// The pointer remains valid until the block is released or dropped.
    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[cfg(test)]
    pub(crate) fn origin(&self) -> Option<&PooledOrigin> {
        match &self.backing {
            Backing::Pooled(origin) => Some(origin),
            Backing::Direct(_) => None,
        }
    }
}

impl Deref for Block {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: The block has exclusive ownership of `len` initialized bytes at `ptr` (chunks
        // and direct allocations are zero-initialized) and the memory stays alive as long as the
        // block exists, because the block holds the chunk or allocation that contains it.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Block {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: See `deref()`. We hold `&mut self`, so no other reference to the bytes exists.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for Block {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("size_class", &self.size_class())
            .finish_non_exhaustive()
    }
}

// SAFETY: A block is the exclusive owner of its bytes, just like a `Box<[u8]>`. The chunk it
// references is itself `Send + Sync`.
unsafe impl Send for Block {}
// SAFETY: Shared access only hands out `&[u8]`, which is safe to share between threads.
unsafe impl Sync for Block {}

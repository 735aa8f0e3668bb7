use std::ptr::NonNull;
use std::sync::Arc;

use crate::Chunk;

/// A contiguous byte range carved out of an arena [`Chunk`], owned by exactly one pool.
///
/// The slab keeps its chunk alive. It does not know how it is subdivided into blocks;
/// that is the business of the pool that owns it.
#[derive(Debug)]
pub(crate) struct Slab {
    chunk: Arc<Chunk>,

    /// Byte offset of the slab within the chunk.
    offset: usize,

    len: usize,
}

impl Slab {
    /// # Panics
    ///
    /// Panics if the range does not lie within the chunk.
    pub(crate) fn new(chunk: Arc<Chunk>, offset: usize, len: usize) -> Self {
        let end = offset
            .checked_add(len)
            .expect("slab range must not overflow the address space");

        assert!(
            end <= chunk.len(),
            "slab range {offset}..{end} exceeds chunk of {} bytes",
            chunk.len()
        );

        Self { chunk, offset, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg_attr(not(test), expect(dead_code, reason = "diagnostics used by tests"))]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Pointer to the byte at `offset` bytes from the start of the slab.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not within the slab.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset < self.len,
            "offset {offset} is outside slab of {} bytes",
            self.len
        );

        // SAFETY: The slab range was validated against the chunk in `new()` and `offset` is
        // within the slab, so the result stays within the same allocated object.
        unsafe { self.chunk.base().add(self.offset.wrapping_add(offset)) }
    }
}

use std::num::NonZero;

use new_zealand::nz;

use crate::{Error, MAX_POOLED_LENGTH, PoolRegistry, Result, SizeClass};

const DEFAULT_CHUNK_BYTES: NonZero<usize> = nz!(262_144);
const DEFAULT_SLAB_BYTES_TARGET: NonZero<usize> = nz!(16_384);
const DEFAULT_MIN_BLOCKS_PER_SLAB: NonZero<usize> = nz!(8);

/// Builder for creating an instance of [`PoolRegistry`].
///
/// All settings are optional. The defaults suit records of a few dozen to a few thousand bytes
/// that are created in batches of hundreds.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use lw_pools::PoolRegistry;
///
/// let registry = PoolRegistry::builder()
///     .chunk_bytes(NonZero::new(1024 * 1024).unwrap())
///     .slab_bytes_target(NonZero::new(64 * 1024).unwrap())
///     .build()
///     .unwrap();
/// ```
#[derive(Debug)]
#[must_use]
pub struct PoolRegistryBuilder {
    chunk_bytes: NonZero<usize>,
    slab_bytes_target: NonZero<usize>,
    min_blocks_per_slab: NonZero<usize>,
}

impl PoolRegistryBuilder {
    pub(crate) fn new() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            slab_bytes_target: DEFAULT_SLAB_BYTES_TARGET,
            min_blocks_per_slab: DEFAULT_MIN_BLOCKS_PER_SLAB,
        }
    }

    /// Sets the size of the chunks the arena allocates from the system.
    ///
    /// Slabs are carved out of chunks, so this is the granularity at which the registry as a
    /// whole grows. Must be at least [`MAX_POOLED_LENGTH`]. Default is 256 KiB.
    pub fn chunk_bytes(mut self, bytes: NonZero<usize>) -> Self {
        self.chunk_bytes = bytes;
        self
    }

    /// Sets the number of bytes a pool tries to obtain from the arena whenever it runs out of
    /// free blocks.
    ///
    /// The actual slab size is the largest multiple of the block size that fits into the target,
    /// but never fewer than [`min_blocks_per_slab`](Self::min_blocks_per_slab) blocks.
    /// Default is 16 KiB.
    pub fn slab_bytes_target(mut self, bytes: NonZero<usize>) -> Self {
        self.slab_bytes_target = bytes;
        self
    }

    /// Sets the minimum number of blocks in each slab, which matters for the largest size
    /// classes where the slab byte target would only fit a few blocks. Default is 8.
    pub fn min_blocks_per_slab(mut self, count: NonZero<usize>) -> Self {
        self.min_blocks_per_slab = count;
        self
    }

    /// Builds the registry with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the chunk size is smaller than the largest
    /// block size or if the slab size of some size class would overflow.
    pub fn build(self) -> Result<PoolRegistry> {
        if self.chunk_bytes.get() < MAX_POOLED_LENGTH {
            return Err(Error::InvalidConfiguration {
                problem: format!(
                    "chunk size of {} bytes cannot hold a single block of the largest size class ({MAX_POOLED_LENGTH} bytes)",
                    self.chunk_bytes
                ),
            });
        }

        let config = PoolConfig {
            chunk_bytes: self.chunk_bytes,
            slab_bytes_target: self.slab_bytes_target,
            min_blocks_per_slab: self.min_blocks_per_slab,
        };

        // Validate up front, so growing a pool never has to deal with arithmetic failures.
        for class in SizeClass::all() {
            let blocks = config.blocks_per_slab(class);

            if blocks.get().checked_mul(class.block_size()).is_none() {
                return Err(Error::InvalidConfiguration {
                    problem: format!(
                        "slab of {blocks} blocks of size class {class} overflows the address space"
                    ),
                });
            }
        }

        Ok(PoolRegistry::new_inner(config))
    }
}

/// Validated tuning parameters of a [`PoolRegistry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PoolConfig {
    pub(crate) chunk_bytes: NonZero<usize>,
    slab_bytes_target: NonZero<usize>,
    min_blocks_per_slab: NonZero<usize>,
}

impl PoolConfig {
    /// How many blocks of the given class each slab of its pool contains.
    #[expect(
        clippy::integer_division,
        reason = "we want the number of whole blocks that fit"
    )]
    pub(crate) fn blocks_per_slab(&self, class: SizeClass) -> NonZero<usize> {
        let fitting = self.slab_bytes_target.get() / class.block_size();

        NonZero::new(fitting)
            .unwrap_or(self.min_blocks_per_slab)
            .max(self.min_blocks_per_slab)
    }
}

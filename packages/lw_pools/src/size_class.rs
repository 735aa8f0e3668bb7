//! Mapping of requested byte lengths to the fixed set of pool size classes.
//!
//! Size classes are laid out in three tiers of increasing granularity:
//!
//! | Requested length | Step  | Classes |
//! |------------------|-------|---------|
//! | `0..=256`        | 8     | 32      |
//! | `257..=1024`     | 32    | 24      |
//! | `1025..=4096`    | 128   | 24      |
//!
//! Every block size is a multiple of [`BLOCK_ALIGN`], so every block handed out by a pool
//! starts at an address aligned to [`BLOCK_ALIGN`].

use std::fmt;

use crate::{Error, Result};

/// Alignment guaranteed for the start of every pooled block.
pub const BLOCK_ALIGN: usize = 8;

/// The largest requested length that is served from a pool.
///
/// Longer requests are served by the direct allocation path.
pub const MAX_POOLED_LENGTH: usize = COARSE_LIMIT;

/// The number of size classes, which is also the number of pool slots in a registry.
pub const SIZE_CLASS_COUNT: usize = FINE_CLASSES + MEDIUM_CLASSES + COARSE_CLASSES;

const FINE_LIMIT: usize = 256;
const FINE_STEP_SHIFT: u32 = 3;
const FINE_CLASSES: usize = FINE_LIMIT >> FINE_STEP_SHIFT;

const MEDIUM_LIMIT: usize = 1024;
const MEDIUM_STEP_SHIFT: u32 = 5;
const MEDIUM_CLASSES: usize = (MEDIUM_LIMIT - FINE_LIMIT) >> MEDIUM_STEP_SHIFT;

const COARSE_LIMIT: usize = 4096;
const COARSE_STEP_SHIFT: u32 = 7;
const COARSE_CLASSES: usize = (COARSE_LIMIT - MEDIUM_LIMIT) >> COARSE_STEP_SHIFT;

const SIZE_CLASSES: [SizeClass; SIZE_CLASS_COUNT] = build_table();

/// A bucket of allocation requests that are all rounded up to the same canonical block size.
///
/// Obtain one via [`SizeClass::for_length()`], [`SizeClass::by_index()`] or
/// [`SizeClass::all()`].
///
/// # Example
///
/// ```
/// use lw_pools::SizeClass;
///
/// let class = SizeClass::for_length(10).unwrap();
///
/// assert_eq!(class.block_size(), 16);
/// assert_eq!(class.index(), 1);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SizeClass {
    index: usize,
    block_size: usize,
}

impl SizeClass {
    /// Identifies the size class that serves requests of `length` bytes.
    ///
    /// The mapping is monotonic: a longer request never maps to a smaller block size.
    /// A length of zero maps to the smallest class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oversized`] if `length` exceeds [`MAX_POOLED_LENGTH`].
    #[inline]
    pub fn for_length(length: usize) -> Result<Self> {
        if length > MAX_POOLED_LENGTH {
            return Err(Error::Oversized {
                length,
                max: MAX_POOLED_LENGTH,
            });
        }

        let index = index_for_length(length);

        Ok(Self {
            index,
            block_size: block_size_for_index(index),
        })
    }

    /// Returns the size class with the given index, if such a class exists.
    #[must_use]
    pub fn by_index(index: usize) -> Option<Self> {
        SIZE_CLASSES.get(index).copied()
    }

    /// Iterates over all size classes in order of increasing block size.
    pub fn all() -> impl Iterator<Item = Self> {
        SIZE_CLASSES.iter().copied()
    }

    /// The index of this class, in `0..SIZE_CLASS_COUNT`.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The canonical number of bytes in every block of this class.
    #[must_use]
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({} bytes)", self.index, self.block_size)
    }
}

// All the arithmetic below operates on values bounded by MAX_POOLED_LENGTH and
// SIZE_CLASS_COUNT, so none of it can overflow.

#[inline]
const fn index_for_length(length: usize) -> usize {
    if length <= FINE_LIMIT {
        let length = if length == 0 { 1 } else { length };
        (length.wrapping_add(7) >> FINE_STEP_SHIFT).wrapping_sub(1)
    } else if length <= MEDIUM_LIMIT {
        let above = length.wrapping_sub(FINE_LIMIT);
        FINE_CLASSES
            .wrapping_add(above.wrapping_add(31) >> MEDIUM_STEP_SHIFT)
            .wrapping_sub(1)
    } else {
        let above = length.wrapping_sub(MEDIUM_LIMIT);
        (FINE_CLASSES + MEDIUM_CLASSES)
            .wrapping_add(above.wrapping_add(127) >> COARSE_STEP_SHIFT)
            .wrapping_sub(1)
    }
}

#[inline]
const fn block_size_for_index(index: usize) -> usize {
    if index < FINE_CLASSES {
        index.wrapping_add(1) << FINE_STEP_SHIFT
    } else if index < FINE_CLASSES + MEDIUM_CLASSES {
        let steps = index.wrapping_sub(FINE_CLASSES).wrapping_add(1);
        FINE_LIMIT.wrapping_add(steps << MEDIUM_STEP_SHIFT)
    } else {
        let steps = index
            .wrapping_sub(FINE_CLASSES + MEDIUM_CLASSES)
            .wrapping_add(1);
        MEDIUM_LIMIT.wrapping_add(steps << COARSE_STEP_SHIFT)
    }
}

const fn build_table() -> [SizeClass; SIZE_CLASS_COUNT] {
    let mut table = [SizeClass {
        index: 0,
        block_size: 0,
    }; SIZE_CLASS_COUNT];

    let mut index = 0;
    while index < SIZE_CLASS_COUNT {
        table[index] = SizeClass {
            index,
            block_size: block_size_for_index(index),
        };
        index += 1;
    }

    table
}

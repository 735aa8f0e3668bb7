/// A point-in-time snapshot of the memory statistics of a [`PoolRegistry`][crate::PoolRegistry].
///
/// The pool totals only describe pooled memory. Requests served by the direct allocation path
/// (oversized requests or the native backend) are reported separately and never affect
/// [`total_allocated`](Self::total_allocated) or [`total_used`](Self::total_used).
///
/// # Example
///
/// ```
/// use lw_pools::PoolRegistry;
///
/// let registry = PoolRegistry::new();
/// let block = registry.acquire(100);
///
/// let stats = registry.stats();
/// assert!(stats.total_allocated >= stats.total_used);
/// assert!(stats.waste_fraction() < 1.0);
/// assert_eq!(stats.outstanding_blocks, 1);
///
/// registry.release(block, 100);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Bytes owned by the arena plus the bookkeeping overhead of every installed pool.
    pub total_allocated: usize,

    /// Bytes in blocks currently handed out plus the bookkeeping overhead of every
    /// installed pool.
    pub total_used: usize,

    /// Number of size classes that currently have a pool.
    pub installed_pools: usize,

    /// Number of blocks currently handed out, pooled and direct.
    pub outstanding_blocks: usize,

    /// Bytes in outstanding blocks served by the direct allocation path.
    pub direct_bytes_outstanding: usize,

    /// Number of releases of blocks whose pool had already been destroyed by a cleanup.
    pub orphaned_releases: usize,

    /// Number of cleanups the registry has gone through.
    pub epoch: u64,
}

impl PoolStats {
    /// Bytes allocated for pools but not currently handed out.
    #[must_use]
    pub fn unused_but_allocated(&self) -> usize {
        self.total_allocated.saturating_sub(self.total_used)
    }

    /// The fraction of allocated pool memory that is not in use, in the range `[0, 1)`.
    ///
    /// Zero if nothing is allocated.
    #[must_use]
    pub fn waste_fraction(&self) -> f64 {
        waste_fraction(self.total_allocated, self.total_used)
    }
}

/// Largest value below 1.0, the upper bound of the waste fraction.
const MAX_WASTE_FRACTION: f64 = 1.0 - f64::EPSILON;

#[expect(
    clippy::cast_precision_loss,
    reason = "a ratio does not need more precision than f64 offers"
)]
pub(crate) fn waste_fraction(allocated: usize, used: usize) -> f64 {
    if allocated == 0 || used >= allocated {
        return 0.0;
    }

    // Every installed pool counts its overhead in both totals, so `used` is only zero if no
    // pool is installed, in which case the arena is empty too. We clamp anyway, because the
    // two totals are not read atomically.
    (1.0 - used as f64 / allocated as f64).clamp(0.0, MAX_WASTE_FRACTION)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolStats: Send, Sync, Copy, std::fmt::Debug);

    #[test]
    fn nothing_allocated_is_no_waste() {
        assert!(waste_fraction(0, 0).abs() < f64::EPSILON);
        assert!(PoolStats::default().waste_fraction().abs() < f64::EPSILON);
    }

    #[test]
    fn fully_used_is_no_waste() {
        assert!(waste_fraction(100, 100).abs() < f64::EPSILON);
    }

    #[test]
    fn quarter_used_is_three_quarters_waste() {
        assert!((waste_fraction(400, 100) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn waste_never_reaches_one() {
        let waste = waste_fraction(1000, 0);

        assert!(waste < 1.0);
        assert!(waste > 0.99);
    }

    #[test]
    fn used_above_allocated_is_clamped() {
        // Can happen with a torn read of the two totals.
        assert!(waste_fraction(100, 200).abs() < f64::EPSILON);
    }

    #[test]
    fn unused_but_allocated_saturates() {
        let stats = PoolStats {
            total_allocated: 100,
            total_used: 40,
            ..PoolStats::default()
        };
        assert_eq!(stats.unused_but_allocated(), 60);

        let torn = PoolStats {
            total_allocated: 40,
            total_used: 100,
            ..PoolStats::default()
        };
        assert_eq!(torn.unused_but_allocated(), 0);
    }
}

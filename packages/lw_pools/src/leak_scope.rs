use tracing::warn;

use crate::PoolRegistry;

/// Watches a stretch of code for blocks that are acquired but never released.
///
/// The scope records the number of outstanding blocks when it is created. When it is dropped,
/// any increase is reported as a warning. Useful around a unit of work that is expected to
/// give back everything it takes, such as the processing of one batch of records.
///
/// The count is registry-wide, so work happening concurrently on other threads is attributed
/// to the scope as well.
///
/// # Example
///
/// ```
/// use lw_pools::PoolRegistry;
///
/// let registry = PoolRegistry::new();
///
/// let scope = registry.leak_scope("batch");
/// let block = registry.acquire(32);
/// assert_eq!(scope.net_outstanding(), 1);
///
/// registry.release(block, 32);
/// assert_eq!(scope.net_outstanding(), 0);
/// ```
#[derive(Debug)]
#[must_use = "the scope only checks for leaks when it is dropped at the end of the watched code"]
pub struct LeakScope<'a> {
    registry: &'a PoolRegistry,
    name: &'static str,
    initial_outstanding: usize,
}

impl<'a> LeakScope<'a> {
    pub(crate) fn new(registry: &'a PoolRegistry, name: &'static str) -> Self {
        Self {
            registry,
            name,
            initial_outstanding: registry.outstanding_blocks(),
        }
    }

    /// Blocks acquired minus blocks released since the scope was created.
    ///
    /// Negative if the scope released blocks acquired before it started.
    #[must_use]
    #[expect(
        clippy::cast_possible_wrap,
        reason = "block counts are bounded by the address space divided by the block size"
    )]
    pub fn net_outstanding(&self) -> i64 {
        let now = self.registry.outstanding_blocks() as i64;
        let then = self.initial_outstanding as i64;

        now.wrapping_sub(then)
    }
}

impl Drop for LeakScope<'_> {
    fn drop(&mut self) {
        let net = self.net_outstanding();

        if net > 0 {
            warn!(
                scope = self.name,
                leaked_blocks = net,
                "blocks acquired in scope were not released"
            );
        }
    }
}

impl PoolRegistry {
    /// Starts watching for blocks that are acquired but not released before the returned
    /// scope is dropped.
    pub fn leak_scope(&self, name: &'static str) -> LeakScope<'_> {
        LeakScope::new(self, name)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn balanced_scope_is_zero() {
        let registry = PoolRegistry::new();

        let scope = registry.leak_scope("balanced");
        let a = registry.acquire(8);
        let b = registry.acquire(5000);
        assert_eq!(scope.net_outstanding(), 2);

        registry.release(a, 8);
        registry.release(b, 5000);
        assert_eq!(scope.net_outstanding(), 0);
    }

    #[test]
    fn counts_relative_to_start() {
        let registry = PoolRegistry::new();

        let before = registry.acquire(64);
        let scope = registry.leak_scope("relative");
        assert_eq!(scope.net_outstanding(), 0);

        registry.release(before, 64);
        assert_eq!(scope.net_outstanding(), -1);
    }

    #[test]
    fn leaking_scope_drops_without_panic() {
        let registry = PoolRegistry::new();

        let leaked = {
            let scope = registry.leak_scope("leaky");
            let block = registry.acquire(16);
            assert_eq!(scope.net_outstanding(), 1);
            block
        };

        registry.release(leaked, 16);
        assert_eq!(registry.outstanding_blocks(), 0);
    }
}

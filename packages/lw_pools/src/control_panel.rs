use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::stats::waste_fraction;
use crate::{Block, LeakScope, PoolRegistry, PoolStats};

static GLOBAL: LazyLock<ControlPanel> = LazyLock::new(ControlPanel::default);

/// Process-wide policy switches and statistics of the lightweight-object allocator.
///
/// The control panel owns a [`PoolRegistry`] and decides, based on its flags, whether
/// requests go to the pools or straight to the system allocator. Most code uses the
/// process-wide instance returned by [`global()`](Self::global).
///
/// # Flags
///
/// * `cleanup_on_conversion` (default `true`) - whether
///   [`conversion_finished()`](Self::conversion_finished) releases all pooled memory.
/// * `native_backend_enabled` (default `false`) - whether every request bypasses the pools
///   and is served by a direct allocation, for comparing against a plain allocator.
///
/// Flags can be changed at any time from any thread. Blocks acquired before a change are
/// released correctly after it.
///
/// # Example
///
/// ```
/// use lw_pools::ControlPanel;
///
/// let panel = ControlPanel::global();
///
/// let block = panel.acquire(48);
/// assert!(panel.total_pool_mem_used() > 0);
/// panel.release(block, 48);
///
/// assert!(panel.pool_waste_fraction() < 1.0);
/// ```
#[derive(Debug)]
pub struct ControlPanel {
    registry: PoolRegistry,

    cleanup_on_conversion: AtomicBool,
    native_backend_enabled: AtomicBool,
}

impl ControlPanel {
    /// The process-wide control panel, created with a default [`PoolRegistry`] on first use.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Creates an independent control panel with default flags on top of `registry`.
    #[must_use]
    pub fn new(registry: PoolRegistry) -> Self {
        Self {
            registry,
            cleanup_on_conversion: AtomicBool::new(true),
            native_backend_enabled: AtomicBool::new(false),
        }
    }

    /// The registry that serves pooled requests.
    #[must_use]
    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Hands out a block of `length` bytes, from a pool unless the native backend is enabled.
    ///
    /// # Panics
    ///
    /// See [`PoolRegistry::acquire()`].
    pub fn acquire(&self, length: usize) -> Block {
        if self.native_backend_enabled() {
            self.registry.acquire_direct(length)
        } else {
            self.registry.acquire(length)
        }
    }

    /// Returns a block obtained from [`acquire()`](Self::acquire).
    ///
    /// # Panics
    ///
    /// See [`PoolRegistry::release()`].
    pub fn release(&self, block: Block, length: usize) {
        self.registry.release(block, length);
    }

    /// Sets whether [`conversion_finished()`](Self::conversion_finished) releases all pooled
    /// memory.
    pub fn set_cleanup_on_conversion(&self, enabled: bool) {
        self.cleanup_on_conversion.store(enabled, Ordering::Relaxed);
    }

    /// Whether [`conversion_finished()`](Self::conversion_finished) releases all pooled memory.
    #[must_use]
    pub fn cleanup_on_conversion(&self) -> bool {
        self.cleanup_on_conversion.load(Ordering::Relaxed)
    }

    /// Sets whether all requests bypass the pools.
    pub fn set_native_backend_enabled(&self, enabled: bool) {
        let previous = self.native_backend_enabled.swap(enabled, Ordering::Relaxed);

        if previous != enabled {
            debug!(enabled, "native backend toggled");
        }
    }

    /// Whether all requests bypass the pools.
    #[must_use]
    pub fn native_backend_enabled(&self) -> bool {
        self.native_backend_enabled.load(Ordering::Relaxed)
    }

    /// Signals that a batch of lightweight objects has been converted to their heavyweight
    /// form and released.
    ///
    /// Releases all pooled memory if `cleanup_on_conversion` is set. Returns whether it did.
    /// The same restrictions as for [`release_all_held_memory()`](Self::release_all_held_memory)
    /// apply.
    pub fn conversion_finished(&self) -> bool {
        if !self.cleanup_on_conversion() {
            return false;
        }

        self.release_all_held_memory();
        true
    }

    /// Destroys all pools and returns their memory to the system.
    ///
    /// Must not be called concurrently with acquire or release calls. See
    /// [`PoolRegistry::cleanup()`].
    pub fn release_all_held_memory(&self) {
        self.registry.cleanup();
    }

    /// Bytes held by the pools, including bookkeeping overhead.
    #[must_use]
    pub fn total_pool_mem_allocated(&self) -> usize {
        self.registry.total_allocated()
    }

    /// Bytes in blocks currently handed out by the pools, including bookkeeping overhead.
    ///
    /// The first acquire for a size class installs its pool, which adds
    /// [`POOL_OVERHEAD_BYTES`][crate::POOL_OVERHEAD_BYTES] to this total until the next
    /// [`release_all_held_memory()`](Self::release_all_held_memory). An acquire and release
    /// round trip therefore only leaves the total unchanged once the pool exists.
    #[must_use]
    pub fn total_pool_mem_used(&self) -> usize {
        self.registry.total_used()
    }

    /// Bytes held by the pools that are not handed out.
    #[must_use]
    pub fn mem_unused_but_allocated_in_pools(&self) -> usize {
        let used = self.total_pool_mem_used();
        let allocated = self.total_pool_mem_allocated();

        allocated.saturating_sub(used)
    }

    /// The fraction of pooled memory that is not handed out, in the range `[0, 1)`.
    #[must_use]
    pub fn pool_waste_fraction(&self) -> f64 {
        let used = self.total_pool_mem_used();
        let allocated = self.total_pool_mem_allocated();

        waste_fraction(allocated, used)
    }

    /// Takes a snapshot of all statistics of the underlying registry.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.registry.stats()
    }

    /// See [`PoolRegistry::leak_scope()`].
    pub fn leak_scope(&self, name: &'static str) -> LeakScope<'_> {
        self.registry.leak_scope(name)
    }
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new(PoolRegistry::new())
    }
}

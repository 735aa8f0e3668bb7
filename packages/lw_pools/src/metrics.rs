//! Metrics for the pool system.
//!
//! The hot acquire/release path is deliberately not instrumented. Only the slow paths
//! (arena growth, pool installation, direct allocations, cleanup) observe events.

use nm::{Event, Magnitude};

/// Histogram buckets for memory requests in bytes.
///
/// Slab requests are typically in the 16 KiB range, chunks are 256 KiB by default and direct
/// allocations start just above the largest pooled size class.
const BYTES_BUCKETS: &[Magnitude] = &[
    1024,
    4096,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
    4 * 1024 * 1024,
];

thread_local! {
    /// Bytes requested from the arena by a pool whose free list ran dry.
    pub(crate) static SLAB_BYTES: Event = Event::builder()
        .name("lw_pools_slab_bytes")
        .histogram(BYTES_BUCKETS)
        .build();

    /// Bytes allocated from the system by the arena for a new chunk.
    pub(crate) static CHUNK_BYTES: Event = Event::builder()
        .name("lw_pools_chunk_bytes")
        .histogram(BYTES_BUCKETS)
        .build();

    /// Bytes of requests served by the direct allocation path.
    pub(crate) static DIRECT_ALLOC_BYTES: Event = Event::builder()
        .name("lw_pools_direct_alloc_bytes")
        .histogram(BYTES_BUCKETS)
        .build();

    pub(crate) static POOL_INSTALLS: Event = Event::builder()
        .name("lw_pools_pool_installs")
        .build();

    /// A thread built a candidate pool but another thread installed its pool first.
    pub(crate) static LOST_INSTALL_RACES: Event = Event::builder()
        .name("lw_pools_lost_install_races")
        .build();

    pub(crate) static ORPHANED_RELEASES: Event = Event::builder()
        .name("lw_pools_orphaned_releases")
        .build();

    pub(crate) static CLEANUPS: Event = Event::builder()
        .name("lw_pools_cleanups")
        .build();
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Size-class memory pools for large numbers of small, short-lived records.
//!
//! Programs that create and discard millions of small fixed-shape records (histogram bins,
//! event fragments and the like) spend a noticeable share of their time in the general-purpose
//! allocator and lose memory to its per-allocation overhead. This crate serves such records
//! from pools of fixed-size blocks instead, with fast reuse of released blocks and the ability
//! to hand all memory back to the system in one step.
//!
//! # Quick start
//!
//! ```rust
//! use lw_pools::ControlPanel;
//!
//! let panel = ControlPanel::global();
//!
//! let mut block = panel.acquire(24);
//! block.copy_from_slice(&[1; 24]);
//!
//! // Blocks are released with the same length they were acquired with.
//! panel.release(block, 24);
//!
//! println!(
//!     "{} bytes held by pools, {:.1}% of them unused",
//!     panel.total_pool_mem_allocated(),
//!     panel.pool_waste_fraction() * 100.0
//! );
//! ```
//!
//! # Structure
//!
//! * Every requested length is mapped to one of [`SIZE_CLASS_COUNT`] [`SizeClass`]es. Requests
//!   up to [`MAX_POOLED_LENGTH`] bytes are pooled, longer ones are served by a direct
//!   allocation that is tracked separately.
//! * A [`PoolRegistry`] keeps one pool per size class, created on first use. Pools carve their
//!   blocks out of slabs obtained from an arena shared by all pools of the registry.
//! * The [`ControlPanel`] owns a registry and adds process-wide policy switches. A global
//!   instance is available via [`ControlPanel::global()`].
//!
//! # Cleanup
//!
//! [`PoolRegistry::cleanup()`] (or [`ControlPanel::release_all_held_memory()`]) destroys every
//! pool and returns all memory to the system. It must not run concurrently with acquire or
//! release calls. Pools are rebuilt on demand afterwards.
//!
//! # Features
//!
//! * `leak_check` - tracks every outstanding block, counting invalid releases and reporting
//!   blocks that were never released when their pool is destroyed. Adds overhead to every
//!   acquire and release.

mod arena;
mod block;
mod control_panel;
mod error;
mod leak_scope;
#[cfg(feature = "leak_check")]
mod leak_tracker;
mod metrics;
mod pool;
mod registry;
mod registry_builder;
mod size_class;
mod slab;
mod stats;

pub(crate) use arena::*;
pub use block::Block;
pub(crate) use block::{Backing, DirectAllocation, PooledOrigin};
pub use control_panel::*;
pub use error::Error;
pub(crate) use error::Result;
pub use leak_scope::*;
#[cfg(feature = "leak_check")]
pub(crate) use leak_tracker::*;
pub(crate) use pool::*;
pub use registry::*;
pub use registry_builder::PoolRegistryBuilder;
pub(crate) use registry_builder::PoolConfig;
pub use size_class::*;
pub(crate) use slab::*;
pub use stats::PoolStats;

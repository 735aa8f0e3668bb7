use thiserror::Error;

/// Errors that can occur when configuring pools or mapping requests to size classes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested length is larger than the largest size class served by the pools.
    ///
    /// [`PoolRegistry::acquire()`][crate::PoolRegistry::acquire] serves such requests through
    /// the direct allocation path instead of returning this error. Only the explicitly
    /// pool-only APIs surface it.
    #[error("requested length of {length} bytes exceeds the largest pooled size of {max} bytes")]
    Oversized {
        /// The length that was requested.
        length: usize,

        /// The largest length that can be served from a pool.
        max: usize,
    },

    /// A pool registry was configured with values that cannot produce working pools.
    #[error("invalid pool registry configuration: {problem}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        problem: String,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

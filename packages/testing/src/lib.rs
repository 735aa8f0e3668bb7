#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the `lw_pools` workspace.

use std::sync::{Barrier, mpsc};
use std::thread;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// If the test takes longer than the timeout to complete, the test fails instead of hanging
/// the CI pipeline. The timeout is 10 seconds under normal conditions and 60 seconds under
/// Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly, so mutation testing can detect hanging
/// mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode) or if the test
/// itself panics.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Runs `f` on `threads` threads that are all released at the same moment, returning the
/// results in thread order.
///
/// Useful for provoking races on lazily initialized state, such as the first request for a
/// size class.
///
/// # Example
///
/// ```rust
/// use testing::race;
///
/// let results = race(4, |thread_index| thread_index * 10);
/// assert_eq!(results, vec![0, 10, 20, 30]);
/// ```
pub fn race<F, R>(threads: usize, f: F) -> Vec<R>
where
    F: Fn(usize) -> R + Sync,
    R: Send,
{
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|thread_index| {
                let barrier = &barrier;
                let f = &f;

                s.spawn(move || {
                    barrier.wait();
                    f(thread_index)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("racing thread should not panic"))
            .collect()
    })
}

/// Generates a reproducible sequence of `count` request lengths in `1..=max_length`.
///
/// Threads of a stress test pass different seeds to get different but repeatable workloads.
///
/// # Panics
///
/// Panics if `max_length` is zero.
#[must_use]
pub fn random_lengths(seed: u64, count: usize, max_length: usize) -> Vec<usize> {
    assert!(max_length > 0, "max_length must be at least 1");

    let mut rng = SmallRng::seed_from_u64(seed);

    (0..count)
        .map(|_| rng.random_range(1..=max_length))
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    fn race_runs_every_thread_once() {
        let counter = AtomicUsize::new(0);

        let results = race(8, |i| {
            counter.fetch_add(1, Ordering::Relaxed);
            i
        });

        assert_eq!(counter.load(Ordering::Relaxed), 8);
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn random_lengths_are_reproducible_and_in_range() {
        let a = random_lengths(42, 1000, 300);
        let b = random_lengths(42, 1000, 300);

        assert_eq!(a, b);
        assert!(a.iter().all(|len| (1..=300).contains(len)));
    }
}

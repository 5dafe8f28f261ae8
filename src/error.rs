//! Typed failures shared by every primitive in this crate.
//!
//! Timeouts are *not* represented here: a timed acquisition that misses its deadline is
//! an ordinary return (`None`/[`PopResult::Timeout`](crate::pool::queue::PopResult)), not
//! an error. `Error` is reserved for programmer mistakes and for the few outcomes a
//! caller genuinely needs to branch on (a stopped pool).

use std::fmt;

/// Errors that can be returned by the primitives in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `unlock` was called on a mutex that is not currently held.
    #[error("unlock called on a mutex that is not held")]
    InvalidState,

    /// `unlock` of a reentrant mutex was called by a thread other than its owner.
    #[error("unlock called by a thread that does not own the mutex")]
    NotOwner,

    /// A pool or queue was configured with an inconsistent or non-positive capacity.
    #[error("invalid pool capacity: {0}")]
    CapacityMisconfigured(CapacityError),

    /// A task or a group of tasks was submitted after `stop` was called.
    #[error("submission rejected: the queue or pool has been stopped")]
    Stopped,

    /// A future-bearing task panicked while executing on a worker thread.
    #[error("task panicked before producing a result")]
    TaskPanicked,
}

/// Reason a [`crate::pool::PoolBuilder`] rejected its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    /// `max_threads` is zero; the pool could never run a task.
    MaxIsZero,
    /// `max_threads < min_threads`.
    MaxBelowMin { min: usize, max: usize },
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityError::MaxIsZero => write!(f, "max_threads must be at least 1"),
            CapacityError::MaxBelowMin { min, max } => {
                write!(f, "max_threads ({max}) is below min_threads ({min})")
            }
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Blocking synchronization primitives and an elastic worker pool built on them.
//!
//! - [`spin_mutex::SpinMutex`] — test-and-test-and-set exclusive lock, never blocks.
//! - [`mutex::Mutex`] — non-recursive exclusive lock with blocking, non-blocking, and
//!   timed acquisition.
//! - [`reentrant_mutex::ReentrantMutex`] — same API, safe to relock from its own owner.
//! - [`rwlock::RwLock`] — fair FIFO reader-writer lock with batched reader admission.
//! - [`multi_lock`] — deadlock-free simultaneous acquisition of several lockables.
//! - [`pool::Pool`] — an elastic worker pool over a FIFO/priority/delay task queue.
//!
//! Every primitive surfaces failures as typed [`error::Error`] values rather than panics,
//! with the sole exception of unrecoverable programmer errors (a guard outliving the
//! invariant it depends on), and logs its state transitions through the `log` facade at
//! targets under this crate's module path. Timed acquisition never counts as an error: a
//! missed deadline is an ordinary `None`/[`pool::queue::PopResult::Timeout`].

pub mod error;
pub mod multi_lock;
pub mod mutex;
pub mod pool;
pub mod reentrant_mutex;
pub mod rwlock;
pub mod spin_mutex;

pub use error::{CapacityError, Error, Result};
pub use mutex::{Mutex, MutexGuard};
pub use pool::{Pool, PoolBuilder, TaskHandle};
pub use reentrant_mutex::{ReentrantMutex, ReentrantMutexGuard};
pub use rwlock::RwLock;
pub use spin_mutex::{SpinMutex, SpinMutexGuard};

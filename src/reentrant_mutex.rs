//! A reentrant (recursive) exclusive mutex with the same timed-acquisition API as
//! [`crate::mutex::Mutex`].

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::{Condvar, Mutex as StdMutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::error::{Error, Result};

struct State {
    owner: Option<ThreadId>,
    count: u64,
}

/// A mutex that may be locked more than once by the thread that already holds it.
///
/// The owning thread's `n`th nested `lock` must be matched by `n` calls to `unlock`
/// (dropping the returned guards) before another thread can acquire the lock. A thread
/// that is not the current owner calling `unlock` is a programmer error and returns
/// [`Error::NotOwner`] rather than corrupting the counter.
pub struct ReentrantMutex<T: ?Sized> {
    state: StdMutex<State>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

/// RAII guard returned by the `lock` family on [`ReentrantMutex`].
pub struct ReentrantMutexGuard<'a, T: ?Sized> {
    lock: &'a ReentrantMutex<T>,
}

unsafe impl<T: ?Sized + Send> Send for ReentrantMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    /// Creates a new reentrant mutex in the unlocked state, wrapping `data`.
    pub fn new(data: T) -> Self {
        Self {
            state: StdMutex::new(State {
                owner: None,
                count: 0,
            }),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the mutex, returning the wrapped data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> ReentrantMutex<T> {
    fn may_enter(state: &State, me: ThreadId) -> bool {
        state.count == 0 || state.owner == Some(me)
    }

    /// Blocks the calling thread until the lock can be acquired (immediately, if the
    /// calling thread already owns it).
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !Self::may_enter(&state, me) {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.count == 0 {
            state.owner = Some(me);
        }
        state.count += 1;
        trace!("reentrant mutex acquired, count={}", state.count);
        ReentrantMutexGuard { lock: self }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !Self::may_enter(&state, me) {
            return None;
        }
        if state.count == 0 {
            state.owner = Some(me);
        }
        state.count += 1;
        Some(ReentrantMutexGuard { lock: self })
    }

    /// Attempts to acquire the lock, waiting at most until `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> Option<ReentrantMutexGuard<'_, T>> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if Self::may_enter(&state, me) {
                if state.count == 0 {
                    state.owner = Some(me);
                }
                state.count += 1;
                return Some(ReentrantMutexGuard { lock: self });
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let (guard, timeout_result) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if timeout_result.timed_out() && !Self::may_enter(&state, me) {
                return None;
            }
        }
    }

    /// Attempts to acquire the lock, waiting at most `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ReentrantMutexGuard<'_, T>> {
        self.try_lock_until(Instant::now() + timeout)
    }

    /// Returns a mutable reference to the underlying data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn do_unlock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.owner != Some(me) {
            error!("reentrant mutex unlock called by non-owner thread");
            return Err(Error::NotOwner);
        }
        state.count -= 1;
        let fully_released = state.count == 0;
        if fully_released {
            state.owner = None;
        }
        drop(state);
        if fully_released {
            self.cond.notify_one();
        }
        Ok(())
    }
}

impl<T: ?Sized> Drop for ReentrantMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock
            .do_unlock()
            .expect("internal invariant: guard implies this thread owns the lock");
    }
}

impl<T: ?Sized> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

// No `DerefMut` for `ReentrantMutexGuard`: the owning thread can hold more than one live
// guard at once (that's the point of reentrancy), so handing out `&mut T` through any one
// of them would alias the `&T`/`&mut T` another live guard could hand out at the same
// time. `get_mut` above is the only way to reach `&mut T`, and it requires `&mut
// ReentrantMutex<T>`, which statically rules out any other live guard.

impl<T: Default> Default for ReentrantMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentry_scenario() {
        let lock = ReentrantMutex::new(0);

        let g1 = lock.lock();
        let g2 = lock.lock();
        let g3 = lock.lock();

        drop(g3);
        drop(g2);

        // One guard still outstanding: `count == 1`. A concurrent try_lock from a
        // different thread must fail, proving the owner check is thread-specific.
        let lock = Arc::new(lock);
        let lock2 = lock.clone();
        let other_failed = thread::spawn(move || lock2.try_lock().is_none())
            .join()
            .unwrap();
        assert!(other_failed);

        drop(g1);

        // Fully released: a fresh thread can now acquire it.
        let lock3 = lock.clone();
        let other_succeeded = thread::spawn(move || lock3.try_lock().is_some())
            .join()
            .unwrap();
        assert!(other_succeeded);
    }

    #[test]
    fn non_owner_unlock_is_reported_not_silently_dropped() {
        let lock = ReentrantMutex::new(());
        let guard = lock.lock();

        let lock = Arc::new(lock);
        let lock2 = lock.clone();
        thread::spawn(move || {
            // A foreign thread has no guard to drop, so we exercise the same
            // invariant directly through the private path this module's Drop uses.
            assert!(matches!(lock2.do_unlock(), Err(Error::NotOwner)));
        })
        .join()
        .unwrap();

        drop(guard);
    }
}

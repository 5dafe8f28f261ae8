//! A test-and-test-and-set spin mutex.
//!
//! Unlike every other lock in this crate, [`SpinMutex`] never parks the calling thread: a
//! contended `lock` busy-waits until the flag clears. It has no fairness guarantee, no
//! timed variant, and is not reentrant — a thread that locks it twice deadlocks itself,
//! exactly as a bare `std::sync::Mutex` would. It exists for very short critical sections
//! where the cost of a syscall-backed park would dwarf the cost of the critical section
//! itself.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinning mutual-exclusion primitive.
///
/// This acts like [`std::sync::Mutex`], but never blocks the OS thread: a contended
/// `lock` spins. No thread may lock it twice; no thread may unlock a lock it does not
/// hold (there is no owner tracking at all, so this is simply undefined in the sense that
/// whichever thread calls `unlock` releases it).
pub struct SpinMutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`SpinMutex::lock`] and [`SpinMutex::try_lock`].
///
/// Dropping the guard unlocks the mutex.
pub struct SpinMutexGuard<'a, T: ?Sized> {
    lock: &'a SpinMutex<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Creates a new spin mutex wrapping `data`, initially unlocked.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the mutex, returning the wrapped data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Acquires the lock, spinning until it becomes available.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinMutexGuard { lock: self };
            }

            // Test-only inner spin: read-only polling avoids hammering the cache line
            // with exclusive-ownership requests while the lock is held by someone else.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinMutexGuard { lock: self })
    }

    /// Returns a mutable reference to the underlying data without locking.
    ///
    /// Safe because a `&mut SpinMutex<T>` statically guarantees exclusive access.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: Default> Default for SpinMutex<T> {
    #[inline]
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
    fn single_threaded() {
        let lock = SpinMutex::new(5);
        assert_eq!(*lock.lock(), 5);

        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinMutex::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn contended_increment() {
        const THREADS: usize = 8;
        const ITERS: usize = 2_000;

        let counter = Arc::new(SpinMutex::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*counter.lock(), THREADS * ITERS);
    }
}

//! Deadlock-free simultaneous acquisition of several lockables.
//!
//! `acquire((&a, &b))` (and the three- and four-lock variants) acquires every lock in the
//! tuple or none at all, without requiring callers to agree on a global lock order. The
//! strategy is acquire-first/try-rest/retry: block on the first lock, then `try_lock` the
//! rest in argument order; if any of those attempts fails, release everything acquired so
//! far and restart the whole sequence from the first lock. Because a failed attempt
//! always unwinds back to holding nothing, no cycle of holders can deadlock each other -
//! at least one side of any cycle will eventually observe a `try_lock` failure and back
//! off. This is not starvation-free: under adversarial scheduling a particular caller
//! could retry indefinitely.

use std::thread;

/// A type that can be locked and try-locked, producing an RAII guard.
///
/// Implemented by [`crate::mutex::Mutex`], [`crate::reentrant_mutex::ReentrantMutex`],
/// and the write side of [`crate::rwlock::RwLock`].
pub trait Lockable {
    /// The RAII guard produced by a successful lock.
    type Guard<'a>
    where
        Self: 'a;

    /// Blocks until the lock is acquired.
    fn lock(&self) -> Self::Guard<'_>;

    /// Attempts to acquire the lock without blocking.
    fn try_lock(&self) -> Option<Self::Guard<'_>>;
}

impl<T: ?Sized> Lockable for crate::mutex::Mutex<T> {
    type Guard<'a> = crate::mutex::MutexGuard<'a, T> where Self: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        crate::mutex::Mutex::lock(self)
    }

    fn try_lock(&self) -> Option<Self::Guard<'_>> {
        crate::mutex::Mutex::try_lock(self)
    }
}

impl<T: ?Sized> Lockable for crate::reentrant_mutex::ReentrantMutex<T> {
    type Guard<'a> = crate::reentrant_mutex::ReentrantMutexGuard<'a, T> where Self: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        crate::reentrant_mutex::ReentrantMutex::lock(self)
    }

    fn try_lock(&self) -> Option<Self::Guard<'_>> {
        crate::reentrant_mutex::ReentrantMutex::try_lock(self)
    }
}

/// Guard holding two simultaneously-acquired locks, released in reverse acquisition
/// order on drop.
pub struct MultiGuard2<'a, A: Lockable + 'a, B: Lockable + 'a> {
    a: Option<A::Guard<'a>>,
    b: Option<B::Guard<'a>>,
}

impl<'a, A: Lockable, B: Lockable> MultiGuard2<'a, A, B> {
    /// Wraps two guards that the caller has already locked, without acquiring anything.
    ///
    /// The caller is responsible for having locked `a` and `b` through the same
    /// `Lockable` implementations this module would have used.
    pub fn adopt(a: A::Guard<'a>, b: B::Guard<'a>) -> Self {
        Self {
            a: Some(a),
            b: Some(b),
        }
    }

    /// Returns references to the two held guards.
    pub fn guards(&self) -> (&A::Guard<'a>, &B::Guard<'a>) {
        (self.a.as_ref().unwrap(), self.b.as_ref().unwrap())
    }

    /// Returns mutable references to the two held guards.
    pub fn guards_mut(&mut self) -> (&mut A::Guard<'a>, &mut B::Guard<'a>) {
        (self.a.as_mut().unwrap(), self.b.as_mut().unwrap())
    }
}

impl<A: Lockable, B: Lockable> Drop for MultiGuard2<'_, A, B> {
    fn drop(&mut self) {
        self.b.take();
        self.a.take();
    }
}

/// Acquires `a` and `b` atomically (all-or-nothing, with retry on contention).
pub fn acquire2<'a, A: Lockable, B: Lockable>(a: &'a A, b: &'a B) -> MultiGuard2<'a, A, B> {
    loop {
        let ga = a.lock();
        if let Some(gb) = b.try_lock() {
            return MultiGuard2 {
                a: Some(ga),
                b: Some(gb),
            };
        }
        drop(ga);
        thread::yield_now();
    }
}

/// Guard holding three simultaneously-acquired locks, released in reverse acquisition
/// order on drop.
pub struct MultiGuard3<'a, A: Lockable + 'a, B: Lockable + 'a, C: Lockable + 'a> {
    a: Option<A::Guard<'a>>,
    b: Option<B::Guard<'a>>,
    c: Option<C::Guard<'a>>,
}

impl<'a, A: Lockable, B: Lockable, C: Lockable> MultiGuard3<'a, A, B, C> {
    /// Wraps three already-locked guards without acquiring anything.
    pub fn adopt(a: A::Guard<'a>, b: B::Guard<'a>, c: C::Guard<'a>) -> Self {
        Self {
            a: Some(a),
            b: Some(b),
            c: Some(c),
        }
    }

    /// Returns references to the three held guards.
    pub fn guards(&self) -> (&A::Guard<'a>, &B::Guard<'a>, &C::Guard<'a>) {
        (
            self.a.as_ref().unwrap(),
            self.b.as_ref().unwrap(),
            self.c.as_ref().unwrap(),
        )
    }
}

impl<A: Lockable, B: Lockable, C: Lockable> Drop for MultiGuard3<'_, A, B, C> {
    fn drop(&mut self) {
        self.c.take();
        self.b.take();
        self.a.take();
    }
}

/// Acquires `a`, `b`, and `c` atomically (all-or-nothing, with retry on contention).
pub fn acquire3<'a, A: Lockable, B: Lockable, C: Lockable>(
    a: &'a A,
    b: &'a B,
    c: &'a C,
) -> MultiGuard3<'a, A, B, C> {
    loop {
        let ga = a.lock();
        let gb = match b.try_lock() {
            Some(g) => g,
            None => {
                drop(ga);
                thread::yield_now();
                continue;
            }
        };
        let gc = match c.try_lock() {
            Some(g) => g,
            None => {
                drop(gb);
                drop(ga);
                thread::yield_now();
                continue;
            }
        };
        return MultiGuard3 {
            a: Some(ga),
            b: Some(gb),
            c: Some(gc),
        };
    }
}

/// Guard holding four simultaneously-acquired locks, released in reverse acquisition
/// order on drop.
pub struct MultiGuard4<'a, A: Lockable + 'a, B: Lockable + 'a, C: Lockable + 'a, D: Lockable + 'a>
{
    a: Option<A::Guard<'a>>,
    b: Option<B::Guard<'a>>,
    c: Option<C::Guard<'a>>,
    d: Option<D::Guard<'a>>,
}

impl<'a, A: Lockable, B: Lockable, C: Lockable, D: Lockable> MultiGuard4<'a, A, B, C, D> {
    /// Wraps four already-locked guards without acquiring anything.
    pub fn adopt(a: A::Guard<'a>, b: B::Guard<'a>, c: C::Guard<'a>, d: D::Guard<'a>) -> Self {
        Self {
            a: Some(a),
            b: Some(b),
            c: Some(c),
            d: Some(d),
        }
    }

    /// Returns references to the four held guards.
    pub fn guards(&self) -> (&A::Guard<'a>, &B::Guard<'a>, &C::Guard<'a>, &D::Guard<'a>) {
        (
            self.a.as_ref().unwrap(),
            self.b.as_ref().unwrap(),
            self.c.as_ref().unwrap(),
            self.d.as_ref().unwrap(),
        )
    }

    /// Returns mutable references to the four held guards.
    pub fn guards_mut(
        &mut self,
    ) -> (
        &mut A::Guard<'a>,
        &mut B::Guard<'a>,
        &mut C::Guard<'a>,
        &mut D::Guard<'a>,
    ) {
        (
            self.a.as_mut().unwrap(),
            self.b.as_mut().unwrap(),
            self.c.as_mut().unwrap(),
            self.d.as_mut().unwrap(),
        )
    }
}

impl<A: Lockable, B: Lockable, C: Lockable, D: Lockable> Drop for MultiGuard4<'_, A, B, C, D> {
    fn drop(&mut self) {
        self.d.take();
        self.c.take();
        self.b.take();
        self.a.take();
    }
}

/// Acquires `a`, `b`, `c`, and `d` atomically (all-or-nothing, with retry on contention).
pub fn acquire4<'a, A: Lockable, B: Lockable, C: Lockable, D: Lockable>(
    a: &'a A,
    b: &'a B,
    c: &'a C,
    d: &'a D,
) -> MultiGuard4<'a, A, B, C, D> {
    loop {
        let ga = a.lock();
        let gb = match b.try_lock() {
            Some(g) => g,
            None => {
                drop(ga);
                thread::yield_now();
                continue;
            }
        };
        let gc = match c.try_lock() {
            Some(g) => g,
            None => {
                drop(gb);
                drop(ga);
                thread::yield_now();
                continue;
            }
        };
        let gd = match d.try_lock() {
            Some(g) => g,
            None => {
                drop(gc);
                drop(gb);
                drop(ga);
                thread::yield_now();
                continue;
            }
        };
        return MultiGuard4 {
            a: Some(ga),
            b: Some(gb),
            c: Some(gc),
            d: Some(gd),
        };
    }
}

/// Tuple-based entry point: `acquire((&a, &b))`, `acquire((&a, &b, &c))`, or
/// `acquire((&a, &b, &c, &d))`.
pub trait MultiLock<'a> {
    /// The combined guard type for this tuple's lockables.
    type Guards;

    /// Acquires every lockable in the tuple, all-or-nothing.
    fn acquire(self) -> Self::Guards;
}

/// Degenerate zero-lock case: acquires nothing, returns immediately.
impl<'a> MultiLock<'a> for () {
    type Guards = ();

    fn acquire(self) {}
}

/// Degenerate single-lock case: a plain blocking `lock`, no retry loop needed since
/// there is nothing else to roll back on failure.
impl<'a, A: Lockable + 'a> MultiLock<'a> for (&'a A,) {
    type Guards = A::Guard<'a>;

    fn acquire(self) -> Self::Guards {
        self.0.lock()
    }
}

impl<'a, A: Lockable + 'a, B: Lockable + 'a> MultiLock<'a> for (&'a A, &'a B) {
    type Guards = MultiGuard2<'a, A, B>;

    fn acquire(self) -> Self::Guards {
        acquire2(self.0, self.1)
    }
}

impl<'a, A: Lockable + 'a, B: Lockable + 'a, C: Lockable + 'a> MultiLock<'a>
    for (&'a A, &'a B, &'a C)
{
    type Guards = MultiGuard3<'a, A, B, C>;

    fn acquire(self) -> Self::Guards {
        acquire3(self.0, self.1, self.2)
    }
}

impl<'a, A: Lockable + 'a, B: Lockable + 'a, C: Lockable + 'a, D: Lockable + 'a> MultiLock<'a>
    for (&'a A, &'a B, &'a C, &'a D)
{
    type Guards = MultiGuard4<'a, A, B, C, D>;

    fn acquire(self) -> Self::Guards {
        acquire4(self.0, self.1, self.2, self.3)
    }
}

/// Acquires every lockable in `locks`, all-or-nothing, deadlock-free against any other
/// caller acquiring the same locks in a different order.
pub fn acquire<'a, T: MultiLock<'a>>(locks: T) -> T::Guards {
    locks.acquire()
}

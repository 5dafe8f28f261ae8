//! An elastic worker pool built on [`TaskQueue`].
//!
//! The pool keeps between `min` and `max` worker threads alive, growing when the queue
//! backs up and shrinking non-core workers back down after an idle timeout. Workers never
//! unwind a task panic past the loop: plain submissions log and discard it, future-bearing
//! submissions route it to the caller through [`TaskHandle`].

pub mod queue;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::{debug, error, trace, warn};

use crate::error::{CapacityError, Error, Result};
use queue::{PopResult, Task, TaskQueue};

const DEFAULT_MIN_THREADS: usize = 2;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

// `idle_count` and `stopping` are touched by every worker on every wake-up; padding them
// to their own cache line only holds if `CachePadded` actually pads up to one.
static_assertions::const_assert!(
    std::mem::size_of::<CachePadded<AtomicUsize>>() >= 64
);

/// Builder for [`Pool`], validating capacity before any thread is spawned.
pub struct PoolBuilder {
    min_threads: usize,
    max_threads: usize,
    idle_timeout: Duration,
}

impl PoolBuilder {
    fn new() -> Self {
        Self {
            min_threads: DEFAULT_MIN_THREADS,
            max_threads: num_cpus::get().max(DEFAULT_MIN_THREADS),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Sets the lower bound on live workers. `0` is legal: a fully elastic pool with no
    /// core workers.
    pub fn min_threads(mut self, min_threads: usize) -> Self {
        self.min_threads = min_threads;
        self
    }

    /// Sets the upper bound on live workers. Must be at least `min_threads` and nonzero.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets how long a non-core worker waits for new work before it retires.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Validates the configuration and spawns the core workers.
    pub fn build(self) -> Result<Pool> {
        if self.max_threads == 0 {
            return Err(Error::CapacityMisconfigured(CapacityError::MaxIsZero));
        }
        if self.max_threads < self.min_threads {
            return Err(Error::CapacityMisconfigured(CapacityError::MaxBelowMin {
                min: self.min_threads,
                max: self.max_threads,
            }));
        }

        let inner = Arc::new(PoolInner {
            queue: Arc::new(TaskQueue::new()),
            workers: Mutex::new(Workers {
                active: BTreeMap::new(),
                dead: Vec::new(),
            }),
            idle_count: CachePadded::new(AtomicUsize::new(0)),
            stopping: CachePadded::new(AtomicBool::new(false)),
            next_worker_id: AtomicU64::new(0),
            min: self.min_threads,
            max: self.max_threads,
            idle_timeout: self.idle_timeout,
        });

        for _ in 0..self.min_threads {
            spawn_worker(&inner);
        }

        debug!(
            "pool built: min={} max={} idle_timeout={:?}",
            self.min_threads, self.max_threads, self.idle_timeout
        );

        Ok(Pool { inner })
    }
}

struct Workers {
    active: BTreeMap<u64, JoinHandle<()>>,
    dead: Vec<JoinHandle<()>>,
}

struct PoolInner {
    queue: Arc<TaskQueue>,
    workers: Mutex<Workers>,
    idle_count: CachePadded<AtomicUsize>,
    stopping: CachePadded<AtomicBool>,
    next_worker_id: AtomicU64,
    min: usize,
    max: usize,
    idle_timeout: Duration,
}

/// An elastic pool of worker threads draining a shared [`TaskQueue`].
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// A handle to a task submitted through [`Pool::submit`], yielding its result (or
/// [`Error::TaskPanicked`] if the task panicked) once it has run.
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<std::thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run, returning its result.
    pub fn join(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::TaskPanicked),
            // The sender was dropped without ever sending: the pool was stopped before
            // the task could run.
            Err(_) => Err(Error::Stopped),
        }
    }
}

impl Pool {
    /// Starts building a pool. Defaults: `min_threads = 2`, `max_threads =
    /// num_cpus::get()`, `idle_timeout = 2s`.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Builds a pool with the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Submits a fire-and-forget task to the back of the normal queue.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.push(Box::new(task))?;
        self.expand();
        Ok(())
    }

    /// Submits a fire-and-forget task ahead of anything already queued in the normal FIFO.
    pub fn spawn_priority<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.push_priority(Box::new(task))?;
        self.expand();
        Ok(())
    }

    /// Submits a fire-and-forget task that becomes eligible to run after `delay`.
    pub fn spawn_after<F>(&self, delay: Duration, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_at(Instant::now() + delay, task)
    }

    /// Submits a fire-and-forget task that becomes eligible to run at `deadline`.
    pub fn spawn_at<F>(&self, deadline: Instant, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.push_delay(Box::new(task), deadline)?;
        self.expand();
        Ok(())
    }

    /// Submits a task and returns a [`TaskHandle`] that yields its result.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let boxed: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            // The receiver may already be gone if the caller dropped the handle; that's
            // fine, the result is simply discarded.
            let _ = tx.send(result);
        });
        self.inner.queue.push(boxed)?;
        self.expand();
        Ok(TaskHandle { rx })
    }

    /// Number of tasks currently queued (not yet dispatched to a worker).
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of currently live worker threads (core and elastic).
    pub fn active_threads(&self) -> usize {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .len()
    }

    fn expand(&self) {
        expand(&self.inner);
    }

    /// Stops accepting work and blocks until every already-accepted task (normal,
    /// priority, or delayed) has executed and every worker has exited.
    ///
    /// Idempotent: a second call observes `stopping` already set and simply waits for the
    /// same drain to finish.
    pub fn stop(&self) {
        let already_stopping = self.inner.stopping.swap(true, Ordering::AcqRel);
        self.inner.queue.stop();

        if already_stopping {
            trace!("pool stop: already in progress, waiting for drain");
        }

        let to_join = {
            let mut workers = self
                .inner
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let mut all: Vec<JoinHandle<()>> =
                std::mem::take(&mut workers.active).into_values().collect();
            all.extend(std::mem::take(&mut workers.dead));
            all
        };

        for handle in to_join {
            if let Err(payload) = handle.join() {
                warn!("pool stop: worker thread panicked: {payload:?}");
            }
        }

        debug!("pool stopped, all workers joined");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(inner: &Arc<PoolInner>) {
    let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let inner_for_thread = inner.clone();
    let handle = thread::Builder::new()
        .name(format!("fairlock-pool-{id}"))
        .spawn(move || worker_loop(inner_for_thread, id))
        .expect("failed to spawn pool worker thread");

    let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
    workers.active.insert(id, handle);
    inner.idle_count.fetch_add(1, Ordering::AcqRel);
    trace!("worker {id} spawned");
}

fn worker_loop(inner: Arc<PoolInner>, id: u64) {
    loop {
        match inner.queue.pop(inner.idle_timeout) {
            PopResult::Ready(task) => {
                inner.idle_count.fetch_sub(1, Ordering::AcqRel);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!("worker {id}: task panicked: {payload:?}");
                }
                inner.idle_count.fetch_add(1, Ordering::AcqRel);
            }
            PopResult::Stopped => {
                inner.idle_count.fetch_sub(1, Ordering::AcqRel);
                retire(&inner, id);
                debug!("worker {id} exiting: queue stopped and drained");
                break;
            }
            PopResult::Timeout => {
                let stopping = inner.stopping.load(Ordering::Acquire);
                let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
                let active = workers.active.len();

                // Delayed tasks must survive `stop()`: a worker idling past the timeout
                // while stopping only retires if enough workers remain to cover a
                // pending delayed task, or there is none left to cover.
                let retire_now = if stopping {
                    active > inner.min || !inner.queue.has_pending_delayed()
                } else {
                    active > inner.min
                };

                if retire_now {
                    if let Some(handle) = workers.active.remove(&id) {
                        workers.dead.push(handle);
                    }
                    drop(workers);
                    inner.idle_count.fetch_sub(1, Ordering::AcqRel);
                    debug!("worker {id} exiting on idle timeout (stopping={stopping})");
                    break;
                }

                trace!("worker {id} idle timeout; staying as core capacity");
            }
        }
    }
}

fn retire(inner: &Arc<PoolInner>, id: u64) {
    let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = workers.active.remove(&id) {
        workers.dead.push(handle);
    }
}

fn expand(inner: &Arc<PoolInner>) {
    {
        let pending = inner.queue.len();
        let idle = inner.idle_count.load(Ordering::Acquire);
        let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        let active = workers.active.len();

        // With `min_threads(0)` a pool can sit at zero live workers; the general
        // `pending > idle + 1` guard never trips at `idle == 0, pending == 1`, so the
        // very first submission would otherwise have nobody to drain it. Force a single
        // spawn whenever there is work and nothing alive to pick it up.
        let starting_from_empty = active == 0 && pending > 0;

        if active < inner.max && (pending > idle + 1 || starting_from_empty) {
            let room = inner.max - active;
            let backlog = if starting_from_empty {
                1
            } else {
                pending - idle
            };
            let to_spawn = backlog.min(room);
            if to_spawn > 0 {
                debug!(
                    "pool expanding: active={active} pending={pending} idle={idle}, spawning {to_spawn}"
                );
                for _ in 0..to_spawn {
                    let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
                    let inner_for_thread = inner.clone();
                    let handle = thread::Builder::new()
                        .name(format!("fairlock-pool-{id}"))
                        .spawn(move || worker_loop(inner_for_thread, id))
                        .expect("failed to spawn pool worker thread");
                    workers.active.insert(id, handle);
                    inner.idle_count.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }
    reap(inner);
}

fn reap(inner: &Arc<PoolInner>) {
    let dead = match inner.workers.try_lock() {
        Ok(mut workers) if !workers.dead.is_empty() => std::mem::take(&mut workers.dead),
        _ => return,
    };

    for handle in dead {
        if let Err(payload) = handle.join() {
            warn!("pool reaper: worker thread panicked: {payload:?}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Once};

    static LOG_INIT: Once = Once::new();

    fn init_logging() {
        LOG_INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    #[test]
    fn rejects_zero_max_threads() {
        let err = Pool::builder().max_threads(0).build().unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityMisconfigured(CapacityError::MaxIsZero)
        ));
    }

    #[test]
    fn rejects_max_below_min() {
        let err = Pool::builder()
            .min_threads(4)
            .max_threads(2)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityMisconfigured(CapacityError::MaxBelowMin { min: 4, max: 2 })
        ));
    }

    #[test]
    fn spawn_runs_tasks() {
        let pool = Pool::builder()
            .min_threads(2)
            .max_threads(4)
            .idle_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        pool.stop();
    }

    #[test]
    fn submit_returns_value() {
        let pool = Pool::builder()
            .min_threads(1)
            .max_threads(2)
            .build()
            .unwrap();
        let handle = pool.submit(|| 2 + 2).unwrap();
        assert_eq!(handle.join().unwrap(), 4);
        pool.stop();
    }

    #[test]
    fn submit_surfaces_panics_through_the_handle() {
        let pool = Pool::builder()
            .min_threads(1)
            .max_threads(2)
            .build()
            .unwrap();
        let handle = pool.submit(|| -> i32 { panic!("boom") }).unwrap();
        assert!(matches!(handle.join(), Err(Error::TaskPanicked)));
        pool.stop();
    }

    /// Scenario: a burst of slow tasks drives the pool from `min` up toward `max`, and it
    /// scales back down to `min` once the backlog has drained and workers have sat idle
    /// past `idle_timeout`.
    #[test]
    fn elastic_scale_up_and_back_down() {
        init_logging();
        let pool = Pool::builder()
            .min_threads(2)
            .max_threads(10)
            .idle_timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        for _ in 0..20 {
            pool.spawn(|| thread::sleep(Duration::from_millis(500)))
                .unwrap();
        }

        let scale_up_deadline = Instant::now() + Duration::from_secs(2);
        let mut peak = pool.active_threads();
        while Instant::now() < scale_up_deadline {
            peak = peak.max(pool.active_threads());
            if peak == 10 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(peak, 10);

        let scale_down_deadline = Instant::now() + Duration::from_secs(4);
        while pool.active_threads() > 2 && Instant::now() < scale_down_deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(pool.active_threads(), 2);

        pool.stop();
    }

    /// Scenario: a pool with `min_threads(0)` starts with no workers at all. Its very
    /// first submission must still spawn someone to pick it up, rather than sitting in
    /// the queue forever with `active_threads() == 0`.
    #[test]
    fn zero_min_threads_spawns_a_worker_for_the_first_task() {
        let pool = Pool::builder()
            .min_threads(0)
            .max_threads(4)
            .idle_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        assert_eq!(pool.active_threads(), 0);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_for_task = ran.clone();
        pool.spawn(move || {
            ran_for_task.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while ran.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.stop();
    }

    /// Scenario: `stop()` only returns after every already-accepted task, including
    /// delayed ones, has actually executed.
    #[test]
    fn stop_drains_normal_and_delayed_tasks() {
        let pool = Pool::builder()
            .min_threads(1)
            .max_threads(4)
            .idle_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let ran = ran.clone();
            pool.spawn(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        for _ in 0..5 {
            let ran = ran.clone();
            pool.spawn_after(Duration::from_millis(200), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 15);
    }
}

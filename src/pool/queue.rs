//! The blocking task queue backing [`crate::pool::Pool`].
//!
//! Three submission modes feed two underlying structures: a plain FIFO (`normal`, with a
//! single "jump the line" priority level that prepends instead of appending) and a
//! delay heap keyed by absolute deadline. `pop` drains whichever is ready first,
//! preferring an overdue delayed task over the FIFO, and otherwise parks the calling
//! thread until the nearer of "a delayed task becomes due" or "the idle timeout expires".

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{Error, Result};

/// A unit of work submitted to the queue: an owned, one-shot closure.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of a [`TaskQueue::pop`] call.
pub enum PopResult {
    /// A task is ready to run.
    Ready(Task),
    /// The queue was stopped and both the FIFO and the delay heap have drained.
    Stopped,
    /// No task became ready before the idle timeout elapsed.
    Timeout,
}

struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // BinaryHeap is a max-heap; we want the *earliest* deadline on top, so this is
    // reversed relative to natural deadline order. `seq` breaks ties in submission
    // order so equal deadlines behave deterministically.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    normal: VecDeque<Task>,
    delayed: BinaryHeap<DelayedTask>,
    stopped: bool,
    next_seq: u64,
}

/// A FIFO + priority + delay task queue shared between submitters and worker threads.
pub struct TaskQueue {
    state: Mutex<Shared>,
    cond: Condvar,
}

impl TaskQueue {
    /// Creates a new, empty, running queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Shared {
                normal: VecDeque::new(),
                delayed: BinaryHeap::new(),
                stopped: false,
                next_seq: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `task` to the back of the normal FIFO.
    pub fn push(&self, task: Task) -> Result<()> {
        let mut state = self.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        state.normal.push_back(task);
        drop(state);
        self.cond.notify_one();
        Ok(())
    }

    /// Prepends `task` to the normal FIFO: it runs before anything already queued there,
    /// but still behind any already-overdue delayed task.
    pub fn push_priority(&self, task: Task) -> Result<()> {
        let mut state = self.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        state.normal.push_front(task);
        drop(state);
        self.cond.notify_one();
        Ok(())
    }

    /// Schedules `task` to become ready at `deadline`.
    pub fn push_delay(&self, task: Task, deadline: Instant) -> Result<()> {
        let mut state = self.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(DelayedTask {
            deadline,
            seq,
            task,
        });
        drop(state);
        self.cond.notify_one();
        Ok(())
    }

    /// Number of tasks currently queued (normal + delayed, regardless of readiness).
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.normal.len() + state.delayed.len()
    }

    /// Whether any delayed task is still queued, ready or not.
    pub fn has_pending_delayed(&self) -> bool {
        !self.lock().delayed.is_empty()
    }

    /// Marks the queue stopped: subsequent `push*` calls fail with [`Error::Stopped`].
    /// Already-queued tasks remain drainable; `pop` only returns `Stopped` once both
    /// structures are empty.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Waits for the next ready task, an idle timeout, or a stop signal.
    pub fn pop(&self, idle_timeout: Duration) -> PopResult {
        let arrival = Instant::now();
        let arrival_deadline = arrival + idle_timeout;
        let mut state = self.lock();

        loop {
            let now = Instant::now();

            if let Some(top) = state.delayed.peek() {
                if top.deadline <= now {
                    let dt = state.delayed.pop().expect("just peeked");
                    trace!("queue: delayed task became ready");
                    return PopResult::Ready(dt.task);
                }
            }

            if let Some(task) = state.normal.pop_front() {
                return PopResult::Ready(task);
            }

            if state.stopped && state.normal.is_empty() && state.delayed.is_empty() {
                return PopResult::Stopped;
            }

            let next_delay_deadline = state.delayed.peek().map(|dt| dt.deadline);
            let wait_until = match next_delay_deadline {
                Some(d) if d < arrival_deadline => d,
                _ => arrival_deadline,
            };

            let now = Instant::now();
            if wait_until <= now {
                if wait_until >= arrival_deadline {
                    trace!("queue: pop timed out after {idle_timeout:?}");
                    return PopResult::Timeout;
                }
                // The delay deadline we were waiting for is already due; loop back to
                // the top so it is popped as `Ready` rather than spuriously reported as
                // a timeout.
                continue;
            }

            let (guard, _) = self
                .cond
                .wait_timeout(state, wait_until - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let q = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            q.push(Box::new(move || log.lock().unwrap().push(i))).unwrap();
        }

        for _ in 0..5 {
            match q.pop(Duration::from_millis(10)) {
                PopResult::Ready(t) => t(),
                _ => panic!("expected Ready"),
            }
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn priority_jumps_the_line() {
        let q = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            q.push(Box::new(move || log.lock().unwrap().push(i))).unwrap();
        }
        {
            let log = log.clone();
            q.push_priority(Box::new(move || log.lock().unwrap().push(99)))
                .unwrap();
        }

        for _ in 0..4 {
            match q.pop(Duration::from_millis(10)) {
                PopResult::Ready(t) => t(),
                _ => panic!("expected Ready"),
            }
        }

        assert_eq!(*log.lock().unwrap(), vec![99, 0, 1, 2]);
    }

    #[test]
    fn delay_task_does_not_execute_before_its_deadline() {
        let q = TaskQueue::new();
        let fired_at = Arc::new(Mutex::new(None));
        let deadline = Instant::now() + Duration::from_millis(150);

        {
            let fired_at = fired_at.clone();
            q.push_delay(
                Box::new(move || *fired_at.lock().unwrap() = Some(Instant::now())),
                deadline,
            )
            .unwrap();
        }

        match q.pop(Duration::from_secs(2)) {
            PopResult::Ready(t) => t(),
            _ => panic!("expected Ready"),
        }

        assert!(fired_at.lock().unwrap().unwrap() >= deadline);
    }

    #[test]
    fn pop_times_out_when_idle() {
        let q = TaskQueue::new();
        let start = Instant::now();
        match q.pop(Duration::from_millis(50)) {
            PopResult::Timeout => {}
            _ => panic!("expected Timeout"),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn stop_drains_then_reports_stopped() {
        let q = Arc::new(TaskQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ran = ran.clone();
            q.push(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        q.stop();
        assert!(matches!(q.push(Box::new(|| {})), Err(Error::Stopped)));

        for _ in 0..3 {
            match q.pop(Duration::from_millis(10)) {
                PopResult::Ready(t) => t(),
                _ => panic!("expected Ready while draining"),
            }
        }

        assert!(matches!(q.pop(Duration::from_millis(10)), PopResult::Stopped));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_push_and_pop() {
        let q = Arc::new(TaskQueue::new());
        let total = Arc::new(AtomicUsize::new(0));

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    q.push(Box::new(|| {})).unwrap();
                }
            })
        };

        let consumer = {
            let q = q.clone();
            let total = total.clone();
            thread::spawn(move || {
                let mut seen = 0;
                while seen < 200 {
                    if let PopResult::Ready(t) = q.pop(Duration::from_millis(200)) {
                        t();
                        seen += 1;
                        total.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 200);
    }
}

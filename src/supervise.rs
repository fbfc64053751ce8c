//! Cooperative cancellation and completion tracking for pipeline tasks.
//!
//! Every pipeline instance runs two restart loops on their own threads. They
//! share a [`CancelToken`] that is checked at iteration boundaries, and each
//! loop holds a [`TaskGuard`] from a shared [`TaskGroup`] so the owning process
//! can wait for every loop to wind down before it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation flag.
///
/// A child token observes its parent: cancelling the parent cancels every
/// child, cancelling a child leaves the parent running.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token scoped to a single iteration of a loop owned by `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns true when the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Counter of running tasks, decremented when each task's guard drops.
#[derive(Clone, Debug, Default)]
pub struct TaskGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. Completion is signalled once, when the guard drops.
    pub fn enter(&self) -> TaskGuard {
        let (count, _) = &*self.inner;
        *count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        TaskGuard {
            group: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        let (count, _) = &*self.inner;
        *count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every registered task has completed.
    pub fn wait(&self) {
        let (count, done) = &*self.inner;
        let mut active = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *active > 0 {
            active = done.wait(active).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`TaskGroup::wait`] but gives up after `timeout`.
    ///
    /// Returns true when every task completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (count, done) = &*self.inner;
        let active = count.lock().unwrap_or_else(PoisonError::into_inner);
        let (active, _) = done
            .wait_timeout_while(active, timeout, |active| *active > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *active == 0
    }

    fn leave(&self) {
        let (count, done) = &*self.inner;
        let mut active = count.lock().unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
        if *active == 0 {
            done.notify_all();
        }
    }
}

/// Held by a running task; dropping it marks the task complete.
#[derive(Debug)]
pub struct TaskGuard {
    group: TaskGroup,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.group.leave();
    }
}

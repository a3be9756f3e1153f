//! Deferred execution for sync flushes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::traits::{Scheduler, Task};

/// Explicitly drained FIFO queue.
///
/// Tasks run only when [`run_until_idle`](Self::run_until_idle) is called,
/// which makes flush timing deterministic. Clones share one queue.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use tabstore::{Scheduler, TaskQueue};
///
/// let queue = TaskQueue::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let h = hits.clone();
/// queue.schedule(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }));
///
/// assert_eq!(hits.load(Ordering::SeqCst), 0);
/// assert_eq!(queue.run_until_idle(), 1);
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run tasks until the queue is empty, including tasks scheduled by the
    /// tasks themselves. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // The lock is released before the task runs so it can schedule more.
            let next = self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, task: Task) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio")]
impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self, crate::BackendError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| crate::BackendError::Unavailable(e.to_string()))
    }
}

#[cfg(feature = "tokio")]
impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        // Flushes block on storage I/O.
        self.handle.spawn_blocking(task);
    }
}

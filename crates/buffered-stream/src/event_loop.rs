//! Cooperative scheduler that runs deferred work on a later turn.
//!
//! ## Turns
//!
//! Every call to [`EventLoop::run_turn`] runs the tasks that were queued
//! before the turn started, in FIFO order. Tasks deferred while a turn is
//! running land in the next turn, which is what "later turn" means for
//! stream flushing: a stream that re-arms its flush yields to everybody
//! else that was already waiting.
//!
//! There is no parallelism: tasks run one after another on the thread that
//! drives the loop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Host primitive for deferring a callback to a later turn.
pub trait Scheduler: Send + Sync {
    /// Queue `task` to run after the current turn has finished.
    fn defer(&self, task: Task);
}

/// FIFO task queue driven turn by turn.
pub struct EventLoop {
    queue: Mutex<VecDeque<Task>>,
    len: AtomicUsize,
}

impl EventLoop {
    /// Create a new event loop.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, task: Task) {
        self.queue.lock().push_back(task);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True when no task is queued.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Run one turn. Returns how many tasks ran.
    pub fn run_turn(&self) -> usize {
        let batch: Vec<Task> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        let count = batch.len();
        if count != 0 {
            self.len.fetch_sub(count, Ordering::Relaxed);
        }
        tracing::trace!(tasks = count, "event loop turn");

        // Lock is released: tasks may defer more work.
        for task in batch {
            task();
        }
        count
    }

    /// Run turns until nothing is queued. Returns the total number of tasks
    /// that ran.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        while !self.is_idle() {
            total += self.run_turn();
        }
        total
    }

    /// Run until idle, yielding to the tokio scheduler between turns.
    pub async fn run_until_complete_async(&self) {
        while !self.is_idle() {
            self.run_turn();
            tokio::task::yield_now().await;
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }
}

impl Scheduler for EventLoop {
    fn defer(&self, task: Task) {
        self.push(task);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

//! Where listener callbacks and async commits run.
//!
//! A [`Dispatcher`] accepts boxed tasks. Two implementations are provided:
//!
//! - [`InlineDispatcher`] runs each task immediately on the calling thread.
//!   Tests use it to get deterministic delivery.
//! - [`PooledDispatcher`] runs tasks on a fixed pool of worker threads with a
//!   priority queue and a bounded depth.
//!
//! [`SerialQueue`] layers per-consumer FIFO order on top of any dispatcher, so
//! one listener sees its callbacks in order even on a multi-threaded pool.

use mvstm_core::{StmError, StmResult};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, warn};

/// Unit of work handed to a dispatcher
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Priority levels for dispatched work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Housekeeping
    Low = 0,
    /// Async commits and `run_async` bodies
    Normal = 1,
    /// Listener deliveries
    High = 2,
}

/// Error returned when a dispatcher cannot take a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackpressureError {
    /// Queue is at capacity
    #[error("dispatcher queue is full")]
    QueueFull,
    /// Dispatcher has been shut down
    #[error("dispatcher is shut down")]
    ShutDown,
}

impl From<BackpressureError> for StmError {
    fn from(e: BackpressureError) -> Self {
        StmError::Rejected(e.to_string())
    }
}

/// Dispatcher metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Number of tasks waiting in the queue.
    pub queue_depth: usize,
    /// Number of tasks currently executing.
    pub active_tasks: usize,
    /// Total number of tasks completed, panicked ones included.
    pub tasks_completed: u64,
    /// Number of worker threads (0 for inline).
    pub worker_count: usize,
}

/// Executes tasks, inline or on other threads
pub trait Dispatcher: Send + Sync {
    /// Run `task` at normal priority
    fn execute(&self, task: Task) -> Result<(), BackpressureError> {
        self.execute_with_priority(TaskPriority::Normal, task)
    }

    /// Run `task` at the given priority
    fn execute_with_priority(&self, priority: TaskPriority, task: Task) -> Result<(), BackpressureError>;

    /// Block until every task accepted so far has finished
    fn drain(&self) {}

    /// Stop accepting tasks and release workers. Queued tasks still run.
    fn shutdown(&self) {}

    /// Current metrics
    fn stats(&self) -> DispatcherStats;
}

/// Runs a task, logging instead of unwinding into the caller
fn run_guarded(task: Task) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        error!(
            target: "mvstm::notify",
            "dispatched task panicked: {:?}",
            e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
        );
    }
}

// ============================================================================
// Inline
// ============================================================================

/// Runs every task synchronously on the caller's thread
#[derive(Debug, Default)]
pub struct InlineDispatcher {
    completed: AtomicU64,
}

impl InlineDispatcher {
    /// Create an inline dispatcher
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for InlineDispatcher {
    fn execute_with_priority(&self, _priority: TaskPriority, task: Task) -> Result<(), BackpressureError> {
        run_guarded(task);
        self.completed.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            tasks_completed: self.completed.load(AtomicOrdering::Relaxed),
            ..DispatcherStats::default()
        }
    }
}

static INLINE: Lazy<Arc<InlineDispatcher>> = Lazy::new(|| Arc::new(InlineDispatcher::new()));

/// Process-wide inline dispatcher
pub fn inline_dispatcher() -> Arc<dyn Dispatcher> {
    INLINE.clone()
}

// ============================================================================
// Pooled
// ============================================================================

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    work: Task,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PoolInner {
    queue: Mutex<BinaryHeap<TaskEnvelope>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

/// Fixed pool of worker threads with a priority queue.
///
/// Higher-priority tasks run first; within the same priority, tasks start in
/// FIFO order.
pub struct PooledDispatcher {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl std::fmt::Debug for PooledDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDispatcher")
            .field("workers", &self.num_threads)
            .field("max_queue_depth", &self.inner.max_queue_depth)
            .finish()
    }
}

impl PooledDispatcher {
    /// Create a pool with `num_threads` workers (at least one).
    ///
    /// Workers are named `mvstm-worker-0`, `mvstm-worker-1`, etc.
    ///
    /// # Errors
    /// Returns `StmError::Io` if a worker thread cannot be spawned.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> StmResult<Self> {
        let num_threads = num_threads.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let pool = PooledDispatcher {
            inner,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            num_threads,
        };
        for i in 0..num_threads {
            let inner = Arc::clone(&pool.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("mvstm-worker-{}", i))
                .spawn(move || worker_loop(&inner));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    // joins the workers already started
                    pool.shutdown();
                    return Err(StmError::Io(e));
                }
            }
        }
        Ok(pool)
    }
}

impl Dispatcher for PooledDispatcher {
    fn execute_with_priority(&self, priority: TaskPriority, task: Task) -> Result<(), BackpressureError> {
        // Reject after shutdown: workers have been joined, the task would never run
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(BackpressureError::ShutDown);
        }
        if self.inner.queue_depth.load(AtomicOrdering::Acquire) >= self.inner.max_queue_depth {
            return Err(BackpressureError::QueueFull);
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut queue = self.inner.queue.lock();
            queue.push(TaskEnvelope {
                priority,
                sequence,
                work: task,
            });
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Workers remain running after drain completes.
    fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Notify under the queue lock: a worker between its shutdown check and
        // its wait holds this lock, so it cannot miss the wakeup.
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        let current = std::thread::current().id();
        for handle in workers.drain(..) {
            // a task shutting down its own pool cannot join itself
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for PooledDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_tasks` and wakes drain waiters, even if the task panicked.
struct ActiveTaskGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);

        // Notify under the queue lock: drain() checks its condition holding it.
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard { inner };
        run_guarded(task.work);
    }
}

// ============================================================================
// Serial queue
// ============================================================================

struct SerialState {
    pending: VecDeque<Task>,
    running: bool,
}

/// FIFO lane on top of a dispatcher.
///
/// Tasks pushed to one queue run one at a time, in push order, whatever the
/// underlying dispatcher does. A task pushed while the lane runs (including
/// from inside one of its own tasks) is picked up by the current run.
pub struct SerialQueue {
    dispatcher: Arc<dyn Dispatcher>,
    state: Arc<Mutex<SerialState>>,
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SerialQueue")
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}

impl SerialQueue {
    /// Lane running its tasks on `dispatcher`
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        SerialQueue {
            dispatcher,
            state: Arc::new(Mutex::new(SerialState {
                pending: VecDeque::new(),
                running: false,
            })),
        }
    }

    /// Dispatcher the lane runs on
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Tasks queued and not started
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Queue `task` behind everything pushed before it
    pub fn push(&self, task: Task) {
        {
            let mut state = self.state.lock();
            state.pending.push_back(task);
            if state.running {
                return;
            }
            state.running = true;
        }
        let state = Arc::clone(&self.state);
        let run: Task = Box::new(move || run_lane(&state));
        if let Err(e) = self.dispatcher.execute_with_priority(TaskPriority::High, run) {
            // never drop deliveries: fall back to the caller's thread
            warn!(target: "mvstm::notify", error = %e, "Dispatcher refused serial lane, running inline");
            run_lane(&self.state);
        }
    }
}

fn run_lane(state: &Mutex<SerialState>) {
    loop {
        let task = {
            let mut state = state.lock();
            match state.pending.pop_front() {
                Some(task) => task,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
        run_guarded(task);
    }
}

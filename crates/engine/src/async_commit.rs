//! Commits that report through callbacks
//!
//! `commit_async` hands a finished transaction to a dispatcher and reports
//! the `CommitStatus` later. `run_async` runs a transaction body on the
//! dispatcher and retries it on conflict. Neither blocks the caller.
//!
//! A task the dispatcher never runs (queue full, shut down) reports
//! `StmError::Cancelled` to its callback when it is dropped.

use crate::dispatcher::{Dispatcher, Task};
use mvstm_concurrency::{CommitStatus, StartFlags, Transaction, Trunk};
use mvstm_core::{StmError, StmResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Receives the result of an asynchronous operation, exactly once
pub trait AsyncCallback<T>: Send + 'static {
    /// The operation finished
    fn on_success(self: Box<Self>, result: T);
    /// The operation failed, was cancelled, or its connection closed
    fn on_failure(self: Box<Self>, error: StmError);
}

struct FnCallback<F>(F);

impl<T, F> AsyncCallback<T> for FnCallback<F>
where
    F: FnOnce(StmResult<T>) + Send + 'static,
{
    fn on_success(self: Box<Self>, result: T) {
        (self.0)(Ok(result))
    }

    fn on_failure(self: Box<Self>, error: StmError) {
        (self.0)(Err(error))
    }
}

/// Callback from a closure over the result
pub fn callback_fn<T, F>(f: F) -> Box<dyn AsyncCallback<T>>
where
    T: 'static,
    F: FnOnce(StmResult<T>) + Send + 'static,
{
    Box::new(FnCallback(f))
}

// ============================================================================
// Completion
// ============================================================================

struct CompletionState<T> {
    result: Mutex<Option<StmResult<T>>>,
    done: Condvar,
}

/// Blocking handle on the result of an asynchronous operation
pub struct Completion<T> {
    state: Arc<CompletionState<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Completion<T> {
    /// A callback and the handle it completes
    pub fn pair() -> (Box<dyn AsyncCallback<T>>, Completion<T>) {
        let completion = Completion {
            state: Arc::new(CompletionState {
                result: Mutex::new(None),
                done: Condvar::new(),
            }),
        };
        let state = Arc::clone(&completion.state);
        let callback = callback_fn(move |result| {
            *state.result.lock() = Some(result);
            state.done.notify_all();
        });
        (callback, completion)
    }

    /// True once the result arrived
    pub fn is_done(&self) -> bool {
        self.state.result.lock().is_some()
    }

    /// Block until the result arrives and take it
    pub fn wait(self) -> StmResult<T> {
        let mut result = self.state.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            self.state.done.wait(&mut result);
        }
    }

    /// Block for at most `timeout`; `None` if the result has not arrived
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StmResult<T>> {
        let mut result = self.state.result.lock();
        if result.is_none() {
            self.state.done.wait_for(&mut result, timeout);
        }
        result.take()
    }
}

// ============================================================================
// Callback slot
// ============================================================================

/// Reports `Cancelled` if dropped before a result was delivered
struct Pending<T: 'static> {
    callback: Option<Box<dyn AsyncCallback<T>>>,
    stats: Arc<AsyncStats>,
}

impl<T: 'static> Pending<T> {
    fn complete(mut self, result: StmResult<T>) {
        if let Some(callback) = self.callback.take() {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(value) => callback.on_success(value),
                Err(e) => callback.on_failure(e),
            }
        }
    }
}

impl<T: 'static> Drop for Pending<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            callback.on_failure(StmError::Cancelled);
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Counters of asynchronous operations
#[derive(Debug, Default)]
pub struct AsyncStats {
    /// Tasks handed to a dispatcher
    pub submitted: AtomicU64,
    /// Tasks that reported a result
    pub completed: AtomicU64,
    /// Tasks dropped without running
    pub cancelled: AtomicU64,
}

/// Options for `run_async`
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Flags for each attempt's transaction
    pub flags: StartFlags,
    /// Attempts before giving up on conflicts
    pub max_attempts: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            flags: StartFlags::NONE,
            max_attempts: 16,
        }
    }
}

/// Result of `run_async`
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    /// The body's transaction committed
    Committed {
        /// What the body returned on the committed attempt
        value: T,
        /// Sequence of the published map, `None` for a read-only body
        sequence: Option<u64>,
    },
    /// Every attempt conflicted
    Conflict {
        /// Attempts made
        attempts: u32,
    },
}

/// Submits commits and transaction bodies to a dispatcher
#[derive(Clone)]
pub struct AsyncRunner {
    dispatcher: Arc<dyn Dispatcher>,
    stats: Arc<AsyncStats>,
}

impl std::fmt::Debug for AsyncRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRunner")
            .field("stats", &self.stats)
            .finish()
    }
}

impl AsyncRunner {
    /// Runner on `dispatcher`
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::with_stats(dispatcher, Arc::new(AsyncStats::default()))
    }

    /// Runner sharing `stats` with other runners
    pub fn with_stats(dispatcher: Arc<dyn Dispatcher>, stats: Arc<AsyncStats>) -> Self {
        AsyncRunner { dispatcher, stats }
    }

    /// Counters
    pub fn stats(&self) -> &Arc<AsyncStats> {
        &self.stats
    }

    fn submit<T: 'static>(&self, callback: Box<dyn AsyncCallback<T>>, work: impl FnOnce(Pending<T>) + Send + 'static)
    where
        T: Send,
    {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let pending = Pending {
            callback: Some(callback),
            stats: Arc::clone(&self.stats),
        };
        let task: Task = Box::new(move || work(pending));
        // a refused task is dropped, and the slot reports Cancelled
        if let Err(e) = self.dispatcher.execute(task) {
            warn!(target: "mvstm::async", error = %e, "Async task refused by dispatcher");
        }
    }

    /// Commit `txn` on the dispatcher and report the status
    pub fn commit(&self, mut txn: Transaction, callback: Box<dyn AsyncCallback<CommitStatus>>) {
        self.submit(callback, move |pending| {
            let result = txn.commit();
            debug!(target: "mvstm::async", txn = txn.id(), result = ?result, "Async commit finished");
            pending.complete(result);
        });
    }

    /// Run `body` in a transaction on the dispatcher, retrying on conflict.
    ///
    /// An `Err` from the body aborts that attempt and is reported through
    /// `on_failure` without retrying.
    pub fn run<T, F>(
        &self,
        trunk: &Arc<Trunk>,
        options: RunOptions,
        mut body: F,
        callback: Box<dyn AsyncCallback<RunOutcome<T>>>,
    ) where
        T: Send + 'static,
        F: FnMut(&mut Transaction) -> StmResult<T> + Send + 'static,
    {
        let trunk = Arc::clone(trunk);
        self.submit(callback, move |pending| {
            let result = run_attempts(&trunk, options, &mut body);
            pending.complete(result);
        });
    }
}

pub(crate) fn run_attempts<T, F>(trunk: &Arc<Trunk>, options: RunOptions, body: &mut F) -> StmResult<RunOutcome<T>>
where
    F: FnMut(&mut Transaction) -> StmResult<T>,
{
    let max_attempts = options.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let mut txn = Transaction::start_with(trunk, options.flags);
        let value = match body(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                txn.abort();
                return Err(e);
            }
        };
        match txn.commit() {
            Ok(CommitStatus::Success) => {
                return Ok(RunOutcome::Committed {
                    value,
                    sequence: txn.committed_sequence(),
                })
            }
            Ok(CommitStatus::Conflict) => {
                debug!(target: "mvstm::async", attempt, "Async run conflicted, retrying");
            }
            Err(StmError::PublishContention { attempts }) if attempt < max_attempts => {
                debug!(target: "mvstm::async", attempt, attempts, "Async run lost the publish race, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(RunOutcome::Conflict {
        attempts: max_attempts,
    })
}

/// Commit `txn` on `dispatcher`, reporting through `callback`
pub fn commit_async(
    txn: Transaction,
    dispatcher: Arc<dyn Dispatcher>,
    callback: Box<dyn AsyncCallback<CommitStatus>>,
) {
    AsyncRunner::new(dispatcher).commit(txn, callback)
}

/// Run `body` on `dispatcher` with conflict retries, reporting through `callback`
pub fn run_async<T, F>(
    trunk: &Arc<Trunk>,
    dispatcher: Arc<dyn Dispatcher>,
    options: RunOptions,
    body: F,
    callback: Box<dyn AsyncCallback<RunOutcome<T>>>,
) where
    T: Send + 'static,
    F: FnMut(&mut Transaction) -> StmResult<T> + Send + 'static,
{
    AsyncRunner::new(dispatcher).run(trunk, options, body, callback)
}

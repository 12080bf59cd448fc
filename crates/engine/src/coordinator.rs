//! Engine-wide transaction metrics
//!
//! The coordinator keeps a weak list of every trunk the engine created and
//! the counters shared by all async runners. [`StmCoordinator::metrics`]
//! folds them into one [`StmMetrics`].

use crate::async_commit::AsyncStats;
use mvstm_concurrency::{Trunk, TrunkStatsSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Aggregates statistics of the engine's trunks
///
/// # Memory Ordering
///
/// The counters read here use Relaxed ordering. They are observational
/// only and never synchronize other memory, so a metrics call may see a
/// commit counted in one trunk and not yet in the async totals.
pub struct StmCoordinator {
    trunks: Mutex<Vec<Weak<Trunk>>>,
    async_stats: Arc<AsyncStats>,
    started_at: Instant,
}

impl std::fmt::Debug for StmCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StmCoordinator")
            .field("trunks", &self.trunks.lock().len())
            .field("async_stats", &self.async_stats)
            .finish()
    }
}

impl Default for StmCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl StmCoordinator {
    /// Empty coordinator
    pub fn new() -> Self {
        StmCoordinator {
            trunks: Mutex::new(Vec::new()),
            async_stats: Arc::new(AsyncStats::default()),
            started_at: Instant::now(),
        }
    }

    /// Counters shared by every async runner of the engine
    pub fn async_stats(&self) -> &Arc<AsyncStats> {
        &self.async_stats
    }

    /// Track `trunk` until it is dropped
    pub fn track(&self, trunk: &Arc<Trunk>) {
        let mut trunks = self.trunks.lock();
        trunks.retain(|t| t.strong_count() > 0);
        trunks.push(Arc::downgrade(trunk));
        debug!(target: "mvstm::engine", trunk = %trunk.id(), tracked = trunks.len(), "Tracking trunk");
    }

    /// Trunks still alive
    pub fn trunks(&self) -> Vec<Arc<Trunk>> {
        self.trunks.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Async tasks submitted and not yet finished
    pub fn async_in_flight(&self) -> u64 {
        let submitted = self.async_stats.submitted.load(Ordering::Relaxed);
        let done = self.async_stats.completed.load(Ordering::Relaxed)
            + self.async_stats.cancelled.load(Ordering::Relaxed);
        submitted.saturating_sub(done)
    }

    /// Wait until every submitted async task reported.
    ///
    /// Returns `false` if `timeout` expired first.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let sleep_duration = Duration::from_millis(1);

        while self.async_in_flight() > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(sleep_duration);
        }
        true
    }

    /// Current metrics
    pub fn metrics(&self) -> StmMetrics {
        let trunks = self.trunks();
        let mut totals = TrunkStatsSnapshot::default();
        for trunk in &trunks {
            let s = trunk.stats().snapshot();
            totals.started += s.started;
            totals.committed += s.committed;
            totals.conflicted += s.conflicted;
            totals.aborted += s.aborted;
            totals.publish_retries += s.publish_retries;
            totals.trims += s.trims;
            totals.rejected += s.rejected;
        }
        let commit_rate = if totals.started > 0 {
            totals.committed as f64 / totals.started as f64
        } else {
            0.0
        };
        StmMetrics {
            trunks: trunks.len(),
            transactions: totals,
            commit_rate,
            async_submitted: self.async_stats.submitted.load(Ordering::Relaxed),
            async_completed: self.async_stats.completed.load(Ordering::Relaxed),
            async_cancelled: self.async_stats.cancelled.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Engine metrics
#[derive(Debug, Clone)]
pub struct StmMetrics {
    /// Live trunks
    pub trunks: usize,
    /// Transaction counters summed over live trunks
    pub transactions: TrunkStatsSnapshot,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
    /// Async tasks handed to a dispatcher
    pub async_submitted: u64,
    /// Async tasks that reported a result
    pub async_completed: u64,
    /// Async tasks dropped without running
    pub async_cancelled: u64,
    /// Time since the engine started
    pub uptime: Duration,
}

impl StmMetrics {
    /// Conflict rate (conflicted / started)
    pub fn conflict_rate(&self) -> f64 {
        if self.transactions.started > 0 {
            self.transactions.conflicted as f64 / self.transactions.started as f64
        } else {
            0.0
        }
    }

    /// Commits per second since start
    pub fn commits_per_second(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.transactions.committed as f64 / secs
        } else {
            0.0
        }
    }
}

//! The `Stm` engine handle
//!
//! `Stm` ties the layers together for applications that do not want to wire
//! them by hand:
//!
//! - trunks, in memory or recovered from a directory
//! - a dispatcher shared by listener callbacks, async commits and loopback
//!   transports
//! - one notifier per trunk that has listeners
//! - interceptors, replicators and authorities per trunk
//! - engine-wide metrics
//!
//! # Example
//!
//! ```ignore
//! let stm = Stm::new(StmConfig::in_memory())?;
//! let trunk = stm.create_trunk()?;
//! let counter = trunk.create_object(ObjectKind::Fields { count: 1 });
//! stm.run(&trunk, |txn| txn.set(&counter, 0, 1i64))?;
//! ```

use crate::async_commit::{run_attempts, AsyncCallback, AsyncRunner, RunOptions, RunOutcome};
use crate::config::{DispatcherKind, StmConfig, CONFIG_FILE_NAME};
use crate::coordinator::{StmCoordinator, StmMetrics};
use crate::dispatcher::{inline_dispatcher, Dispatcher, PooledDispatcher};
use crate::listener::{Listener, ListenerId};
use crate::notifier::Notifier;
use crate::registry::OPEN_TRUNKS;
use crate::replication::{Authority, Replicator, Transport};
use dashmap::DashMap;
use mvstm_concurrency::{
    CommitStatus, Interceptor, Persister, RecoveryCoordinator, SharedTransaction, StartFlags,
    TObject, Transaction, TransactionScope, Trunk,
};
use mvstm_core::{StmError, StmResult, TrunkId};
use mvstm_durability::{FileStore, Store};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long `shutdown` waits for async work before giving up
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine handle
pub struct Stm {
    config: StmConfig,
    data_dir: Option<PathBuf>,
    dispatcher: Arc<dyn Dispatcher>,
    coordinator: Arc<StmCoordinator>,
    runner: AsyncRunner,
    notifiers: DashMap<TrunkId, (Arc<Trunk>, Arc<Notifier>)>,
    interceptors: DashMap<TrunkId, Arc<Interceptor>>,
    persisters: DashMap<TrunkId, Arc<Persister>>,
    authorities: DashMap<TrunkId, Arc<Authority>>,
    replicators: Mutex<Vec<Arc<Replicator>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("data_dir", &self.data_dir)
            .field("config", &self.config)
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

impl Stm {
    /// Engine without a data directory. Durable trunks are unavailable.
    ///
    /// # Errors
    /// `StmError::InvalidInput` for an invalid config, `StmError::Io` if
    /// pool workers cannot be spawned.
    pub fn new(config: StmConfig) -> StmResult<Stm> {
        Self::build(config, None)
    }

    /// Engine rooted at `dir`, configured from `dir/mvstm.toml`.
    ///
    /// A default config file is written on first open.
    pub fn open(dir: impl AsRef<Path>) -> StmResult<Stm> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;
        let config_path = dir.join(CONFIG_FILE_NAME);
        StmConfig::write_default_if_missing(&config_path)?;
        let config = StmConfig::from_file(&config_path)?;
        Self::build(config, Some(dir))
    }

    /// Engine rooted at `dir` with an explicit config. The config file is
    /// not read or written.
    pub fn open_with(dir: impl AsRef<Path>, config: StmConfig) -> StmResult<Stm> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;
        Self::build(config, Some(dir))
    }

    fn build(config: StmConfig, data_dir: Option<PathBuf>) -> StmResult<Stm> {
        config.validate()?;
        let dispatcher: Arc<dyn Dispatcher> = match config.dispatcher_kind()? {
            DispatcherKind::Inline => inline_dispatcher(),
            DispatcherKind::Pooled => Arc::new(PooledDispatcher::new(
                config.worker_threads,
                config.max_queue_depth,
            )?),
        };
        let coordinator = Arc::new(StmCoordinator::new());
        let runner = AsyncRunner::with_stats(
            Arc::clone(&dispatcher),
            Arc::clone(coordinator.async_stats()),
        );
        info!(
            target: "mvstm::engine",
            data_dir = ?data_dir,
            dispatcher = %config.dispatcher,
            granularity = %config.granularity,
            durability = %config.durability,
            "Engine started"
        );
        Ok(Stm {
            config,
            data_dir,
            dispatcher,
            coordinator,
            runner,
            notifiers: DashMap::new(),
            interceptors: DashMap::new(),
            persisters: DashMap::new(),
            authorities: DashMap::new(),
            replicators: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Data directory, if any
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Dispatcher shared by callbacks and async work
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    fn ensure_open(&self) -> StmResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StmError::invalid_state("engine is shut down"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trunks
    // ------------------------------------------------------------------

    /// New in-memory trunk
    pub fn create_trunk(&self) -> StmResult<Arc<Trunk>> {
        self.create_trunk_with_id(TrunkId::new())
    }

    /// New in-memory trunk with a known id, for peers mirroring one trunk
    pub fn create_trunk_with_id(&self, id: TrunkId) -> StmResult<Arc<Trunk>> {
        self.ensure_open()?;
        let trunk = Trunk::with_id(id, self.config.trunk_config()?);
        self.coordinator.track(&trunk);
        debug!(target: "mvstm::engine", trunk = %id, "Trunk created");
        Ok(trunk)
    }

    /// Open the trunk stored under `name` in the data directory.
    ///
    /// With durability `"cache"` the trunk lives in memory only. Otherwise
    /// its commit log is replayed and acknowledged maps keep being appended.
    /// Opening the same name twice in a process returns the same trunk.
    ///
    /// # Errors
    /// - `StmError::InvalidInput` for an empty name or one with separators
    /// - `StmError::InvalidState` if a durable mode is set and the engine has
    ///   no data directory
    /// - store and recovery errors
    pub fn open_trunk(&self, name: &str) -> StmResult<Arc<Trunk>> {
        self.ensure_open()?;
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StmError::invalid_input(format!(
                "invalid trunk name '{}'",
                name
            )));
        }
        let mode = self.config.durability_mode()?;
        if !mode.requires_store() {
            return self.create_trunk();
        }
        let dir = self
            .data_dir
            .as_ref()
            .ok_or_else(|| {
                StmError::invalid_state(format!(
                    "durability '{}' needs a data directory; use Stm::open",
                    mode.as_str()
                ))
            })?
            .join(name);

        // held for the whole open so two threads cannot recover one log twice
        let mut registry = OPEN_TRUNKS.lock();
        if let Some(trunk) = registry.get(&dir).and_then(|weak| weak.upgrade()) {
            info!(target: "mvstm::engine", path = %dir.display(), "Returning open trunk");
            self.coordinator.track(&trunk);
            return Ok(trunk);
        }

        let store = FileStore::open(&dir, mode)?;
        let trunk_id = store.trunk_id();
        let store: Arc<dyn Store> = Arc::new(store);
        let result = RecoveryCoordinator::new(store).recover(trunk_id, self.config.trunk_config()?)?;
        info!(
            target: "mvstm::engine",
            path = %dir.display(),
            trunk = %trunk_id,
            maps = result.stats.maps_replayed,
            objects = result.stats.objects_registered,
            "Trunk opened"
        );
        registry.insert(dir, Arc::downgrade(&result.trunk));
        drop(registry);

        self.coordinator.track(&result.trunk);
        self.persisters.insert(trunk_id, result.persister);
        Ok(result.trunk)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a transaction on `trunk`
    pub fn start(&self, trunk: &Arc<Trunk>) -> Transaction {
        Transaction::start(trunk)
    }

    /// Start a transaction on `trunk` with `flags`
    pub fn start_with(&self, trunk: &Arc<Trunk>, flags: StartFlags) -> Transaction {
        Transaction::start_with(trunk, flags)
    }

    /// Run `body` in a transaction on the calling thread, retrying on
    /// conflict. An `Err` from the body aborts the attempt and is returned.
    ///
    /// # Errors
    /// The body's error, `StmError::PublishContention`, or
    /// `StmError::InvalidState` when every attempt conflicted.
    pub fn run<T, F>(&self, trunk: &Arc<Trunk>, body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        self.run_with(trunk, RunOptions::default(), body)
    }

    /// `run` with explicit flags and attempt limit
    pub fn run_with<T, F>(&self, trunk: &Arc<Trunk>, options: RunOptions, mut body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        match run_attempts(trunk, options, &mut body)? {
            RunOutcome::Committed { value, .. } => Ok(value),
            RunOutcome::Conflict { attempts } => {
                warn!(target: "mvstm::txn", trunk = %trunk.id(), attempts, "Transaction kept conflicting");
                Err(StmError::invalid_state(format!(
                    "transaction conflicted on all {} attempts",
                    attempts
                )))
            }
        }
    }

    /// Commit `txn` on the dispatcher
    pub fn commit_async(&self, txn: Transaction, callback: Box<dyn AsyncCallback<CommitStatus>>) {
        self.runner.commit(txn, callback)
    }

    /// Run `body` on the dispatcher with conflict retries
    pub fn run_async<T, F>(
        &self,
        trunk: &Arc<Trunk>,
        options: RunOptions,
        body: F,
        callback: Box<dyn AsyncCallback<RunOutcome<T>>>,
    ) where
        T: Send + 'static,
        F: FnMut(&mut Transaction) -> StmResult<T> + Send + 'static,
    {
        self.runner.run(trunk, options, body, callback)
    }

    /// Current transaction of this thread's innermost scope
    pub fn current(&self) -> Option<SharedTransaction> {
        TransactionScope::current()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    fn notifier(&self, trunk: &Arc<Trunk>) -> Arc<Notifier> {
        let entry = self.notifiers.entry(trunk.id()).or_insert_with(|| {
            (
                Arc::clone(trunk),
                Notifier::attach(trunk, self.config.merge_by_source),
            )
        });
        Arc::clone(&entry.1)
    }

    /// Attach `listener` to `object` of `trunk`; callbacks run on the
    /// engine's dispatcher.
    pub fn add_listener(
        &self,
        trunk: &Arc<Trunk>,
        object: &TObject,
        listener: Listener,
    ) -> StmResult<ListenerId> {
        self.add_listener_with(trunk, object, listener, Arc::clone(&self.dispatcher))
    }

    /// Attach `listener` with callbacks on `dispatcher`
    pub fn add_listener_with(
        &self,
        trunk: &Arc<Trunk>,
        object: &TObject,
        listener: Listener,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> StmResult<ListenerId> {
        self.ensure_open()?;
        if object.trunk() != trunk.id() {
            return Err(StmError::WrongTrunk {
                object: object.id(),
                expected: trunk.id(),
                actual: object.trunk(),
            });
        }
        self.notifier(trunk)
            .registry()
            .add_listener(object, listener, dispatcher)
    }

    /// Detach a listener. The trunk's notifier is dropped with its last
    /// listener.
    pub fn remove_listener(&self, trunk: &Arc<Trunk>, id: ListenerId) -> bool {
        let removed = match self.notifiers.get(&trunk.id()) {
            Some(entry) => entry.1.registry().remove_listener(id),
            None => return false,
        };
        let idle = self
            .notifiers
            .remove_if(&trunk.id(), |_, (_, notifier)| notifier.registry().is_empty());
        if let Some((_, (trunk, notifier))) = idle {
            notifier.detach(&trunk);
            debug!(target: "mvstm::notify", trunk = %trunk.id(), "Notifier detached");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Interception and replication
    // ------------------------------------------------------------------

    /// Interceptor of `trunk`, created on first use.
    ///
    /// A trunk connected with [`Stm::connect`] returns its replicator's
    /// interceptor.
    pub fn interceptor(&self, trunk: &Arc<Trunk>) -> Arc<Interceptor> {
        let entry = self
            .interceptors
            .entry(trunk.id())
            .or_insert_with(|| Interceptor::new(trunk));
        Arc::clone(entry.value())
    }

    /// Mirror `trunk` from an authority through `transport`.
    ///
    /// # Errors
    /// `StmError::InvalidState` if the trunk is already intercepted or
    /// holds commits.
    pub fn connect(&self, trunk: &Arc<Trunk>, transport: Arc<dyn Transport>) -> StmResult<Arc<Replicator>> {
        self.ensure_open()?;
        if self.interceptors.contains_key(&trunk.id()) || trunk.is_intercepted() {
            return Err(StmError::invalid_state(format!(
                "trunk {} is already intercepted",
                trunk.id()
            )));
        }
        let replicator = Replicator::connect(trunk, transport)?;
        self.interceptors
            .insert(trunk.id(), Arc::clone(replicator.interceptor()));
        self.replicators.lock().push(Arc::clone(&replicator));
        Ok(replicator)
    }

    /// Authority serving `trunk`, created on first use
    pub fn serve(&self, trunk: &Arc<Trunk>) -> StmResult<Arc<Authority>> {
        self.ensure_open()?;
        if trunk.is_intercepted() {
            return Err(StmError::invalid_state(format!(
                "trunk {} is speculative and cannot be served",
                trunk.id()
            )));
        }
        let entry = self
            .authorities
            .entry(trunk.id())
            .or_insert_with(|| Authority::new(trunk));
        Ok(Arc::clone(entry.value()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Engine metrics
    pub fn metrics(&self) -> StmMetrics {
        self.coordinator.metrics()
    }

    /// Flush every store this engine appends to
    pub fn sync(&self) -> StmResult<()> {
        for entry in self.persisters.iter() {
            entry.value().store().sync()?;
        }
        Ok(())
    }

    /// Close connections, wait for async work, detach notifiers and sync
    /// stores. Idempotent; also run on drop.
    pub fn shutdown(&self) -> StmResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for replicator in self.replicators.lock().drain(..) {
            replicator.close();
        }
        let authorities: Vec<_> = self.authorities.iter().map(|e| Arc::clone(e.value())).collect();
        self.authorities.clear();
        for authority in authorities {
            authority.shutdown();
        }
        if !self.coordinator.wait_for_idle(SHUTDOWN_TIMEOUT) {
            warn!(
                target: "mvstm::engine",
                in_flight = self.coordinator.async_in_flight(),
                "Async work still running at shutdown"
            );
        }
        self.dispatcher.drain();

        let notifiers: Vec<_> = self
            .notifiers
            .iter()
            .map(|e| (Arc::clone(&e.value().0), Arc::clone(&e.value().1)))
            .collect();
        self.notifiers.clear();
        for (trunk, notifier) in notifiers {
            notifier.detach(&trunk);
        }
        self.interceptors.clear();

        let result = self.sync();
        for entry in self.persisters.iter() {
            if entry.value().failures() > 0 {
                warn!(
                    target: "mvstm::store",
                    trunk = %entry.key(),
                    failures = entry.value().failures(),
                    "Store reported append failures"
                );
            }
        }
        self.dispatcher.shutdown();
        info!(target: "mvstm::engine", "Engine shut down");
        result
    }
}

impl Drop for Stm {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(target: "mvstm::engine", error = %e, "Shutdown on drop failed");
        }
    }
}

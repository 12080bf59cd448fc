//! Client side of replication
//!
//! A [`Replicator`] keeps a local trunk in speculative mode and mirrors it
//! against an [`Authority`](super::Authority):
//!
//! - local commits publish at once, then ship to the authority in sequence
//!   order as `Commit` messages
//! - `Ack` moves them below the acknowledged boundary, `Reject` rolls them
//!   back together with everything committed after them
//! - `Applied` maps from other writers go in at the boundary, below local
//!   speculative maps
//! - a closed connection rolls back whatever is still speculative and fails
//!   outstanding remote calls with `StmError::ConnectionClosed`
//!
//! Each `Commit` carries how many authority-ordered maps the client had
//! applied before the commit was published. The authority only has to check
//! the commit against maps ordered after that.

use super::message::Message;
use super::transport::{Receiver, Transport};
use crate::async_commit::AsyncCallback;
use mvstm_concurrency::{
    Interceptor, MapPayload, Trunk, TrunkObserver, ValidationResult, VersionMap,
};
use mvstm_core::{ObjectDescriptor, StmError, StmResult, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Authority-ordered maps known locally, by when they became known.
///
/// Entry `(marker, ordinal)`: every local map with a sequence above `marker`
/// was published after the first `ordinal` authority maps were applied.
#[derive(Debug, Default)]
struct ServerOrder {
    floor: u64,
    entries: VecDeque<(u64, u64)>,
}

impl ServerOrder {
    fn last(&self) -> (u64, u64) {
        self.entries.back().copied().unwrap_or((0, self.floor))
    }

    /// The map with local `sequence` is now known at the next ordinal
    fn learn(&mut self, sequence: u64) {
        let (marker, ordinal) = self.last();
        self.entries.push_back((marker.max(sequence), ordinal + 1));
    }

    /// Maps through ordinal `ordinal` are known, the newest at `sequence`
    fn learn_through(&mut self, sequence: u64, ordinal: u64) {
        let (marker, _) = self.last();
        self.entries.push_back((marker.max(sequence), ordinal));
    }

    /// Authority ordinals applied before the local map `sequence` published
    fn based_on(&self, sequence: u64) -> u64 {
        let known = self.entries.partition_point(|&(marker, _)| marker < sequence);
        if known == 0 {
            self.floor
        } else {
            self.entries[known - 1].1
        }
    }

    /// Forget entries no local map at or above `sequence` needs
    fn prune_below(&mut self, sequence: u64) {
        while self.entries.len() > 1 && self.entries[1].0 < sequence {
            if let Some((_, ordinal)) = self.entries.pop_front() {
                self.floor = ordinal;
            }
        }
    }
}

/// Replicator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicatorStats {
    /// Commits shipped
    pub commits_sent: u64,
    /// Local maps acknowledged by the authority
    pub acknowledged: u64,
    /// Local maps rolled back
    pub rolled_back: u64,
    /// Maps from other writers applied
    pub applied: u64,
}

#[derive(Default)]
struct Counters {
    commits_sent: AtomicU64,
    acknowledged: AtomicU64,
    rolled_back: AtomicU64,
    applied: AtomicU64,
}

/// Mirrors a local trunk against an authority
pub struct Replicator {
    trunk: Arc<Trunk>,
    transport: Arc<dyn Transport>,
    interceptor: Arc<Interceptor>,
    observer: Mutex<Option<Arc<dyn TrunkObserver>>>,
    order: Mutex<ServerOrder>,
    welcomed: AtomicBool,
    connected: AtomicBool,
    flush_requested: AtomicBool,
    last_sent: Mutex<u64>,
    next_call: AtomicU64,
    calls: Mutex<FxHashMap<u64, Box<dyn AsyncCallback<Value>>>>,
    counters: Counters,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("trunk", &self.trunk.id())
            .field("welcomed", &self.is_welcomed())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Forwards trunk events without keeping the replicator alive
struct ReplicatorObserver {
    replicator: Weak<Replicator>,
}

impl TrunkObserver for ReplicatorObserver {
    fn on_published(&self, _trunk: &Trunk, map: &Arc<VersionMap>) {
        if map.source().is_some() || map.interception().is_none() {
            return;
        }
        if let Some(replicator) = self.replicator.upgrade() {
            replicator.flush_outbox();
        }
    }

    fn on_object_created(&self, _trunk: &Trunk, descriptor: &Arc<ObjectDescriptor>) {
        if let Some(replicator) = self.replicator.upgrade() {
            replicator.send(&Message::Object {
                descriptor: (**descriptor).clone(),
            });
        }
    }
}

impl Replicator {
    /// Mirror `trunk`, which must be empty, through `transport`.
    ///
    /// The trunk switches to speculative mode at once. Its content arrives
    /// with the authority's welcome.
    ///
    /// # Errors
    /// `StmError::InvalidState` if the trunk already holds commits.
    pub fn connect(trunk: &Arc<Trunk>, transport: Arc<dyn Transport>) -> StmResult<Arc<Replicator>> {
        if !trunk.snapshot().is_empty() {
            return Err(StmError::invalid_state(
                "a replicated trunk must start empty",
            ));
        }
        let interceptor = Interceptor::new(trunk);
        interceptor.intercept();
        let replicator = Arc::new(Replicator {
            trunk: Arc::clone(trunk),
            transport: Arc::clone(&transport),
            interceptor,
            observer: Mutex::new(None),
            order: Mutex::new(ServerOrder::default()),
            welcomed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            flush_requested: AtomicBool::new(false),
            last_sent: Mutex::new(0),
            next_call: AtomicU64::new(1),
            calls: Mutex::new(FxHashMap::default()),
            counters: Counters::default(),
        });
        let observer: Arc<dyn TrunkObserver> = Arc::new(ReplicatorObserver {
            replicator: Arc::downgrade(&replicator),
        });
        trunk.add_observer(Arc::clone(&observer));
        *replicator.observer.lock() = Some(observer);

        let receiver: Arc<dyn Receiver> = replicator.clone();
        transport.bind(Arc::downgrade(&receiver));
        info!(target: "mvstm::replication", trunk = %trunk.id(), "Replicator connected");
        Ok(replicator)
    }

    /// Local trunk
    pub fn trunk(&self) -> &Arc<Trunk> {
        &self.trunk
    }

    /// Interceptor holding the trunk in speculative mode
    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    /// True once the authority's initial state was applied
    pub fn is_welcomed(&self) -> bool {
        self.welcomed.load(Ordering::Acquire)
    }

    /// True until the connection closes
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Counters
    pub fn stats(&self) -> ReplicatorStats {
        ReplicatorStats {
            commits_sent: self.counters.commits_sent.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
        }
    }

    /// Call `method` on the authority. The result or failure arrives through
    /// `callback`; a remote failure is `StmError::Remote`.
    pub fn call_async(&self, method: &str, args: Vec<Value>, callback: Box<dyn AsyncCallback<Value>>) {
        if !self.is_connected() {
            callback.on_failure(StmError::ConnectionClosed);
            return;
        }
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().insert(call, callback);
        let message = Message::Invoke {
            call,
            method: method.to_string(),
            args,
        };
        if let Err(e) = message.to_bytes().and_then(|bytes| self.transport.send(bytes)) {
            if let Some(callback) = self.calls.lock().remove(&call) {
                callback.on_failure(e);
            }
        }
    }

    /// Say goodbye and close the connection
    pub fn close(&self) {
        if self.transport.is_open() {
            self.send(&Message::Close);
            self.transport.close();
        }
    }

    fn send(&self, message: &Message) {
        match message.to_bytes().and_then(|bytes| self.transport.send(bytes)) {
            Ok(()) => {}
            Err(StmError::ConnectionClosed) => {
                debug!(target: "mvstm::replication", message = message.name(), "Send after close dropped");
            }
            Err(e) => {
                warn!(target: "mvstm::replication", message = message.name(), error = %e, "Send failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound commits
    // ------------------------------------------------------------------

    /// Ship unsent speculative maps, oldest first. Only one thread ships at
    /// a time; a request made meanwhile is served by that thread.
    fn flush_outbox(&self) {
        self.flush_requested.store(true, Ordering::SeqCst);
        loop {
            let Some(mut last_sent) = self.last_sent.try_lock() else {
                return;
            };
            while self.flush_requested.swap(false, Ordering::SeqCst) {
                if !self.is_welcomed() || !self.is_connected() {
                    continue;
                }
                self.ship_pending(&mut last_sent);
            }
            drop(last_sent);
            if !self.flush_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn ship_pending(&self, last_sent: &mut u64) {
        let snapshot = self.trunk.snapshot();
        for map in snapshot.speculative_maps() {
            if map.sequence() <= *last_sent || map.source().is_some() {
                continue;
            }
            let Some(interception) = map.interception() else {
                continue;
            };
            let based_on = self.order.lock().based_on(map.sequence());
            self.send(&Message::Commit {
                interception,
                sequence: map.sequence(),
                based_on,
                payload: MapPayload::from_map(map),
            });
            *last_sent = map.sequence();
            self.counters.commits_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.order.lock().prune_below(*last_sent + 1);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn handle(&self, message: Message) -> StmResult<()> {
        match message {
            Message::Welcome {
                acknowledged,
                descriptors,
                maps,
            } => {
                for descriptor in descriptors {
                    self.trunk.register_descriptor(descriptor);
                }
                let mut newest = 0;
                for payload in maps {
                    let map = self.apply(payload)?;
                    newest = map.sequence();
                }
                self.order.lock().learn_through(newest, acknowledged);
                self.welcomed.store(true, Ordering::Release);
                info!(
                    target: "mvstm::replication",
                    trunk = %self.trunk.id(),
                    acknowledged,
                    "Welcomed by authority"
                );
                self.flush_outbox();
            }
            Message::Object { descriptor } => {
                self.trunk.register_descriptor(descriptor);
            }
            Message::Applied { payload } => {
                let map = self.apply(payload)?;
                self.order.lock().learn(map.sequence());
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Message::Ack {
                interception,
                through,
            } => {
                let acknowledged = self.trunk.acknowledge(interception, through)?;
                let mut order = self.order.lock();
                for map in &acknowledged {
                    order.learn(map.sequence());
                }
                self.counters
                    .acknowledged
                    .fetch_add(acknowledged.len() as u64, Ordering::Relaxed);
            }
            Message::Reject {
                interception,
                from,
                reason,
            } => {
                warn!(
                    target: "mvstm::replication",
                    trunk = %self.trunk.id(),
                    %interception,
                    from,
                    reason = %reason,
                    "Authority rejected commit"
                );
                let rolled_back = self.interceptor.reject(from)?;
                self.counters
                    .rolled_back
                    .fetch_add(rolled_back as u64, Ordering::Relaxed);
                self.interceptor.intercept();
            }
            Message::InvokeResult { call, result } => {
                let callback = self.calls.lock().remove(&call);
                match (callback, result) {
                    (Some(callback), Ok(value)) => callback.on_success(value),
                    (Some(callback), Err(message)) => {
                        callback.on_failure(StmError::Remote { message })
                    }
                    (None, _) => {
                        debug!(target: "mvstm::replication", call, "Result for unknown call");
                    }
                }
            }
            Message::Close => self.transport.close(),
            other => {
                return Err(StmError::invalid_input(format!(
                    "unexpected {} message from authority",
                    other.name()
                )))
            }
        }
        Ok(())
    }

    fn apply(&self, payload: MapPayload) -> StmResult<Arc<VersionMap>> {
        let source = payload.source;
        self.trunk
            .apply_remote(payload.versions, source, |_| ValidationResult::ok())
            .map_err(|_| StmError::internal("remote map refused without validation"))
    }

    fn disconnected(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let snapshot = self.trunk.snapshot();
        let rolled_back = match snapshot.speculative_maps().first() {
            Some(first) => self.interceptor.reject(first.sequence()).unwrap_or_else(|e| {
                warn!(target: "mvstm::replication", error = %e, "Rollback on close failed");
                0
            }),
            None => 0,
        };
        self.counters
            .rolled_back
            .fetch_add(rolled_back as u64, Ordering::Relaxed);
        self.interceptor.reset();

        let calls: Vec<_> = self.calls.lock().drain().map(|(_, c)| c).collect();
        let failed = calls.len();
        for callback in calls {
            callback.on_failure(StmError::ConnectionClosed);
        }
        if let Some(observer) = self.observer.lock().take() {
            self.trunk.remove_observer(&observer);
        }
        warn!(
            target: "mvstm::replication",
            trunk = %self.trunk.id(),
            rolled_back,
            failed_calls = failed,
            "Connection to authority closed"
        );
    }
}

impl Receiver for Replicator {
    fn receive(&self, bytes: &[u8]) {
        let result = Message::from_bytes(bytes).and_then(|message| self.handle(message));
        if let Err(e) = result {
            warn!(target: "mvstm::replication", trunk = %self.trunk.id(), error = %e, "Inbound message failed");
        }
    }

    fn on_disconnect(&self) {
        self.disconnected();
    }
}

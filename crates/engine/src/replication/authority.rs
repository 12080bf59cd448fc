//! Server side of replication
//!
//! An [`Authority`] owns the trunk whose order is final. Peers ship their
//! speculative commits to it; each one is checked against every map the
//! authority ordered after the peer's `based_on`, then either applied as a
//! remote map or refused.
//!
//! All ordering messages (`Ack` to the writer, `Applied` to everyone else)
//! go out from a single walk over acknowledged maps, in ordinal order. Every
//! peer therefore sees the authority's order exactly.

use super::message::Message;
use super::transport::{Receiver, Transport};
use mvstm_concurrency::{
    validation::validate_writes, ConflictType, MapPayload, Pin, Trunk, TrunkObserver,
    ValidationResult, VersionMap,
};
use mvstm_core::{InterceptionId, ObjectDescriptor, Source, StmError, StmResult, Value};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Handler for a hosted method
pub type MethodHandler = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Authority counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    /// Peers accepted over the lifetime
    pub peers_accepted: u64,
    /// Peer commits applied
    pub commits_applied: u64,
    /// Peer commits refused
    pub commits_rejected: u64,
    /// Method calls served
    pub calls: u64,
}

#[derive(Default)]
struct Counters {
    peers_accepted: AtomicU64,
    commits_applied: AtomicU64,
    commits_rejected: AtomicU64,
    calls: AtomicU64,
}

/// Writer of an applied map, waiting for its `Ack`
struct PendingAck {
    peer: Source,
    interception: InterceptionId,
    through: u64,
}

struct Broadcast {
    cursor: u64,
    pin: Option<Pin>,
}

/// One connected peer
pub struct Peer {
    authority: Weak<Authority>,
    source: Source,
    transport: Arc<dyn Transport>,
    rejected_epoch: Mutex<Option<InterceptionId>>,
    history: Mutex<Option<Pin>>,
    open: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("source", &self.source)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl Peer {
    /// Writer id stamped on this peer's maps
    pub fn source(&self) -> Source {
        self.source
    }

    /// True until the connection closes
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, message: &Message) {
        if !self.is_open() {
            return;
        }
        match message.to_bytes().and_then(|bytes| self.transport.send(bytes)) {
            Ok(()) => {}
            Err(StmError::ConnectionClosed) => {
                debug!(target: "mvstm::replication", peer = %self.source, message = message.name(), "Peer gone, message dropped");
            }
            Err(e) => {
                warn!(target: "mvstm::replication", peer = %self.source, message = message.name(), error = %e, "Send to peer failed");
            }
        }
    }
}

impl Receiver for Peer {
    fn receive(&self, bytes: &[u8]) {
        let Some(authority) = self.authority.upgrade() else {
            return;
        };
        let result = Message::from_bytes(bytes).and_then(|message| authority.handle(self, message));
        if let Err(e) = result {
            warn!(target: "mvstm::replication", peer = %self.source, error = %e, "Inbound peer message failed");
        }
    }

    fn on_disconnect(&self) {
        if let Some(authority) = self.authority.upgrade() {
            authority.disconnected(self.source);
        }
    }
}

/// Final orderer of a trunk shared with peers
pub struct Authority {
    trunk: Arc<Trunk>,
    source: Source,
    peers: RwLock<Vec<Arc<Peer>>>,
    methods: RwLock<FxHashMap<String, MethodHandler>>,
    pending_acks: Mutex<FxHashMap<u64, PendingAck>>,
    broadcast_requested: AtomicBool,
    broadcast: Mutex<Broadcast>,
    observer: Mutex<Option<Arc<dyn TrunkObserver>>>,
    counters: Counters,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("trunk", &self.trunk.id())
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

struct AuthorityObserver {
    authority: Weak<Authority>,
}

impl TrunkObserver for AuthorityObserver {
    fn on_acknowledged(&self, _trunk: &Trunk, _maps: &[Arc<VersionMap>]) {
        if let Some(authority) = self.authority.upgrade() {
            authority.request_broadcast();
        }
    }

    fn on_object_created(&self, _trunk: &Trunk, descriptor: &Arc<ObjectDescriptor>) {
        if let Some(authority) = self.authority.upgrade() {
            let message = Message::Object {
                descriptor: (**descriptor).clone(),
            };
            for peer in authority.peers.read().iter() {
                peer.send(&message);
            }
        }
    }
}

impl Authority {
    /// Serve `trunk`. Local commits on it are final and reach every peer.
    pub fn new(trunk: &Arc<Trunk>) -> Arc<Authority> {
        let cursor = trunk.snapshot().acknowledged_count();
        let authority = Arc::new(Authority {
            trunk: Arc::clone(trunk),
            source: Source::new(),
            peers: RwLock::new(Vec::new()),
            methods: RwLock::new(FxHashMap::default()),
            pending_acks: Mutex::new(FxHashMap::default()),
            broadcast_requested: AtomicBool::new(false),
            broadcast: Mutex::new(Broadcast {
                cursor,
                pin: Some(trunk.pin_ordinal(cursor)),
            }),
            observer: Mutex::new(None),
            counters: Counters::default(),
        });
        let observer: Arc<dyn TrunkObserver> = Arc::new(AuthorityObserver {
            authority: Arc::downgrade(&authority),
        });
        trunk.add_observer(Arc::clone(&observer));
        *authority.observer.lock() = Some(observer);
        info!(target: "mvstm::replication", trunk = %trunk.id(), "Authority serving trunk");
        authority
    }

    /// Served trunk
    pub fn trunk(&self) -> &Arc<Trunk> {
        &self.trunk
    }

    /// Host `name`; peers reach it with `Replicator::call_async`
    pub fn register_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.methods.write().insert(name.to_string(), Arc::new(handler));
    }

    /// Connected peers
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Counters
    pub fn stats(&self) -> AuthorityStats {
        AuthorityStats {
            peers_accepted: self.counters.peers_accepted.load(Ordering::Relaxed),
            commits_applied: self.counters.commits_applied.load(Ordering::Relaxed),
            commits_rejected: self.counters.commits_rejected.load(Ordering::Relaxed),
            calls: self.counters.calls.load(Ordering::Relaxed),
        }
    }

    /// Take a new peer on `transport` and send it the current state
    pub fn accept(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Arc<Peer> {
        // the walk lock keeps the welcome and the broadcast cursor in step
        let broadcast = self.broadcast.lock();
        let snapshot = self.trunk.snapshot();
        let welcomed = broadcast.cursor;
        let peer = Arc::new(Peer {
            authority: Arc::downgrade(self),
            source: Source::new(),
            transport: Arc::clone(&transport),
            rejected_epoch: Mutex::new(None),
            history: Mutex::new(Some(self.trunk.pin_ordinal(welcomed))),
            open: AtomicBool::new(true),
        });

        let mut peers = self.peers.write();
        let descriptors = self
            .trunk
            .descriptors()
            .iter()
            .map(|d| (**d).clone())
            .collect();
        let through = snapshot.acknowledged_index() - (snapshot.acknowledged_count() - welcomed) as usize;
        let maps = snapshot.version_maps()[..=through]
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| self.outbound_payload(m))
            .collect();
        peer.send(&Message::Welcome {
            acknowledged: welcomed,
            descriptors,
            maps,
        });
        peers.push(Arc::clone(&peer));
        drop(peers);
        drop(broadcast);

        self.counters.peers_accepted.fetch_add(1, Ordering::Relaxed);
        let receiver: Arc<dyn Receiver> = peer.clone();
        transport.bind(Arc::downgrade(&receiver));
        info!(target: "mvstm::replication", peer = %peer.source, acknowledged = welcomed, "Peer accepted");
        peer
    }

    /// Close every peer connection and stop serving
    pub fn shutdown(&self) {
        let peers: Vec<_> = self.peers.write().drain(..).collect();
        for peer in peers {
            peer.send(&Message::Close);
            peer.open.store(false, Ordering::Release);
            peer.transport.close();
        }
        if let Some(observer) = self.observer.lock().take() {
            self.trunk.remove_observer(&observer);
        }
        self.broadcast.lock().pin = None;
    }

    fn outbound_payload(&self, map: &VersionMap) -> MapPayload {
        let mut payload = MapPayload::from_map(map);
        payload.source = Some(payload.source.unwrap_or(self.source));
        payload
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn handle(&self, peer: &Peer, message: Message) -> StmResult<()> {
        match message {
            Message::Commit {
                interception,
                sequence,
                based_on,
                payload,
            } => self.on_commit(peer, interception, sequence, based_on, payload),
            Message::Object { descriptor } => {
                self.trunk.register_descriptor(descriptor.clone());
                let message = Message::Object { descriptor };
                for other in self.peers.read().iter() {
                    if other.source != peer.source {
                        other.send(&message);
                    }
                }
                Ok(())
            }
            Message::Invoke { call, method, args } => {
                self.counters.calls.fetch_add(1, Ordering::Relaxed);
                let handler = self.methods.read().get(&method).cloned();
                let result = match handler {
                    Some(handler) => handler(&args),
                    None => Err(format!("unknown method '{}'", method)),
                };
                peer.send(&Message::InvokeResult { call, result });
                Ok(())
            }
            Message::Close => {
                peer.transport.close();
                Ok(())
            }
            other => Err(StmError::invalid_input(format!(
                "unexpected {} message from peer",
                other.name()
            ))),
        }
    }

    fn on_commit(
        &self,
        peer: &Peer,
        interception: InterceptionId,
        sequence: u64,
        based_on: u64,
        payload: MapPayload,
    ) -> StmResult<()> {
        {
            let epoch = peer.rejected_epoch.lock();
            if epoch.map_or(false, |rejected| interception <= rejected) {
                debug!(target: "mvstm::replication", peer = %peer.source, sequence, "Commit after rejection dropped");
                return Ok(());
            }
        }
        *peer.history.lock() = Some(self.trunk.pin_ordinal(based_on));

        let source = peer.source;
        let verdict = self.trunk.apply_remote(payload.versions.clone(), Some(source), |snapshot| {
            let base_ordinal = snapshot.acknowledged_count() - snapshot.acknowledged_index() as u64;
            if base_ordinal > based_on {
                return ValidationResult::conflict(ConflictType::Folded { based_on });
            }
            let mut intervening = FxHashSet::default();
            for index in 1..=snapshot.acknowledged_index() {
                let map = &snapshot.version_maps()[index];
                let newer = snapshot.ordinal_of(index).map_or(false, |o| o > based_on);
                if newer && map.source() != Some(source) {
                    intervening.insert(map.sequence());
                }
            }
            let verdict = validate_writes(snapshot, &payload.versions, |s| intervening.contains(&s));
            if verdict.is_valid() {
                // the map gets the next sequence once this returns
                self.pending_acks.lock().insert(
                    snapshot.next_sequence(),
                    PendingAck {
                        peer: source,
                        interception,
                        through: sequence,
                    },
                );
            }
            verdict
        });

        match verdict {
            Ok(map) => {
                self.counters.commits_applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "mvstm::replication",
                    peer = %source,
                    peer_sequence = sequence,
                    sequence = map.sequence(),
                    "Peer commit applied"
                );
            }
            Err(verdict) => {
                self.counters.commits_rejected.fetch_add(1, Ordering::Relaxed);
                *peer.rejected_epoch.lock() = Some(interception);
                let reason = match verdict.conflicts.first() {
                    Some(ConflictType::Folded { .. }) => {
                        "history needed for validation was folded".to_string()
                    }
                    _ => format!("{} conflict(s)", verdict.conflict_count()),
                };
                debug!(target: "mvstm::replication", peer = %source, sequence, reason = %reason, "Peer commit rejected");
                peer.send(&Message::Reject {
                    interception,
                    from: sequence,
                    reason,
                });
            }
        }
        Ok(())
    }

    fn disconnected(&self, source: Source) {
        let removed = {
            let mut peers = self.peers.write();
            let before = peers.len();
            peers.retain(|p| {
                if p.source == source {
                    p.open.store(false, Ordering::Release);
                    *p.history.lock() = None;
                    false
                } else {
                    true
                }
            });
            before != peers.len()
        };
        if removed {
            self.pending_acks.lock().retain(|_, ack| ack.peer != source);
            info!(target: "mvstm::replication", peer = %source, "Peer disconnected");
        }
    }

    // ------------------------------------------------------------------
    // Ordered broadcast
    // ------------------------------------------------------------------

    fn request_broadcast(&self) {
        self.broadcast_requested.store(true, Ordering::SeqCst);
        loop {
            let Some(mut state) = self.broadcast.try_lock() else {
                return;
            };
            while self.broadcast_requested.swap(false, Ordering::SeqCst) {
                self.broadcast_new(&mut state);
            }
            drop(state);
            if !self.broadcast_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn broadcast_new(&self, state: &mut Broadcast) {
        let snapshot = self.trunk.snapshot();
        let count = snapshot.acknowledged_count();
        if count <= state.cursor {
            return;
        }
        let last = snapshot.acknowledged_index();
        let behind = (count - state.cursor) as usize;
        if behind > last {
            warn!(target: "mvstm::replication", missing = behind - last, "Maps folded before broadcast");
        }
        let first = (last + 1).saturating_sub(behind).max(1);
        let peers: Vec<_> = self.peers.read().clone();
        for map in &snapshot.version_maps()[first..=last] {
            let ack = self.pending_acks.lock().remove(&map.sequence());
            let applied = Message::Applied {
                payload: self.outbound_payload(map),
            };
            for peer in &peers {
                match &ack {
                    Some(ack) if ack.peer == peer.source => peer.send(&Message::Ack {
                        interception: ack.interception,
                        through: ack.through,
                    }),
                    _ => peer.send(&applied),
                }
            }
        }
        state.cursor = count;
        state.pin = Some(self.trunk.pin_ordinal(count));
    }
}

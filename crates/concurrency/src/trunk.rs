//! Trunks: the shared snapshot pointer and the state hung off it
//!
//! A `Trunk` owns the current `Snapshot` of one logical root. Every change to
//! the snapshot chain goes through here:
//!
//! ```text
//! publish      - append a local map (CAS against the snapshot a commit validated)
//! apply_remote - insert an authoritative map below local speculative maps
//! acknowledge  - move the durable boundary forward
//! reject       - drop speculative maps from a sequence onward
//! trim         - fold an acknowledged, unpinned prefix into the base map
//! ```
//!
//! The snapshot pointer is an `ArcSwap`: readers load it without locking and
//! never wait on a writer. Writers serialize on a writer-only mutex, build the
//! successor from the loaded snapshot and store it. Observers are invoked after
//! the mutex is released, on the thread that made the change.
//!
//! ## Pins
//!
//! Folding a map into the base makes it invisible to anyone walking the chain
//! by sequence. Transactions pin below the first map they may validate against
//! or check for rejection so those stay in the array; the ALL notifier pins the last
//! sequence it visited. The persister and the COALESCE notifier pin a lifetime
//! acknowledgement ordinal instead. `trim` folds only maps that every pin has
//! moved past.
//!
//! Rejected sequences are remembered only while a sequence pin sits below them.

use crate::object::TObject;
use crate::snapshot::Snapshot;
use crate::validation::ValidationResult;
use crate::version::Version;
use crate::version_map::VersionMap;
use dashmap::DashMap;
use mvstm_core::{
    Bits, FieldIndex, Granularity, InterceptionId, ObjectDescriptor, ObjectId, ObjectKind,
    Source, StmError, StmResult, TrunkId, Value,
};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Default number of publish attempts before a commit gives up
pub const DEFAULT_MAX_PUBLISH_RETRIES: u32 = 64;

/// Default snapshot length that triggers a trim
pub const DEFAULT_TRIM_THRESHOLD: usize = 32;

/// Per-trunk settings, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkConfig {
    /// Notification cadence
    pub granularity: Granularity,
    /// Publish attempts per commit before `PublishContention`
    pub max_publish_retries: u32,
    /// Snapshot length above which publishing and acknowledging trim
    pub trim_threshold: usize,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        TrunkConfig {
            granularity: Granularity::All,
            max_publish_retries: DEFAULT_MAX_PUBLISH_RETRIES,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
        }
    }
}

impl TrunkConfig {
    /// Default settings with the given granularity
    pub fn with_granularity(granularity: Granularity) -> Self {
        TrunkConfig {
            granularity,
            ..TrunkConfig::default()
        }
    }
}

/// Callbacks fired after the trunk's state changed.
///
/// Invoked on the thread that made the change, after the writer mutex was
/// released. Implementations must not assume events from different threads
/// arrive in snapshot order: re-read `trunk.snapshot()` when order matters.
pub trait TrunkObserver: Send + Sync {
    /// A map was appended or inserted
    fn on_published(&self, _trunk: &Trunk, _map: &Arc<VersionMap>) {}

    /// Maps became durable, in position order
    fn on_acknowledged(&self, _trunk: &Trunk, _maps: &[Arc<VersionMap>]) {}

    /// Speculative maps were removed, in position order
    fn on_rejected(&self, _trunk: &Trunk, _maps: &[Arc<VersionMap>]) {}

    /// Speculative mode was switched
    fn on_interception_changed(&self, _trunk: &Trunk, _intercepted: bool, _id: InterceptionId) {}

    /// An object was registered
    fn on_object_created(&self, _trunk: &Trunk, _descriptor: &Arc<ObjectDescriptor>) {}

    /// The root object changed
    fn on_root_changed(&self, _trunk: &Trunk, _root: ObjectId) {}
}

/// What a pin protects from trimming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    /// Maps with a higher sequence stay in the array
    Sequence,
    /// Maps with a higher acknowledgement ordinal stay in the array
    Ordinal,
}

/// Keeps part of the snapshot chain from being folded until dropped
#[derive(Debug)]
pub struct Pin {
    trunk: Weak<Trunk>,
    kind: PinKind,
    value: u64,
}

impl Pin {
    /// Pinned sequence or ordinal
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Kind of bound
    pub fn kind(&self) -> PinKind {
        self.kind
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        if let Some(trunk) = self.trunk.upgrade() {
            trunk.unpin(self.kind, self.value);
        }
    }
}

#[derive(Default)]
struct Pins {
    sequences: BTreeMap<u64, usize>,
    ordinals: BTreeMap<u64, usize>,
}

impl Pins {
    fn bucket(&mut self, kind: PinKind) -> &mut BTreeMap<u64, usize> {
        match kind {
            PinKind::Sequence => &mut self.sequences,
            PinKind::Ordinal => &mut self.ordinals,
        }
    }

    fn add(&mut self, kind: PinKind, value: u64) {
        *self.bucket(kind).entry(value).or_insert(0) += 1;
    }

    fn min_sequence(&self) -> u64 {
        self.sequences.keys().next().copied().unwrap_or(u64::MAX)
    }

    fn min_ordinal(&self) -> u64 {
        self.ordinals.keys().next().copied().unwrap_or(u64::MAX)
    }
}

/// Transaction outcome counters
#[derive(Debug, Default)]
pub struct TrunkStats {
    started: AtomicU64,
    committed: AtomicU64,
    conflicted: AtomicU64,
    aborted: AtomicU64,
    publish_retries: AtomicU64,
    trims: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`TrunkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrunkStatsSnapshot {
    /// Transactions started
    pub started: u64,
    /// Commits that published (or had nothing to publish)
    pub committed: u64,
    /// Commits that reported a conflict
    pub conflicted: u64,
    /// Explicit or implicit aborts
    pub aborted: u64,
    /// Publish attempts lost to a concurrent swap
    pub publish_retries: u64,
    /// Trims that folded at least one map
    pub trims: u64,
    /// Speculative maps rejected
    pub rejected: u64,
}

impl TrunkStats {
    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflicted(&self) {
        self.conflicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> TrunkStatsSnapshot {
        TrunkStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            conflicted: self.conflicted.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot captured by a starting transaction, with its pin
pub(crate) struct Capture {
    pub snapshot: Arc<Snapshot>,
    pub start_sequence: u64,
    /// Speculative maps hidden from the transaction
    pub excluded: SmallVec<[u64; 4]>,
    /// Speculative maps the transaction can read
    pub speculative_seen: SmallVec<[u64; 4]>,
    pub pin: Pin,
}

/// Logical root of a snapshot chain
pub struct Trunk {
    id: TrunkId,
    config: TrunkConfig,
    me: Weak<Trunk>,
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    objects: DashMap<ObjectId, Arc<ObjectDescriptor>>,
    object_prefix: u64,
    next_object: AtomicU64,
    root: RwLock<Option<ObjectId>>,
    pins: Mutex<Pins>,
    rejected: Mutex<FxHashSet<u64>>,
    observers: RwLock<Vec<Arc<dyn TrunkObserver>>>,
    stats: TrunkStats,
}

impl std::fmt::Debug for Trunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trunk")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl Trunk {
    /// Create an empty trunk with a fresh id
    pub fn new(config: TrunkConfig) -> Arc<Trunk> {
        Trunk::with_id(TrunkId::new(), config)
    }

    /// Create an empty trunk with a known id
    pub fn with_id(id: TrunkId, config: TrunkConfig) -> Arc<Trunk> {
        Trunk::build(id, config, Snapshot::empty(), Vec::new(), None)
    }

    /// Rebuild a trunk from replayed maps and descriptors.
    ///
    /// Every map is treated as acknowledged. No observer is notified.
    pub fn recover(
        id: TrunkId,
        config: TrunkConfig,
        maps: Vec<VersionMap>,
        descriptors: Vec<ObjectDescriptor>,
        root: Option<ObjectId>,
    ) -> Arc<Trunk> {
        let trunk = Trunk::build(id, config, Snapshot::recovered(maps), descriptors, root);
        let snapshot = trunk.snapshot();
        info!(
            target: "mvstm::trunk",
            trunk = %id,
            maps = snapshot.len() - 1,
            objects = trunk.objects.len(),
            "Recovered trunk"
        );
        trunk
    }

    fn build(
        id: TrunkId,
        config: TrunkConfig,
        snapshot: Snapshot,
        descriptors: Vec<ObjectDescriptor>,
        root: Option<ObjectId>,
    ) -> Arc<Trunk> {
        let objects = DashMap::new();
        for descriptor in descriptors {
            objects.insert(descriptor.id, Arc::new(descriptor));
        }
        // peers share object ids, so each trunk instance allocates in its own range
        let object_prefix = u64::from(rand::random::<u32>()) << 32;
        Arc::new_cyclic(|me| Trunk {
            id,
            config,
            me: me.clone(),
            snapshot: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
            objects,
            object_prefix,
            next_object: AtomicU64::new(1),
            root: RwLock::new(root),
            pins: Mutex::new(Pins::default()),
            rejected: Mutex::new(FxHashSet::default()),
            observers: RwLock::new(Vec::new()),
            stats: TrunkStats::default(),
        })
    }

    /// Trunk id
    pub fn id(&self) -> TrunkId {
        self.id
    }

    /// Settings fixed at creation
    pub fn config(&self) -> &TrunkConfig {
        &self.config
    }

    /// Notification cadence
    pub fn granularity(&self) -> Granularity {
        self.config.granularity
    }

    /// Transaction counters
    pub fn stats(&self) -> &TrunkStats {
        &self.stats
    }

    /// Owning handle to this trunk
    pub fn handle(&self) -> StmResult<Arc<Trunk>> {
        self.me
            .upgrade()
            .ok_or_else(|| StmError::invalid_state("trunk is being dropped"))
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// True while commits are published speculatively
    pub fn is_intercepted(&self) -> bool {
        self.snapshot.load().is_intercepted()
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register an observer
    pub fn add_observer(&self, observer: Arc<dyn TrunkObserver>) {
        self.observers.write().push(observer);
    }

    /// Unregister an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn TrunkObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    fn observers(&self) -> Vec<Arc<dyn TrunkObserver>> {
        self.observers.read().clone()
    }

    // ------------------------------------------------------------------
    // Pins
    // ------------------------------------------------------------------

    /// Keep maps with a sequence above `sequence` out of trimming
    pub fn pin_sequence(&self, sequence: u64) -> Pin {
        self.pin(PinKind::Sequence, sequence)
    }

    /// Keep maps with an acknowledgement ordinal above `ordinal` out of trimming
    pub fn pin_ordinal(&self, ordinal: u64) -> Pin {
        self.pin(PinKind::Ordinal, ordinal)
    }

    fn pin(&self, kind: PinKind, value: u64) -> Pin {
        self.pins.lock().add(kind, value);
        Pin {
            trunk: self.me.clone(),
            kind,
            value,
        }
    }

    fn unpin(&self, kind: PinKind, value: u64) {
        let mut pins = self.pins.lock();
        let bucket = pins.bucket(kind);
        if let Some(count) = bucket.get_mut(&value) {
            *count -= 1;
            if *count == 0 {
                bucket.remove(&value);
                if kind == PinKind::Sequence {
                    self.prune_rejected(&pins);
                }
            }
        }
    }

    /// Capture the current snapshot for a starting transaction.
    ///
    /// Loading and pinning happen under the pins mutex, which `trim` also
    /// holds, so no fold lands between the two.
    pub(crate) fn capture(&self, ignore_speculative: bool) -> Capture {
        let mut pins = self.pins.lock();
        let live = self.snapshot.load_full();
        let start_sequence = live.last_sequence();
        let speculative: SmallVec<[u64; 4]> = live
            .speculative_maps()
            .iter()
            .map(|m| m.sequence())
            .collect();
        let (snapshot, excluded, speculative_seen) = if ignore_speculative && !speculative.is_empty()
        {
            let trimmed = Arc::new(live.trimmed_to(live.acknowledged_index()));
            (trimmed, speculative, SmallVec::new())
        } else {
            (live, SmallVec::new(), speculative)
        };
        // rejection checks on speculative_seen need those entries kept
        let pinned = excluded
            .iter()
            .chain(speculative_seen.iter())
            .min()
            .map_or(start_sequence, |s| s.saturating_sub(1).min(start_sequence));
        pins.add(PinKind::Sequence, pinned);
        drop(pins);
        let pin = Pin {
            trunk: self.me.clone(),
            kind: PinKind::Sequence,
            value: pinned,
        };
        self.stats.record_started();
        Capture {
            snapshot,
            start_sequence,
            excluded,
            speculative_seen,
            pin,
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Append a locally committed map if the snapshot is still `expected`.
    ///
    /// On a lost race the versions are handed back for another attempt.
    pub(crate) fn try_publish(
        &self,
        expected: &Arc<Snapshot>,
        versions: Vec<Version>,
    ) -> Result<Arc<VersionMap>, Vec<Version>> {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        if !Arc::ptr_eq(&current, expected) {
            return Err(versions);
        }
        let (next, map) = current.with_published(versions);
        let acknowledged = next.acknowledged_index() == next.len() - 1;
        self.snapshot.store(Arc::new(next));
        drop(writer);

        debug!(
            target: "mvstm::trunk",
            trunk = %self.id,
            sequence = map.sequence(),
            speculative = !acknowledged,
            "Published version map"
        );
        let observers = self.observers();
        for observer in &observers {
            observer.on_published(self, &map);
        }
        if acknowledged {
            let maps = [map.clone()];
            for observer in &observers {
                observer.on_acknowledged(self, &maps);
            }
        }
        self.maybe_trim();
        Ok(map)
    }

    /// Insert a map already ordered by an authority.
    ///
    /// The map goes at the durable boundary, below local speculative maps, and
    /// is acknowledged on arrival. `validate` runs while other writers are held
    /// off and can refuse the map; nothing is published then.
    pub fn apply_remote<F>(
        &self,
        versions: Vec<Version>,
        source: Option<Source>,
        validate: F,
    ) -> Result<Arc<VersionMap>, ValidationResult>
    where
        F: FnOnce(&Snapshot) -> ValidationResult,
    {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let verdict = validate(&current);
        if !verdict.is_valid() {
            return Err(verdict);
        }
        let (next, map) = current.with_remote(versions, source);
        self.snapshot.store(Arc::new(next));
        drop(writer);

        debug!(
            target: "mvstm::trunk",
            trunk = %self.id,
            sequence = map.sequence(),
            source = ?source,
            "Applied remote version map"
        );
        let observers = self.observers();
        let maps = [map.clone()];
        for observer in &observers {
            observer.on_published(self, &map);
            observer.on_acknowledged(self, &maps);
        }
        self.maybe_trim();
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Interception
    // ------------------------------------------------------------------

    /// Switch to speculative publishing under a new interception id
    pub fn begin_interception(&self) -> InterceptionId {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let id = current.interception().next();
        self.snapshot.store(Arc::new(current.with_interception(true, id)));
        drop(writer);
        self.interception_changed(true, id);
        info!(target: "mvstm::intercept", trunk = %self.id, interception = %id, "Interception started");
        id
    }

    /// Leave speculative mode, accepting every pending map.
    ///
    /// Pending maps are acknowledged in the same swap that clears the flag, so
    /// a commit racing the reset is either accepted here or published durable.
    /// Returns the maps that became durable.
    pub fn end_interception(&self) -> Vec<Arc<VersionMap>> {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let id = current.interception().next();
        let accepted = current.speculative_maps().to_vec();
        let next = current
            .with_acknowledged_through(current.len() - 1)
            .with_interception(false, id);
        self.snapshot.store(Arc::new(next));
        drop(writer);

        self.after_acknowledged(&accepted);
        self.interception_changed(false, id);
        info!(
            target: "mvstm::intercept",
            trunk = %self.id,
            interception = %id,
            accepted = accepted.len(),
            "Interception ended"
        );
        accepted
    }

    fn interception_changed(&self, intercepted: bool, id: InterceptionId) {
        for observer in self.observers() {
            observer.on_interception_changed(self, intercepted, id);
        }
    }

    /// Acknowledge every map up to and including the one with `through`.
    ///
    /// Returns the maps that became durable; empty if they already were.
    /// Fails with `StaleInterception` if the map was published under another
    /// interception id, and `UnknownSequence` if no such map was published
    /// or it was rejected.
    pub fn acknowledge(
        &self,
        interception: InterceptionId,
        through: u64,
    ) -> StmResult<Vec<Arc<VersionMap>>> {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let position = match current.position_of(through) {
            Some(position) => position,
            None if through <= current.version_maps()[0].sequence()
                && !self.was_rejected(through) =>
            {
                // folded into the base, hence acknowledged
                return Ok(Vec::new());
            }
            None => return Err(StmError::UnknownSequence(through)),
        };
        if position <= current.acknowledged_index() {
            return Ok(Vec::new());
        }
        if let Some(expected) = current.version_maps()[position].interception() {
            if expected != interception {
                return Err(StmError::StaleInterception {
                    expected,
                    found: interception,
                });
            }
        }
        let acknowledged =
            current.version_maps()[current.acknowledged_index() + 1..=position].to_vec();
        self.snapshot.store(Arc::new(current.with_acknowledged_through(position)));
        drop(writer);
        self.after_acknowledged(&acknowledged);
        Ok(acknowledged)
    }

    /// Acknowledge every speculative map
    pub fn acknowledge_all(&self) -> Vec<Arc<VersionMap>> {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        if !current.has_speculative() {
            return Vec::new();
        }
        let acknowledged = current.speculative_maps().to_vec();
        self.snapshot
            .store(Arc::new(current.with_acknowledged_through(current.len() - 1)));
        drop(writer);
        self.after_acknowledged(&acknowledged);
        acknowledged
    }

    fn after_acknowledged(&self, maps: &[Arc<VersionMap>]) {
        if maps.is_empty() {
            return;
        }
        debug!(
            target: "mvstm::intercept",
            trunk = %self.id,
            count = maps.len(),
            through = maps[maps.len() - 1].sequence(),
            "Acknowledged version maps"
        );
        for observer in self.observers() {
            observer.on_acknowledged(self, maps);
        }
        self.maybe_trim();
    }

    /// Remove speculative maps with a sequence at or above `from_sequence`.
    ///
    /// Acknowledged maps cannot be rejected. Returns the removed maps.
    pub fn reject_from(&self, from_sequence: u64) -> StmResult<Vec<Arc<VersionMap>>> {
        let writer = self.writer.lock();
        let current = self.snapshot.load_full();
        if let Some(position) = current.position_of(from_sequence) {
            if position <= current.acknowledged_index() {
                return Err(StmError::invalid_state(format!(
                    "map {} is acknowledged and cannot be rejected",
                    from_sequence
                )));
            }
        }
        let (next, rejected) = current.without_speculative_from(from_sequence);
        if rejected.is_empty() {
            return Ok(rejected);
        }
        self.snapshot.store(Arc::new(next));
        {
            let pins = self.pins.lock();
            self.rejected
                .lock()
                .extend(rejected.iter().map(|m| m.sequence()));
            self.prune_rejected(&pins);
        }
        drop(writer);

        self.stats
            .rejected
            .fetch_add(rejected.len() as u64, Ordering::Relaxed);
        warn!(
            target: "mvstm::intercept",
            trunk = %self.id,
            from = from_sequence,
            count = rejected.len(),
            "Rejected speculative version maps"
        );
        for observer in self.observers() {
            observer.on_rejected(self, &rejected);
        }
        Ok(rejected)
    }

    /// True if the map with `sequence` was rejected
    pub fn was_rejected(&self, sequence: u64) -> bool {
        self.rejected.lock().contains(&sequence)
    }

    /// True if any of `sequences` was rejected
    pub(crate) fn any_rejected(&self, sequences: &[u64]) -> Option<u64> {
        let rejected = self.rejected.lock();
        sequences.iter().copied().find(|s| rejected.contains(s))
    }

    /// Number of rejected sequences still remembered
    pub fn rejected_count(&self) -> usize {
        self.rejected.lock().len()
    }

    /// Forget rejections no sequence pin can still ask about
    fn prune_rejected(&self, pins: &Pins) {
        let floor = pins.min_sequence();
        let mut rejected = self.rejected.lock();
        if floor == u64::MAX {
            rejected.clear();
        } else {
            rejected.retain(|&sequence| sequence > floor);
        }
    }

    // ------------------------------------------------------------------
    // Trimming
    // ------------------------------------------------------------------

    fn maybe_trim(&self) {
        if self.snapshot.load().len() > self.config.trim_threshold {
            self.trim();
        }
    }

    /// Fold the acknowledged prefix that no pin still needs into the base map.
    ///
    /// Returns the number of maps folded.
    pub fn trim(&self) -> usize {
        let writer = self.writer.lock();
        let pins = self.pins.lock();
        let current = self.snapshot.load_full();
        let (max_sequence, max_ordinal) = (pins.min_sequence(), pins.min_ordinal());
        let mut cut = 0;
        for index in 1..=current.acknowledged_index() {
            let sequence = current.version_maps()[index].sequence();
            let ordinal = current.ordinal_of(index).unwrap_or(u64::MAX);
            if sequence > max_sequence || ordinal > max_ordinal {
                break;
            }
            cut = index;
        }
        if cut == 0 {
            return 0;
        }
        self.snapshot.store(Arc::new(current.folded(cut)));
        drop(pins);
        drop(writer);
        self.stats.trims.fetch_add(1, Ordering::Relaxed);
        debug!(target: "mvstm::trunk", trunk = %self.id, folded = cut, "Trimmed snapshot");
        cut
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Register a new object
    pub fn create_object(&self, kind: ObjectKind) -> TObject {
        let id = self.allocate_object_id();
        self.insert_descriptor(ObjectDescriptor::new(id, kind), true);
        TObject::new(id, self.id, kind)
    }

    /// Register a new fields object with read-only values fixed now
    pub fn create_object_with_read_only(
        &self,
        kind: ObjectKind,
        read_only: Vec<(FieldIndex, Value)>,
    ) -> StmResult<TObject> {
        let count = match kind {
            ObjectKind::Fields { count } => count,
            other => {
                return Err(StmError::invalid_input(format!(
                    "read-only fields require a fields object, got {}",
                    other.name()
                )))
            }
        };
        let mut sorted = read_only;
        sorted.sort_by_key(|(field, _)| *field);
        sorted.dedup_by_key(|(field, _)| *field);
        let id = self.allocate_object_id();
        let mut descriptor = ObjectDescriptor::new(id, kind);
        let mut bits = Bits::new();
        for (field, value) in sorted {
            if field >= count {
                return Err(StmError::FieldOutOfRange {
                    object: id,
                    field,
                    count,
                });
            }
            bits.set(field);
            descriptor.read_only_values.push(value);
        }
        descriptor.read_only = bits;
        self.insert_descriptor(descriptor, true);
        Ok(TObject::new(id, self.id, kind))
    }

    /// Register an object created elsewhere, without notifying observers
    pub fn register_descriptor(&self, descriptor: ObjectDescriptor) -> TObject {
        let object = TObject::new(descriptor.id, self.id, descriptor.kind);
        self.insert_descriptor(descriptor, false);
        object
    }

    fn allocate_object_id(&self) -> ObjectId {
        ObjectId(self.object_prefix | self.next_object.fetch_add(1, Ordering::Relaxed))
    }

    fn insert_descriptor(&self, descriptor: ObjectDescriptor, notify: bool) {
        let descriptor = Arc::new(descriptor);
        self.objects.insert(descriptor.id, descriptor.clone());
        if notify {
            for observer in self.observers() {
                observer.on_object_created(self, &descriptor);
            }
        }
    }

    /// Descriptor of a registered object
    pub fn descriptor(&self, id: ObjectId) -> StmResult<Arc<ObjectDescriptor>> {
        self.objects
            .get(&id)
            .map(|d| d.value().clone())
            .ok_or(StmError::UnknownObject(id))
    }

    /// Handle to a registered object
    pub fn object(&self, id: ObjectId) -> Option<TObject> {
        self.objects
            .get(&id)
            .map(|d| TObject::new(id, self.id, d.kind))
    }

    /// All registered descriptors, in id order
    pub fn descriptors(&self) -> Vec<Arc<ObjectDescriptor>> {
        let mut all: Vec<_> = self.objects.iter().map(|d| d.value().clone()).collect();
        all.sort_by_key(|d| d.id);
        all
    }

    /// Number of registered objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Make `object` the root of the trunk
    pub fn set_root(&self, object: &TObject) -> StmResult<()> {
        if object.trunk() != self.id {
            return Err(StmError::WrongTrunk {
                object: object.id(),
                expected: self.id,
                actual: object.trunk(),
            });
        }
        self.descriptor(object.id())?;
        *self.root.write() = Some(object.id());
        for observer in self.observers() {
            observer.on_root_changed(self, object.id());
        }
        Ok(())
    }

    /// Root object, if set
    pub fn root(&self) -> Option<TObject> {
        let root = (*self.root.read())?;
        self.object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvstm_core::Value;
    use std::sync::atomic::AtomicUsize;

    fn write(object: ObjectId, value: i64) -> Version {
        let mut v = Version::new(object, ObjectKind::Fields { count: 4 });
        v.set_field(0, Value::Int(value));
        v
    }

    fn publish(trunk: &Trunk, version: Version) -> Arc<VersionMap> {
        let snapshot = trunk.snapshot();
        trunk.try_publish(&snapshot, vec![version]).unwrap()
    }

    #[derive(Default)]
    struct Counting {
        published: AtomicUsize,
        acknowledged: AtomicUsize,
        rejected: AtomicUsize,
    }

    impl TrunkObserver for Counting {
        fn on_published(&self, _trunk: &Trunk, _map: &Arc<VersionMap>) {
            self.published.fetch_add(1, Ordering::SeqCst);
        }
        fn on_acknowledged(&self, _trunk: &Trunk, maps: &[Arc<VersionMap>]) {
            self.acknowledged.fetch_add(maps.len(), Ordering::SeqCst);
        }
        fn on_rejected(&self, _trunk: &Trunk, maps: &[Arc<VersionMap>]) {
            self.rejected.fetch_add(maps.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_publish_requires_expected_snapshot() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        let stale = trunk.snapshot();
        publish(&trunk, write(obj.id(), 1));

        let returned = trunk.try_publish(&stale, vec![write(obj.id(), 2)]);
        assert_eq!(returned.unwrap_err().len(), 1);
        assert_eq!(
            trunk.snapshot().read_field(obj.id(), 0),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn test_observers_see_publish_and_ack() {
        let trunk = Trunk::new(TrunkConfig::default());
        let counting = Arc::new(Counting::default());
        trunk.add_observer(counting.clone());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });

        publish(&trunk, write(obj.id(), 1));
        let id = trunk.begin_interception();
        let spec = publish(&trunk, write(obj.id(), 2));
        assert_eq!(counting.published.load(Ordering::SeqCst), 2);
        assert_eq!(counting.acknowledged.load(Ordering::SeqCst), 1);

        let acked = trunk.acknowledge(id, spec.sequence()).unwrap();
        assert_eq!(acked.len(), 1);
        assert_eq!(counting.acknowledged.load(Ordering::SeqCst), 2);
        // second ack of the same map is a no-op
        assert!(trunk.acknowledge(id, spec.sequence()).unwrap().is_empty());
    }

    #[test]
    fn test_ack_with_stale_interception_fails() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        let id = trunk.begin_interception();
        let map = publish(&trunk, write(obj.id(), 1));
        let err = trunk.acknowledge(id.next(), map.sequence()).unwrap_err();
        assert!(matches!(err, StmError::StaleInterception { .. }));
        assert!(matches!(
            trunk.acknowledge(id, 99).unwrap_err(),
            StmError::UnknownSequence(99)
        ));
    }

    #[test]
    fn test_reject_and_end_interception() {
        let trunk = Trunk::new(TrunkConfig::default());
        let counting = Arc::new(Counting::default());
        trunk.add_observer(counting.clone());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });

        publish(&trunk, write(obj.id(), 1));
        trunk.begin_interception();
        let m2 = publish(&trunk, write(obj.id(), 2));
        let m3 = publish(&trunk, write(obj.id(), 3));

        let rejected = trunk.reject_from(m3.sequence()).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(counting.rejected.load(Ordering::SeqCst), 1);

        let accepted = trunk.end_interception();
        assert_eq!(accepted.len(), 1);
        assert!(!trunk.is_intercepted());
        let snapshot = trunk.snapshot();
        assert!(!snapshot.has_speculative());
        assert_eq!(snapshot.read_field(obj.id(), 0), Some(&Value::Int(2)));
        assert!(trunk.reject_from(m2.sequence()).is_err());
    }

    #[test]
    fn test_rejected_sequences_forgotten_once_unpinned() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        let id = trunk.begin_interception();
        let m1 = publish(&trunk, write(obj.id(), 1));
        let m2 = publish(&trunk, write(obj.id(), 2));

        let reader = trunk.pin_sequence(m1.sequence());
        trunk.reject_from(m2.sequence()).unwrap();
        assert!(trunk.was_rejected(m2.sequence()));
        assert!(!trunk.was_rejected(m1.sequence()));
        assert_eq!(trunk.rejected_count(), 1);

        drop(reader);
        assert_eq!(trunk.rejected_count(), 0);
        assert!(matches!(
            trunk.acknowledge(id, m2.sequence()).unwrap_err(),
            StmError::UnknownSequence(_)
        ));
    }

    #[test]
    fn test_rejection_without_pins_is_not_retained() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        for round in 0..10 {
            trunk.begin_interception();
            let map = publish(&trunk, write(obj.id(), round));
            trunk.reject_from(map.sequence()).unwrap();
            trunk.end_interception();
        }
        assert_eq!(trunk.stats().snapshot().rejected, 10);
        assert_eq!(trunk.rejected_count(), 0);
    }

    struct CommitOnAck {
        object: ObjectId,
        fired: std::sync::atomic::AtomicBool,
    }

    impl TrunkObserver for CommitOnAck {
        fn on_acknowledged(&self, trunk: &Trunk, _maps: &[Arc<VersionMap>]) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                publish(trunk, write(self.object, 99));
            }
        }
    }

    #[test]
    fn test_commit_during_end_interception_is_durable() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        trunk.begin_interception();
        publish(&trunk, write(obj.id(), 1));
        trunk.add_observer(Arc::new(CommitOnAck {
            object: obj.id(),
            fired: Default::default(),
        }));

        let accepted = trunk.end_interception();
        assert_eq!(accepted.len(), 1);
        let snapshot = trunk.snapshot();
        assert!(!trunk.is_intercepted());
        assert!(!snapshot.has_speculative());
        assert_eq!(snapshot.acknowledged_count(), 2);
        assert_eq!(snapshot.read_field(obj.id(), 0), Some(&Value::Int(99)));
    }

    #[test]
    fn test_snapshot_readable_while_writer_busy() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        publish(&trunk, write(obj.id(), 1));

        let writer = trunk.writer.lock();
        let reader = {
            let trunk = trunk.clone();
            std::thread::spawn(move || {
                let snapshot = trunk.snapshot();
                (snapshot.last_sequence(), trunk.is_intercepted())
            })
        };
        assert_eq!(reader.join().unwrap(), (1, false));
        drop(writer);
    }

    #[test]
    fn test_trim_respects_pins() {
        let config = TrunkConfig {
            trim_threshold: usize::MAX,
            ..TrunkConfig::default()
        };
        let trunk = Trunk::new(config);
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        for i in 1..=3 {
            publish(&trunk, write(obj.id(), i));
        }
        let pin = trunk.pin_sequence(2);
        for i in 4..=5 {
            publish(&trunk, write(obj.id(), i));
        }

        assert_eq!(trunk.trim(), 2);
        let snapshot = trunk.snapshot();
        assert_eq!(snapshot.version_maps()[1].sequence(), 3);
        assert_eq!(snapshot.acknowledged_count(), 5);

        drop(pin);
        assert_eq!(trunk.trim(), 3);
        let snapshot = trunk.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.read_field(obj.id(), 0), Some(&Value::Int(5)));
    }

    #[test]
    fn test_trim_never_folds_speculative() {
        let trunk = Trunk::new(TrunkConfig {
            trim_threshold: usize::MAX,
            ..TrunkConfig::default()
        });
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        publish(&trunk, write(obj.id(), 1));
        trunk.begin_interception();
        publish(&trunk, write(obj.id(), 2));
        assert_eq!(trunk.trim(), 1);
        let snapshot = trunk.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.has_speculative());
    }

    #[test]
    fn test_remote_map_goes_below_speculative() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk.create_object(ObjectKind::Fields { count: 4 });
        trunk.begin_interception();
        let local = publish(&trunk, write(obj.id(), 1));
        let remote = trunk
            .apply_remote(vec![write(obj.id(), 7)], Some(Source::new()), |_| {
                ValidationResult::ok()
            })
            .unwrap();
        let snapshot = trunk.snapshot();
        assert_eq!(snapshot.acknowledged_index(), 1);
        assert_eq!(snapshot.version_maps()[1].sequence(), remote.sequence());
        assert_eq!(snapshot.speculative_maps()[0].sequence(), local.sequence());
        // local speculative write still shadows the remote one
        assert_eq!(snapshot.read_field(obj.id(), 0), Some(&Value::Int(1)));
    }

    #[test]
    fn test_read_only_descriptor() {
        let trunk = Trunk::new(TrunkConfig::default());
        let obj = trunk
            .create_object_with_read_only(
                ObjectKind::Fields { count: 3 },
                vec![(2, Value::from("fixed")), (0, Value::Int(9))],
            )
            .unwrap();
        let descriptor = trunk.descriptor(obj.id()).unwrap();
        assert_eq!(descriptor.read_only_value(0), Some(&Value::Int(9)));
        assert_eq!(descriptor.read_only_value(2), Some(&Value::from("fixed")));
        assert_eq!(descriptor.read_only_value(1), None);

        let err = trunk
            .create_object_with_read_only(ObjectKind::Fields { count: 1 }, vec![(3, Value::Null)])
            .unwrap_err();
        assert!(matches!(err, StmError::FieldOutOfRange { .. }));
    }

    #[test]
    fn test_root_must_belong_to_trunk() {
        let a = Trunk::new(TrunkConfig::default());
        let b = Trunk::new(TrunkConfig::default());
        let foreign = b.create_object(ObjectKind::Keyed);
        assert!(matches!(
            a.set_root(&foreign).unwrap_err(),
            StmError::WrongTrunk { .. }
        ));
        let local = a.create_object(ObjectKind::Keyed);
        a.set_root(&local).unwrap();
        assert_eq!(a.root(), Some(local));
    }
}

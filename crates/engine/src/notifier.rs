//! Walking published maps into listener callbacks
//!
//! Each trunk gets one [`Notifier`]. It observes the trunk and, when new maps
//! show up, runs a [`Visitor`] over the maps it has not visited yet:
//!
//! ```text
//! on_visiting_branch   COALESCE: open a read transaction that ignores speculative data
//! visit each map       publish order; per version, ascending field / key / op order
//! on_visited_branch    hand batched changes to each listener's lane, close the read
//! ```
//!
//! ## Granularity
//!
//! - **All**: every published map is visited once, speculative maps included,
//!   and each change is delivered with the value that commit wrote. The cursor
//!   is the highest sequence visited, held by a sequence pin.
//! - **Coalesce**: only acknowledged maps are visited. A walk collects what
//!   changed and delivers each changed slot once, with the latest acknowledged
//!   value. The cursor is a lifetime acknowledgement ordinal, held by an
//!   ordinal pin.
//!
//! Under All, listeners that were told about a speculative map that is later
//! rejected get callbacks for the affected slots with their restored values.
//!
//! Walks are serialized per trunk. A signal that arrives while a walk runs,
//! on another thread or from inside a callback, makes the running walk go
//! around once more.

use crate::listener::{Change, ListenerId, ListenerRegistry, Registration};
use mvstm_concurrency::{
    ListOp, Pin, Snapshot, StartFlags, TObject, Transaction, Trunk, TrunkObserver, Version,
    VersionData, VersionMap,
};
use mvstm_core::{FieldIndex, Granularity, ObjectId, Source, StmResult, TrunkId, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Notifier counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    /// Walks run
    pub walks: u64,
    /// Maps visited
    pub maps_visited: u64,
    /// Changes handed to listeners
    pub changes_dispatched: u64,
    /// Rollback walks after rejections
    pub rollbacks: u64,
}

struct WalkState {
    cursor: u64,
    pin: Option<Pin>,
}

/// Delivers committed changes of one trunk to its listeners
pub struct Notifier {
    trunk: TrunkId,
    granularity: Granularity,
    merge_by_source: bool,
    registry: ListenerRegistry,
    signalled: AtomicBool,
    walk: Mutex<WalkState>,
    rejected: Mutex<Vec<Arc<VersionMap>>>,
    walks: AtomicU64,
    maps_visited: AtomicU64,
    changes_dispatched: AtomicU64,
    rollbacks: AtomicU64,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("trunk", &self.trunk)
            .field("granularity", &self.granularity)
            .field("merge_by_source", &self.merge_by_source)
            .field("listeners", &self.registry.len())
            .finish()
    }
}

impl Notifier {
    /// Start notifying for `trunk`. Only maps published from now on are
    /// delivered.
    pub fn attach(trunk: &Arc<Trunk>, merge_by_source: bool) -> Arc<Notifier> {
        let granularity = trunk.granularity();
        let snapshot = trunk.snapshot();
        let (cursor, pin) = match granularity {
            Granularity::All => {
                let cursor = snapshot.last_sequence();
                (cursor, trunk.pin_sequence(cursor))
            }
            Granularity::Coalesce => {
                let cursor = snapshot.acknowledged_count();
                (cursor, trunk.pin_ordinal(cursor))
            }
        };
        let notifier = Arc::new(Notifier {
            trunk: trunk.id(),
            granularity,
            merge_by_source,
            registry: ListenerRegistry::new(),
            signalled: AtomicBool::new(false),
            walk: Mutex::new(WalkState {
                cursor,
                pin: Some(pin),
            }),
            rejected: Mutex::new(Vec::new()),
            walks: AtomicU64::new(0),
            maps_visited: AtomicU64::new(0),
            changes_dispatched: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        });
        let observer: Arc<dyn TrunkObserver> = notifier.clone();
        trunk.add_observer(observer);
        debug!(target: "mvstm::notify", trunk = %trunk.id(), ?granularity, cursor, "Notifier attached");
        notifier
    }

    /// Stop observing `trunk` and release the cursor pin
    pub fn detach(self: &Arc<Self>, trunk: &Trunk) -> bool {
        let observer: Arc<dyn TrunkObserver> = self.clone();
        let removed = trunk.remove_observer(&observer);
        self.walk.lock().pin = None;
        removed
    }

    /// Listeners of this trunk
    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Delivery cadence, fixed by the trunk
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Last visited sequence (All) or acknowledgement ordinal (Coalesce)
    pub fn cursor(&self) -> u64 {
        self.walk.lock().cursor
    }

    /// Counters
    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            walks: self.walks.load(Ordering::Relaxed),
            maps_visited: self.maps_visited.load(Ordering::Relaxed),
            changes_dispatched: self.changes_dispatched.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }

    /// Walk whatever is new now, unless a walk is already running
    pub fn signal(&self, trunk: &Trunk) {
        self.signalled.store(true, Ordering::SeqCst);
        loop {
            let Some(mut state) = self.walk.try_lock() else {
                return;
            };
            while self.signalled.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.walk_once(&mut state, trunk) {
                    warn!(target: "mvstm::notify", trunk = %self.trunk, error = %e, "Notification walk failed");
                }
            }
            drop(state);
            // a signal raised after the last swap found the lock taken
            if !self.signalled.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn walk_once(&self, state: &mut WalkState, trunk: &Trunk) -> StmResult<()> {
        let rejected = std::mem::take(&mut *self.rejected.lock());
        let snapshot = trunk.snapshot();
        self.walks.fetch_add(1, Ordering::Relaxed);
        match self.granularity {
            Granularity::All => {
                self.roll_back(state, &snapshot, &rejected);
                self.walk_all(state, trunk, &snapshot);
                Ok(())
            }
            Granularity::Coalesce => self.walk_coalesce(state, trunk, &snapshot),
        }
    }

    fn walk_all(&self, state: &mut WalkState, trunk: &Trunk, snapshot: &Snapshot) {
        let mut maps: Vec<&Arc<VersionMap>> = snapshot.version_maps()[1..]
            .iter()
            .filter(|m| m.sequence() > state.cursor)
            .collect();
        if maps.is_empty() {
            return;
        }
        maps.sort_by_key(|m| m.sequence());

        let mut visitor = Visitor::new(self);
        visitor.on_visiting_branch(trunk, false);
        for map in &maps {
            visitor.visit_map(map);
        }
        visitor.on_visited_branch();

        if let Some(last) = maps.last() {
            state.cursor = last.sequence();
            state.pin = Some(trunk.pin_sequence(state.cursor));
        }
    }

    fn walk_coalesce(&self, state: &mut WalkState, trunk: &Trunk, snapshot: &Snapshot) -> StmResult<()> {
        let count = snapshot.acknowledged_count();
        if count <= state.cursor {
            return Ok(());
        }
        let behind = (count - state.cursor) as usize;
        let last = snapshot.acknowledged_index();
        let first = if behind > last {
            warn!(
                target: "mvstm::notify",
                trunk = %self.trunk,
                missing = behind - last,
                "Acknowledged maps were folded before notification"
            );
            1
        } else {
            last + 1 - behind
        };

        let mut visitor = Visitor::new(self);
        visitor.on_visiting_branch(trunk, true);
        for map in &snapshot.version_maps()[first..=last] {
            visitor.visit_map(map);
        }
        visitor.on_visited_branch();

        state.cursor = count;
        state.pin = Some(trunk.pin_ordinal(count));
        Ok(())
    }

    /// Tell listeners about slots whose visited values were rolled back
    fn roll_back(&self, state: &WalkState, snapshot: &Snapshot, rejected: &[Arc<VersionMap>]) {
        let seen: Vec<&Arc<VersionMap>> = rejected
            .iter()
            .filter(|m| m.sequence() <= state.cursor)
            .collect();
        if seen.is_empty() {
            return;
        }
        self.rollbacks.fetch_add(1, Ordering::Relaxed);

        let mut dirty: BTreeMap<ObjectId, Dirty> = BTreeMap::new();
        for map in seen {
            for version in map.versions() {
                if self.registry.listeners_of(version.object()).is_empty() {
                    continue;
                }
                dirty
                    .entry(version.object())
                    .or_insert_with(|| Dirty::empty_like(version.data()))
                    .absorb(version);
            }
        }
        for (object, dirty) in dirty {
            let registrations = self.registry.listeners_of(object);
            let changes = dirty.changes_from_snapshot(object, snapshot);
            self.dispatch(&registrations, changes);
        }
    }

    fn dispatch(&self, registrations: &[Arc<Registration>], changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        for registration in registrations {
            self.changes_dispatched
                .fetch_add(changes.len() as u64, Ordering::Relaxed);
            registration.dispatch(changes.clone());
        }
    }
}

impl TrunkObserver for Notifier {
    fn on_published(&self, trunk: &Trunk, _map: &Arc<VersionMap>) {
        if self.granularity == Granularity::All {
            self.signal(trunk);
        }
    }

    fn on_acknowledged(&self, trunk: &Trunk, _maps: &[Arc<VersionMap>]) {
        if self.granularity == Granularity::Coalesce {
            self.signal(trunk);
        }
    }

    fn on_rejected(&self, trunk: &Trunk, maps: &[Arc<VersionMap>]) {
        if self.granularity == Granularity::All {
            self.rejected.lock().extend(maps.iter().cloned());
            self.signal(trunk);
        }
    }
}

// ============================================================================
// Visitor
// ============================================================================

/// Slots of one object changed during a coalescing walk
#[derive(Debug)]
enum Dirty {
    Fields(BTreeSet<FieldIndex>),
    Keyed {
        cleared: bool,
        keys: BTreeSet<String>,
    },
    Indexed {
        structural: bool,
        slots: BTreeSet<u32>,
    },
}

impl Dirty {
    fn empty_like(data: &VersionData) -> Self {
        match data {
            VersionData::Fields { .. } => Dirty::Fields(BTreeSet::new()),
            VersionData::Keyed { .. } => Dirty::Keyed {
                cleared: false,
                keys: BTreeSet::new(),
            },
            VersionData::Indexed { .. } => Dirty::Indexed {
                structural: false,
                slots: BTreeSet::new(),
            },
        }
    }

    fn absorb(&mut self, version: &Version) {
        match self {
            Dirty::Fields(fields) => fields.extend(version.fields().map(|(f, _)| f)),
            Dirty::Keyed { cleared, keys } => {
                *cleared |= version.resets();
                keys.extend(version.keys().map(|(k, _)| k.to_string()));
            }
            Dirty::Indexed { structural, slots } => {
                if version.is_structural() {
                    *structural = true;
                } else if let Some(bits) = version.bits() {
                    slots.extend(bits.iter());
                }
            }
        }
    }

    /// Current values read through a transaction
    fn changes_from_transaction(&self, object: &TObject, txn: &mut Transaction) -> StmResult<Vec<Change>> {
        let mut changes = Vec::new();
        match self {
            Dirty::Fields(fields) => {
                for &field in fields {
                    let value = txn.get(object, field)?;
                    changes.push(Change::Field { field, value });
                }
            }
            Dirty::Keyed { cleared: true, .. } => {
                changes.push(Change::KeysCleared);
                for (key, value) in txn.entries(object)? {
                    changes.push(Change::Put { key, value });
                }
            }
            Dirty::Keyed { keys, .. } => {
                for key in keys {
                    changes.push(match txn.get_key(object, key)? {
                        Some(value) => Change::Put {
                            key: key.clone(),
                            value,
                        },
                        None => Change::KeyRemoved { key: key.clone() },
                    });
                }
            }
            Dirty::Indexed {
                structural: true, ..
            } => {
                changes.push(Change::ElementsCleared);
                for (index, value) in txn.list_items(object)?.into_iter().enumerate() {
                    changes.push(Change::Added {
                        index: index as u32,
                        value,
                    });
                }
            }
            Dirty::Indexed { slots, .. } => {
                for &index in slots {
                    if let Some(value) = txn.list_get(object, index)? {
                        changes.push(Change::ElementSet { index, value });
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Current values read straight from a snapshot
    fn changes_from_snapshot(&self, object: ObjectId, snapshot: &Snapshot) -> Vec<Change> {
        let mut changes = Vec::new();
        match self {
            Dirty::Fields(fields) => {
                for &field in fields {
                    let value = snapshot
                        .read_field(object, field)
                        .cloned()
                        .unwrap_or(Value::Null);
                    changes.push(Change::Field { field, value });
                }
            }
            Dirty::Keyed { cleared: true, .. } => {
                changes.push(Change::KeysCleared);
                for (key, value) in snapshot.keyed_entries(object) {
                    changes.push(Change::Put { key, value });
                }
            }
            Dirty::Keyed { keys, .. } => {
                for key in keys {
                    changes.push(match snapshot.read_key(object, key) {
                        Some(value) => Change::Put {
                            key: key.clone(),
                            value: value.clone(),
                        },
                        None => Change::KeyRemoved { key: key.clone() },
                    });
                }
            }
            Dirty::Indexed { .. } => {
                changes.push(Change::ElementsCleared);
                for (index, value) in snapshot.list(object).into_iter().enumerate() {
                    changes.push(Change::Added {
                        index: index as u32,
                        value,
                    });
                }
            }
        }
        changes
    }
}

/// Changes a single version made, in delivery order
fn changes_of(version: &Version) -> Vec<Change> {
    match version.data() {
        VersionData::Fields { .. } => version
            .fields()
            .map(|(field, value)| Change::Field {
                field,
                value: value.clone(),
            })
            .collect(),
        VersionData::Keyed { cleared, .. } => {
            let mut changes = Vec::new();
            if *cleared {
                changes.push(Change::KeysCleared);
            }
            changes.extend(version.keys().map(|(key, value)| match value {
                Some(value) => Change::Put {
                    key: key.to_string(),
                    value: value.clone(),
                },
                None => Change::KeyRemoved {
                    key: key.to_string(),
                },
            }));
            changes
        }
        VersionData::Indexed { resets, ops, .. } => {
            let mut changes = Vec::with_capacity(ops.len() + 1);
            if *resets && !matches!(ops.first(), Some(ListOp::Clear)) {
                changes.push(Change::ElementsCleared);
            }
            changes.extend(ops.iter().map(|op| match op {
                ListOp::Insert { index, value } => Change::Added {
                    index: *index,
                    value: value.clone(),
                },
                ListOp::Remove { index } => Change::ElementRemoved { index: *index },
                ListOp::Set { index, value } => Change::ElementSet {
                    index: *index,
                    value: value.clone(),
                },
                ListOp::Clear => Change::ElementsCleared,
            }));
            changes
        }
    }
}

/// One walk over the unvisited maps of a trunk.
///
/// Changes are batched per listener and handed over at the end of the walk,
/// or earlier when the producing source changes under merge-by-source.
pub struct Visitor<'a> {
    notifier: &'a Notifier,
    read: Option<Transaction>,
    batches: Vec<(Arc<Registration>, Vec<Change>)>,
    batch_of: FxHashMap<ListenerId, usize>,
    dirty: BTreeMap<ObjectId, (TObject, Dirty)>,
    source: Option<Option<Source>>,
}

impl<'a> Visitor<'a> {
    fn new(notifier: &'a Notifier) -> Self {
        Visitor {
            notifier,
            read: None,
            batches: Vec::new(),
            batch_of: FxHashMap::default(),
            dirty: BTreeMap::new(),
            source: None,
        }
    }

    /// Prepare a walk over `trunk`. Coalescing walks read current values
    /// through a transaction that ignores speculative data.
    pub fn on_visiting_branch(&mut self, trunk: &Trunk, coalesce: bool) {
        if !coalesce {
            return;
        }
        match trunk.handle() {
            Ok(handle) => {
                self.read = Some(Transaction::start_with(
                    &handle,
                    StartFlags::IGNORE_SPECULATIVE_DATA,
                ));
            }
            Err(e) => {
                warn!(target: "mvstm::notify", trunk = %trunk.id(), error = %e, "Trunk dropped during walk");
            }
        }
    }

    /// Visit one map: batch its changes (All) or record what it dirtied
    /// (Coalesce).
    pub fn visit_map(&mut self, map: &VersionMap) {
        self.flush_on_source_change_and_return_if_delay_merge(map.source());
        self.source = Some(map.source());
        self.notifier.maps_visited.fetch_add(1, Ordering::Relaxed);
        for version in map.versions() {
            let registrations = self.notifier.registry.listeners_of(version.object());
            let Some(first) = registrations.first() else {
                continue;
            };
            if self.read.is_some() {
                let object = *first.object();
                self.dirty
                    .entry(version.object())
                    .or_insert_with(|| (object, Dirty::empty_like(version.data())))
                    .1
                    .absorb(version);
            } else {
                let changes = changes_of(version);
                for registration in registrations {
                    self.batch(registration, &changes);
                }
            }
        }
    }

    fn batch(&mut self, registration: Arc<Registration>, changes: &[Change]) {
        match self.batch_of.get(&registration.id()) {
            Some(&slot) => self.batches[slot].1.extend_from_slice(changes),
            None => {
                self.batch_of.insert(registration.id(), self.batches.len());
                self.batches.push((registration, changes.to_vec()));
            }
        }
    }

    /// Under merge-by-source, hand over everything pending before a map from
    /// another source is merged in.
    ///
    /// Returns true if the caller must delay the merge until that flush has
    /// happened, false if the new map can be merged into the pending batch.
    pub fn flush_on_source_change_and_return_if_delay_merge(&mut self, source: Option<Source>) -> bool {
        if !self.notifier.merge_by_source {
            return false;
        }
        match self.source {
            Some(previous) if previous != source && self.has_pending() => {
                self.flush();
                true
            }
            _ => false,
        }
    }

    fn has_pending(&self) -> bool {
        !self.batches.is_empty() || !self.dirty.is_empty()
    }

    fn flush(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        if let Some(txn) = self.read.as_mut() {
            for (object, (handle, dirty)) in dirty {
                match dirty.changes_from_transaction(&handle, txn) {
                    Ok(changes) => {
                        let registrations = self.notifier.registry.listeners_of(object);
                        self.notifier.dispatch(&registrations, changes);
                    }
                    Err(e) => {
                        warn!(target: "mvstm::notify", %object, error = %e, "Reading coalesced values failed");
                    }
                }
            }
        }
        self.batch_of.clear();
        for (registration, changes) in self.batches.drain(..) {
            self.notifier
                .changes_dispatched
                .fetch_add(changes.len() as u64, Ordering::Relaxed);
            registration.dispatch(changes);
        }
    }

    /// Finish the walk: hand over pending changes and close the read
    /// transaction.
    pub fn on_visited_branch(&mut self) {
        self.flush();
        if let Some(mut txn) = self.read.take() {
            txn.abort();
        }
    }
}

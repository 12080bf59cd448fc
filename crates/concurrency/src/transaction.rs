//! Transactions over a trunk's snapshot chain
//!
//! A `Transaction` captures the trunk's current snapshot at start and reads
//! from it for its whole lifetime (snapshot isolation). Writes accumulate in
//! private `Version`s, one per object, and reach the trunk only on commit.
//!
//! # Read-Your-Writes
//!
//! Reads check the transaction's own pending version first, then the captured
//! snapshot. Only snapshot reads are recorded in the object's [`Footprint`].
//!
//! # Commit
//!
//! ```text
//! 1. No writes: SUCCESS, nothing published
//! 2. Speculative data read by the transaction was rejected: CONFLICT
//! 3. Validate against maps published since start: CONFLICT on overlap
//! 4. Publish if the trunk still holds the validated snapshot
//! 5. Lost the race: validate only the newer maps, back off, go to 4
//! ```
//!
//! Step 5 is bounded by `TrunkConfig::max_publish_retries`; on exhaustion the
//! transaction aborts with `StmError::PublishContention`.
//!
//! # Rollback
//!
//! Errors returned by the body of a transaction never roll it back
//! implicitly: call `abort()`. Dropping an active transaction aborts it.
//! `nested` is the exception: a failing nested body restores the private
//! state it started with.

use crate::object::TObject;
use crate::pool::SavepointPool;
use crate::snapshot::Snapshot;
use crate::trunk::{Pin, Trunk};
use crate::validation::{validate_against, ConflictType, Footprint, Touched, ValidationResult};
use crate::version::{KeyLookup, ListOp, Version};
use crate::version_map::VersionMap;
use mvstm_core::{FieldIndex, ObjectDescriptor, ObjectId, ObjectKind, StmError, StmResult, Value};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Status of a transaction in its lifecycle
///
/// `Active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is executing, can read/write
    Active,
    /// Commit published (or had nothing to publish)
    Success,
    /// Commit found a conflicting map
    Conflict,
    /// Transaction was aborted
    Aborted,
}

impl TransactionStatus {
    /// True for every state but `Active`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

/// Outcome of a commit that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Writes are published
    Success,
    /// Writes were discarded; retry the whole body
    Conflict,
}

/// Options for starting a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StartFlags(u8);

impl StartFlags {
    /// No option
    pub const NONE: StartFlags = StartFlags(0);
    /// Read only acknowledged data, hiding speculative maps
    pub const IGNORE_SPECULATIVE_DATA: StartFlags = StartFlags(1);

    /// True if every flag of `other` is set
    pub fn contains(self, other: StartFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StartFlags {
    type Output = StartFlags;

    fn bitor(self, rhs: StartFlags) -> StartFlags {
        StartFlags(self.0 | rhs.0)
    }
}

/// What a transaction did to one object
#[derive(Debug, Clone)]
pub(crate) struct Access {
    descriptor: Arc<ObjectDescriptor>,
    reads: Footprint,
    write: Option<Version>,
}

impl Access {
    fn new(descriptor: Arc<ObjectDescriptor>) -> Self {
        Access {
            reads: Footprint::for_kind(descriptor.kind),
            descriptor,
            write: None,
        }
    }

    fn write_mut(&mut self) -> &mut Version {
        let descriptor = &self.descriptor;
        self.write
            .get_or_insert_with(|| Version::new(descriptor.id, descriptor.kind))
    }

    fn pending(&self) -> Option<&Version> {
        self.write.as_ref().filter(|w| !w.is_empty())
    }
}

/// Unit of work against one trunk
pub struct Transaction {
    id: u64,
    trunk: Arc<Trunk>,
    snapshot: Arc<Snapshot>,
    start_sequence: u64,
    excluded: SmallVec<[u64; 4]>,
    speculative_seen: SmallVec<[u64; 4]>,
    flags: StartFlags,
    status: TransactionStatus,
    accesses: BTreeMap<ObjectId, Access>,
    depth: u32,
    pin: Option<Pin>,
    committed: Option<Arc<VersionMap>>,
    conflicts: Vec<ConflictType>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("trunk", &self.trunk.id())
            .field("start_sequence", &self.start_sequence)
            .field("status", &self.status)
            .field("objects", &self.accesses.len())
            .finish()
    }
}

impl Transaction {
    /// Start a transaction on the trunk's current snapshot
    pub fn start(trunk: &Arc<Trunk>) -> Transaction {
        Transaction::start_with(trunk, StartFlags::NONE)
    }

    /// Start a transaction with options.
    ///
    /// With `IGNORE_SPECULATIVE_DATA` the transaction reads a private copy of
    /// the snapshot cut at the acknowledged boundary; the live snapshot is
    /// left untouched.
    pub fn start_with(trunk: &Arc<Trunk>, flags: StartFlags) -> Transaction {
        let capture = trunk.capture(flags.contains(StartFlags::IGNORE_SPECULATIVE_DATA));
        let id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "mvstm::txn",
            txn = id,
            trunk = %trunk.id(),
            start = capture.start_sequence,
            hidden = capture.excluded.len(),
            "Transaction started"
        );
        Transaction {
            id,
            trunk: trunk.clone(),
            snapshot: capture.snapshot,
            start_sequence: capture.start_sequence,
            excluded: capture.excluded,
            speculative_seen: capture.speculative_seen,
            flags,
            status: TransactionStatus::Active,
            accesses: BTreeMap::new(),
            depth: 0,
            pin: Some(capture.pin),
            committed: None,
            conflicts: Vec::new(),
        }
    }

    /// Process-unique transaction id, for logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Trunk the transaction runs on
    pub fn trunk(&self) -> &Arc<Trunk> {
        &self.trunk
    }

    /// Snapshot the transaction reads from
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Last sequence visible when the transaction started
    pub fn start_sequence(&self) -> u64 {
        self.start_sequence
    }

    /// Start options
    pub fn flags(&self) -> StartFlags {
        self.flags
    }

    /// Lifecycle state
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// True until commit or abort
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Nesting depth; 0 outside `nested`
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// True if nothing would be published on commit
    pub fn is_read_only(&self) -> bool {
        self.accesses.values().all(|a| a.pending().is_none())
    }

    /// Conflicts reported by the last commit
    pub fn conflicts(&self) -> &[ConflictType] {
        &self.conflicts
    }

    /// Map published by a successful commit; `None` for read-only commits
    pub fn committed_map(&self) -> Option<&Arc<VersionMap>> {
        self.committed.as_ref()
    }

    /// Sequence of the published map
    pub fn committed_sequence(&self) -> Option<u64> {
        self.committed.as_ref().map(|m| m.sequence())
    }

    /// Fail unless the transaction is active
    pub fn ensure_active(&self) -> StmResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StmError::invalid_state(format!(
                "Transaction {} is not active: {:?}",
                self.id, self.status
            )))
        }
    }

    fn access(&mut self, object: &TObject, expected: &'static str) -> StmResult<&mut Access> {
        self.ensure_active()?;
        if object.trunk() != self.trunk.id() {
            return Err(StmError::WrongTrunk {
                object: object.id(),
                expected: self.trunk.id(),
                actual: object.trunk(),
            });
        }
        if !self.accesses.contains_key(&object.id()) {
            let descriptor = self.trunk.descriptor(object.id())?;
            self.accesses.insert(object.id(), Access::new(descriptor));
        }
        let access = self
            .accesses
            .get_mut(&object.id())
            .ok_or(StmError::UnknownObject(object.id()))?;
        let actual = access.descriptor.kind.name();
        if actual != expected {
            return Err(StmError::KindMismatch {
                object: object.id(),
                expected,
                actual,
            });
        }
        Ok(access)
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    fn check_field(access: &Access, field: FieldIndex) -> StmResult<()> {
        match access.descriptor.kind {
            ObjectKind::Fields { count } if field >= count => Err(StmError::FieldOutOfRange {
                object: access.descriptor.id,
                field,
                count,
            }),
            _ => Ok(()),
        }
    }

    /// Read a field. Unwritten fields read as `Value::Null`.
    pub fn get(&mut self, object: &TObject, field: FieldIndex) -> StmResult<Value> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "fields")?;
        Self::check_field(access, field)?;
        if let Some(value) = access.descriptor.read_only_value(field) {
            return Ok(value.clone());
        }
        if let Some(value) = access.write.as_ref().and_then(|w| w.field(field)) {
            return Ok(value.clone());
        }
        access.reads.read_field(field);
        Ok(snapshot
            .read_field(object.id(), field)
            .cloned()
            .unwrap_or_default())
    }

    /// Write a field
    pub fn set(&mut self, object: &TObject, field: FieldIndex, value: impl Into<Value>) -> StmResult<()> {
        let access = self.access(object, "fields")?;
        Self::check_field(access, field)?;
        if access.descriptor.read_only.get(field) {
            return Err(StmError::ReadOnlyField {
                object: object.id(),
                field,
            });
        }
        access.write_mut().set_field(field, value.into());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Keyed
    // ------------------------------------------------------------------

    fn entries_of(snapshot: &Snapshot, access: &Access, object: ObjectId) -> BTreeMap<String, Value> {
        let mut entries = snapshot.keyed_entries(object);
        if let Some(write) = &access.write {
            write.apply_entries(&mut entries);
        }
        entries
    }

    /// Value of `key`, `None` if absent
    pub fn get_key(&mut self, object: &TObject, key: &str) -> StmResult<Option<Value>> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "keyed")?;
        if let Some(write) = &access.write {
            match write.entry(key) {
                KeyLookup::Put(value) => return Ok(Some(value.clone())),
                KeyLookup::Removed => return Ok(None),
                KeyLookup::Untouched => {}
            }
        }
        access.reads.read_key(key);
        Ok(snapshot.read_key(object.id(), key).cloned())
    }

    /// True if `key` is present
    pub fn contains_key(&mut self, object: &TObject, key: &str) -> StmResult<bool> {
        Ok(self.get_key(object, key)?.is_some())
    }

    /// Insert or replace `key`
    pub fn put(&mut self, object: &TObject, key: impl Into<String>, value: impl Into<Value>) -> StmResult<()> {
        let access = self.access(object, "keyed")?;
        access.write_mut().put(key.into(), value.into());
        Ok(())
    }

    /// Remove `key`; removing an absent key is not an error
    pub fn remove_key(&mut self, object: &TObject, key: impl Into<String>) -> StmResult<()> {
        let access = self.access(object, "keyed")?;
        access.write_mut().remove_key(key.into());
        Ok(())
    }

    /// Remove every entry
    pub fn clear(&mut self, object: &TObject) -> StmResult<()> {
        let access = self.access(object, "keyed")?;
        access.write_mut().clear_entries();
        Ok(())
    }

    /// All entries, in key order
    pub fn entries(&mut self, object: &TObject) -> StmResult<BTreeMap<String, Value>> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "keyed")?;
        access.reads.read_all();
        Ok(Self::entries_of(&snapshot, access, object.id()))
    }

    /// All keys, in order
    pub fn keys(&mut self, object: &TObject) -> StmResult<Vec<String>> {
        Ok(self.entries(object)?.into_keys().collect())
    }

    /// Number of entries
    pub fn entry_count(&mut self, object: &TObject) -> StmResult<usize> {
        Ok(self.entries(object)?.len())
    }

    // ------------------------------------------------------------------
    // Indexed
    // ------------------------------------------------------------------

    fn list_of(snapshot: &Snapshot, access: &Access, object: ObjectId) -> Vec<Value> {
        let mut list = snapshot.list(object);
        if let Some(write) = &access.write {
            write.apply_ops(&mut list);
        }
        list
    }

    /// Element at `index`, `None` past the end
    pub fn list_get(&mut self, object: &TObject, index: u32) -> StmResult<Option<Value>> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "indexed")?;
        let wrote_slot = access
            .write
            .as_ref()
            .and_then(Version::bits)
            .map_or(false, |bits| bits.get(index));
        if !wrote_slot {
            access.reads.read_slot(index);
        }
        Ok(Self::list_of(&snapshot, access, object.id())
            .into_iter()
            .nth(index as usize))
    }

    /// Number of elements
    pub fn list_len(&mut self, object: &TObject) -> StmResult<usize> {
        Ok(self.list_items(object)?.len())
    }

    /// All elements, in order
    pub fn list_items(&mut self, object: &TObject) -> StmResult<Vec<Value>> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "indexed")?;
        access.reads.read_all();
        Ok(Self::list_of(&snapshot, access, object.id()))
    }

    /// Append an element
    pub fn list_push(&mut self, object: &TObject, value: impl Into<Value>) -> StmResult<()> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "indexed")?;
        let len = Self::list_of(&snapshot, access, object.id()).len();
        access.reads.read_all();
        access.write_mut().push_op(ListOp::Insert {
            index: len as u32,
            value: value.into(),
        });
        Ok(())
    }

    /// Insert before `index`; `index == len` appends
    pub fn list_insert(&mut self, object: &TObject, index: u32, value: impl Into<Value>) -> StmResult<()> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "indexed")?;
        let len = Self::list_of(&snapshot, access, object.id()).len();
        if index as usize > len {
            return Err(StmError::IndexOutOfBounds {
                object: object.id(),
                index: index as usize,
                len,
            });
        }
        access.reads.read_all();
        access.write_mut().push_op(ListOp::Insert {
            index,
            value: value.into(),
        });
        Ok(())
    }

    /// Remove and return the element at `index`
    pub fn list_remove(&mut self, object: &TObject, index: u32) -> StmResult<Value> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "indexed")?;
        let list = Self::list_of(&snapshot, access, object.id());
        let len = list.len();
        let removed = list
            .into_iter()
            .nth(index as usize)
            .ok_or(StmError::IndexOutOfBounds {
                object: object.id(),
                index: index as usize,
                len,
            })?;
        access.reads.read_all();
        access.write_mut().push_op(ListOp::Remove { index });
        Ok(removed)
    }

    /// Replace the element at `index`
    pub fn list_set(&mut self, object: &TObject, index: u32, value: impl Into<Value>) -> StmResult<()> {
        let snapshot = self.snapshot.clone();
        let access = self.access(object, "indexed")?;
        let len = Self::list_of(&snapshot, access, object.id()).len();
        if index as usize >= len {
            return Err(StmError::IndexOutOfBounds {
                object: object.id(),
                index: index as usize,
                len,
            });
        }
        access.write_mut().push_op(ListOp::Set {
            index,
            value: value.into(),
        });
        Ok(())
    }

    /// Remove every element
    pub fn list_clear(&mut self, object: &TObject) -> StmResult<()> {
        let access = self.access(object, "indexed")?;
        access.reads.read_all();
        access.write_mut().push_op(ListOp::Clear);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nesting
    // ------------------------------------------------------------------

    /// Run `body` as a nested transaction.
    ///
    /// If `body` fails while the transaction is still active, private state
    /// is restored to what it was before `body` ran; the error is returned.
    pub fn nested<T, F>(&mut self, body: F) -> StmResult<T>
    where
        F: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        self.ensure_active()?;
        let mut saved = SavepointPool::acquire();
        saved.extend(self.accesses.iter().map(|(id, a)| (*id, a.clone())));
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;
        if result.is_err() && self.is_active() {
            debug!(target: "mvstm::txn", txn = self.id, depth = self.depth, "Nested transaction rolled back");
            self.accesses.clear();
            self.accesses.extend(saved.drain(..));
        }
        SavepointPool::release(saved);
        result
    }

    // ------------------------------------------------------------------
    // Commit / abort
    // ------------------------------------------------------------------

    fn collect_writes(&self) -> Vec<Version> {
        self.accesses
            .values()
            .filter_map(Access::pending)
            .cloned()
            .collect()
    }

    fn validate(&self, current: &Snapshot, checked_through: Option<u64>) -> ValidationResult {
        if let Some(sequence) = self.trunk.any_rejected(&self.speculative_seen) {
            return ValidationResult::conflict(ConflictType::RolledBack { sequence });
        }
        let touched: Vec<Touched<'_>> = self
            .accesses
            .iter()
            .map(|(id, a)| Touched {
                object: *id,
                reads: (!a.reads.is_empty()).then_some(&a.reads),
                write: a.pending(),
            })
            .collect();
        match checked_through {
            None => validate_against(current, &touched, |s| {
                s > self.start_sequence || self.excluded.contains(&s)
            }),
            Some(checked) => validate_against(current, &touched, |s| s > checked),
        }
    }

    /// Validate and publish.
    ///
    /// Returns `CommitStatus::Conflict` when an intervening map overlaps the
    /// transaction's reads or writes; nothing is published then. Fails if the
    /// transaction is not active, or with `PublishContention` when every
    /// publish attempt lost to a concurrent commit.
    pub fn commit(&mut self) -> StmResult<CommitStatus> {
        self.ensure_active()?;
        let mut versions = self.collect_writes();
        if versions.is_empty() {
            self.finish(TransactionStatus::Success);
            self.trunk.stats().record_committed();
            debug!(target: "mvstm::txn", txn = self.id, "Read-only transaction committed");
            return Ok(CommitStatus::Success);
        }

        let attempts = self.trunk.config().max_publish_retries.max(1);
        let mut checked_through = None;
        for attempt in 0..attempts {
            let current = self.trunk.snapshot();
            let verdict = self.validate(&current, checked_through);
            if !verdict.is_valid() {
                warn!(
                    target: "mvstm::txn",
                    txn = self.id,
                    conflicts = verdict.conflict_count(),
                    first = ?verdict.conflicts.first(),
                    "Transaction conflict"
                );
                self.conflicts = verdict.conflicts;
                self.finish(TransactionStatus::Conflict);
                self.trunk.stats().record_conflicted();
                return Ok(CommitStatus::Conflict);
            }
            checked_through = Some(current.last_sequence());
            match self.trunk.try_publish(&current, versions) {
                Ok(map) => {
                    debug!(
                        target: "mvstm::txn",
                        txn = self.id,
                        sequence = map.sequence(),
                        objects = map.len(),
                        attempts = attempt + 1,
                        "Transaction committed"
                    );
                    self.committed = Some(map);
                    self.finish(TransactionStatus::Success);
                    self.trunk.stats().record_committed();
                    return Ok(CommitStatus::Success);
                }
                Err(returned) => {
                    versions = returned;
                    self.trunk.stats().record_publish_retry();
                    backoff(attempt);
                }
            }
        }

        warn!(target: "mvstm::txn", txn = self.id, attempts, "Publish contention, aborting");
        self.finish(TransactionStatus::Aborted);
        self.trunk.stats().record_aborted();
        Err(StmError::PublishContention { attempts })
    }

    /// Discard private writes. No-op unless active.
    pub fn abort(&mut self) {
        if !self.is_active() {
            return;
        }
        debug!(target: "mvstm::txn", txn = self.id, "Transaction aborted");
        self.finish(TransactionStatus::Aborted);
        self.trunk.stats().record_aborted();
    }

    fn finish(&mut self, status: TransactionStatus) {
        self.status = status;
        self.accesses.clear();
        self.pin = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Spin for the first attempts, then yield the thread
fn backoff(attempt: u32) {
    if attempt < 6 {
        for _ in 0..(1u32 << attempt) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

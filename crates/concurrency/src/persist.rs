//! Writing acknowledged maps to a store
//!
//! A [`Persister`] observes a trunk and appends every map to the store once
//! it is acknowledged, in acknowledgement order. Speculative maps are never
//! written, so a rejected map cannot reach disk.
//!
//! Progress is tracked as a lifetime acknowledgement ordinal. The persister
//! holds an ordinal pin at that position, so maps it has not written yet stay
//! in the snapshot until it has.

use crate::payload::{descriptor_to_bytes, MapPayload};
use crate::trunk::{Pin, Trunk, TrunkObserver};
use crate::version_map::VersionMap;
use mvstm_core::{ObjectDescriptor, ObjectId, StmResult};
use mvstm_durability::{RecordKind, Store, StoreRecord};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

struct PersistState {
    persisted: u64,
    pin: Option<Pin>,
}

/// Trunk observer appending acknowledged maps to a store
pub struct Persister {
    store: Arc<dyn Store>,
    state: Mutex<PersistState>,
    failures: AtomicU64,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("persisted", &self.persisted())
            .field("failures", &self.failures())
            .finish()
    }
}

impl Persister {
    /// Start persisting `trunk` to `store`.
    ///
    /// `persisted` is the number of acknowledged maps the store already holds:
    /// 0 for a fresh trunk, the replayed map count for a recovered one. On a
    /// fresh trunk the descriptors registered so far are written too.
    pub fn attach(trunk: &Arc<Trunk>, store: Arc<dyn Store>, persisted: u64) -> StmResult<Arc<Persister>> {
        let persister = Arc::new(Persister {
            store,
            state: Mutex::new(PersistState {
                persisted,
                pin: Some(trunk.pin_ordinal(persisted)),
            }),
            failures: AtomicU64::new(0),
        });
        if persisted == 0 {
            for descriptor in trunk.descriptors() {
                persister.write_descriptor(&descriptor)?;
            }
            if let Some(root) = trunk.root() {
                persister.store.set_root(root.id())?;
            }
        }
        trunk.add_observer(persister.clone());
        persister.flush(trunk)?;
        Ok(persister)
    }

    /// Acknowledged maps written so far, as a lifetime ordinal
    pub fn persisted(&self) -> u64 {
        self.state.lock().persisted
    }

    /// Store errors seen by observer callbacks
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Write every acknowledged map not yet in the store.
    ///
    /// Returns the number of maps written.
    pub fn flush(&self, trunk: &Trunk) -> StmResult<usize> {
        let mut state = self.state.lock();
        let snapshot = trunk.snapshot();
        let count = snapshot.acknowledged_count();
        if count <= state.persisted {
            return Ok(0);
        }
        let behind = (count - state.persisted) as usize;
        let last = snapshot.acknowledged_index();
        if behind > last {
            // only possible if the pin was bypassed
            return Err(mvstm_core::StmError::internal(format!(
                "{} acknowledged maps were folded before being persisted",
                behind - last
            )));
        }
        let pending: &[Arc<VersionMap>] = &snapshot.version_maps()[last + 1 - behind..=last];
        for map in pending {
            let payload = MapPayload::from_map(map).to_bytes()?;
            self.store.append_commit(map.sequence(), payload)?;
            state.persisted += 1;
        }
        state.pin = Some(trunk.pin_ordinal(state.persisted));
        debug!(
            target: "mvstm::store",
            trunk = %trunk.id(),
            written = behind,
            persisted = state.persisted,
            "Persisted version maps"
        );
        Ok(behind)
    }

    fn write_descriptor(&self, descriptor: &ObjectDescriptor) -> StmResult<()> {
        let payload = descriptor_to_bytes(descriptor)?;
        self.store
            .append(&StoreRecord::new(RecordKind::Object, descriptor.id.0, payload))
    }

    fn report(&self, trunk: &Trunk, result: StmResult<()>) {
        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            error!(target: "mvstm::store", trunk = %trunk.id(), error = %e, "Persisting failed");
        }
    }
}

impl TrunkObserver for Persister {
    fn on_acknowledged(&self, trunk: &Trunk, _maps: &[Arc<VersionMap>]) {
        self.report(trunk, self.flush(trunk).map(|_| ()));
    }

    fn on_object_created(&self, trunk: &Trunk, descriptor: &Arc<ObjectDescriptor>) {
        self.report(trunk, self.write_descriptor(descriptor));
    }

    fn on_root_changed(&self, trunk: &Trunk, root: ObjectId) {
        self.report(trunk, self.store.set_root(root));
    }
}

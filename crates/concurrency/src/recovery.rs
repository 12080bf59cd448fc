//! Rebuilding a trunk from its store
//!
//! Replay semantics:
//! - Replays do NOT re-run conflict detection
//! - Maps are restored in acknowledgement order with their original sequences
//! - Every replayed map is acknowledged
//! - The last root record wins
//!
//! ## Recovery Procedure
//!
//! 1. Replay every record from the store
//! 2. Decode object descriptors and version maps
//! 3. Build the trunk with `Trunk::recover`
//! 4. Attach a `Persister` that continues after the replayed maps

use crate::payload::{descriptor_from_bytes, MapPayload};
use crate::persist::Persister;
use crate::trunk::{Trunk, TrunkConfig};
use mvstm_core::{ObjectId, StmError, StmResult, TrunkId};
use mvstm_durability::{RecordKind, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Coordinates trunk recovery from a store
pub struct RecoveryCoordinator {
    store: Arc<dyn Store>,
}

impl RecoveryCoordinator {
    /// Create a new recovery coordinator
    pub fn new(store: Arc<dyn Store>) -> Self {
        RecoveryCoordinator { store }
    }

    /// Replay the store into a trunk and keep persisting it.
    ///
    /// An empty store yields an empty trunk.
    ///
    /// # Errors
    /// - If the store cannot be read
    /// - If a payload cannot be decoded (`StmError::Corruption`)
    pub fn recover(&self, trunk_id: TrunkId, config: TrunkConfig) -> StmResult<RecoveryResult> {
        let records = self.store.replay()?;
        let mut stats = RecoveryStats::default();
        let mut maps = Vec::new();
        let mut descriptors = BTreeMap::new();
        let mut root: Option<ObjectId> = None;

        for record in records {
            stats.bytes_replayed += record.payload.len() as u64;
            match record.kind {
                RecordKind::Commit => {
                    let payload = MapPayload::from_bytes(&record.payload).map_err(|e| {
                        StmError::Corruption(format!("commit {}: {}", record.sequence, e))
                    })?;
                    stats.maps_replayed += 1;
                    stats.versions_replayed += payload.versions.len();
                    stats.final_sequence = stats.final_sequence.max(payload.sequence);
                    maps.push(payload.into_map());
                }
                RecordKind::Object => {
                    let descriptor = descriptor_from_bytes(&record.payload).map_err(|e| {
                        StmError::Corruption(format!("object {}: {}", record.sequence, e))
                    })?;
                    descriptors.insert(descriptor.id, descriptor);
                }
                RecordKind::Root => {
                    stats.root_records += 1;
                    root = Some(ObjectId(record.sequence));
                }
            }
        }
        stats.objects_registered = descriptors.len();

        let trunk = Trunk::recover(
            trunk_id,
            config,
            maps,
            descriptors.into_values().collect(),
            root,
        );
        let persister = Persister::attach(&trunk, self.store.clone(), stats.maps_replayed as u64)?;

        info!(
            target: "mvstm::store",
            trunk = %trunk_id,
            maps = stats.maps_replayed,
            objects = stats.objects_registered,
            final_sequence = stats.final_sequence,
            "Recovery complete"
        );
        Ok(RecoveryResult {
            trunk,
            persister,
            stats,
        })
    }
}

/// Result of recovery operation
pub struct RecoveryResult {
    /// Trunk holding every replayed map
    pub trunk: Arc<Trunk>,
    /// Persister attached to the trunk, continuing after the replayed maps
    pub persister: Arc<Persister>,
    /// Statistics about the recovery process
    pub stats: RecoveryStats,
}

/// Statistics from recovery
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of version maps replayed
    pub maps_replayed: usize,

    /// Number of per-object versions inside those maps
    pub versions_replayed: usize,

    /// Number of distinct objects registered
    pub objects_registered: usize,

    /// Number of root records seen
    pub root_records: usize,

    /// Highest commit sequence replayed
    pub final_sequence: u64,

    /// Payload bytes read
    pub bytes_replayed: u64,
}

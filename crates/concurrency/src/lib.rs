//! Concurrency layer for mvstm
//!
//! This crate implements multi-version optimistic concurrency control:
//! - Version / VersionMap: Per-object and per-commit write sets
//! - Snapshot: Immutable ordered chain of version maps
//! - Trunk: Atomic snapshot pointer, pins, trimming, object registry
//! - Transaction: Read/write tracking and commit-time validation
//! - Interception: Speculative publication with deferred acknowledgement
//! - Persistence: Acknowledged maps appended to a store and replayed on open

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod helper;
pub mod interception;
pub mod object;
pub mod payload;
pub mod persist;
pub mod pool;
pub mod recovery;
pub mod snapshot;
pub mod transaction;
pub mod trunk;
pub mod validation;
pub mod version;
pub mod version_map;

pub use context::{ScopeGuard, SharedTransaction, TransactionScope};
pub use interception::{
    AckDecision, Acknowledger, Interceptor, ManualAcknowledger, PendingAcks, RandomAcknowledger,
    ThresholdAcknowledger,
};
pub use object::TObject;
pub use payload::{MapPayload, PayloadError};
pub use persist::Persister;
pub use pool::SavepointPool;
pub use recovery::{RecoveryCoordinator, RecoveryResult, RecoveryStats};
pub use snapshot::{MapStatus, Snapshot};
pub use transaction::{CommitStatus, StartFlags, Transaction, TransactionStatus};
pub use trunk::{
    Pin, PinKind, Trunk, TrunkConfig, TrunkObserver, TrunkStats, TrunkStatsSnapshot,
    DEFAULT_MAX_PUBLISH_RETRIES, DEFAULT_TRIM_THRESHOLD,
};
pub use validation::{ConflictType, Footprint, ValidationResult};
pub use version::{KeyLookup, ListOp, Version, VersionData};
pub use version_map::VersionMap;

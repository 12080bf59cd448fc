//! mvstm - multi-version software transactional memory
//!
//! Transactions read an immutable snapshot chain and publish their writes as
//! one version map. Conflicts are detected at commit by comparing read sets
//! against maps published since the transaction started. A trunk can run
//! speculatively under an authority: local commits are visible at once and
//! are rolled back if the authority rejects them.
//!
//! # Quick Start
//!
//! ```ignore
//! use mvstm::{ObjectKind, Stm, StmConfig};
//!
//! let stm = Stm::new(StmConfig::in_memory())?;
//! let trunk = stm.create_trunk()?;
//! let account = trunk.create_object(ObjectKind::Fields { count: 2 });
//!
//! stm.run(&trunk, |txn| {
//!     let balance = txn.get(&account, 0)?.int_or_zero();
//!     txn.set(&account, 0, balance + 10)
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `mvstm-core`: bitsets, values, ids and the error type
//! - `mvstm-concurrency`: versions, snapshots, trunks, transactions,
//!   interception, persistence and recovery
//! - `mvstm-durability`: commit stores and the record format
//! - `mvstm-engine`: dispatchers, listeners, async commits, replication and
//!   the [`Stm`] handle

pub use mvstm_concurrency::{
    AckDecision, Acknowledger, CommitStatus, ConflictType, Interceptor, ManualAcknowledger,
    MapStatus, RandomAcknowledger, SharedTransaction, Snapshot, StartFlags, TObject,
    ThresholdAcknowledger, Transaction, TransactionScope, TransactionStatus, Trunk, TrunkConfig,
    TrunkObserver, Version, VersionMap,
};
pub use mvstm_core::{
    Bits, FieldIndex, Granularity, InterceptionId, ObjectDescriptor, ObjectId, ObjectKind,
    Source, StmError, StmResult, TrunkId, Value,
};
pub use mvstm_durability::{DurabilityMode, FileStore, MemoryStore, Store};
pub use mvstm_engine::*;

//! Append-only commit stores
//!
//! A store is a durable append log of encoded version maps, object
//! descriptors and the root object id. It never interprets payloads; it only
//! has to return records in append order on replay.

mod file;
mod memory;

pub use file::{FileStore, LOG_FILE_NAME};
pub use memory::MemoryStore;

use crate::format::{RecordKind, StoreRecord};
use mvstm_core::{ObjectId, StmResult};

/// Durable append log consumed by trunk persistence and recovery
pub trait Store: Send + Sync {
    /// Append one record
    fn append(&self, record: &StoreRecord) -> StmResult<()>;

    /// Every record in append order
    fn replay(&self) -> StmResult<Vec<StoreRecord>>;

    /// Flush appended records to stable storage
    fn sync(&self) -> StmResult<()>;

    /// Append an encoded version map under its commit sequence
    fn append_commit(&self, sequence: u64, payload: Vec<u8>) -> StmResult<()> {
        self.append(&StoreRecord::new(RecordKind::Commit, sequence, payload))
    }

    /// Record the root object. The last root written wins.
    fn set_root(&self, root: ObjectId) -> StmResult<()> {
        self.append(&StoreRecord::new(RecordKind::Root, root.0, Vec::new()))
    }

    /// Root object recorded by the last `set_root`
    fn root(&self) -> StmResult<Option<ObjectId>> {
        Ok(self
            .replay()?
            .iter()
            .rev()
            .find(|r| r.kind == RecordKind::Root)
            .map(|r| ObjectId(r.sequence)))
    }
}

//! Error types for mvstm
//!
//! A commit conflict is NOT an error: it is reported as a commit status so
//! callers can retry the transaction body. Everything here is either an I/O or
//! transport failure, or a contract violation that fails fast instead of
//! corrupting a snapshot chain.

use crate::types::{FieldIndex, InterceptionId, ObjectId, TrunkId};
use std::io;
use thiserror::Error;

/// Result type alias for mvstm operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Error type shared by every mvstm crate
#[derive(Debug, Error)]
pub enum StmError {
    /// Operation not allowed in the current transaction or trunk state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid argument or configuration value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Object belongs to another trunk than the transaction
    #[error("{object} belongs to trunk {actual}, transaction runs on trunk {expected}")]
    WrongTrunk {
        /// Object written or read
        object: ObjectId,
        /// Trunk of the transaction
        expected: TrunkId,
        /// Trunk of the object
        actual: TrunkId,
    },

    /// Object is not registered on the trunk
    #[error("Unknown object {0}")]
    UnknownObject(ObjectId),

    /// Operation does not match the object shape
    #[error("{object} is {actual}, operation requires {expected}")]
    KindMismatch {
        /// Object accessed
        object: ObjectId,
        /// Shape the operation needs
        expected: &'static str,
        /// Shape of the object
        actual: &'static str,
    },

    /// Write to a field fixed at object creation
    #[error("Field {field} of {object} is read-only")]
    ReadOnlyField {
        /// Object written
        object: ObjectId,
        /// Read-only field
        field: FieldIndex,
    },

    /// Field index beyond the object's field count
    #[error("Field {field} out of range for {object} with {count} fields")]
    FieldOutOfRange {
        /// Object accessed
        object: ObjectId,
        /// Requested field
        field: FieldIndex,
        /// Field count of the object
        count: u32,
    },

    /// List index beyond the current length
    #[error("Index {index} out of bounds for {object} of length {len}")]
    IndexOutOfBounds {
        /// Object accessed
        object: ObjectId,
        /// Requested index
        index: usize,
        /// Current length
        len: usize,
    },

    /// Publish compare-and-swap lost too many races in a row
    #[error("Commit gave up after {attempts} contended publish attempts")]
    PublishContention {
        /// Attempts made
        attempts: u32,
    },

    /// Acknowledgement refers to an older interception epoch
    #[error("Stale acknowledgement: expected {expected}, found {found}")]
    StaleInterception {
        /// Epoch carried by the map
        expected: InterceptionId,
        /// Epoch carried by the acknowledgement
        found: InterceptionId,
    },

    /// Sequence number not present in the snapshot chain
    #[error("Unknown sequence {0}")]
    UnknownSequence(u64),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Store layer error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport closed while an operation was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// Remote method raised on the remote side
    #[error("Remote error: {message}")]
    Remote {
        /// Message reported by the remote side
        message: String,
    },

    /// Dispatcher refused the task (full queue or shut down)
    #[error("Dispatcher rejected task: {0}")]
    Rejected(String),

    /// Task was dropped before it ran
    #[error("Operation cancelled before it ran")]
    Cancelled,

    /// Invariant violation inside mvstm
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StmError {
    /// Create an InvalidState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        StmError::InvalidState(message.into())
    }

    /// Create an InvalidInput error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StmError::InvalidInput(message.into())
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        StmError::Internal(message.into())
    }

    /// True for transport failures that end every pending operation
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, StmError::ConnectionClosed)
    }
}

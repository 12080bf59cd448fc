//! Wire messages between a replicator and its authority
//!
//! Every message is one MessagePack blob. Version maps travel as
//! [`MapPayload`], object registrations as [`ObjectDescriptor`].

use mvstm_concurrency::MapPayload;
use mvstm_core::{InterceptionId, ObjectDescriptor, StmError, StmResult, Value};
use serde::{Deserialize, Serialize};

/// One replication message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Authority -> peer, once on accept: the acknowledged state so far
    Welcome {
        /// Authority ordinal of the last map included
        acknowledged: u64,
        /// Registered objects
        descriptors: Vec<ObjectDescriptor>,
        /// Acknowledged maps, oldest first
        maps: Vec<MapPayload>,
    },
    /// Either way: an object was registered
    Object {
        /// The new object
        descriptor: ObjectDescriptor,
    },
    /// Peer -> authority: a speculative local commit
    Commit {
        /// Interception epoch the map was published under
        interception: InterceptionId,
        /// Peer-local sequence of the map
        sequence: u64,
        /// Authority ordinals the peer had applied when it published
        based_on: u64,
        /// The writes
        payload: MapPayload,
    },
    /// Authority -> peer: commits through `through` are ordered
    Ack {
        /// Epoch of the acknowledged map
        interception: InterceptionId,
        /// Peer-local sequence of the acknowledged map
        through: u64,
    },
    /// Authority -> peer: the commit at `from` conflicted; it and every later
    /// commit of that epoch are dropped
    Reject {
        /// Epoch of the refused map
        interception: InterceptionId,
        /// Peer-local sequence of the refused map
        from: u64,
        /// Why
        reason: String,
    },
    /// Authority -> peer: a map ordered by the authority from another writer
    Applied {
        /// The writes
        payload: MapPayload,
    },
    /// Peer -> authority: call a hosted method
    Invoke {
        /// Call id, unique per peer
        call: u64,
        /// Method name
        method: String,
        /// Arguments
        args: Vec<Value>,
    },
    /// Authority -> peer: result of an `Invoke`
    InvokeResult {
        /// Call id from the `Invoke`
        call: u64,
        /// Return value, or the message the method failed with
        result: Result<Value, String>,
    },
    /// Either way: the sender is going away
    Close,
}

impl Message {
    /// Encode to MessagePack bytes
    pub fn to_bytes(&self) -> StmResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| StmError::Serialization(e.to_string()))
    }

    /// Decode MessagePack bytes
    pub fn from_bytes(bytes: &[u8]) -> StmResult<Message> {
        rmp_serde::from_slice(bytes).map_err(|e| StmError::Serialization(e.to_string()))
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Message::Welcome { .. } => "welcome",
            Message::Object { .. } => "object",
            Message::Commit { .. } => "commit",
            Message::Ack { .. } => "ack",
            Message::Reject { .. } => "reject",
            Message::Applied { .. } => "applied",
            Message::Invoke { .. } => "invoke",
            Message::InvokeResult { .. } => "invoke_result",
            Message::Close => "close",
        }
    }
}

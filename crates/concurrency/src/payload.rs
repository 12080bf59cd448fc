//! Version map serialization for store records and replication
//!
//! Each acknowledged map is serialized into a single `MapPayload` blob stored
//! in a `Commit` record; object registrations go into `Object` records as a
//! serialized `ObjectDescriptor`.
//!
//! ## Format
//!
//! Payloads are serialized using MessagePack (`rmp-serde`) for compact binary
//! encoding with schema evolution support.

use crate::version::Version;
use crate::version_map::VersionMap;
use mvstm_core::{ObjectDescriptor, Source, StmError};
use serde::{Deserialize, Serialize};

/// Serializable form of one version map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPayload {
    /// Sequence the map had when it was published
    pub sequence: u64,
    /// Peer that produced the writes
    pub source: Option<Source>,
    /// Per-object writes, ordered by object id
    pub versions: Vec<Version>,
}

impl MapPayload {
    /// Capture a published map
    pub fn from_map(map: &VersionMap) -> Self {
        MapPayload {
            sequence: map.sequence(),
            source: map.source(),
            versions: map.versions().to_vec(),
        }
    }

    /// Rebuild the map; speculative markers are not persisted
    pub fn into_map(self) -> VersionMap {
        VersionMap::new(self.sequence, self.versions).with_source(self.source)
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        rmp_serde::to_vec(self).map_err(|e| PayloadError::SerializeFailed(e.to_string()))
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        rmp_serde::from_slice(bytes).map_err(|e| PayloadError::DeserializeFailed(e.to_string()))
    }
}

/// Serialize an object descriptor
pub fn descriptor_to_bytes(descriptor: &ObjectDescriptor) -> Result<Vec<u8>, PayloadError> {
    rmp_serde::to_vec(descriptor).map_err(|e| PayloadError::SerializeFailed(e.to_string()))
}

/// Deserialize an object descriptor
pub fn descriptor_from_bytes(bytes: &[u8]) -> Result<ObjectDescriptor, PayloadError> {
    rmp_serde::from_slice(bytes).map_err(|e| PayloadError::DeserializeFailed(e.to_string()))
}

/// Errors from payload serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// Failed to serialize a payload
    #[error("Failed to serialize payload: {0}")]
    SerializeFailed(String),

    /// Failed to deserialize payload bytes
    #[error("Failed to deserialize payload: {0}")]
    DeserializeFailed(String),
}

impl From<PayloadError> for StmError {
    fn from(e: PayloadError) -> Self {
        StmError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ListOp;
    use mvstm_core::{ObjectId, ObjectKind, Value};

    #[test]
    fn test_roundtrip_mixed_shapes() {
        let mut fields = Version::new(ObjectId(1), ObjectKind::Fields { count: 40 });
        fields.set_field(33, Value::from("far field"));
        let mut keyed = Version::new(ObjectId(2), ObjectKind::Keyed);
        keyed.put("k".into(), Value::Bytes(vec![1, 2, 3]));
        keyed.remove_key("gone".into());
        let mut list = Version::new(ObjectId(3), ObjectKind::Indexed);
        list.push_op(ListOp::Insert {
            index: 0,
            value: Value::Float(1.5),
        });

        let map = VersionMap::new(12, vec![list, keyed, fields]).with_source(Some(Source::new()));
        let bytes = MapPayload::from_map(&map).to_bytes().unwrap();
        let decoded = MapPayload::from_bytes(&bytes).unwrap().into_map();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let mut descriptor = ObjectDescriptor::new(ObjectId(9), ObjectKind::Fields { count: 3 });
        descriptor.read_only.set(1);
        descriptor.read_only_values.push(Value::Int(5));
        let bytes = descriptor_to_bytes(&descriptor).unwrap();
        assert_eq!(descriptor_from_bytes(&bytes).unwrap(), descriptor);
    }

    #[test]
    fn test_invalid_bytes() {
        let result = MapPayload::from_bytes(&[0xFF, 0x00, 0x01]);
        assert!(matches!(result, Err(PayloadError::DeserializeFailed(_))));
        let err: StmError = result.unwrap_err().into();
        assert!(matches!(err, StmError::Serialization(_)));
    }
}

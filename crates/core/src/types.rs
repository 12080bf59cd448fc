//! Identifier and configuration types shared by every crate
//!
//! This module defines:
//! - TrunkId: Unique identifier for a snapshot chain
//! - ObjectId: Identifier of a transactional object within its trunk
//! - Source: Provenance of a commit (local or a connected peer)
//! - InterceptionId: Speculative-mode epoch counter
//! - Granularity: Notification cadence of a trunk
//! - ObjectKind / ObjectDescriptor: Shape of a transactional object

use crate::bits::Bits;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Index of a field, key slot or list element inside one object
pub type FieldIndex = u32;

/// Unique identifier for a trunk (a snapshot chain)
///
/// A TrunkId is a wrapper around a UUID v4. Replicated peers address the same
/// logical trunk by the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrunkId(Uuid);

impl TrunkId {
    /// Create a new random TrunkId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TrunkId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a TrunkId from a string representation
    ///
    /// # Errors
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this TrunkId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TrunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transactional object, unique within its trunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Where a commit originated
///
/// Maps published locally carry no source. Maps applied on behalf of a peer
/// carry that peer's source so listeners can separate interleaved streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source(Uuid);

impl Source {
    /// Create a new random source
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a source from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this source
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source:{}", self.0)
    }
}

/// Speculative-mode epoch
///
/// Increases by one each time a trunk's interception is switched on or off, so
/// an acknowledgement carrying an older id can be recognized as stale after a
/// reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct InterceptionId(pub u32);

impl InterceptionId {
    /// The following epoch
    pub fn next(self) -> Self {
        InterceptionId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for InterceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interception#{}", self.0)
    }
}

/// Notification cadence of a trunk, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Granularity {
    /// Every committed change is delivered with the value of that commit
    #[default]
    All,
    /// Only the latest acknowledged value is delivered, once per walk
    Coalesce,
}

impl Granularity {
    /// Lowercase name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::All => "all",
            Granularity::Coalesce => "coalesce",
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Granularity::All),
            "coalesce" => Ok(Granularity::Coalesce),
            other => Err(format!(
                "unknown granularity '{}', expected \"all\" or \"coalesce\"",
                other
            )),
        }
    }
}

/// Shape of a transactional object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Fixed set of indexed fields
    Fields {
        /// Number of fields
        count: u32,
    },
    /// String-keyed entries (map-like)
    Keyed,
    /// Ordered elements (list-like)
    Indexed,
}

impl ObjectKind {
    /// Short name for error messages
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Fields { .. } => "fields",
            ObjectKind::Keyed => "keyed",
            ObjectKind::Indexed => "indexed",
        }
    }
}

/// Registry entry describing an object
///
/// Read-only fields are fixed when the object is created. They are not part of
/// any version and are never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Object id
    pub id: ObjectId,
    /// Object shape
    pub kind: ObjectKind,
    /// Which fields are read-only
    pub read_only: Bits,
    /// Values of the read-only fields, in ascending field order
    pub read_only_values: Vec<Value>,
}

impl ObjectDescriptor {
    /// Descriptor without read-only fields
    pub fn new(id: ObjectId, kind: ObjectKind) -> Self {
        ObjectDescriptor {
            id,
            kind,
            read_only: Bits::new(),
            read_only_values: Vec::new(),
        }
    }

    /// Value of a read-only field, if `field` is one
    pub fn read_only_value(&self, field: FieldIndex) -> Option<&Value> {
        if !self.read_only.get(field) {
            return None;
        }
        let position = self.read_only.iter().take_while(|&f| f < field).count();
        self.read_only_values.get(position)
    }
}

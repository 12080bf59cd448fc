//! Handles to transactional objects

use mvstm_core::{ObjectId, ObjectKind, TrunkId};
use std::fmt;

/// Handle to a transactional object.
///
/// A `TObject` carries no state of its own: values live in the version maps of
/// its trunk and are read and written through a `Transaction` on that trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TObject {
    id: ObjectId,
    trunk: TrunkId,
    kind: ObjectKind,
}

impl TObject {
    pub(crate) fn new(id: ObjectId, trunk: TrunkId, kind: ObjectKind) -> Self {
        TObject { id, trunk, kind }
    }

    /// Object id, unique within the trunk
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Trunk the object belongs to
    pub fn trunk(&self) -> TrunkId {
        self.trunk
    }

    /// Object shape
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}

impl fmt::Display for TObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.kind.name())
    }
}

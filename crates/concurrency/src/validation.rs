//! Commit-time conflict detection
//!
//! A transaction conflicts if any map published after it captured its
//! snapshot wrote something the transaction read or wrote. Detection is a
//! per-object intersection between the transaction's [`Footprint`] (plus its
//! own pending version) and each intervening map's version of that object.
//!
//! Rules by object shape:
//! - fields: dirty-bit intersection
//! - keyed: key intersection; a committed clear conflicts with any access, and
//!   a whole-object read (length, iteration) conflicts with any committed write
//! - indexed: a committed structural change (insert, remove, clear) conflicts
//!   with any access; element sets conflict by slot intersection. A transaction
//!   that itself changed the structure conflicts with any committed write.
//!
//! Disjoint footprints never conflict.

use crate::snapshot::Snapshot;
use crate::version::{Version, VersionData};
use mvstm_core::{Bits, FieldIndex, ObjectId, ObjectKind};
use std::collections::BTreeSet;

/// Types of conflicts found at commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// A committed map wrote a field the transaction accessed
    Field {
        /// Object with the conflict
        object: ObjectId,
        /// First overlapping field
        field: FieldIndex,
        /// Sequence of the committed map
        sequence: u64,
    },

    /// A committed map wrote a key the transaction accessed.
    ///
    /// `key` is `None` when the whole object is involved (clear, or a
    /// whole-object read).
    Key {
        /// Object with the conflict
        object: ObjectId,
        /// Overlapping key
        key: Option<String>,
        /// Sequence of the committed map
        sequence: u64,
    },

    /// A committed map changed an element the transaction accessed.
    ///
    /// `index` is `None` for structural conflicts.
    Element {
        /// Object with the conflict
        object: ObjectId,
        /// Overlapping slot
        index: Option<u32>,
        /// Sequence of the committed map
        sequence: u64,
    },

    /// The transaction read speculative data that was later rejected
    RolledBack {
        /// Sequence of the rejected map
        sequence: u64,
    },

    /// Maps the check needed were already folded into the base
    Folded {
        /// Ordinal the writer had seen
        based_on: u64,
    },
}

/// Result of transaction validation
///
/// Accumulates all conflicts found. A transaction publishes only if
/// `is_valid()` returns true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// All conflicts detected during validation
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Create a successful validation result (no conflicts)
    pub fn ok() -> Self {
        ValidationResult {
            conflicts: Vec::new(),
        }
    }

    /// Create a validation result with a single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        ValidationResult {
            conflicts: vec![conflict],
        }
    }

    /// Check if validation passed (no conflicts)
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Merge another validation result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Get the number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }
}

/// What a transaction read from one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Footprint {
    /// Fields read
    Fields(Bits),
    /// Keys read; `all` after a whole-object read
    Keyed {
        /// Individual keys looked up
        keys: BTreeSet<String>,
        /// Length or iteration was observed
        all: bool,
    },
    /// Slots read; `all` after a whole-object read
    Indexed {
        /// Individual slots read
        slots: Bits,
        /// Length or iteration was observed
        all: bool,
    },
}

impl Footprint {
    /// Empty footprint for an object of `kind`
    pub fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Fields { .. } => Footprint::Fields(Bits::new()),
            ObjectKind::Keyed => Footprint::Keyed {
                keys: BTreeSet::new(),
                all: false,
            },
            ObjectKind::Indexed => Footprint::Indexed {
                slots: Bits::new(),
                all: false,
            },
        }
    }

    /// True if nothing was read
    pub fn is_empty(&self) -> bool {
        match self {
            Footprint::Fields(bits) => bits.is_empty(),
            Footprint::Keyed { keys, all } => !all && keys.is_empty(),
            Footprint::Indexed { slots, all } => !all && slots.is_empty(),
        }
    }

    /// Record a field read
    pub fn read_field(&mut self, field: FieldIndex) {
        if let Footprint::Fields(bits) = self {
            bits.set(field);
        }
    }

    /// Record a key lookup
    pub fn read_key(&mut self, key: &str) {
        if let Footprint::Keyed { keys, all: false } = self {
            keys.insert(key.to_string());
        }
    }

    /// Record a slot read
    pub fn read_slot(&mut self, index: u32) {
        if let Footprint::Indexed { slots, all: false } = self {
            slots.set(index);
        }
    }

    /// Record a whole-object read
    pub fn read_all(&mut self) {
        match self {
            Footprint::Fields(_) => {}
            Footprint::Keyed { keys, all } => {
                keys.clear();
                *all = true;
            }
            Footprint::Indexed { slots, all } => {
                slots.clear();
                *all = true;
            }
        }
    }
}

/// One object a transaction touched
#[derive(Debug, Clone, Copy)]
pub struct Touched<'a> {
    /// Object id
    pub object: ObjectId,
    /// What was read, if anything
    pub reads: Option<&'a Footprint>,
    /// What the transaction is about to write, if anything
    pub write: Option<&'a Version>,
}

/// Check one committed version against one touched object
pub fn check_version(touched: &Touched<'_>, committed: &Version, sequence: u64) -> Option<ConflictType> {
    let object = touched.object;
    match committed.data() {
        VersionData::Fields { bits, .. } => {
            let mut mine = match touched.reads {
                Some(Footprint::Fields(read)) => read.clone(),
                _ => Bits::new(),
            };
            if let Some(bits) = touched.write.and_then(Version::bits) {
                mine.union_with(bits);
            }
            mine.first_common(bits).map(|field| ConflictType::Field {
                object,
                field,
                sequence,
            })
        }
        VersionData::Keyed { cleared, entries } => {
            let whole = |key| ConflictType::Key {
                object,
                key,
                sequence,
            };
            let (read_keys, read_all) = match touched.reads {
                Some(Footprint::Keyed { keys, all }) => (Some(keys), *all),
                _ => (None, false),
            };
            let wrote_all = touched.write.map_or(false, Version::resets);
            if *cleared || read_all || wrote_all {
                return Some(whole(None));
            }
            entries.keys().find_map(|key| {
                let read = read_keys.map_or(false, |keys| keys.contains(key));
                let written = touched
                    .write
                    .map_or(false, |w| w.keys().any(|(k, _)| k == key));
                (read || written).then(|| whole(Some(key.clone())))
            })
        }
        VersionData::Indexed { touched: slots, .. } => {
            let structural = |index| ConflictType::Element {
                object,
                index,
                sequence,
            };
            let (read_slots, read_all) = match touched.reads {
                Some(Footprint::Indexed { slots, all }) => (Some(slots), *all),
                _ => (None, false),
            };
            let wrote_structure = touched.write.map_or(false, Version::is_structural);
            if committed.is_structural() || read_all || wrote_structure {
                return Some(structural(None));
            }
            let mut mine = read_slots.cloned().unwrap_or_default();
            if let Some(bits) = touched.write.and_then(Version::bits) {
                mine.union_with(bits);
            }
            mine.first_common(slots).map(|i| structural(Some(i)))
        }
    }
}

/// Validate touched objects against every map in `snapshot` selected by
/// `include`, oldest first.
///
/// # Arguments
/// * `snapshot` - Snapshot holding the maps to check against
/// * `touched` - Objects the transaction read or wrote
/// * `include` - Sequence filter selecting intervening maps
pub fn validate_against<'a, F>(snapshot: &Snapshot, touched: &[Touched<'a>], include: F) -> ValidationResult
where
    F: Fn(u64) -> bool,
{
    let mut result = ValidationResult::ok();
    if touched.is_empty() {
        return result;
    }
    // index 0 holds folded history, never an intervening commit
    for map in snapshot.version_maps().iter().skip(1) {
        if !include(map.sequence()) {
            continue;
        }
        for t in touched {
            if let Some(committed) = map.find(t.object) {
                if let Some(conflict) = check_version(t, committed, map.sequence()) {
                    result.conflicts.push(conflict);
                }
            }
        }
    }
    result
}

/// Validate bare write-sets, with no read information, against the maps in
/// `snapshot` selected by `include`.
///
/// Used by an authority to order commits shipped by a peer.
pub fn validate_writes<F>(snapshot: &Snapshot, writes: &[Version], include: F) -> ValidationResult
where
    F: Fn(u64) -> bool,
{
    let touched: Vec<Touched<'_>> = writes
        .iter()
        .map(|w| Touched {
            object: w.object(),
            reads: None,
            write: Some(w),
        })
        .collect();
    validate_against(snapshot, &touched, include)
}

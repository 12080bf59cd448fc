//! Per-object write records
//!
//! A `Version` holds what one transaction attempt wrote to one object. It is
//! private to that transaction until published inside a `VersionMap`; after
//! that it is only read, except when trimming folds newer versions into a
//! base copy with [`Version::merge`].
//!
//! Three shapes exist, one per [`ObjectKind`]:
//! - fields: a dirty bitset and the values of the written fields
//! - keyed: per-key puts and removes, plus a `cleared` marker
//! - indexed: an operation log with the touched slots in current coordinates

use mvstm_core::{Bits, FieldIndex, ObjectId, ObjectKind, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// One operation on an indexed (list-like) object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListOp {
    /// Insert before `index`; existing elements from `index` move up
    Insert {
        /// Position of the new element
        index: u32,
        /// Inserted value
        value: Value,
    },
    /// Remove the element at `index`; elements above move down
    Remove {
        /// Position removed
        index: u32,
    },
    /// Replace the element at `index`
    Set {
        /// Position replaced
        index: u32,
        /// New value
        value: Value,
    },
    /// Remove every element
    Clear,
}

impl ListOp {
    /// Apply to a materialized list. Out-of-range positions are ignored.
    pub fn apply(&self, list: &mut Vec<Value>) {
        match self {
            ListOp::Insert { index, value } => {
                let at = (*index as usize).min(list.len());
                list.insert(at, value.clone());
            }
            ListOp::Remove { index } => {
                if (*index as usize) < list.len() {
                    list.remove(*index as usize);
                }
            }
            ListOp::Set { index, value } => {
                if let Some(slot) = list.get_mut(*index as usize) {
                    *slot = value.clone();
                }
            }
            ListOp::Clear => list.clear(),
        }
    }

    /// True if the operation changes the list length or renumbers slots
    pub fn is_structural(&self) -> bool {
        !matches!(self, ListOp::Set { .. })
    }

    fn mark(&self, touched: &mut Bits) {
        match self {
            ListOp::Insert { index, .. } => {
                touched.insert_shift(*index);
                touched.set(*index);
            }
            ListOp::Remove { index } => touched.remove(*index),
            ListOp::Set { index, .. } => {
                touched.set(*index);
            }
            ListOp::Clear => touched.clear(),
        }
    }
}

/// Outcome of looking up one key in a keyed version
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyLookup<'a> {
    /// The version put this value
    Put(&'a Value),
    /// The version removed the key, or cleared the object
    Removed,
    /// The version says nothing about the key
    Untouched,
}

/// Write payload of a version, by object shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VersionData {
    /// Indexed fields of a `Fields` object
    Fields {
        /// Which fields were written
        bits: Bits,
        /// Written values, ascending by field
        values: SmallVec<[(FieldIndex, Value); 4]>,
    },
    /// Entries of a `Keyed` object
    Keyed {
        /// All earlier entries are gone
        cleared: bool,
        /// `Some` for a put, `None` for a remove
        entries: BTreeMap<String, Option<Value>>,
    },
    /// Operation log of an `Indexed` object
    Indexed {
        /// Replay starts from an empty list instead of the previous state
        resets: bool,
        /// Operations in the order they were made
        ops: Vec<ListOp>,
        /// Slots written, in coordinates after the last op
        touched: Bits,
    },
}

/// Tentative writes of one transaction attempt to one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    object: ObjectId,
    data: VersionData,
}

impl Version {
    /// Empty version for an object of the given shape
    pub fn new(object: ObjectId, kind: ObjectKind) -> Self {
        let data = match kind {
            ObjectKind::Fields { .. } => VersionData::Fields {
                bits: Bits::new(),
                values: SmallVec::new(),
            },
            ObjectKind::Keyed => VersionData::Keyed {
                cleared: false,
                entries: BTreeMap::new(),
            },
            ObjectKind::Indexed => VersionData::Indexed {
                resets: false,
                ops: Vec::new(),
                touched: Bits::new(),
            },
        };
        Version { object, data }
    }

    /// Object this version belongs to
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Write payload
    pub fn data(&self) -> &VersionData {
        &self.data
    }

    /// True if the version records no write
    pub fn is_empty(&self) -> bool {
        match &self.data {
            VersionData::Fields { bits, .. } => bits.is_empty(),
            VersionData::Keyed { cleared, entries } => !cleared && entries.is_empty(),
            VersionData::Indexed { resets, ops, .. } => !resets && ops.is_empty(),
        }
    }

    /// Dirty slots: written fields, or touched list slots
    pub fn bits(&self) -> Option<&Bits> {
        match &self.data {
            VersionData::Fields { bits, .. } => Some(bits),
            VersionData::Indexed { touched, .. } => Some(touched),
            VersionData::Keyed { .. } => None,
        }
    }

    /// True if everything older than this version is irrelevant
    pub fn resets(&self) -> bool {
        match &self.data {
            VersionData::Fields { .. } => false,
            VersionData::Keyed { cleared, .. } => *cleared,
            VersionData::Indexed { resets, .. } => *resets,
        }
    }

    /// True if the version inserted, removed or cleared list elements
    pub fn is_structural(&self) -> bool {
        match &self.data {
            VersionData::Indexed { resets, ops, .. } => {
                *resets || ops.iter().any(ListOp::is_structural)
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Value written to `field`, if this version wrote it
    pub fn field(&self, field: FieldIndex) -> Option<&Value> {
        match &self.data {
            VersionData::Fields { bits, values } if bits.get(field) => values
                .binary_search_by_key(&field, |(f, _)| *f)
                .ok()
                .map(|pos| &values[pos].1),
            _ => None,
        }
    }

    /// Written fields with their values, ascending
    pub fn fields(&self) -> impl Iterator<Item = (FieldIndex, &Value)> {
        let values: &[(FieldIndex, Value)] = match &self.data {
            VersionData::Fields { values, .. } => values.as_slice(),
            _ => &[],
        };
        values.iter().map(|(f, v)| (*f, v))
    }

    /// Record a field write. Ignored on other shapes.
    pub fn set_field(&mut self, field: FieldIndex, value: Value) {
        if let VersionData::Fields { bits, values } = &mut self.data {
            bits.set(field);
            match values.binary_search_by_key(&field, |(f, _)| *f) {
                Ok(pos) => values[pos].1 = value,
                Err(pos) => values.insert(pos, (field, value)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Keyed
    // ------------------------------------------------------------------

    /// What this version says about `key`
    pub fn entry(&self, key: &str) -> KeyLookup<'_> {
        match &self.data {
            VersionData::Keyed { cleared, entries } => match entries.get(key) {
                Some(Some(value)) => KeyLookup::Put(value),
                Some(None) => KeyLookup::Removed,
                None if *cleared => KeyLookup::Removed,
                None => KeyLookup::Untouched,
            },
            _ => KeyLookup::Untouched,
        }
    }

    /// Keys this version put or removed
    pub fn keys(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        let entries = match &self.data {
            VersionData::Keyed { entries, .. } => Some(entries),
            _ => None,
        };
        entries
            .into_iter()
            .flat_map(|e| e.iter())
            .map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Record a put. Ignored on other shapes.
    pub fn put(&mut self, key: String, value: Value) {
        if let VersionData::Keyed { entries, .. } = &mut self.data {
            entries.insert(key, Some(value));
        }
    }

    /// Record a remove. Ignored on other shapes.
    pub fn remove_key(&mut self, key: String) {
        if let VersionData::Keyed { entries, .. } = &mut self.data {
            entries.insert(key, None);
        }
    }

    /// Record a clear: every earlier entry is gone. Ignored on other shapes.
    pub fn clear_entries(&mut self) {
        if let VersionData::Keyed { cleared, entries } = &mut self.data {
            *cleared = true;
            entries.clear();
        }
    }

    /// Apply this version's entry changes to a materialized map
    pub fn apply_entries(&self, map: &mut BTreeMap<String, Value>) {
        if let VersionData::Keyed { cleared, entries } = &self.data {
            if *cleared {
                map.clear();
            }
            for (key, value) in entries {
                match value {
                    Some(v) => {
                        map.insert(key.clone(), v.clone());
                    }
                    None => {
                        map.remove(key);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Indexed
    // ------------------------------------------------------------------

    /// Operations in the order they were made
    pub fn list_ops(&self) -> &[ListOp] {
        match &self.data {
            VersionData::Indexed { ops, .. } => ops,
            _ => &[],
        }
    }

    /// Record a list operation, keeping touched slots in current coordinates
    pub fn push_op(&mut self, op: ListOp) {
        if let VersionData::Indexed {
            resets,
            ops,
            touched,
        } = &mut self.data
        {
            op.mark(touched);
            if matches!(op, ListOp::Clear) {
                *resets = true;
                ops.clear();
            }
            ops.push(op);
        }
    }

    /// Apply this version's operations to a materialized list
    pub fn apply_ops(&self, list: &mut Vec<Value>) {
        if let VersionData::Indexed { resets, ops, .. } = &self.data {
            if *resets {
                list.clear();
            }
            for op in ops {
                op.apply(list);
            }
        }
    }

    // ------------------------------------------------------------------
    // Trimming
    // ------------------------------------------------------------------

    /// Fold a newer version of the same object into this one.
    ///
    /// Only what `next` wrote is overwritten.
    pub fn merge(&mut self, next: &Version) {
        debug_assert_eq!(self.object, next.object);
        let same_shape =
            std::mem::discriminant(&self.data) == std::mem::discriminant(&next.data);
        if next.resets() || !same_shape {
            self.data = next.data.clone();
            return;
        }
        match &next.data {
            VersionData::Fields { values, .. } => {
                for (field, value) in values {
                    self.set_field(*field, value.clone());
                }
            }
            VersionData::Keyed { entries, .. } => {
                for (key, value) in entries {
                    match value {
                        Some(v) => self.put(key.clone(), v.clone()),
                        None => self.remove_key(key.clone()),
                    }
                }
            }
            VersionData::Indexed { ops, .. } => {
                for op in ops {
                    self.push_op(op.clone());
                }
            }
        }
    }

    /// Rewrite as a self-contained base version with nothing below it
    pub fn compact_as_base(&mut self) {
        if let VersionData::Keyed { cleared, entries } = &mut self.data {
            *cleared = true;
            entries.retain(|_, v| v.is_some());
            return;
        }
        if matches!(self.data, VersionData::Indexed { .. }) {
            let mut list = Vec::new();
            self.apply_ops(&mut list);
            let len = list.len() as u32;
            self.data = VersionData::Indexed {
                resets: true,
                ops: list
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| ListOp::Insert {
                        index: i as u32,
                        value,
                    })
                    .collect(),
                touched: Bits::from_indices(0..len),
            };
        }
    }
}

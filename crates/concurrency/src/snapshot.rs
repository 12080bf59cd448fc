//! Immutable snapshot chains
//!
//! A `Snapshot` is the ordered array of version maps visible at one point in
//! time. Index 0 always holds a base map: every write folded away by trimming,
//! or an empty map on a fresh trunk. Maps at indices `1..=acknowledged_index`
//! are durable; maps above are speculative, pending acknowledgement.
//!
//! Snapshots are never mutated. Publishing, acknowledging, rejecting and
//! trimming each build a new snapshot that the trunk swaps in atomically, so a
//! reader holding an `Arc<Snapshot>` sees a fixed history for as long as it
//! keeps it.
//!
//! ## Sequences and positions
//!
//! Every published map gets a fresh sequence from `next_sequence`. Positions
//! follow sequences except when a remote map is merged below local speculative
//! maps, so membership tests use sequences and ordering uses positions.
//!
//! `acknowledged_index` is relative to the current array and drops when
//! trimming folds a prefix. `acknowledged_count` counts every map ever
//! acknowledged on the trunk and never decreases.

use crate::helper::{insert_version_map, remove_version_map};
use crate::version::{KeyLookup, Version};
use crate::version_map::VersionMap;
use mvstm_core::{FieldIndex, InterceptionId, ObjectId, Source, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Durability status of a map inside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    /// At or below the acknowledged index
    Acknowledged,
    /// Above the acknowledged index, published under this epoch
    Speculative(InterceptionId),
}

/// Ordered, immutable array of version maps
#[derive(Debug, Clone)]
pub struct Snapshot {
    writes: Vec<Arc<VersionMap>>,
    acknowledged_index: usize,
    acknowledged_count: u64,
    next_sequence: u64,
    intercepted: bool,
    interception: InterceptionId,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::empty()
    }
}

impl Snapshot {
    /// Snapshot of a trunk with no writes
    pub fn empty() -> Self {
        Snapshot {
            writes: vec![Arc::new(VersionMap::empty())],
            acknowledged_index: 0,
            acknowledged_count: 0,
            next_sequence: 1,
            intercepted: false,
            interception: InterceptionId::default(),
        }
    }

    /// Snapshot rebuilt from replayed maps, all acknowledged
    pub fn recovered(maps: Vec<VersionMap>) -> Self {
        let next_sequence = maps.iter().map(VersionMap::sequence).max().unwrap_or(0) + 1;
        let count = maps.len();
        let mut writes = Vec::with_capacity(count + 1);
        writes.push(Arc::new(VersionMap::empty()));
        writes.extend(maps.into_iter().map(Arc::new));
        Snapshot {
            writes,
            acknowledged_index: count,
            acknowledged_count: count as u64,
            next_sequence,
            intercepted: false,
            interception: InterceptionId::default(),
        }
    }

    /// All maps, oldest first, base map at index 0
    pub fn version_maps(&self) -> &[Arc<VersionMap>] {
        &self.writes
    }

    /// Boundary between durable and speculative maps
    pub fn acknowledged_index(&self) -> usize {
        self.acknowledged_index
    }

    /// Maps acknowledged over the trunk's lifetime, including folded ones
    pub fn acknowledged_count(&self) -> u64 {
        self.acknowledged_count
    }

    /// Most recent map
    pub fn last(&self) -> &Arc<VersionMap> {
        // never empty: index 0 is the base map
        &self.writes[self.writes.len() - 1]
    }

    /// Number of maps, base included
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// True if only the base map is present and it is empty
    pub fn is_empty(&self) -> bool {
        self.writes.len() == 1 && self.writes[0].is_empty()
    }

    /// Highest sequence allocated so far
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Sequence the next published map will get
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// True while commits are published speculatively
    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    /// Current speculative epoch
    pub fn interception(&self) -> InterceptionId {
        self.interception
    }

    /// Status of the map at `index`
    pub fn status_of(&self, index: usize) -> Option<MapStatus> {
        let map = self.writes.get(index)?;
        if index <= self.acknowledged_index {
            Some(MapStatus::Acknowledged)
        } else {
            Some(MapStatus::Speculative(
                map.interception().unwrap_or(self.interception),
            ))
        }
    }

    /// Durable maps after the base
    pub fn acknowledged_maps(&self) -> &[Arc<VersionMap>] {
        &self.writes[1..=self.acknowledged_index]
    }

    /// Maps pending acknowledgement
    pub fn speculative_maps(&self) -> &[Arc<VersionMap>] {
        &self.writes[self.acknowledged_index + 1..]
    }

    /// True if any map is pending acknowledgement
    pub fn has_speculative(&self) -> bool {
        self.acknowledged_index + 1 < self.writes.len()
    }

    /// Lifetime acknowledgement ordinal of the map at `index`
    pub fn ordinal_of(&self, index: usize) -> Option<u64> {
        if index > self.acknowledged_index {
            return None;
        }
        Some(self.acknowledged_count - (self.acknowledged_index - index) as u64)
    }

    /// Position of the map with `sequence`, if still in the array.
    ///
    /// Maps folded into the base are not found.
    pub fn position_of(&self, sequence: u64) -> Option<usize> {
        self.writes
            .iter()
            .rposition(|m| m.sequence() == sequence)
            .filter(|&pos| pos > 0)
    }

    /// Prefix ending at `index`, the newest visible map.
    ///
    /// Used for reads that must ignore speculative data. Indices past the end
    /// are clamped.
    pub fn trimmed_to(&self, index: usize) -> Snapshot {
        let end = index.min(self.writes.len() - 1);
        let acknowledged_index = self.acknowledged_index.min(end);
        Snapshot {
            writes: self.writes[..=end].to_vec(),
            acknowledged_index,
            acknowledged_count: self
                .ordinal_of(acknowledged_index)
                .unwrap_or(self.acknowledged_count),
            next_sequence: self.next_sequence,
            intercepted: self.intercepted,
            interception: self.interception,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Newest value written to a field, scanning newest map first
    pub fn read_field(&self, object: ObjectId, field: FieldIndex) -> Option<&Value> {
        self.writes
            .iter()
            .rev()
            .filter_map(|m| m.find(object))
            .find_map(|v| v.field(field))
    }

    /// Newest value of a key, `None` if absent
    pub fn read_key(&self, object: ObjectId, key: &str) -> Option<&Value> {
        for version in self.writes.iter().rev().filter_map(|m| m.find(object)) {
            match version.entry(key) {
                KeyLookup::Put(value) => return Some(value),
                KeyLookup::Removed => return None,
                KeyLookup::Untouched => {}
            }
        }
        None
    }

    /// Versions of `object` from the newest reset onward, oldest first
    fn replay_chain(&self, object: ObjectId) -> Vec<&Version> {
        let mut chain = Vec::new();
        for version in self.writes.iter().rev().filter_map(|m| m.find(object)) {
            chain.push(version);
            if version.resets() {
                break;
            }
        }
        chain.reverse();
        chain
    }

    /// Materialized entries of a keyed object
    pub fn keyed_entries(&self, object: ObjectId) -> BTreeMap<String, Value> {
        let mut entries = BTreeMap::new();
        for version in self.replay_chain(object) {
            version.apply_entries(&mut entries);
        }
        entries
    }

    /// Materialized elements of an indexed object
    pub fn list(&self, object: ObjectId) -> Vec<Value> {
        let mut list = Vec::new();
        for version in self.replay_chain(object) {
            version.apply_ops(&mut list);
        }
        list
    }

    // ------------------------------------------------------------------
    // Successor snapshots
    // ------------------------------------------------------------------

    /// Append a locally committed map
    pub(crate) fn with_published(&self, versions: Vec<Version>) -> (Snapshot, Arc<VersionMap>) {
        let interception = self.intercepted.then_some(self.interception);
        let map = Arc::new(
            VersionMap::new(self.next_sequence, versions).with_interception(interception),
        );
        let mut next = self.clone();
        next.writes.push(map.clone());
        next.next_sequence += 1;
        if !self.intercepted && !self.has_speculative() {
            next.acknowledged_index = next.writes.len() - 1;
            next.acknowledged_count += 1;
        }
        (next, map)
    }

    /// Insert an already-ordered remote map at the acknowledged boundary,
    /// below any local speculative maps
    pub(crate) fn with_remote(
        &self,
        versions: Vec<Version>,
        source: Option<Source>,
    ) -> (Snapshot, Arc<VersionMap>) {
        let map = Arc::new(VersionMap::new(self.next_sequence, versions).with_source(source));
        let mut next = self.clone();
        next.writes = insert_version_map(&self.writes, self.acknowledged_index + 1, map.clone());
        next.next_sequence += 1;
        next.acknowledged_index += 1;
        next.acknowledged_count += 1;
        (next, map)
    }

    /// Acknowledge every map up to and including `position`
    pub(crate) fn with_acknowledged_through(&self, position: usize) -> Snapshot {
        let mut next = self.clone();
        if position > self.acknowledged_index {
            let position = position.min(self.writes.len() - 1);
            next.acknowledged_count += (position - self.acknowledged_index) as u64;
            next.acknowledged_index = position;
        }
        next
    }

    /// Remove speculative maps with a sequence at or above `from_sequence`
    pub(crate) fn without_speculative_from(
        &self,
        from_sequence: u64,
    ) -> (Snapshot, Vec<Arc<VersionMap>>) {
        let mut writes = self.writes.clone();
        let mut rejected = Vec::new();
        let mut position = writes.len();
        while position > self.acknowledged_index + 1 {
            position -= 1;
            if writes[position].sequence() >= from_sequence {
                rejected.push(writes[position].clone());
                writes = remove_version_map(&writes, position);
            }
        }
        rejected.reverse();
        let mut next = self.clone();
        next.writes = writes;
        (next, rejected)
    }

    /// Switch speculative mode
    pub(crate) fn with_interception(&self, intercepted: bool, id: InterceptionId) -> Snapshot {
        let mut next = self.clone();
        next.intercepted = intercepted;
        next.interception = id;
        next
    }

    /// Fold maps `0..=cut` into a single base map
    pub(crate) fn folded(&self, cut: usize) -> Snapshot {
        let cut = cut.min(self.acknowledged_index);
        let base = VersionMap::fold(self.writes[..=cut].iter().map(|m| m.as_ref()));
        let mut writes = Vec::with_capacity(self.writes.len() - cut);
        writes.push(Arc::new(base));
        writes.extend_from_slice(&self.writes[cut + 1..]);
        let mut next = self.clone();
        next.writes = writes;
        next.acknowledged_index -= cut;
        next
    }
}

//! One commit's write-set

use crate::version::Version;
use mvstm_core::{InterceptionId, ObjectId, Source};
use std::collections::BTreeMap;

/// Versions published together by one commit.
///
/// Immutable once inside a snapshot. Versions are kept sorted by object id so
/// lookups during reads and validation are a binary search.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMap {
    sequence: u64,
    source: Option<Source>,
    interception: Option<InterceptionId>,
    versions: Vec<Version>,
}

impl VersionMap {
    /// Create a map from versions in any order
    pub fn new(sequence: u64, mut versions: Vec<Version>) -> Self {
        versions.sort_by_key(Version::object);
        VersionMap {
            sequence,
            source: None,
            interception: None,
            versions,
        }
    }

    /// Empty map, used as the base of a fresh snapshot
    pub fn empty() -> Self {
        VersionMap::new(0, Vec::new())
    }

    /// Tag the map with the peer that produced it
    pub fn with_source(mut self, source: Option<Source>) -> Self {
        self.source = source;
        self
    }

    /// Tag the map as published under a speculative epoch
    pub fn with_interception(mut self, interception: Option<InterceptionId>) -> Self {
        self.interception = interception;
        self
    }

    /// Commit sequence, unique within the trunk
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Peer that produced the writes; `None` for local commits
    pub fn source(&self) -> Option<Source> {
        self.source
    }

    /// Speculative epoch the map was published under
    pub fn interception(&self) -> Option<InterceptionId> {
        self.interception
    }

    /// Versions ordered by object id
    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Number of objects written
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True if nothing was written
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Version of `object` in this map
    pub fn find(&self, object: ObjectId) -> Option<&Version> {
        self.versions
            .binary_search_by_key(&object, Version::object)
            .ok()
            .map(|pos| &self.versions[pos])
    }

    /// Fold consecutive maps, oldest first, into one self-contained base map.
    ///
    /// The result carries the highest sequence among the inputs, no source and
    /// no interception.
    pub fn fold<'a, I>(maps: I) -> VersionMap
    where
        I: IntoIterator<Item = &'a VersionMap>,
    {
        let mut merged: BTreeMap<ObjectId, Version> = BTreeMap::new();
        let mut sequence = 0;
        for map in maps {
            sequence = sequence.max(map.sequence);
            for version in &map.versions {
                match merged.get_mut(&version.object()) {
                    Some(existing) => existing.merge(version),
                    None => {
                        merged.insert(version.object(), version.clone());
                    }
                }
            }
        }
        let versions = merged
            .into_values()
            .map(|mut v| {
                v.compact_as_base();
                v
            })
            .collect();
        VersionMap::new(sequence, versions)
    }
}

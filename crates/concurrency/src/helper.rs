//! Copy-on-write array helpers for snapshot chains

use crate::version_map::VersionMap;
use std::sync::Arc;

/// Copy of `maps` with the map at `index` excised.
///
/// Relative order of the remaining maps is preserved. An out-of-range index
/// returns an unchanged copy.
pub fn remove_version_map(maps: &[Arc<VersionMap>], index: usize) -> Vec<Arc<VersionMap>> {
    let mut result = Vec::with_capacity(maps.len().saturating_sub(1));
    result.extend_from_slice(&maps[..index.min(maps.len())]);
    if index < maps.len() {
        result.extend_from_slice(&maps[index + 1..]);
    }
    result
}

/// Copy of `maps` with `map` inserted at `index`
pub fn insert_version_map(
    maps: &[Arc<VersionMap>],
    index: usize,
    map: Arc<VersionMap>,
) -> Vec<Arc<VersionMap>> {
    let at = index.min(maps.len());
    let mut result = Vec::with_capacity(maps.len() + 1);
    result.extend_from_slice(&maps[..at]);
    result.push(map);
    result.extend_from_slice(&maps[at..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: u64) -> Vec<Arc<VersionMap>> {
        (0..n).map(|s| Arc::new(VersionMap::new(s, Vec::new()))).collect()
    }

    fn sequences(maps: &[Arc<VersionMap>]) -> Vec<u64> {
        maps.iter().map(|m| m.sequence()).collect()
    }

    #[test]
    fn test_remove_middle() {
        let maps = chain(5);
        assert_eq!(sequences(&remove_version_map(&maps, 2)), vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_remove_first() {
        let maps = chain(5);
        assert_eq!(sequences(&remove_version_map(&maps, 0)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_remove_last() {
        let maps = chain(5);
        assert_eq!(sequences(&remove_version_map(&maps, 4)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_remove_keeps_shared_maps() {
        let maps = chain(3);
        let removed = remove_version_map(&maps, 1);
        assert!(Arc::ptr_eq(&maps[0], &removed[0]));
        assert!(Arc::ptr_eq(&maps[2], &removed[1]));
    }

    #[test]
    fn test_remove_out_of_range() {
        let maps = chain(2);
        assert_eq!(sequences(&remove_version_map(&maps, 7)), vec![0, 1]);
    }

    #[test]
    fn test_insert() {
        let maps = chain(3);
        let inserted = insert_version_map(&maps, 1, Arc::new(VersionMap::new(9, Vec::new())));
        assert_eq!(sequences(&inserted), vec![0, 9, 1, 2]);
    }
}

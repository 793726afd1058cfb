//! Read-only cell-tower → coarse-location map
//!
//! Built offline from an OpenCellID dump, serialized whole with postcard,
//! and loaded once at startup. Expect on the order of 10^7 entries. The map
//! is immutable after load and freely sharable across threads.

use crate::error::{Error, Result};
use crate::types::{CoarseLocation, TowerKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Lookup table from packed cell identifiers to coarse locations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TowerMap {
    cells: HashMap<u64, CoarseLocation>,
}

impl TowerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a serialized map from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref()).map_err(|e| Error::Storage(e.to_string()))?;
        postcard::from_bytes(&bytes).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Serialize the whole map to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = postcard::to_allocvec(self).map_err(|e| Error::Storage(e.to_string()))?;
        fs::write(path.as_ref(), bytes).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Insert one cell. Used by the offline preprocessor output and tests;
    /// the server never mutates a loaded map.
    pub fn insert(&mut self, tower: TowerKey, location: CoarseLocation) {
        self.cells.insert(tower.0, location);
    }

    /// Coarse location of `tower`, if known.
    pub fn get(&self, tower: TowerKey) -> Option<CoarseLocation> {
        self.cells.get(&tower.0).copied()
    }

    /// Every cell whose mobile country code equals `mcc`.
    pub fn filter_by_country(&self, mcc: u16) -> Vec<(TowerKey, CoarseLocation)> {
        self.cells
            .iter()
            .map(|(&packed, &loc)| (TowerKey(packed), loc))
            .filter(|(tower, _)| tower.mcc() == mcc)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_map() -> TowerMap {
        let mut map = TowerMap::new();
        map.insert(
            TowerKey::pack(234, 10, 100, 1).unwrap(),
            CoarseLocation::from_degrees(52.21, 0.09),
        );
        map.insert(
            TowerKey::pack(234, 10, 100, 2).unwrap(),
            CoarseLocation::from_degrees(52.20, 0.12),
        );
        map.insert(
            TowerKey::pack(262, 1, 50, 7).unwrap(),
            CoarseLocation::from_degrees(52.52, 13.40),
        );
        map
    }

    #[test]
    fn test_lookup() {
        let map = sample_map();
        let hit = map.get(TowerKey::pack(234, 10, 100, 1).unwrap()).unwrap();
        assert_eq!(hit, CoarseLocation::from_degrees(52.21, 0.09));

        assert!(map.get(TowerKey::pack(234, 10, 100, 99).unwrap()).is_none());
    }

    #[test]
    fn test_filter_by_country() {
        let map = sample_map();
        let uk = map.filter_by_country(234);
        assert_eq!(uk.len(), 2);
        assert!(uk.iter().all(|(tower, _)| tower.mcc() == 234));

        assert_eq!(map.filter_by_country(262).len(), 1);
        assert!(map.filter_by_country(208).is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("towers.bin");

        let map = sample_map();
        map.save(&path).unwrap();

        let loaded = TowerMap::load(&path).unwrap();
        assert_eq!(loaded.len(), map.len());
        assert_eq!(
            loaded.get(TowerKey::pack(262, 1, 50, 7).unwrap()),
            map.get(TowerKey::pack(262, 1, 50, 7).unwrap())
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(TowerMap::load(dir.path().join("absent.bin")).is_err());
    }
}

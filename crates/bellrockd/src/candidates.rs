//! Candidate-set construction for AID resolution
//!
//! Three sources, tried in priority order: the observer's recent
//! acquaintances, their declared peers, and users co-located with the
//! observer. Ordering is purely a heuristic; correctness only needs every
//! keyed user to be reachable from some source. Co-location is computed once
//! per batch and cached per coarse cell.

use bellrock_core::types::{CoarseLocation, SecretKey, Uid};
use bellrock_store::{Keystore, KeystoreError, Store, StoreError};
use std::collections::HashMap;

/// Which source produced a resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Recent,
    Peers,
    Colocated,
}

/// Users co-located with one observer during one batch, grouped by the
/// coarse cells the observer itself visited in the batch's time range.
pub struct ColocationIndex {
    cells: HashMap<CoarseLocation, Vec<Uid>>,
}

impl ColocationIndex {
    /// An index with no cells; every lookup yields an empty source.
    pub fn empty() -> Self {
        Self {
            cells: HashMap::new(),
        }
    }

    /// Build from the observer's own location intervals overlapping
    /// `[start, end]`. One store query per interval; results for intervals
    /// sharing a coarse cell are merged without duplicates.
    ///
    /// An observer with no stored locations in the range yields an empty
    /// index, which is legal: affected observations simply stay unresolved.
    pub fn build(
        store: &Store,
        observer: Uid,
        start: u64,
        end: u64,
    ) -> Result<Self, StoreError> {
        let mut cells: HashMap<CoarseLocation, Vec<Uid>> = HashMap::new();
        for interval in store.locations_for(observer, Some((start, end)))? {
            let nearby = store.users_at(interval.coarse, (interval.start_ts, interval.end_ts))?;
            let entry = cells.entry(interval.coarse).or_default();
            for uid in nearby {
                if !entry.contains(&uid) {
                    entry.push(uid);
                }
            }
        }
        Ok(Self { cells })
    }

    /// Users co-located with the observer at `cell`, store order. Empty when
    /// the observation's position projects to a cell the observer has no
    /// interval for.
    pub fn users_at(&self, cell: CoarseLocation) -> &[Uid] {
        self.cells.get(&cell).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

/// Materialize `(uid, key)` candidate pairs, preserving order. UIDs without
/// a stored key are skipped: they can never match, and a deleted user may
/// legitimately linger in another observer's in-memory window.
pub fn with_keys(
    keystore: &Keystore,
    uids: &[Uid],
) -> Result<Vec<(Uid, SecretKey)>, KeystoreError> {
    let mut out = Vec::with_capacity(uids.len());
    for &uid in uids {
        if let Some(key) = keystore.get(uid)? {
            out.push((uid, key));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellrock_core::types::{TowerKey, UserLocation};
    use bellrock_store::MasterKey;
    use tempfile::tempdir;

    fn uid(n: u8) -> Uid {
        Uid::from_bytes([0, 0, 0, 0, 0, 0, 0, n])
    }

    fn loc(start: u64, end: u64, lat: f64, lon: f64) -> UserLocation {
        UserLocation {
            start_ts: start,
            end_ts: end,
            coarse: CoarseLocation::from_degrees(lat, lon),
            tower: TowerKey::pack(234, 10, 1, 1).unwrap(),
        }
    }

    #[test]
    fn test_build_groups_by_cell() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let observer = uid(1);

        // Observer was at two cells; two other users share one of them.
        store.add_location(observer, &loc(100, 200, 52.21, 0.09)).unwrap();
        store.add_location(observer, &loc(300, 400, 52.30, 0.10)).unwrap();
        store.add_location(uid(2), &loc(150, 180, 52.21, 0.09)).unwrap();
        store.add_location(uid(3), &loc(190, 250, 52.21, 0.09)).unwrap();
        store.add_location(uid(4), &loc(150, 180, 48.85, 2.35)).unwrap();

        let index = ColocationIndex::build(&store, observer, 100, 400).unwrap();
        assert_eq!(index.cell_count(), 2);

        let here = CoarseLocation::from_degrees(52.21, 0.09);
        let nearby = index.users_at(here);
        assert!(nearby.contains(&observer));
        assert!(nearby.contains(&uid(2)));
        assert!(nearby.contains(&uid(3)));
        assert!(!nearby.contains(&uid(4)));

        // A cell the observer never visited is an empty source.
        let elsewhere = CoarseLocation::from_degrees(48.85, 2.35);
        assert!(index.users_at(elsewhere).is_empty());
    }

    #[test]
    fn test_build_without_history_is_empty() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let index = ColocationIndex::build(&store, uid(1), 0, 1000).unwrap();
        assert_eq!(index.cell_count(), 0);
    }

    #[test]
    fn test_merged_intervals_deduplicate() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let observer = uid(1);

        // Two observer intervals at the same cell, both overlapping uid(2).
        store.add_location(observer, &loc(100, 200, 52.21, 0.09)).unwrap();
        store.add_location(observer, &loc(250, 300, 52.21, 0.09)).unwrap();
        store.add_location(uid(2), &loc(100, 300, 52.21, 0.09)).unwrap();

        let index = ColocationIndex::build(&store, observer, 100, 300).unwrap();
        let nearby = index.users_at(CoarseLocation::from_degrees(52.21, 0.09));
        assert_eq!(nearby.iter().filter(|&&u| u == uid(2)).count(), 1);
    }

    #[test]
    fn test_with_keys_skips_keyless() {
        let dir = tempdir().unwrap();
        let ks = Keystore::open(dir.path(), &MasterKey::derive(b"secret")).unwrap();

        let keyed = uid(1);
        let key = SecretKey::random();
        ks.put(keyed, &key).unwrap();

        let pairs = with_keys(&ks, &[uid(9), keyed, uid(8)]).unwrap();
        assert_eq!(pairs, vec![(keyed, key)]);
    }
}

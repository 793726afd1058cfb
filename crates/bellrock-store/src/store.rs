//! Main relational store using sled
//!
//! One tree per logical table. Composite big-endian keys make the hot
//! queries single prefix scans:
//!
//! - `users`: `uid` → registration timestamp
//! - `peers`: `uid ‖ peer` → `[]`, two rows per logical edge so lookup by
//!   either endpoint is one scan
//! - `observations`: `observer ‖ ts ‖ aid` → postcard([`Observation`]),
//!   chronological within an observer
//! - `locations`: `uid ‖ start ‖ end` → postcard([`UserLocation`])

use bellrock_core::types::{Aid, CoarseLocation, Observation, Uid, UserLocation};
use sled::{Batch, Db, Tree};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::warn;

/// Buffered rows that force a commit before the background ticker fires.
pub const DEFAULT_BUFFER_LIMIT: usize = 5000;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("user not found: {0}")]
    UserNotFound(Uid),
    #[error("duplicate user: {0}")]
    DuplicateUser(Uid),
    #[error("peer edge not found: {0} <-> {1}")]
    EdgeNotFound(Uid, Uid),
    #[error("self edge rejected: {0}")]
    SelfEdge(Uid),
    #[error("invalid interval: start {start} > end {end}")]
    InvalidInterval { start: u64, end: u64 },
    #[error("observation not found")]
    ObservationNotFound,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for bellrock_core::Error {
    fn from(e: StoreError) -> Self {
        use bellrock_core::Error;
        match e {
            StoreError::UserNotFound(u) => Error::NotFound(format!("user {u}")),
            StoreError::EdgeNotFound(a, b) => Error::NotFound(format!("peer edge {a} <-> {b}")),
            StoreError::ObservationNotFound => Error::NotFound("observation".into()),
            StoreError::DuplicateUser(u) => Error::Duplicate(format!("user {u}")),
            StoreError::SelfEdge(_) | StoreError::InvalidInterval { .. } => {
                Error::Integrity(e.to_string())
            }
            StoreError::Corrupt(_) => Error::Integrity(e.to_string()),
            StoreError::Sled(_) | StoreError::Codec(_) => Error::Storage(e.to_string()),
        }
    }
}

/// The relational half of the server state. Key material lives in the
/// segregated [`crate::Keystore`], never here.
pub struct Store {
    db: Db,
    users: Tree,
    peers: Tree,
    observations: Tree,
    locations: Tree,
    /// Rows written through the buffered path since the last commit.
    pending: AtomicUsize,
    buffer_limit: usize,
}

fn edge_key(a: Uid, b: Uid) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(a.as_bytes());
    key[8..].copy_from_slice(b.as_bytes());
    key
}

fn obs_key(obs: &Observation) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(obs.observer.as_bytes());
    key[8..16].copy_from_slice(&obs.ts.to_be_bytes());
    key[16..].copy_from_slice(obs.aid.as_bytes());
    key
}

fn loc_key(uid: Uid, loc: &UserLocation) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(uid.as_bytes());
    key[8..16].copy_from_slice(&loc.start_ts.to_be_bytes());
    key[16..].copy_from_slice(&loc.end_ts.to_be_bytes());
    key
}

fn uid_prefix(key: &[u8]) -> Result<Uid, StoreError> {
    let bytes: [u8; 8] = key
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt(format!("key too short: {} bytes", key.len())))?;
    Ok(Uid::from_bytes(bytes))
}

impl Store {
    /// Open the store at the given path with the default commit buffer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_limit(path, DEFAULT_BUFFER_LIMIT)
    }

    /// Open with an explicit buffered-write commit threshold.
    pub fn open_with_limit(path: impl AsRef<Path>, buffer_limit: usize) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let users = db.open_tree("users")?;
        let peers = db.open_tree("peers")?;
        let observations = db.open_tree("observations")?;
        let locations = db.open_tree("locations")?;

        Ok(Self {
            db,
            users,
            peers,
            observations,
            locations,
            pending: AtomicUsize::new(0),
            buffer_limit: buffer_limit.max(1),
        })
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    /// Register a UID. Rejected without side effects when already present.
    pub fn add_user(&self, uid: Uid, created_ts: u64) -> Result<(), StoreError> {
        if self.users.contains_key(uid.as_bytes())? {
            return Err(StoreError::DuplicateUser(uid));
        }
        self.users
            .insert(uid.as_bytes(), &created_ts.to_le_bytes())?;
        self.flush()?;
        Ok(())
    }

    pub fn contains_user(&self, uid: Uid) -> Result<bool, StoreError> {
        Ok(self.users.contains_key(uid.as_bytes())?)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Remove the user and every row referencing them: peer edges in both
    /// directions, observations they made or appear in as the resolved
    /// subject, and their location history.
    pub fn delete_user(&self, uid: Uid) -> Result<(), StoreError> {
        if self.users.remove(uid.as_bytes())?.is_none() {
            return Err(StoreError::UserNotFound(uid));
        }

        for peer in self.peers_of(uid)? {
            self.peers.remove(edge_key(uid, peer))?;
            self.peers.remove(edge_key(peer, uid))?;
        }

        let mut batch = Batch::default();
        for item in self.observations.scan_prefix(uid.as_bytes()) {
            let (key, _) = item?;
            batch.remove(key);
        }
        for item in self.observations.iter() {
            let (key, value) = item?;
            let obs: Observation = postcard::from_bytes(&value)?;
            if obs.resolved == Some(uid) {
                batch.remove(key);
            }
        }
        self.observations.apply_batch(batch)?;

        let mut batch = Batch::default();
        for item in self.locations.scan_prefix(uid.as_bytes()) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.locations.apply_batch(batch)?;

        self.flush()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Peers
    // -------------------------------------------------------------------------

    /// Add a symmetric peer edge. At most one edge per pair; re-adding an
    /// existing edge is a no-op. Self-edges are rejected.
    pub fn add_peer(&self, a: Uid, b: Uid) -> Result<(), StoreError> {
        if a == b {
            return Err(StoreError::SelfEdge(a));
        }
        self.peers.insert(edge_key(a, b), &[] as &[u8])?;
        self.peers.insert(edge_key(b, a), &[] as &[u8])?;
        self.flush()?;
        Ok(())
    }

    /// Remove a peer edge from both endpoints.
    pub fn delete_peer(&self, a: Uid, b: Uid) -> Result<(), StoreError> {
        let fwd = self.peers.remove(edge_key(a, b))?;
        let rev = self.peers.remove(edge_key(b, a))?;
        if fwd.is_none() && rev.is_none() {
            return Err(StoreError::EdgeNotFound(a, b));
        }
        self.flush()?;
        Ok(())
    }

    /// Declared peers of `uid`, in stored order.
    pub fn peers_of(&self, uid: Uid) -> Result<Vec<Uid>, StoreError> {
        let mut out = Vec::new();
        for item in self.peers.scan_prefix(uid.as_bytes()) {
            let (key, _) = item?;
            let bytes: [u8; 8] = key
                .get(8..16)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| StoreError::Corrupt("short peer key".into()))?;
            out.push(Uid::from_bytes(bytes));
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    /// Store one observation and commit immediately.
    pub fn add_observation(&self, obs: &Observation) -> Result<(), StoreError> {
        self.observations
            .insert(obs_key(obs), postcard::to_allocvec(obs)?)?;
        self.flush()?;
        Ok(())
    }

    /// Store a batch of observations with a single commit at the end.
    pub fn add_observations(&self, observations: &[Observation]) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        for obs in observations {
            batch.insert(obs_key(obs).to_vec(), postcard::to_allocvec(obs)?);
        }
        self.observations.apply_batch(batch)?;
        self.flush()?;
        Ok(())
    }

    /// Store one observation without forcing a commit. The row is committed
    /// by the periodic ticker, or sooner once the buffer threshold is hit.
    pub fn add_observation_buffered(&self, obs: &Observation) -> Result<(), StoreError> {
        self.observations
            .insert(obs_key(obs), postcard::to_allocvec(obs)?)?;
        if self.pending.fetch_add(1, Ordering::Relaxed) + 1 >= self.buffer_limit {
            self.flush()?;
        }
        Ok(())
    }

    /// Delete one observation identified by its natural key.
    pub fn delete_observation(&self, observer: Uid, ts: u64, aid: Aid) -> Result<(), StoreError> {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(observer.as_bytes());
        key[8..16].copy_from_slice(&ts.to_be_bytes());
        key[16..].copy_from_slice(aid.as_bytes());
        if self.observations.remove(key)?.is_none() {
            return Err(StoreError::ObservationNotFound);
        }
        self.flush()?;
        Ok(())
    }

    /// Every observation made by `observer`, in chronological order.
    ///
    /// A resolved reference pointing at a user that no longer exists is an
    /// integrity violation; the row is returned with the reference stripped.
    pub fn observations_by_observer(&self, observer: Uid) -> Result<Vec<Observation>, StoreError> {
        let mut out = Vec::new();
        for item in self.observations.scan_prefix(observer.as_bytes()) {
            let (_, value) = item?;
            let mut obs: Observation = postcard::from_bytes(&value)?;
            if let Some(resolved) = obs.resolved {
                if !self.contains_user(resolved)? {
                    warn!(observer = %observer, resolved = %resolved, "stripping dangling resolved reference");
                    obs.resolved = None;
                }
            }
            out.push(obs);
        }
        Ok(out)
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    // -------------------------------------------------------------------------
    // Locations
    // -------------------------------------------------------------------------

    /// Append one location interval for `uid` and commit immediately.
    pub fn add_location(&self, uid: Uid, loc: &UserLocation) -> Result<(), StoreError> {
        if loc.start_ts > loc.end_ts {
            return Err(StoreError::InvalidInterval {
                start: loc.start_ts,
                end: loc.end_ts,
            });
        }
        self.locations
            .insert(loc_key(uid, loc), postcard::to_allocvec(loc)?)?;
        self.flush()?;
        Ok(())
    }

    /// Append a batch of location intervals with a single commit.
    pub fn add_locations(&self, uid: Uid, locs: &[UserLocation]) -> Result<(), StoreError> {
        for loc in locs {
            if loc.start_ts > loc.end_ts {
                return Err(StoreError::InvalidInterval {
                    start: loc.start_ts,
                    end: loc.end_ts,
                });
            }
        }
        let mut batch = Batch::default();
        for loc in locs {
            batch.insert(loc_key(uid, loc).to_vec(), postcard::to_allocvec(loc)?);
        }
        self.locations.apply_batch(batch)?;
        self.flush()?;
        Ok(())
    }

    /// Location intervals of `uid`, optionally restricted to those that
    /// overlap `[s, e]` (intersection, not containment).
    pub fn locations_for(
        &self,
        uid: Uid,
        range: Option<(u64, u64)>,
    ) -> Result<Vec<UserLocation>, StoreError> {
        let mut out = Vec::new();
        for item in self.locations.scan_prefix(uid.as_bytes()) {
            let (_, value) = item?;
            let loc: UserLocation = postcard::from_bytes(&value)?;
            if let Some((s, e)) = range {
                if !loc.overlaps(s, e) {
                    continue;
                }
            }
            out.push(loc);
        }
        Ok(out)
    }

    /// UIDs with a stored interval at `cell` overlapping `[s, e]`,
    /// deduplicated, in stored order.
    pub fn users_at(&self, cell: CoarseLocation, range: (u64, u64)) -> Result<Vec<Uid>, StoreError> {
        let (s, e) = range;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for item in self.locations.iter() {
            let (key, value) = item?;
            let loc: UserLocation = postcard::from_bytes(&value)?;
            if loc.coarse != cell || !loc.overlaps(s, e) {
                continue;
            }
            let uid = uid_prefix(&key)?;
            if seen.insert(uid) {
                out.push(uid);
            }
        }
        Ok(out)
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Commit everything written so far and reset the buffered-row counter.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Rows written through the buffered path since the last commit.
    pub fn pending_rows(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Truncate every table. A no-op on an empty store.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.users.clear()?;
        self.peers.clear()?;
        self.observations.clear()?;
        self.locations.clear()?;
        self.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellrock_core::types::TowerKey;
    use tempfile::tempdir;

    fn open_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (Store::open(dir.path()).unwrap(), dir)
    }

    fn uid(n: u8) -> Uid {
        Uid::from_bytes([0, 0, 0, 0, 0, 0, 0, n])
    }

    fn obs(observer: Uid, ts: u64, aid_byte: u8) -> Observation {
        Observation {
            observer,
            aid: Aid([aid_byte; 16]),
            ts,
            lat: 52.21,
            lon: 0.09,
            place: None,
            resolved: None,
        }
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
    fn test_add_user_and_duplicate() {
        let (store, _dir) = open_store();

        store.add_user(uid(1), 1000).unwrap();
        assert!(store.contains_user(uid(1)).unwrap());
        assert_eq!(store.user_count(), 1);

        let result = store.add_user(uid(1), 2000);
        assert!(matches!(result, Err(StoreError::DuplicateUser(_))));
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_peer_symmetry() {
        let (store, _dir) = open_store();
        store.add_user(uid(1), 0).unwrap();
        store.add_user(uid(2), 0).unwrap();

        store.add_peer(uid(1), uid(2)).unwrap();
        assert_eq!(store.peers_of(uid(1)).unwrap(), vec![uid(2)]);
        assert_eq!(store.peers_of(uid(2)).unwrap(), vec![uid(1)]);

        // Re-adding keeps a single edge.
        store.add_peer(uid(2), uid(1)).unwrap();
        assert_eq!(store.peers_of(uid(1)).unwrap().len(), 1);

        store.delete_peer(uid(2), uid(1)).unwrap();
        assert!(store.peers_of(uid(1)).unwrap().is_empty());
        assert!(store.peers_of(uid(2)).unwrap().is_empty());
    }

    #[test]
    fn test_self_edge_rejected() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.add_peer(uid(3), uid(3)),
            Err(StoreError::SelfEdge(_))
        ));
    }

    #[test]
    fn test_delete_missing_edge() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.delete_peer(uid(1), uid(2)),
            Err(StoreError::EdgeNotFound(_, _))
        ));
    }

    #[test]
    fn test_observations_chronological() {
        let (store, _dir) = open_store();
        let observer = uid(1);

        store
            .add_observations(&[obs(observer, 300, 3), obs(observer, 100, 1), obs(observer, 200, 2)])
            .unwrap();

        let stored = store.observations_by_observer(observer).unwrap();
        let ts: Vec<u64> = stored.iter().map(|o| o.ts).collect();
        assert_eq!(ts, vec![100, 200, 300]);

        // Another observer's rows are invisible here.
        store.add_observation(&obs(uid(2), 50, 9)).unwrap();
        assert_eq!(store.observations_by_observer(observer).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_observation() {
        let (store, _dir) = open_store();
        let o = obs(uid(1), 100, 1);
        store.add_observation(&o).unwrap();

        store.delete_observation(o.observer, o.ts, o.aid).unwrap();
        assert!(store.observations_by_observer(uid(1)).unwrap().is_empty());

        assert!(matches!(
            store.delete_observation(o.observer, o.ts, o.aid),
            Err(StoreError::ObservationNotFound)
        ));
    }

    #[test]
    fn test_dangling_resolved_is_stripped() {
        let (store, _dir) = open_store();
        store.add_user(uid(1), 0).unwrap();

        let mut o = obs(uid(1), 100, 1);
        o.resolved = Some(uid(9)); // never registered
        store.add_observation(&o).unwrap();

        let stored = store.observations_by_observer(uid(1)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].resolved, None);
    }

    #[test]
    fn test_location_overlap_semantics() {
        let (store, _dir) = open_store();
        let user = uid(1);
        store
            .add_locations(
                user,
                &[loc(0, 100, 1.0, 1.0), loc(150, 250, 1.0, 1.0), loc(300, 400, 1.0, 1.0)],
            )
            .unwrap();

        // Overlap, not containment: [90, 160] clips two intervals.
        let hits = store.locations_for(user, Some((90, 160))).unwrap();
        let starts: Vec<u64> = hits.iter().map(|l| l.start_ts).collect();
        assert_eq!(starts, vec![0, 150]);

        // Unrestricted query returns everything.
        assert_eq!(store.locations_for(user, None).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.add_location(uid(1), &loc(10, 5, 0.0, 0.0)),
            Err(StoreError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_users_at_cell() {
        let (store, _dir) = open_store();
        store.add_location(uid(1), &loc(100, 200, 52.21, 0.09)).unwrap();
        store.add_location(uid(2), &loc(150, 250, 52.21, 0.09)).unwrap();
        store.add_location(uid(3), &loc(100, 200, 48.85, 2.35)).unwrap();
        // Same user twice in the window must not duplicate.
        store.add_location(uid(1), &loc(210, 220, 52.21, 0.09)).unwrap();

        let cell = CoarseLocation::from_degrees(52.21, 0.09);
        let users = store.users_at(cell, (150, 215)).unwrap();
        assert_eq!(users, vec![uid(1), uid(2)]);

        // Disjoint time range.
        assert!(store.users_at(cell, (500, 600)).unwrap().is_empty());
    }

    #[test]
    fn test_buffered_commit_threshold() {
        let dir = tempdir().unwrap();
        let store = Store::open_with_limit(dir.path(), 3).unwrap();

        store.add_observation_buffered(&obs(uid(1), 1, 1)).unwrap();
        store.add_observation_buffered(&obs(uid(1), 2, 2)).unwrap();
        assert_eq!(store.pending_rows(), 2);

        // Third row trips the threshold and commits.
        store.add_observation_buffered(&obs(uid(1), 3, 3)).unwrap();
        assert_eq!(store.pending_rows(), 0);
    }

    #[test]
    fn test_cascade_delete() {
        let (store, _dir) = open_store();
        let (a, b) = (uid(1), uid(2));
        store.add_user(a, 0).unwrap();
        store.add_user(b, 0).unwrap();
        store.add_peer(a, b).unwrap();
        store.add_location(b, &loc(0, 100, 1.0, 1.0)).unwrap();

        let mut seen = obs(a, 100, 1);
        seen.resolved = Some(b);
        store.add_observation(&seen).unwrap();
        store.add_observation(&obs(b, 200, 2)).unwrap();

        store.delete_user(b).unwrap();

        assert!(!store.contains_user(b).unwrap());
        assert!(store.peers_of(a).unwrap().is_empty());
        assert!(store.observations_by_observer(b).unwrap().is_empty());
        // The observation where b was the resolved subject is gone too.
        assert!(store.observations_by_observer(a).unwrap().is_empty());
        assert!(store.locations_for(b, None).unwrap().is_empty());

        assert!(matches!(
            store.delete_user(b),
            Err(StoreError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (store, _dir) = open_store();
        store.add_user(uid(1), 0).unwrap();
        store.add_observation(&obs(uid(1), 1, 1)).unwrap();

        store.clear().unwrap();
        assert_eq!(store.user_count(), 0);
        assert_eq!(store.observation_count(), 0);

        // Clearing an already-empty store succeeds.
        store.clear().unwrap();
    }
}

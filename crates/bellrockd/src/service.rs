//! Bellrock ingest service
//!
//! Owns the store, the key store, the tower map, and the resolver, and
//! exposes the registration and ingest operations the daemon serves. The
//! transport shell in [`crate::server`] is a thin adapter over this type.

use crate::acquaintances::RecentWindow;
use crate::config::Config;
use crate::resolver::Resolver;
use bellrock_core::error::{Error, Result};
use bellrock_core::towers::TowerMap;
use bellrock_core::types::{Observation, ObservationBatch, SecretKey, Uid, UserLocation};
use bellrock_store::{Keystore, Store, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Service counters reported over the stats call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceStats {
    pub users: usize,
    pub observations: usize,
    pub locations: usize,
    pub towers: usize,
    pub active_windows: usize,
}

/// The Bellrock server core: every ingest operation goes through here.
pub struct Bellrock {
    store: Arc<Store>,
    keystore: Arc<Keystore>,
    towers: Arc<TowerMap>,
    resolver: Resolver,
    /// One recent-acquaintance window per observer. The outer lock guards
    /// the table; the inner lock serializes batches from the same observer.
    windows: Mutex<HashMap<Uid, Arc<Mutex<RecentWindow>>>>,
    window_capacity: NonZeroUsize,
    commit_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Bellrock {
    /// Open both databases, load the tower map, and assemble the service.
    pub fn open(config: &Config) -> Result<Self> {
        let master = config
            .master_key()
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let store = Arc::new(
            Store::open_with_limit(&config.data_dir, config.commit_buffer)
                .map_err(bellrock_core::Error::from)?,
        );
        let keystore = Arc::new(
            Keystore::open(&config.keystore_dir, &master).map_err(bellrock_core::Error::from)?,
        );

        let towers = match &config.tower_map {
            Some(path) => {
                let map = TowerMap::load(path)?;
                info!(cells = map.len(), "tower map loaded");
                Arc::new(map)
            }
            None => Arc::new(TowerMap::new()),
        };

        Self::new(
            store,
            keystore,
            towers,
            config.lru_capacity,
            config.workers,
            config.parallel_threshold,
            Duration::from_secs(config.commit_interval_secs),
        )
    }

    /// Assemble from already-open components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        keystore: Arc<Keystore>,
        towers: Arc<TowerMap>,
        window_capacity: NonZeroUsize,
        workers: usize,
        parallel_threshold: usize,
        commit_interval: Duration,
    ) -> Result<Self> {
        let resolver = Resolver::new(store.clone(), keystore.clone(), workers, parallel_threshold)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            store,
            keystore,
            towers,
            resolver,
            windows: Mutex::new(HashMap::new()),
            window_capacity,
            commit_interval,
            shutdown_tx,
        })
    }

    // -------------------------------------------------------------------------
    // Registration and keys
    // -------------------------------------------------------------------------

    /// Register a new device: fresh UID, fresh key.
    pub fn register_user(&self) -> Result<(Uid, SecretKey)> {
        // Retry the draw on the astronomically unlikely UID collision.
        loop {
            let uid = Uid::random();
            match self.store.add_user(uid, unix_now()) {
                Ok(()) => {
                    let key = SecretKey::random();
                    self.keystore.put(uid, &key)?;
                    debug!(%uid, "user registered");
                    return Ok((uid, key));
                }
                Err(StoreError::DuplicateUser(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Register `n` devices in one call.
    pub fn register_users(&self, n: usize) -> Result<Vec<(Uid, SecretKey)>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.register_user()?);
        }
        Ok(out)
    }

    /// Replace the device key. AIDs minted under the old key stop resolving
    /// the moment this returns.
    pub fn renew_key(&self, uid: Uid) -> Result<SecretKey> {
        if !self.store.contains_user(uid)? {
            return Err(Error::NotFound(format!("user {uid}")));
        }
        let key = SecretKey::random();
        self.keystore.put(uid, &key)?;
        info!(%uid, "key renewed");
        Ok(key)
    }

    /// Delete a device and everything referencing it.
    pub fn delete_user(&self, uid: Uid) -> Result<()> {
        self.store.delete_user(uid)?;
        self.keystore.remove(uid)?;
        self.windows.lock().remove(&uid);
        info!(%uid, "user deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Peers
    // -------------------------------------------------------------------------

    /// Declare a symmetric peer edge between two registered devices.
    pub fn add_peer(&self, a: Uid, b: Uid) -> Result<()> {
        for uid in [a, b] {
            if !self.store.contains_user(uid)? {
                return Err(Error::NotFound(format!("user {uid}")));
            }
        }
        self.store.add_peer(a, b)?;
        Ok(())
    }

    /// Remove a declared peer edge from both endpoints.
    pub fn delete_peer(&self, a: Uid, b: Uid) -> Result<()> {
        self.store.delete_peer(a, b)?;
        Ok(())
    }

    /// Declared peers of `uid`.
    pub fn peers_of(&self, uid: Uid) -> Result<Vec<Uid>> {
        Ok(self.store.peers_of(uid)?)
    }

    // -------------------------------------------------------------------------
    // Locations
    // -------------------------------------------------------------------------

    /// Append one location interval. The coarse cell is re-derived from the
    /// tower map when the serving tower is known; the client-supplied value
    /// stands otherwise.
    pub fn add_location(&self, uid: Uid, mut loc: UserLocation) -> Result<()> {
        if !self.store.contains_user(uid)? {
            return Err(Error::NotFound(format!("user {uid}")));
        }
        if let Some(coarse) = self.towers.get(loc.tower) {
            loc.coarse = coarse;
        }
        self.store.add_location(uid, &loc)?;
        Ok(())
    }

    /// Append a batch of location intervals with one commit.
    pub fn add_locations(&self, uid: Uid, mut locs: Vec<UserLocation>) -> Result<()> {
        if !self.store.contains_user(uid)? {
            return Err(Error::NotFound(format!("user {uid}")));
        }
        for loc in &mut locs {
            if let Some(coarse) = self.towers.get(loc.tower) {
                loc.coarse = coarse;
            }
        }
        self.store.add_locations(uid, &locs)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    /// Resolve and persist one chronological batch from one observer.
    /// Returns the number of observations whose sender was identified.
    pub fn submit_observations(&self, batch: ObservationBatch) -> Result<usize> {
        let window = self.window_for(batch.observer);
        let mut window = window.lock();
        Ok(self.resolver.resolve_batch(&mut window, batch)?)
    }

    fn window_for(&self, observer: Uid) -> Arc<Mutex<RecentWindow>> {
        self.windows
            .lock()
            .entry(observer)
            .or_insert_with(|| Arc::new(Mutex::new(RecentWindow::new(self.window_capacity))))
            .clone()
    }

    /// Stored observations made by `observer`, chronological.
    pub fn observations_of(&self, observer: Uid) -> Result<Vec<Observation>> {
        Ok(self.store.observations_by_observer(observer)?)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Commit both databases.
    pub fn flush(&self) -> Result<()> {
        self.store.flush().map_err(bellrock_core::Error::from)?;
        self.keystore.flush().map_err(bellrock_core::Error::from)?;
        Ok(())
    }

    /// Spawn the periodic commit ticker. Bounds the loss window for rows
    /// written through the buffered path.
    pub fn spawn_commit_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(service.commit_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.flush() {
                            warn!("periodic commit failed: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Signal background tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            users: self.store.user_count(),
            observations: self.store.observation_count(),
            locations: self.store.location_count(),
            towers: self.towers.len(),
            active_windows: self.windows.lock().len(),
        }
    }
}

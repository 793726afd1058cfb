//! Per-observation resolution loop and parallel trial-decryption fan-out

use crate::acquaintances::RecentWindow;
use crate::candidates::{self, ColocationIndex, Source};
use bellrock_core::codec::{self, CipherCache};
use bellrock_core::types::{Aid, CoarseLocation, ObservationBatch, SecretKey, Uid};
use bellrock_store::{Keystore, KeystoreError, Store, StoreError};
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),
    #[error("unknown observer: {0}")]
    UnknownObserver(Uid),
    #[error("worker pool: {0}")]
    Pool(String),
}

impl From<ResolveError> for bellrock_core::Error {
    fn from(e: ResolveError) -> Self {
        use bellrock_core::Error;
        match e {
            ResolveError::Store(inner) => inner.into(),
            ResolveError::Keystore(inner) => inner.into(),
            ResolveError::UnknownObserver(u) => Error::NotFound(format!("observer {u}")),
            ResolveError::Pool(_) => Error::Crypto(e.to_string()),
        }
    }
}

/// Recovers the senders behind anonymous IDs.
///
/// The only hot path in the server, and the only one that exploits
/// parallelism: when a co-location candidate set outgrows the configured
/// threshold, trial decryptions fan out across a work-stealing pool and stop
/// as soon as any worker finds a match.
pub struct Resolver {
    store: Arc<Store>,
    keystore: Arc<Keystore>,
    ciphers: CipherCache,
    pool: rayon::ThreadPool,
    parallel_threshold: usize,
}

impl Resolver {
    /// Build a resolver with `workers` pool threads (0 = one per core).
    pub fn new(
        store: Arc<Store>,
        keystore: Arc<Keystore>,
        workers: usize,
        parallel_threshold: usize,
    ) -> Result<Self, ResolveError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("bellrock-resolve-{i}"))
            .build()
            .map_err(|e| ResolveError::Pool(e.to_string()))?;

        Ok(Self {
            store,
            keystore,
            ciphers: CipherCache::new(),
            pool,
            parallel_threshold,
        })
    }

    /// Attempt to identify the sender of every observation in `batch`, then
    /// persist the whole batch (resolved or not) in one bulk write. Returns
    /// the number of successful resolutions.
    ///
    /// The caller holds the observer's window lock, which serializes
    /// concurrent batches from the same observer. Read errors abort before
    /// anything is written; write errors surface without retry.
    pub fn resolve_batch(
        &self,
        window: &mut RecentWindow,
        mut batch: ObservationBatch,
    ) -> Result<usize, ResolveError> {
        let observer = batch.observer;
        if !self.store.contains_user(observer)? {
            return Err(ResolveError::UnknownObserver(observer));
        }

        let peers = candidates::with_keys(&self.keystore, &self.store.peers_of(observer)?)?;
        let colocated = match batch.time_range() {
            Some((start, end)) => ColocationIndex::build(&self.store, observer, start, end)?,
            None => ColocationIndex::empty(),
        };

        let mut resolved_count = 0;
        for obs in &mut batch.observations {
            let cell = obs.coarse();
            if let Some((uid, source)) = self.resolve_one(window, &peers, &colocated, obs.aid, cell)? {
                obs.resolved = Some(uid);
                window.touch(uid);
                resolved_count += 1;
                trace!(%observer, %uid, ?source, "observation resolved");
            }
        }

        self.store.add_observations(&batch.observations)?;
        debug!(
            %observer,
            total = batch.observations.len(),
            resolved = resolved_count,
            "batch persisted"
        );
        Ok(resolved_count)
    }

    /// One observation against the three candidate sources in priority
    /// order, short-circuiting on the first match.
    fn resolve_one(
        &self,
        window: &RecentWindow,
        peers: &[(Uid, SecretKey)],
        colocated: &ColocationIndex,
        aid: Aid,
        cell: CoarseLocation,
    ) -> Result<Option<(Uid, Source)>, ResolveError> {
        // Recent acquaintances, most-recent-first. The window is tiny and a
        // hit usually lands within the first few attempts, so sequential.
        let recent = candidates::with_keys(&self.keystore, &window.snapshot())?;
        if let Some(uid) = self.search_sequential(aid, &recent) {
            return Ok(Some((uid, Source::Recent)));
        }

        // Declared peers.
        if let Some(uid) = self.search_sequential(aid, peers) {
            return Ok(Some((uid, Source::Peers)));
        }

        // Users co-located with the observer at this coarse cell. This set
        // can be large (a busy station), so it may fan out.
        let nearby = candidates::with_keys(&self.keystore, colocated.users_at(cell))?;
        if let Some(uid) = self.search(aid, &nearby) {
            return Ok(Some((uid, Source::Colocated)));
        }

        Ok(None)
    }

    /// Trial-decrypt `aid` against candidates in order; first match wins.
    /// A decryption under the wrong key just yields a non-matching block,
    /// so a failed attempt never aborts the scan.
    fn search_sequential(&self, aid: Aid, cands: &[(Uid, SecretKey)]) -> Option<Uid> {
        cands
            .iter()
            .find(|(uid, key)| self.attempt(aid, *uid, key))
            .map(|(uid, _)| *uid)
    }

    /// Fan out across the pool once the set is large enough to amortize
    /// scheduling; remaining attempts stop as soon as one worker matches.
    fn search(&self, aid: Aid, cands: &[(Uid, SecretKey)]) -> Option<Uid> {
        if cands.len() <= self.parallel_threshold {
            return self.search_sequential(aid, cands);
        }
        self.pool.install(|| {
            cands
                .par_iter()
                .find_any(|(uid, key)| self.attempt(aid, *uid, key))
                .map(|(uid, _)| *uid)
        })
    }

    /// One trial decryption with the memoized per-key cipher.
    fn attempt(&self, aid: Aid, uid: Uid, key: &SecretKey) -> bool {
        let cipher = self.ciphers.get(key);
        codec::matches(&codec::trial_decrypt(&aid, &cipher), uid)
    }

    /// Benchmark hook: trial-decrypt `aid` against every registered key.
    ///
    /// This is the brute force the candidate heuristics exist to avoid; it
    /// exists to calibrate them against the worst case. Production callers
    /// must not use it, and nothing in the daemon routes here.
    pub fn resolve_exhaustive(&self, aid: Aid) -> Result<Option<Uid>, ResolveError> {
        let everyone = candidates::with_keys(&self.keystore, &self.keystore.all_uids()?)?;
        Ok(self.pool.install(|| {
            everyone
                .par_iter()
                .find_any(|(uid, key)| self.attempt(aid, *uid, key))
                .map(|(uid, _)| *uid)
        }))
    }

    /// Distinct keys the cipher cache has seen.
    pub fn cached_ciphers(&self) -> usize {
        self.ciphers.len()
    }
}

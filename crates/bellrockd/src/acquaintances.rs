//! Per-observer recent-acquaintance window

use bellrock_core::types::Uid;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Bounded window of the users an observer most recently resolved.
///
/// Touching a UID moves it to the head, so iteration is most-recent-first
/// and an observer's stable social cluster stays at the front of the
/// candidate sequence. The window is in-memory only and rebuilds itself
/// through normal resolution after a restart.
pub struct RecentWindow {
    entries: LruCache<Uid, ()>,
}

impl RecentWindow {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Record `uid` as the most recent acquaintance. Evicts the
    /// least-recently-touched entry when the window is at capacity.
    pub fn touch(&mut self, uid: Uid) {
        self.entries.put(uid, ());
    }

    /// Most-recent-first snapshot of the window.
    pub fn snapshot(&self) -> Vec<Uid> {
        self.entries.iter().map(|(uid, _)| *uid).collect()
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.entries.contains(&uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

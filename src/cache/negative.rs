use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

pub(super) const NOTFOUND_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();

/// Bounded set of keys known to be absent upstream. Lookups slide the
/// per-entry deadline forward; capacity overflow evicts the least recently
/// touched key.
#[derive(Debug)]
pub(super) struct NotFoundCache {
    lru: LruCache<String, Instant>,
    ttl: Duration,
}

impl NotFoundCache {
    pub(super) fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            lru: LruCache::new(capacity),
            ttl,
        }
    }

    pub(super) fn insert(&mut self, key: &str, now: Instant) {
        self.lru.push(key.to_string(), now + self.ttl);
    }

    /// True if `key` is still negatively cached; a hit refreshes the TTL.
    pub(super) fn contains(&mut self, key: &str, now: Instant) -> bool {
        match self.lru.get_mut(key) {
            Some(deadline) if *deadline > now => {
                *deadline = now + self.ttl;
                true
            }
            Some(_) => {
                self.lru.pop(key);
                false
            }
            None => false,
        }
    }

    pub(super) fn remove(&mut self, key: &str) {
        self.lru.pop(key);
    }

    pub(super) fn len(&self) -> usize {
        self.lru.len()
    }
}

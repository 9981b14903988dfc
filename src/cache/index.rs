use std::time::{Duration, Instant};

use lru::LruCache;

use super::CacheEntry;

#[derive(Debug)]
struct IndexSlot {
    entry: CacheEntry,
    expires_at: Instant,
}

pub(super) enum Lookup {
    Hit(CacheEntry),
    Expired(CacheEntry),
    Miss,
}

/// Recency-ordered view of the completed entries. Entry count is unbounded;
/// the byte bound is enforced by the store popping LRU victims. Each slot
/// carries a sliding deadline refreshed on every hit.
#[derive(Debug)]
pub(super) struct CacheIndex {
    lru: LruCache<String, IndexSlot>,
    ttl: Duration,
}

impl CacheIndex {
    pub(super) fn new(ttl: Duration) -> Self {
        Self {
            lru: LruCache::unbounded(),
            ttl,
        }
    }

    /// Returns the live entry for `key`, refreshing its deadline and recency.
    /// An expired slot is popped and handed back so the caller can unlink it.
    pub(super) fn get(&mut self, key: &str, now: Instant) -> Lookup {
        match self.lru.get_mut(key) {
            Some(slot) if slot.expires_at > now => {
                slot.expires_at = now + self.ttl;
                Lookup::Hit(slot.entry.clone())
            }
            Some(_) => match self.lru.pop(key) {
                Some(slot) => Lookup::Expired(slot.entry),
                None => Lookup::Miss,
            },
            None => Lookup::Miss,
        }
    }

    /// Inserts an entry with a fresh deadline. Returns the displaced entry if
    /// `key` was already present.
    pub(super) fn insert(&mut self, entry: CacheEntry, now: Instant) -> Option<CacheEntry> {
        let slot = IndexSlot {
            entry,
            expires_at: now + self.ttl,
        };
        self.lru
            .push(slot.entry.key.clone(), slot)
            .map(|(_key, replaced)| replaced.entry)
    }

    pub(super) fn pop(&mut self, key: &str) -> Option<CacheEntry> {
        self.lru.pop(key).map(|slot| slot.entry)
    }

    pub(super) fn pop_lru(&mut self) -> Option<CacheEntry> {
        self.lru.pop_lru().map(|(_key, slot)| slot.entry)
    }

    /// Pops every entry whose deadline has passed.
    pub(super) fn pop_expired(&mut self, now: Instant) -> Vec<CacheEntry> {
        let expired: Vec<String> = self
            .lru
            .iter()
            .filter(|(_key, slot)| slot.expires_at <= now)
            .map(|(key, _slot)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.lru.pop(&key).map(|slot| slot.entry))
            .collect()
    }

    /// Entries in recency order, without touching recency or deadlines.
    pub(super) fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.lru.iter().map(|(_key, slot)| &slot.entry)
    }

    pub(super) fn len(&self) -> usize {
        self.lru.len()
    }
}

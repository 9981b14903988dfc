use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::sync::{RwLock, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

mod entry;
mod index;
mod layout;
mod negative;
mod persist;
mod streaming;

pub use entry::{CacheEntry, CacheStats};
pub use streaming::{StreamError, StreamingFile, StreamingReader};

use index::{CacheIndex, Lookup};
use layout::CacheLayout;
use negative::{NOTFOUND_CACHE_CAPACITY, NotFoundCache};

/// Disk-backed content store for completed downloads plus the map of
/// in-flight [`StreamingFile`]s. A key lives in at most one of the two at
/// any instant: `get_or_create_pending` inserts into the pending map, and
/// `complete_pending`/`fail_pending` atomically move the key out of it.
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    layout: CacheLayout,
    index: Mutex<CacheIndex>,
    negative: Mutex<NotFoundCache>,
    pending: RwLock<HashMap<String, Arc<StreamingFile>>>,
    total_size: AtomicU64,
    max_size: u64,
    stop_save: watch::Sender<bool>,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileCache {
    /// Opens the cache root, reconciles the persisted index against the
    /// filesystem, removes orphan files, and starts the periodic index save
    /// loop.
    pub async fn open(
        root: PathBuf,
        max_size: u64,
        entry_ttl: Duration,
        notfound_ttl: Duration,
        save_interval: Duration,
    ) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache directory {}", root.display()))?;
        let layout = CacheLayout::new(root);

        let loaded = {
            let layout = layout.clone();
            task::spawn_blocking(move || persist::load_and_cleanup(&layout))
                .await
                .map_err(|err| anyhow!("cache load task failed: {err}"))??
        };

        let now = Instant::now();
        let mut index = CacheIndex::new(entry_ttl);
        let mut total_size = 0u64;
        for entry in loaded {
            total_size += entry.size;
            index.insert(entry, now);
        }
        crate::metrics::set_cache_size(total_size);

        let (stop_save, stop_rx) = watch::channel(false);
        let inner = Arc::new(CacheInner {
            layout,
            index: Mutex::new(index),
            negative: Mutex::new(NotFoundCache::new(NOTFOUND_CACHE_CAPACITY, notfound_ttl)),
            pending: RwLock::new(HashMap::new()),
            total_size: AtomicU64::new(total_size),
            max_size,
            stop_save,
            save_task: Mutex::new(None),
        });

        let save_task = tokio::spawn(save_loop(inner.clone(), save_interval, stop_rx));
        *inner.save_task.lock() = Some(save_task);

        Ok(Self { inner })
    }

    /// Returns the completed entry for `key` if present and unexpired,
    /// sliding its TTL forward. An expired entry is removed and unlinked.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let lookup = self.inner.index.lock().get(key, Instant::now());
        match lookup {
            Lookup::Hit(entry) => {
                crate::metrics::record_cache_lookup(true);
                Some(entry)
            }
            Lookup::Expired(entry) => {
                debug!(key, "cache entry expired");
                self.inner.discard_entry(&entry);
                crate::metrics::record_cache_lookup(false);
                None
            }
            Lookup::Miss => {
                crate::metrics::record_cache_lookup(false);
                None
            }
        }
    }

    /// Returns the in-flight download for `key`, if any.
    pub async fn get_pending(&self, key: &str) -> Option<Arc<StreamingFile>> {
        self.inner.pending.read().await.get(key).cloned()
    }

    /// Atomically returns the existing pending download for `key` or creates
    /// a fresh one (making the shard directory as needed). The boolean is
    /// true only for the caller that created it, which makes that caller the
    /// one fetcher allowed to write the file.
    pub async fn get_or_create_pending(&self, key: &str) -> Result<(Arc<StreamingFile>, bool)> {
        let mut pending = self.inner.pending.write().await;
        if let Some(sf) = pending.get(key) {
            return Ok((sf.clone(), false));
        }

        let file_path = self.inner.layout.file_path(key);
        if let Some(shard_dir) = file_path.parent() {
            async_fs::create_dir_all(shard_dir).await.with_context(|| {
                format!("failed to create cache subdirectory {}", shard_dir.display())
            })?;
        }
        let sf = Arc::new(StreamingFile::create(file_path).await?);
        pending.insert(key.to_string(), sf.clone());
        crate::metrics::set_cache_pending(pending.len());
        Ok((sf, true))
    }

    /// Promotes a finished download into the completed store, evicting LRU
    /// entries first so the byte bound holds. No-op if `key` is not pending.
    pub async fn complete_pending(&self, key: &str, size: u64, content_type: &str) {
        let Some(sf) = self.take_pending(key).await else {
            return;
        };
        sf.complete().await;

        self.inner.evict_for(size);

        let entry = CacheEntry {
            key: key.to_string(),
            file_path: self.inner.layout.file_path(key),
            size,
            content_type: content_type.to_string(),
            created_at: std::time::SystemTime::now(),
        };
        let replaced = self.inner.index.lock().insert(entry, Instant::now());
        if let Some(old) = replaced {
            // Same key, same backing path: the new bytes already replaced the
            // old ones, so only the accounting moves.
            self.inner.total_size.fetch_sub(old.size, Ordering::Relaxed);
        }
        let total = self.inner.total_size.fetch_add(size, Ordering::Relaxed) + size;
        crate::metrics::set_cache_size(total);
        debug!(key, size, "cache entry stored");
    }

    /// Aborts a failed download: the pending entry disappears, the partial
    /// file is unlinked, and tailing readers observe [`StreamError::Aborted`].
    pub async fn fail_pending(&self, key: &str) {
        if let Some(sf) = self.take_pending(key).await {
            sf.abort().await;
            debug!(key, "pending download aborted");
        }
    }

    async fn take_pending(&self, key: &str) -> Option<Arc<StreamingFile>> {
        let mut pending = self.inner.pending.write().await;
        let sf = pending.remove(key);
        crate::metrics::set_cache_pending(pending.len());
        sf
    }

    /// Records that upstream answered 404 for `key`.
    pub fn put_not_found(&self, key: &str) {
        self.inner.negative.lock().insert(key, Instant::now());
    }

    /// True if `key` is negatively cached; a hit slides the TTL forward.
    pub fn is_not_found(&self, key: &str) -> bool {
        let hit = self.inner.negative.lock().contains(key, Instant::now());
        if hit {
            crate::metrics::record_notfound_hit();
        }
        hit
    }

    /// Drops `key` from the completed store (unlinking its file) and from the
    /// negative cache. Pending downloads are untouched.
    pub fn remove(&self, key: &str) {
        let popped = self.inner.index.lock().pop(key);
        if let Some(entry) = popped {
            self.inner.discard_entry(&entry);
        }
        self.inner.negative.lock().remove(key);
    }

    pub async fn stats(&self) -> CacheStats {
        let file_entries = self.inner.index.lock().len();
        let notfound_entries = self.inner.negative.lock().len();
        let pending = self.inner.pending.read().await.len();
        let total_size = self.inner.total_size.load(Ordering::Relaxed);
        let max_size = self.inner.max_size;
        CacheStats {
            file_entries,
            notfound_entries,
            total_size,
            max_size,
            usage_percent: total_size as f64 / max_size as f64 * 100.0,
            pending,
        }
    }

    /// Shutdown: stop the save loop, abort any still-pending downloads, and
    /// write the index one last time.
    pub async fn close(&self) {
        let _ = self.inner.stop_save.send(true);
        let save_task = self.inner.save_task.lock().take();
        if let Some(task) = save_task {
            let _ = task.await;
        }

        let pending: Vec<Arc<StreamingFile>> = {
            let mut map = self.inner.pending.write().await;
            let drained = map.drain().map(|(_key, sf)| sf).collect();
            crate::metrics::set_cache_pending(0);
            drained
        };
        for sf in pending {
            sf.abort().await;
        }

        if let Err(err) = self.inner.save_index().await {
            warn!(error = %err, "save cache index failed");
        }
    }

    #[cfg(test)]
    fn total_size(&self) -> u64 {
        self.inner.total_size.load(Ordering::Relaxed)
    }
}

impl CacheInner {
    /// Pops LRU victims until `incoming` fits inside the byte bound. An empty
    /// LRU ends the loop and the incoming entry is admitted regardless, so
    /// the bound is a soft target rather than a hard cap.
    fn evict_for(&self, incoming: u64) {
        while self.total_size.load(Ordering::Relaxed) + incoming > self.max_size {
            let victim = self.index.lock().pop_lru();
            let Some(victim) = victim else { break };
            debug!(key = %victim.key, size = victim.size, "cache evicted");
            self.discard_entry(&victim);
            crate::metrics::record_cache_eviction();
        }
    }

    /// Unlinks a removed entry's file and subtracts its size. Idempotent
    /// against files already missing from disk.
    fn discard_entry(&self, entry: &CacheEntry) {
        let total = self
            .total_size
            .fetch_sub(entry.size, Ordering::Relaxed)
            .saturating_sub(entry.size);
        crate::metrics::set_cache_size(total);
        match std::fs::remove_file(&entry.file_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %entry.file_path.display(), error = %err, "failed to remove cache file");
            }
        }
    }

    fn sweep_expired(&self) {
        let expired = self.index.lock().pop_expired(Instant::now());
        for entry in expired {
            debug!(key = %entry.key, "expired cache entry swept");
            self.discard_entry(&entry);
        }
    }

    async fn save_index(&self) -> Result<()> {
        let entries: Vec<entry::PersistedEntry> = {
            let index = self.index.lock();
            index.entries().map(|entry| entry.into()).collect()
        };
        persist::save_index(&self.layout, entries).await
    }
}

async fn save_loop(
    inner: Arc<CacheInner>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.sweep_expired();
                if let Err(err) = inner.save_index().await {
                    warn!(error = %err, "save cache index failed");
                }
            }
            _ = stop.changed() => return,
        }
    }
}

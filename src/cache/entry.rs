use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A completed, fully-downloaded cached object. While an entry is present in
/// the completed store, its backing file exists and has exactly `size` bytes;
/// a mismatch found at read time invalidates the entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub created_at: SystemTime,
}

/// Serialized form of an entry inside `index.json`.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PersistedEntry {
    pub key: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub created_at: u64,
}

impl From<&CacheEntry> for PersistedEntry {
    fn from(entry: &CacheEntry) -> Self {
        let created_at = entry
            .created_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            key: entry.key.clone(),
            file_path: entry.file_path.clone(),
            size: entry.size,
            content_type: entry.content_type.clone(),
            created_at,
        }
    }
}

impl From<PersistedEntry> for CacheEntry {
    fn from(persisted: PersistedEntry) -> Self {
        Self {
            key: persisted.key,
            file_path: persisted.file_path,
            size: persisted.size,
            content_type: persisted.content_type,
            created_at: SystemTime::UNIX_EPOCH + Duration::from_secs(persisted.created_at),
        }
    }
}

/// Snapshot served by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub file_entries: usize,
    pub notfound_entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub usage_percent: f64,
    pub pending: usize,
}

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, PersistedEntry};
use super::layout::CacheLayout;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    entries: Vec<PersistedEntry>,
}

/// Writes the index atomically: serialize to `index.json.tmp`, then rename
/// over `index.json`.
pub(super) async fn save_index(layout: &CacheLayout, entries: Vec<PersistedEntry>) -> Result<()> {
    let snapshot = IndexSnapshot { entries };
    let data = serde_json::to_vec_pretty(&snapshot).context("failed to serialize cache index")?;

    let tmp_path = layout.index_tmp_path();
    let index_path = layout.index_path();
    async_fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    if let Err(err) = async_fs::rename(&tmp_path, &index_path).await {
        let _ = async_fs::remove_file(&tmp_path).await;
        return Err(err)
            .with_context(|| format!("failed to rename index into {}", index_path.display()));
    }

    debug!(entries = snapshot.entries.len(), "cache index saved");
    Ok(())
}

/// Loads the persisted index, dropping entries whose backing file is missing
/// or has the wrong size, then removes every orphan file under the cache
/// root. Runs on a blocking thread at startup.
pub(super) fn load_and_cleanup(layout: &CacheLayout) -> Result<Vec<CacheEntry>> {
    let mut entries = Vec::new();
    let mut valid_files: HashSet<PathBuf> = HashSet::new();

    match fs::read(layout.index_path()) {
        Ok(data) => match serde_json::from_slice::<IndexSnapshot>(&data) {
            Ok(snapshot) => {
                for persisted in snapshot.entries {
                    let entry = CacheEntry::from(persisted);
                    match fs::metadata(&entry.file_path) {
                        Ok(meta) if meta.len() == entry.size => {
                            valid_files.insert(entry.file_path.clone());
                            entries.push(entry);
                        }
                        _ => {
                            let _ = fs::remove_file(&entry.file_path);
                        }
                    }
                }
                info!(entries = entries.len(), "cache index loaded");
            }
            Err(err) => {
                warn!(error = %err, "cache index unreadable; starting empty");
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            warn!(error = %err, "failed to read cache index; starting empty");
        }
    }

    cleanup_orphan_files(layout, &valid_files);
    cleanup_empty_dirs(layout);
    Ok(entries)
}

/// Removes every regular file under the root that is neither the index, its
/// staging file, nor a valid entry's backing file. Best-effort: individual
/// failures are logged and skipped.
fn cleanup_orphan_files(layout: &CacheLayout, valid_files: &HashSet<PathBuf>) {
    let index_path = layout.index_path();
    let tmp_path = layout.index_tmp_path();
    let mut removed = 0usize;

    walk_files(layout.root(), &mut |path| {
        if path == index_path || path == tmp_path || valid_files.contains(path) {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove orphan file");
            }
        }
    });

    if removed > 0 {
        info!(count = removed, "orphan files cleaned");
    }
}

fn walk_files(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to scan cache directory");
            return;
        }
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => walk_files(&path, visit),
            Ok(file_type) if file_type.is_file() => visit(&path),
            _ => {}
        }
    }
}

fn cleanup_empty_dirs(layout: &CacheLayout) {
    let entries = match fs::read_dir(layout.root()) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let subdir = entry.path();
        let is_empty = fs::read_dir(&subdir)
            .map(|mut iter| iter.next().is_none())
            .unwrap_or(false);
        if is_empty {
            let _ = fs::remove_dir(&subdir);
        }
    }
}

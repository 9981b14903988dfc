use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub(super) const INDEX_FILE_NAME: &str = "index.json";

/// On-disk shape of the cache root: `index.json`, its `.tmp` staging file,
/// and shard directories named by the first two hex chars of each key digest.
#[derive(Debug, Clone)]
pub(crate) struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    pub(crate) fn index_tmp_path(&self) -> PathBuf {
        self.root.join(format!("{INDEX_FILE_NAME}.tmp"))
    }

    /// `<root>/<hh>/<hex-sha256-of-key>`.
    pub(crate) fn file_path(&self, key: &str) -> PathBuf {
        let digest = key_digest(key);
        self.root.join(&digest[..2]).join(digest)
    }
}

fn key_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

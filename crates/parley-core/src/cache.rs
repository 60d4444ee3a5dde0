//! Content-hash cache.
//!
//! Maps a content hash to a local file holding those bytes, so a download
//! of content already on disk (completed earlier or shared locally, under
//! any attachment id) can finish without opening a transport.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::history::TransferHistoryEntry;

/// Content hash to local path map.
#[derive(Debug, Default)]
pub struct ContentCache {
    entries: HashMap<String, PathBuf>,
}

impl ContentCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from completed downloads in history.
    pub fn from_history<'a>(entries: impl IntoIterator<Item = &'a TransferHistoryEntry>) -> Self {
        let mut cache = Self::new();
        for entry in entries {
            if !entry.is_saved_download() || entry.is_inaccessible {
                continue;
            }
            if let (Some(hash), Some(path)) = (&entry.state.content_hash, &entry.state.saved_path) {
                // History is newest first; keep the most recent copy.
                cache
                    .entries
                    .entry(normalize(hash))
                    .or_insert_with(|| path.clone());
            }
        }
        cache
    }

    /// Record that `path` holds the content with `content_hash`.
    pub fn insert(&mut self, content_hash: &str, path: impl Into<PathBuf>) {
        if content_hash.is_empty() {
            return;
        }
        self.entries.insert(normalize(content_hash), path.into());
    }

    /// Register locally shared content without replacing downloaded copies.
    pub fn register_shared(&mut self, content_hash: &str, path: impl Into<PathBuf>) {
        if content_hash.is_empty() {
            return;
        }
        self.entries
            .entry(normalize(content_hash))
            .or_insert_with(|| path.into());
    }

    /// Find a local copy of `content_hash`.
    ///
    /// Entries whose file no longer exists are dropped.
    pub fn lookup(&mut self, content_hash: &str, exists: impl Fn(&Path) -> bool) -> Option<PathBuf> {
        let key = normalize(content_hash);
        let path = self.entries.get(&key)?;
        if exists(path) {
            return Some(path.clone());
        }
        tracing::debug!(content_hash = %key, path = %path.display(), "Dropping stale cache entry");
        self.entries.remove(&key);
        None
    }

    /// Forget a hash.
    pub fn remove(&mut self, content_hash: &str) -> Option<PathBuf> {
        self.entries.remove(&normalize(content_hash))
    }

    /// Number of cached hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn normalize(content_hash: &str) -> String {
    content_hash.trim().to_lowercase()
}

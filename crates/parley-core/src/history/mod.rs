//! Transfer history tracking for Parley.
//!
//! This module keeps a persisted, size-bounded log of transfers so the user
//! can find past downloads after the live transfer list has been cleared.
//!
//! ## Features
//!
//! - Upserts an entry on every status change of a live transfer
//! - Respects `max_entries` from configuration (newest kept)
//! - Revalidates saved files on demand and flags missing ones
//! - Drops stale rejected downloads when loaded
//! - Persists history to a JSON file, replaced atomically

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HistoryConfig;
use crate::error::{Error, Result};
use crate::transfer::{RequestId, TransferDirection, TransferState, TransferStatus};

const HISTORY_VERSION: u32 = 1;

/// A single transfer history entry.
///
/// Carries every field of the live [`TransferState`] it was recorded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferHistoryEntry {
    /// Last observed transfer state
    #[serde(flatten)]
    pub state: TransferState,
    /// When the transfer was first observed
    pub created_at: DateTime<Utc>,
    /// When the entry last changed
    pub updated_at: DateTime<Utc>,
    /// Saved file no longer exists
    #[serde(default)]
    pub is_inaccessible: bool,
}

impl TransferHistoryEntry {
    /// Create an entry for a newly observed transfer.
    #[must_use]
    pub fn new(state: TransferState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            created_at: now,
            updated_at: now,
            is_inaccessible: false,
        }
    }

    /// Request identifier of the recorded transfer.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.state.request_id
    }

    /// Whether this is a completed download with a saved file.
    #[must_use]
    pub fn is_saved_download(&self) -> bool {
        self.state.direction == TransferDirection::Download
            && self.state.status == TransferStatus::Completed
            && self.state.saved_path.is_some()
    }

    /// Get the creation time as a human-readable string.
    #[must_use]
    pub fn formatted_timestamp(&self) -> String {
        self.created_at.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// Serializable wrapper for the history database.
#[derive(Debug, Serialize, Deserialize)]
struct HistoryDatabase {
    /// Version of the history database format
    version: u32,
    /// Entries, newest first
    entries: Vec<TransferHistoryEntry>,
}

/// Transfer history store.
#[derive(Debug)]
pub struct HistoryStore {
    /// Path to the history database file
    path: PathBuf,
    /// History entries (newest first)
    entries: Vec<TransferHistoryEntry>,
    /// Configuration settings
    config: HistoryConfig,
    /// Entries changed since the last save
    dirty: bool,
}

impl HistoryStore {
    /// Load the history store from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be loaded.
    pub fn load(config: HistoryConfig) -> Result<Self> {
        let path = Self::default_path().unwrap_or_else(|| PathBuf::from("history.json"));
        Self::load_from(path, config)
    }

    /// Load from a specific path.
    ///
    /// Rejected downloads are dropped and transfers a previous run left in
    /// flight are recorded as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store exists but cannot be read or parsed.
    pub fn load_from(path: PathBuf, config: HistoryConfig) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::in_memory(path, config));
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to open history store at {}: {}",
                path.display(),
                e
            ))
        })?;

        let reader = BufReader::new(file);
        let db: HistoryDatabase = serde_json::from_reader(reader).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to parse history store at {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut store = Self {
            path,
            entries: db.entries,
            config,
            dirty: false,
        };
        store.apply_startup_cleanup();

        Ok(store)
    }

    /// Create an empty store that will save to `path`.
    #[must_use]
    pub fn in_memory(path: PathBuf, config: HistoryConfig) -> Self {
        Self {
            path,
            entries: Vec::new(),
            config,
            dirty: false,
        }
    }

    /// Get the default history store path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "parley", "Parley")
            .map(|dirs| dirs.data_dir().join("history.json"))
    }

    /// Save the history store.
    ///
    /// The file is written next to its destination and renamed over it, so
    /// a crash mid-save never leaves a truncated history.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be saved.
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::HistoryError(format!(
                    "Failed to create history store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = HistoryDatabase {
            version: HISTORY_VERSION,
            entries: self.entries.clone(),
        };

        let temp_path = self.path.with_extension("json.tmp");
        let write_temp = || -> Result<()> {
            let file = fs::File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &db)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            writer.flush()?;
            Ok(())
        };
        if let Err(e) = write_temp() {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::HistoryError(format!(
                "Failed to write history store at {}: {}",
                self.path.display(),
                e
            )));
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to replace history store at {}: {}",
                self.path.display(),
                e
            ))
        })?;

        self.dirty = false;
        Ok(())
    }

    /// Save only if something changed since the last save.
    ///
    /// Returns whether a save happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be saved.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Record the current state of a live transfer.
    ///
    /// Updates the matching entry or creates one at the front. A transfer
    /// seen for the first time in a terminal state is ignored rather than
    /// recorded. Returns whether the store changed.
    pub fn observe(&mut self, state: &TransferState, now: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            return false;
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.state.request_id == state.request_id)
        {
            if entry.state == *state {
                return false;
            }
            entry.state = state.clone();
            entry.updated_at = now;
            entry.is_inaccessible = false;
            self.dirty = true;
            return true;
        }

        if state.is_terminal() {
            tracing::debug!(
                request_id = %state.request_id,
                status = %state.status,
                "Ignoring unseen terminal transfer"
            );
            return false;
        }

        self.entries.insert(0, TransferHistoryEntry::new(state.clone(), now));
        if self.entries.len() > self.config.max_entries {
            self.entries.truncate(self.config.max_entries);
        }
        self.dirty = true;
        true
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&mut self, request_id: &RequestId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.state.request_id != request_id);
        let removed = self.entries.len() < before;
        self.dirty |= removed;
        removed
    }

    /// Re-check every saved download and flag the ones whose file is gone.
    ///
    /// Returns the number of inaccessible entries.
    pub fn refresh_accessibility(&mut self, exists: impl Fn(&Path) -> bool) -> usize {
        let mut inaccessible = 0;
        for entry in &mut self.entries {
            let Some(path) = entry.state.saved_path.as_deref() else {
                continue;
            };
            if !entry.is_saved_download() {
                continue;
            }
            let missing = !exists(path);
            if missing != entry.is_inaccessible {
                entry.is_inaccessible = missing;
                self.dirty = true;
            }
            if missing {
                inaccessible += 1;
            }
        }
        tracing::debug!(inaccessible, "Refreshed history accessibility");
        inaccessible
    }

    /// Drop entries flagged inaccessible. Returns how many were removed.
    pub fn prune_inaccessible(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_inaccessible);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
            tracing::debug!(removed, "Pruned inaccessible history entries");
        }
        removed
    }

    /// List history entries.
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum number of entries to return (None for all)
    #[must_use]
    pub fn list(&self, limit: Option<usize>) -> &[TransferHistoryEntry] {
        limit.map_or_else(
            || &self.entries[..],
            |n| &self.entries[..n.min(self.entries.len())],
        )
    }

    /// Get an entry by index (0 = most recent).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TransferHistoryEntry> {
        self.entries.get(index)
    }

    /// Get an entry by request ID.
    #[must_use]
    pub fn find_by_id(&self, request_id: &RequestId) -> Option<&TransferHistoryEntry> {
        self.entries.iter().find(|e| &e.state.request_id == request_id)
    }

    /// Get the total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all history entries.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Get the path to the history store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_startup_cleanup(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|e| {
            !(e.state.direction == TransferDirection::Download
                && e.state.status == TransferStatus::Rejected)
        });
        let dropped = before - self.entries.len();

        let now = Utc::now();
        let mut interrupted = 0;
        for entry in &mut self.entries {
            if !entry.state.is_terminal() {
                entry.state.status = TransferStatus::Failed;
                entry.state.error = Some("interrupted".to_string());
                entry.state.displayed_speed = None;
                entry.state.displayed_eta = None;
                entry.updated_at = now;
                interrupted += 1;
            }
        }

        if self.entries.len() > self.config.max_entries {
            self.entries.truncate(self.config.max_entries);
        }

        if dropped > 0 || interrupted > 0 {
            self.dirty = true;
            tracing::debug!(dropped, interrupted, "Cleaned up history on load");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn download(status: TransferStatus) -> TransferState {
        TransferState::new(
            Uuid::new_v4(),
            "att-1",
            "photo.jpg",
            TransferDirection::Download,
            "bob",
            status,
        )
    }

    fn store_in(dir: &TempDir, max_entries: usize) -> HistoryStore {
        let config = HistoryConfig {
            enabled: true,
            max_entries,
        };
        HistoryStore::load_from(dir.path().join("history.json"), config).unwrap()
    }

    #[test]
    fn test_history_store_save_and_load() {
        let tmp_dir = TempDir::new().unwrap();
        let mut store = store_in(&tmp_dir, 10);

        let mut state = download(TransferStatus::Requesting);
        assert!(store.observe(&state, Utc::now()));
        state.status = TransferStatus::Completed;
        state.progress = 1.0;
        state.saved_path = Some(PathBuf::from("/tmp/photo.jpg"));
        assert!(store.observe(&state, Utc::now()));
        store.save().unwrap();

        let loaded = store_in(&tmp_dir, 10);
        assert_eq!(loaded.len(), 1);
        let entry = loaded.find_by_id(&state.request_id).unwrap();
        assert_eq!(entry.state, state);
        assert!(!tmp_dir.path().join("history.json.tmp").exists());
    }

    #[test]
    fn test_unseen_terminal_state_is_not_recorded() {
        let tmp_dir = TempDir::new().unwrap();
        let mut store = store_in(&tmp_dir, 10);

        assert!(!store.observe(&download(TransferStatus::Failed), Utc::now()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_observe_same_state_is_noop() {
        let tmp_dir = TempDir::new().unwrap();
        let mut store = store_in(&tmp_dir, 10);
        let state = download(TransferStatus::Queued);

        assert!(store.observe(&state, Utc::now()));
        store.save().unwrap();
        assert!(!store.observe(&state, Utc::now()));
        assert!(!store.flush().unwrap());
    }

    #[test]
    fn test_history_max_entries_keeps_newest() {
        let tmp_dir = TempDir::new().unwrap();
        let mut store = store_in(&tmp_dir, 3);

        let states: Vec<_> = (0..5).map(|_| download(TransferStatus::Queued)).collect();
        for state in &states {
            store.observe(state, Utc::now());
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.get(0).unwrap().request_id(), states[4].request_id);
        assert_eq!(store.get(2).unwrap().request_id(), states[2].request_id);
        assert!(store.find_by_id(&states[0].request_id).is_none());
        assert!(store.find_by_id(&states[1].request_id).is_none());
    }

    #[test]
    fn test_refresh_and_prune_inaccessible() {
        let tmp_dir = TempDir::new().unwrap();
        let kept = tmp_dir.path().join("kept.bin");
        fs::write(&kept, b"x").unwrap();
        let mut store = store_in(&tmp_dir, 10);

        let mut present = download(TransferStatus::Requesting);
        let mut missing = download(TransferStatus::Requesting);
        let failed = download(TransferStatus::Requesting);
        for s in [&present, &missing, &failed] {
            store.observe(s, Utc::now());
        }
        present.status = TransferStatus::Completed;
        present.saved_path = Some(kept);
        missing.status = TransferStatus::Completed;
        missing.saved_path = Some(tmp_dir.path().join("gone.bin"));
        store.observe(&present, Utc::now());
        store.observe(&missing, Utc::now());

        assert_eq!(store.refresh_accessibility(Path::exists), 1);
        assert!(store.find_by_id(&missing.request_id).unwrap().is_inaccessible);
        assert!(!store.find_by_id(&present.request_id).unwrap().is_inaccessible);
        assert!(!store.find_by_id(&failed.request_id).unwrap().is_inaccessible);

        assert_eq!(store.prune_inaccessible(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_load_drops_rejected_downloads_and_fails_interrupted() {
        let tmp_dir = TempDir::new().unwrap();
        let mut store = store_in(&tmp_dir, 10);

        let mut rejected = download(TransferStatus::Requesting);
        let mut rejected_upload = rejected.clone();
        rejected_upload.request_id = Uuid::new_v4();
        rejected_upload.direction = TransferDirection::Upload;
        let in_flight = download(TransferStatus::Transferring);

        store.observe(&rejected, Utc::now());
        store.observe(&rejected_upload, Utc::now());
        store.observe(&in_flight, Utc::now());
        rejected.status = TransferStatus::Rejected;
        rejected_upload.status = TransferStatus::Rejected;
        store.observe(&rejected, Utc::now());
        store.observe(&rejected_upload, Utc::now());
        store.save().unwrap();

        let loaded = store_in(&tmp_dir, 10);
        assert_eq!(loaded.len(), 2);
        assert!(loaded.find_by_id(&rejected.request_id).is_none());
        assert!(loaded.find_by_id(&rejected_upload.request_id).is_some());

        let entry = loaded.find_by_id(&in_flight.request_id).unwrap();
        assert_eq!(entry.state.status, TransferStatus::Failed);
        assert_eq!(entry.state.error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_disabled_history_records_nothing() {
        let tmp_dir = TempDir::new().unwrap();
        let config = HistoryConfig {
            enabled: false,
            max_entries: 10,
        };
        let mut store = HistoryStore::in_memory(tmp_dir.path().join("h.json"), config);
        assert!(!store.observe(&download(TransferStatus::Queued), Utc::now()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let tmp_dir = TempDir::new().unwrap();
        let mut store = store_in(&tmp_dir, 10);
        let a = download(TransferStatus::Queued);
        let b = download(TransferStatus::Queued);
        store.observe(&a, Utc::now());
        store.observe(&b, Utc::now());

        assert!(store.remove(&a.request_id));
        assert!(!store.remove(&a.request_id));
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let tmp_dir = TempDir::new().unwrap();
        let store = HistoryStore::load_from(
            tmp_dir.path().join("nonexistent.json"),
            HistoryConfig::default(),
        )
        .unwrap();
        assert!(store.is_empty());
    }
}

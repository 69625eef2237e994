//! Persistent migration manifest.
//!
//! The manifest maps source identities to destination identities and records
//! the status of every item the engine has touched. It is the source of truth
//! for resuming a migration: `Migrated` entries are never processed again.
//!
//! All access goes through an internal mutex, so concurrent item workers can
//! share one `Arc<Manifest>`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::content::{ContentReference, ContentType};
use crate::error::{Error, ItemError, Result};

/// Current persisted layout version.
pub const MANIFEST_VERSION: u32 = 1;

/// Migration status of a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Work started but no outcome recorded yet.
    Pending,
    /// Published to the destination.
    Migrated,
    /// Excluded by a filter.
    Skipped,
    /// Failed; eligible for retry.
    Failed,
}

impl EntryStatus {
    /// Returns true if an entry may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, _) | (Self::Skipped | Self::Failed, Self::Pending)
        )
    }
}

/// Manifest record for one source item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Source identity.
    pub source: ContentReference,
    /// Destination identity, set once published.
    pub destination: Option<ContentReference>,
    /// Current status.
    pub status: EntryStatus,
    /// Last recorded error.
    pub last_error: Option<ItemError>,
    /// Number of times the item was started.
    #[serde(default)]
    pub attempts: u32,
    /// When the entry was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
}

impl ManifestEntry {
    /// Creates a fresh pending entry.
    #[must_use]
    pub fn pending(source: ContentReference) -> Self {
        let now = Utc::now();
        Self {
            source,
            destination: None,
            status: EntryStatus::Pending,
            last_error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns this entry reset to pending for another attempt.
    ///
    /// A destination reference from an earlier partial publish is kept so the
    /// next publish updates instead of creating a duplicate.
    #[must_use]
    pub fn restart(mut self) -> Self {
        self.status = EntryStatus::Pending;
        self.attempts += 1;
        self.updated_at = Utc::now();
        self
    }

    /// Returns this entry marked as migrated to `destination`.
    #[must_use]
    pub fn migrated(mut self, destination: ContentReference) -> Self {
        self.destination = Some(destination);
        self.status = EntryStatus::Migrated;
        self.last_error = None;
        self.updated_at = Utc::now();
        self
    }

    /// Returns this entry marked as skipped.
    #[must_use]
    pub fn skipped(mut self) -> Self {
        self.status = EntryStatus::Skipped;
        self.last_error = None;
        self.updated_at = Utc::now();
        self
    }

    /// Returns this entry marked as failed with `error`.
    #[must_use]
    pub fn failed(mut self, error: ItemError) -> Self {
        self.status = EntryStatus::Failed;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        self
    }
}

/// Per-status counts for one content type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Pending entries.
    pub pending: usize,
    /// Migrated entries.
    pub migrated: usize,
    /// Skipped entries.
    pub skipped: usize,
    /// Failed entries.
    pub failed: usize,
}

impl StatusCounts {
    /// Total number of entries.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.migrated + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<ContentType, BTreeMap<String, ManifestEntry>>,
    /// Errors that stopped a run rather than a single item.
    #[serde(default)]
    errors: Vec<ItemError>,
}

impl Default for ManifestDocument {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ManifestState {
    document: ManifestDocument,
    unsaved: usize,
}

/// The migration manifest.
#[derive(Debug)]
pub struct Manifest {
    path: Option<PathBuf>,
    state: Mutex<ManifestState>,
    save_lock: Mutex<()>,
}

impl Manifest {
    /// Creates an empty manifest that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(ManifestState::default()),
            save_lock: Mutex::new(()),
        }
    }

    /// Loads the manifest stored at `path`.
    ///
    /// A missing file yields an empty manifest bound to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or was
    /// written by an unsupported layout version.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Manifest(format!("read {}: {}", path.display(), e)))?;
            let document: ManifestDocument = serde_json::from_str(&content)
                .map_err(|e| Error::Manifest(format!("parse {}: {}", path.display(), e)))?;
            if document.version != MANIFEST_VERSION {
                return Err(Error::Manifest(format!(
                    "unsupported manifest version {} (expected {})",
                    document.version, MANIFEST_VERSION
                )));
            }
            let total: usize = document.entries.values().map(BTreeMap::len).sum();
            info!(path = %path.display(), entries = total, "Loaded manifest");
            document
        } else {
            info!(path = %path.display(), "No previous manifest, starting fresh");
            ManifestDocument::default()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(ManifestState {
                document,
                unsaved: 0,
            }),
            save_lock: Mutex::new(()),
        })
    }

    /// Location the manifest is saved to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Finds the entry for a source item.
    #[must_use]
    pub fn find_by_source(
        &self,
        content_type: &ContentType,
        source: &ContentReference,
    ) -> Option<ManifestEntry> {
        let state = self.state.lock();
        state
            .document
            .entries
            .get(content_type)
            .and_then(|entries| entries.get(&source.id))
            .cloned()
    }

    /// Inserts or replaces the entry for `entry.source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status transition is not allowed, if a
    /// migrated entry lacks a destination, or if a migrated entry would be
    /// changed.
    pub fn upsert(&self, content_type: &ContentType, mut entry: ManifestEntry) -> Result<()> {
        if entry.status == EntryStatus::Migrated && entry.destination.is_none() {
            return Err(Error::Manifest(format!(
                "{} '{}' marked migrated without a destination",
                content_type, entry.source.id
            )));
        }

        let mut state = self.state.lock();
        let entries = state
            .document
            .entries
            .entry(content_type.clone())
            .or_default();

        if let Some(existing) = entries.get(&entry.source.id) {
            if !existing.status.can_transition_to(entry.status) {
                return Err(Error::Manifest(format!(
                    "{} '{}' cannot move from {:?} to {:?}",
                    content_type, entry.source.id, existing.status, entry.status
                )));
            }
            entry.created_at = existing.created_at;
        }

        debug!(
            content_type = %content_type,
            source_id = %entry.source.id,
            status = ?entry.status,
            "Manifest upsert"
        );
        entries.insert(entry.source.id.clone(), entry);
        state.unsaved += 1;
        Ok(())
    }

    /// Destination reference of a migrated item, looked up by source id.
    #[must_use]
    pub fn destination_for(
        &self,
        content_type: &ContentType,
        source_id: &str,
    ) -> Option<ContentReference> {
        let state = self.state.lock();
        state
            .document
            .entries
            .get(content_type)
            .and_then(|entries| entries.get(source_id))
            .filter(|entry| entry.status == EntryStatus::Migrated)
            .and_then(|entry| entry.destination.clone())
    }

    /// All entries of a content type, ordered by source id.
    #[must_use]
    pub fn entries(&self, content_type: &ContentType) -> Vec<ManifestEntry> {
        let state = self.state.lock();
        state
            .document
            .entries
            .get(content_type)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Status counts per content type.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<ContentType, StatusCounts> {
        let state = self.state.lock();
        state
            .document
            .entries
            .iter()
            .map(|(content_type, entries)| {
                let mut counts = StatusCounts::default();
                for entry in entries.values() {
                    match entry.status {
                        EntryStatus::Pending => counts.pending += 1,
                        EntryStatus::Migrated => counts.migrated += 1,
                        EntryStatus::Skipped => counts.skipped += 1,
                        EntryStatus::Failed => counts.failed += 1,
                    }
                }
                (content_type.clone(), counts)
            })
            .collect()
    }

    /// Appends run-level errors, such as the one that aborted a stage.
    pub fn add_errors(&self, errors: impl IntoIterator<Item = ItemError>) {
        let mut state = self.state.lock();
        let before = state.document.errors.len();
        state.document.errors.extend(errors);
        state.unsaved += state.document.errors.len() - before;
    }

    /// Run-level errors recorded so far, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<ItemError> {
        self.state.lock().document.errors.clone()
    }

    /// Number of changes since the last save.
    #[must_use]
    pub fn unsaved_changes(&self) -> usize {
        self.state.lock().unsaved
    }

    /// Saves the manifest atomically (temp file + rename).
    ///
    /// In-memory manifests only reset their change counter. The counter is
    /// left untouched when the write fails, so the next checkpoint retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        // Held across snapshot and write so saves land in order.
        let _guard = self.save_lock.lock();

        let (snapshot, captured) = {
            let state = self.state.lock();
            (serde_json::to_vec_pretty(&state.document)?, state.unsaved)
        };

        if let Some(path) = &self.path {
            write_atomic(path, &snapshot)
                .map_err(|e| Error::Manifest(format!("write {}: {}", path.display(), e)))?;
            debug!(path = %path.display(), bytes = snapshot.len(), "Manifest saved");
        }

        // Changes made while writing stay counted.
        let mut state = self.state.lock();
        state.unsaved = state.unsaved.saturating_sub(captured);
        Ok(())
    }

    /// Saves if at least `interval` changes are unsaved.
    ///
    /// Returns whether a save happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub fn checkpoint(&self, interval: usize) -> Result<bool> {
        if self.unsaved_changes() >= interval.max(1) {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;

//! Per-resource version history with rollback and compare.
//!
//! Each resource gets a sidecar `.history.json` next to its file. Rollback
//! snapshots the current state as a new version first, so history stays
//! linear and rollbacks are themselves undoable.

use crate::error::{PromptForgeError, Result};
use crate::persist::{read_json_opt, write_json_atomic, STATE_SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One stored snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub snapshot: Value,
    #[serde(default)]
    pub description: String,
}

/// Sidecar file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionHistory {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub resource_type: String,
    pub resource_id: String,
    pub current_version: u32,
    /// Newest-first
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

/// A history store bound to one resource's sidecar file.
pub struct VersionStore {
    path: PathBuf,
    resource_type: String,
    resource_id: String,
    max_versions: usize,
}

impl VersionStore {
    /// Sidecar path convention: `<resource file>.history.json`.
    pub fn sidecar_path(resource_file: &Path) -> PathBuf {
        let mut name = resource_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".history.json");
        resource_file.with_file_name(name)
    }

    pub fn new(
        resource_file: &Path,
        resource_type: &str,
        resource_id: &str,
        max_versions: usize,
    ) -> Self {
        Self {
            path: Self::sidecar_path(resource_file),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            max_versions: max_versions.max(1),
        }
    }

    fn load(&self) -> VersionHistory {
        read_json_opt(&self.path).unwrap_or_else(|| VersionHistory {
            schema_version: STATE_SCHEMA_VERSION,
            resource_type: self.resource_type.clone(),
            resource_id: self.resource_id.clone(),
            current_version: 0,
            versions: Vec::new(),
        })
    }

    fn store(&self, history: &VersionHistory) -> Result<()> {
        write_json_atomic(&self.path, history)
    }

    /// Append a snapshot as `max + 1`, pruning the oldest above `max_versions`.
    pub fn save_version(&self, data: Value, description: &str) -> Result<u32> {
        let mut history = self.load();
        let version = history.current_version + 1;
        history.current_version = version;
        history.versions.insert(
            0,
            VersionEntry {
                version,
                timestamp: Utc::now(),
                snapshot: data,
                description: description.to_string(),
            },
        );
        while history.versions.len() > self.max_versions {
            history.versions.pop();
        }
        self.store(&history)?;
        Ok(version)
    }

    fn find(&self, history: &VersionHistory, version: u32) -> Result<VersionEntry> {
        history
            .versions
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| PromptForgeError::Resolution {
                kind: "version".to_string(),
                id: format!("{} v{}", self.resource_id, version),
            })
    }

    /// Roll back to `target_version`.
    ///
    /// The current state is saved as a new version first, then the target
    /// snapshot is returned for the caller to apply.
    pub fn rollback(&self, target_version: u32, current_state: Value) -> Result<Value> {
        let history = self.load();
        let target = self.find(&history, target_version)?;
        self.save_version(
            current_state,
            &format!("state before rollback to v{}", target_version),
        )?;
        Ok(target.snapshot)
    }

    /// Return the raw snapshots for two versions; diff rendering is a
    /// formatter concern.
    pub fn compare(&self, from: u32, to: u32) -> Result<(VersionEntry, VersionEntry)> {
        let history = self.load();
        Ok((self.find(&history, from)?, self.find(&history, to)?))
    }

    /// Newest-first summaries.
    pub fn format_history(&self, limit: usize) -> String {
        let history = self.load();
        if history.versions.is_empty() {
            return format!("No versions recorded for '{}'.", self.resource_id);
        }
        let mut out = format!(
            "History for {} '{}' (current v{}):\n",
            history.resource_type, history.resource_id, history.current_version
        );
        for entry in history.versions.iter().take(limit) {
            out.push_str(&format!(
                "- v{} [{}] {}\n",
                entry.version,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                if entry.description.is_empty() {
                    "(no description)"
                } else {
                    &entry.description
                }
            ));
        }
        out
    }

    pub fn current_version(&self) -> u32 {
        self.load().current_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir, max: usize) -> VersionStore {
        let resource = dir.path().join("demo.toml");
        VersionStore::new(&resource, "prompt", "demo", max)
    }

    #[test]
    fn versions_increase_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);
        assert_eq!(store.save_version(json!({"v": 1}), "first").unwrap(), 1);
        assert_eq!(store.save_version(json!({"v": 2}), "second").unwrap(), 2);
        assert_eq!(store.current_version(), 2);
    }

    #[test]
    fn fifo_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 2);
        for i in 1..=4 {
            store.save_version(json!({ "v": i }), "").unwrap();
        }
        // Version numbers keep increasing even though old entries are gone
        assert_eq!(store.current_version(), 4);
        assert!(store.compare(1, 2).is_err());
        assert!(store.compare(3, 4).is_ok());
    }

    #[test]
    fn rollback_saves_current_state_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);
        store.save_version(json!({"text": "original"}), "v1").unwrap();
        store.save_version(json!({"text": "edited"}), "v2").unwrap();

        let restored = store
            .rollback(1, json!({"text": "live state"}))
            .unwrap();
        assert_eq!(restored, json!({"text": "original"}));
        // Rollback itself created v3 holding the live state
        assert_eq!(store.current_version(), 3);

        // Rolling back to the pre-rollback version restores the original live state
        let undone = store.rollback(3, restored).unwrap();
        assert_eq!(undone, json!({"text": "live state"}));
    }

    #[test]
    fn compare_returns_both_snapshots_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);
        store.save_version(json!({"a": 1}), "").unwrap();
        store.save_version(json!({"a": 2}), "").unwrap();
        let (from, to) = store.compare(1, 2).unwrap();
        assert_eq!(from.snapshot, json!({"a": 1}));
        assert_eq!(to.snapshot, json!({"a": 2}));
    }
}

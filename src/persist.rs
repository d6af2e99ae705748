//! File-backed state for the `runtime-state/` directory.
//!
//! Every store here follows the same discipline: mutations go through a
//! single writer, each mutation is written through to disk with an atomic
//! write (temp file, fsync, rename), and loaders are best-effort so a
//! missing or corrupt file never prevents startup.

use crate::error::{PromptForgeError, Result};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// Current schema version stamped into every persisted JSON file.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Save a JSON value atomically (write to .tmp, fsync, then rename).
///
/// A crash mid-save leaves the previous file intact.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        let file = writer
            .into_inner()
            .map_err(|e| PromptForgeError::Persistence {
                message: format!("flush failed for {}: {}", tmp_path.display(), e),
            })?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Load a JSON file best-effort.
///
/// Returns `None` when the file is missing; corrupt files are logged and
/// treated as missing so the caller starts from a clean default.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open state file");
            return None;
        }
    };
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "corrupt state file, starting from defaults"
            );
            None
        }
    }
}

/// Persisted framework selection: `runtime-state/framework-state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkState {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub framework_system_enabled: bool,
    #[serde(default)]
    pub active_framework: Option<String>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

fn default_true() -> bool {
    true
}

impl Default for FrameworkState {
    fn default() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            framework_system_enabled: true,
            active_framework: None,
        }
    }
}

/// Persisted gate-system flag: `runtime-state/gate-system-state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSystemState {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for GateSystemState {
    fn default() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            enabled: true,
        }
    }
}

/// Single-writer, write-through store for a small piece of process-wide state.
pub struct StateStore<T> {
    path: PathBuf,
    inner: Mutex<T>,
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    /// Load from disk (or defaults) and bind the store to `path`.
    pub fn load(path: PathBuf) -> Self {
        let state = read_json_opt(&path).unwrap_or_default();
        Self {
            path,
            inner: Mutex::new(state),
        }
    }

    /// Snapshot the current value.
    pub async fn get(&self) -> T {
        self.inner.lock().await.clone()
    }

    /// Mutate under the writer lock and persist before releasing it, so the
    /// on-disk order matches the logical mutation order.
    pub async fn update<F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let mut guard = self.inner.lock().await;
        mutate(&mut guard);
        let snapshot = guard.clone();
        if let Err(e) = write_json_atomic(&self.path, &snapshot) {
            warn!(path = %self.path.display(), error = %e, "state write failed");
            return Err(e);
        }
        Ok(snapshot)
    }

    /// Flush the current value to disk (used at shutdown).
    pub async fn flush(&self) -> Result<()> {
        let guard = self.inner.lock().await;
        write_json_atomic(&self.path, &*guard)
    }
}

/// One remembered invocation for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentRecord {
    pub prompt_id: String,
    pub args: serde_json::Map<String, serde_json::Value>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ArgumentHistoryFile {
    #[serde(default = "default_schema_version")]
    version: u32,
    #[serde(default)]
    sessions: Vec<(String, Vec<ArgumentRecord>)>,
}

/// Bounded per-session argument history: `runtime-state/argument-history.json`.
///
/// Lets a resumed chain step fall back to the arguments a previous request
/// supplied. LRU-bounded on sessions, list-bounded per session.
pub struct ArgumentHistory {
    path: PathBuf,
    per_session_limit: usize,
    inner: Mutex<LruCache<String, Vec<ArgumentRecord>>>,
}

impl ArgumentHistory {
    const MAX_SESSIONS: usize = 256;

    pub fn load(path: PathBuf, per_session_limit: usize) -> Self {
        let cap = NonZeroUsize::new(Self::MAX_SESSIONS).unwrap_or(NonZeroUsize::MIN);
        let mut cache = LruCache::new(cap);
        if let Some(file) = read_json_opt::<ArgumentHistoryFile>(&path) {
            for (session, records) in file.sessions {
                cache.put(session, records);
            }
        }
        Self {
            path,
            per_session_limit: per_session_limit.max(1),
            inner: Mutex::new(cache),
        }
    }

    /// Record the arguments used for a prompt under a session id.
    pub async fn record(
        &self,
        session_id: &str,
        prompt_id: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let records = match guard.get_mut(session_id) {
            Some(r) => r,
            None => {
                guard.put(session_id.to_string(), Vec::new());
                guard
                    .get_mut(session_id)
                    .ok_or_else(|| PromptForgeError::Internal {
                        message: "argument history entry vanished after insert".into(),
                    })?
            }
        };
        records.push(ArgumentRecord {
            prompt_id: prompt_id.to_string(),
            args: args.clone(),
            recorded_at: chrono::Utc::now(),
        });
        let limit = self.per_session_limit;
        if records.len() > limit {
            let excess = records.len() - limit;
            records.drain(..excess);
        }

        let snapshot = ArgumentHistoryFile {
            version: STATE_SCHEMA_VERSION,
            sessions: guard
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        drop(guard);
        write_json_atomic(&self.path, &snapshot)
    }

    /// Most recent arguments recorded for a session, if any.
    pub async fn last_args(
        &self,
        session_id: &str,
    ) -> Option<serde_json::Map<String, serde_json::Value>> {
        let mut guard = self.inner.lock().await;
        guard
            .get(session_id)
            .and_then(|records| records.last())
            .map(|r| r.args.clone())
    }

    pub async fn flush(&self) -> Result<()> {
        let guard = self.inner.lock().await;
        let snapshot = ArgumentHistoryFile {
            version: STATE_SCHEMA_VERSION,
            sessions: guard
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        write_json_atomic(&self.path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framework-state.json");
        let state = FrameworkState {
            version: STATE_SCHEMA_VERSION,
            framework_system_enabled: false,
            active_framework: Some("cageerf".to_string()),
        };
        write_json_atomic(&path, &state).unwrap();
        let loaded: FrameworkState = read_json_opt(&path).unwrap();
        assert!(!loaded.framework_system_enabled);
        assert_eq!(loaded.active_framework.as_deref(), Some("cageerf"));
    }

    #[test]
    fn corrupt_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate-system-state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(read_json_opt::<GateSystemState>(&path).is_none());
    }

    #[test]
    fn older_schema_files_get_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framework-state.json");
        std::fs::write(&path, r#"{"active_framework":"react"}"#).unwrap();
        let loaded: FrameworkState = read_json_opt(&path).unwrap();
        assert!(loaded.framework_system_enabled);
        assert_eq!(loaded.active_framework.as_deref(), Some("react"));
    }

    #[tokio::test]
    async fn argument_history_is_bounded_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let history = ArgumentHistory::load(dir.path().join("argument-history.json"), 2);
        for i in 0..5 {
            let mut args = serde_json::Map::new();
            args.insert("n".to_string(), json!(i));
            history.record("chain-demo", "demo", &args).await.unwrap();
        }
        let last = history.last_args("chain-demo").await.unwrap();
        assert_eq!(last.get("n"), Some(&json!(4)));
    }
}

//! Chain session manager: persistent, resumable multi-step workflow state.
//!
//! All mutations go through one lock so no two operations against the same
//! session observe intermediate state, and the session set is written through
//! to `chain-sessions.json` before the lock is released, keeping the on-disk
//! order aligned with the logical mutation order.

use crate::error::{PromptForgeError, Result};
use crate::gates::PendingGateReview;
use crate::persist::{read_json_opt, write_json_atomic, STATE_SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one chain step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStateKind {
    #[default]
    Pending,
    Rendered,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct StepState {
    pub state: StepStateKind,
    #[serde(default)]
    pub is_placeholder: bool,
}

/// Accumulated per-chain data
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainContextData {
    #[serde(default)]
    pub step_results: BTreeMap<usize, String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// One persistent chain execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSession {
    pub session_id: String,
    pub chain_id: String,
    #[serde(default)]
    pub chain_run_id: Option<String>,
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(default)]
    pub step_states: BTreeMap<usize, StepState>,
    #[serde(default)]
    pub step_args: BTreeMap<usize, Map<String, Value>>,
    #[serde(default)]
    pub execution_order: Vec<usize>,
    #[serde(default)]
    pub chain_context: ChainContextData,
    #[serde(default)]
    pub pending_gate_review: Option<PendingGateReview>,
    /// Immutable snapshot of the parsed command + plan for deterministic resumption
    #[serde(default)]
    pub session_blueprint: Option<Value>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChainSession {
    /// A session paused on a gate review expires on the shorter review TTL.
    pub fn is_review_session(&self) -> bool {
        self.pending_gate_review.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.total_steps > 0
            && (1..=self.total_steps).all(|n| {
                self.step_states
                    .get(&n)
                    .is_some_and(|s| s.state == StepStateKind::Completed)
            })
    }
}

/// View of a session handed to template rendering.
#[derive(Debug, Clone, Serialize)]
pub struct ChainContext {
    pub chain_id: String,
    pub chain_run_id: Option<String>,
    pub total_steps: usize,
    pub current_step: usize,
    pub current_step_args: Map<String, Value>,
    pub step_results: BTreeMap<usize, String>,
    /// Alias for the current step's args, so `{{input}}` works at step one
    pub input: Map<String, Value>,
    pub chain_metadata: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct SessionsFile {
    #[serde(default = "default_schema_version")]
    version: u32,
    #[serde(default)]
    sessions: Vec<ChainSession>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

/// Manager for all chain sessions.
pub struct ChainSessionManager {
    path: PathBuf,
    chain_ttl: Duration,
    review_ttl: Duration,
    sessions: Mutex<HashMap<String, ChainSession>>,
    shutdown_token: CancellationToken,
}

impl ChainSessionManager {
    /// Load persisted sessions best-effort; a missing or corrupt file yields
    /// empty state with a warning.
    pub fn load(path: PathBuf, chain_ttl: Duration, review_ttl: Duration) -> Self {
        let mut map = HashMap::new();
        if let Some(file) = read_json_opt::<SessionsFile>(&path) {
            for session in file.sessions {
                map.insert(session.session_id.clone(), session);
            }
            info!(count = map.len(), "restored chain sessions");
        }
        Self {
            path,
            chain_ttl,
            review_ttl,
            sessions: Mutex::new(map),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Derive a session id for a chain prompt: `chain-{prompt_id}` for the
    /// first run, `chain-{prompt_id}#{n}` for subsequent concurrent runs.
    pub fn session_id_for(chain_id: &str, run: Option<u32>) -> String {
        match run {
            Some(n) if n > 0 => format!("chain-{}#{}", chain_id, n),
            _ => format!("chain-{}", chain_id),
        }
    }

    fn persist(map: &HashMap<String, ChainSession>, path: &PathBuf) {
        let file = SessionsFile {
            version: STATE_SCHEMA_VERSION,
            sessions: map.values().cloned().collect(),
        };
        if let Err(e) = write_json_atomic(path, &file) {
            // Reads stay non-blocking; a failed write is logged, never silent.
            warn!(error = %e, "failed to persist chain sessions");
        }
    }

    pub async fn create_session(
        &self,
        session_id: &str,
        chain_id: &str,
        total_steps: usize,
        metadata: Map<String, Value>,
        blueprint: Option<Value>,
        force_restart: bool,
    ) -> Result<ChainSession> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) && !force_restart {
            return Err(PromptForgeError::Session {
                message: format!(
                    "session '{}' already exists; resume with chain_id=\"{}\" or pass force_restart=true to start over",
                    session_id, session_id
                ),
            });
        }

        let now = Utc::now();
        let session = ChainSession {
            session_id: session_id.to_string(),
            chain_id: chain_id.to_string(),
            chain_run_id: Some(uuid::Uuid::new_v4().to_string()),
            current_step: if total_steps > 0 { 1 } else { 0 },
            total_steps,
            step_states: (1..=total_steps).map(|n| (n, StepState::default())).collect(),
            step_args: BTreeMap::new(),
            execution_order: Vec::new(),
            chain_context: ChainContextData::default(),
            pending_gate_review: None,
            session_blueprint: blueprint,
            last_activity: now,
            created_at: now,
            priority: None,
            metadata,
        };
        sessions.insert(session_id.to_string(), session.clone());
        Self::persist(&sessions, &self.path);
        debug!(session_id, chain_id, total_steps, "created chain session");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<ChainSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn has_active_session(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Run a closure against one session under the manager lock, then persist.
    async fn mutate<F, T>(&self, session_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ChainSession) -> Result<T>,
    {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PromptForgeError::Session {
                message: format!("unknown session '{}'", session_id),
            })?;
        let result = f(session)?;
        session.last_activity = Utc::now();
        Self::persist(&sessions, &self.path);
        Ok(result)
    }

    pub async fn set_step_state(
        &self,
        session_id: &str,
        step_number: usize,
        state: StepStateKind,
        is_placeholder: bool,
    ) -> Result<()> {
        self.mutate(session_id, |session| {
            session
                .step_states
                .insert(step_number, StepState { state, is_placeholder });
            if state == StepStateKind::Rendered
                && !session.execution_order.contains(&step_number)
            {
                session.execution_order.push(step_number);
            }
            Ok(())
        })
        .await
    }

    pub async fn set_step_args(
        &self,
        session_id: &str,
        step_number: usize,
        args: Map<String, Value>,
    ) -> Result<()> {
        self.mutate(session_id, |session| {
            session.step_args.insert(step_number, args);
            Ok(())
        })
        .await
    }

    /// Mark a step completed.
    ///
    /// With `preserve_placeholder` the step keeps its placeholder slot and
    /// `current_step` does not advance.
    pub async fn complete_step(
        &self,
        session_id: &str,
        step_number: usize,
        preserve_placeholder: bool,
    ) -> Result<()> {
        self.mutate(session_id, |session| {
            session.step_states.insert(
                step_number,
                StepState {
                    state: StepStateKind::Completed,
                    is_placeholder: preserve_placeholder,
                },
            );
            if !preserve_placeholder && session.current_step == step_number {
                session.current_step = (step_number + 1).min(session.total_steps);
            }
            Ok(())
        })
        .await
    }

    /// Store the textual result of a step.
    pub async fn record_step_result(
        &self,
        session_id: &str,
        step_number: usize,
        result: String,
    ) -> Result<()> {
        self.mutate(session_id, |session| {
            session.chain_context.step_results.insert(step_number, result);
            Ok(())
        })
        .await
    }

    /// Set a chain variable, visible to conditional expressions as `vars.<key>`.
    pub async fn set_variable(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<()> {
        self.mutate(session_id, |session| {
            session.chain_context.variables.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    /// Jump the cursor to an arbitrary step (conditional branching).
    pub async fn branch_to(&self, session_id: &str, step_number: usize) -> Result<()> {
        self.mutate(session_id, |session| {
            if step_number == 0 || step_number > session.total_steps {
                return Err(PromptForgeError::Session {
                    message: format!(
                        "cannot branch to step {} of {}",
                        step_number, session.total_steps
                    ),
                });
            }
            session.current_step = step_number;
            Ok(())
        })
        .await
    }

    pub async fn get_chain_context(&self, session_id: &str) -> Result<ChainContext> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| PromptForgeError::Session {
                message: format!("unknown session '{}'", session_id),
            })?;
        let current_args = session
            .step_args
            .get(&session.current_step)
            .cloned()
            .unwrap_or_default();
        Ok(ChainContext {
            chain_id: session.chain_id.clone(),
            chain_run_id: session.chain_run_id.clone(),
            total_steps: session.total_steps,
            current_step: session.current_step,
            current_step_args: current_args.clone(),
            step_results: session.chain_context.step_results.clone(),
            input: current_args,
            chain_metadata: session.metadata.clone(),
        })
    }

    pub async fn set_pending_gate_review(
        &self,
        session_id: &str,
        review: Option<PendingGateReview>,
    ) -> Result<()> {
        self.mutate(session_id, |session| {
            session.pending_gate_review = review;
            Ok(())
        })
        .await
    }

    pub async fn get_pending_gate_review(
        &self,
        session_id: &str,
    ) -> Result<Option<PendingGateReview>> {
        Ok(self
            .get_session(session_id)
            .await
            .ok_or_else(|| PromptForgeError::Session {
                message: format!("unknown session '{}'", session_id),
            })?
            .pending_gate_review)
    }

    /// Store an immutable blueprint snapshot. The value is deep-copied, so
    /// later mutation of the caller's copy cannot affect the stored one.
    pub async fn update_session_blueprint(
        &self,
        session_id: &str,
        blueprint: &Value,
    ) -> Result<()> {
        let snapshot = blueprint.clone();
        self.mutate(session_id, move |session| {
            session.session_blueprint = Some(snapshot);
            Ok(())
        })
        .await
    }

    pub async fn get_session_blueprint(&self, session_id: &str) -> Result<Option<Value>> {
        Ok(self
            .get_session(session_id)
            .await
            .ok_or_else(|| PromptForgeError::Session {
                message: format!("unknown session '{}'", session_id),
            })?
            .session_blueprint)
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(session_id).is_some();
        if removed {
            Self::persist(&sessions, &self.path);
        }
        Ok(removed)
    }

    /// Remove every session whose inactivity exceeds its class TTL.
    pub async fn cleanup_stale_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let now = Utc::now();
        let chain_ttl =
            chrono::Duration::from_std(self.chain_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let review_ttl = chrono::Duration::from_std(self.review_ttl)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let before = sessions.len();
        sessions.retain(|id, session| {
            let ttl = if session.is_review_session() {
                review_ttl
            } else {
                chain_ttl
            };
            let keep = now - session.last_activity <= ttl;
            if !keep {
                info!(session_id = %id, review = session.is_review_session(), "expiring stale session");
            }
            keep
        });
        let removed = before - sessions.len();
        if removed > 0 {
            Self::persist(&sessions, &self.path);
        }
        removed
    }

    /// Spawn the periodic cleanup sweep. Opportunistic: a tick that loses the
    /// lock race just waits for the next one.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.cleanup_stale_sessions().await;
                        if removed > 0 {
                            debug!(removed, "session cleanup sweep");
                        }
                    }
                }
            }
        });
    }

    /// Stop the cleanup scheduler and flush state.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let sessions = self.sessions.lock().await;
        Self::persist(&sessions, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> ChainSessionManager {
        ChainSessionManager::load(
            dir.path().join("chain-sessions.json"),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn duplicate_create_without_force_restart_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_session("chain-demo", "demo", 2, Map::new(), None, false)
            .await
            .unwrap();
        let err = mgr
            .create_session("chain-demo", "demo", 2, Map::new(), None, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("force_restart"));

        // force_restart replaces the session
        mgr.create_session("chain-demo", "demo", 2, Map::new(), None, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn complete_step_advances_unless_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_session("chain-demo", "demo", 3, Map::new(), None, false)
            .await
            .unwrap();

        mgr.complete_step("chain-demo", 1, true).await.unwrap();
        assert_eq!(mgr.get_session("chain-demo").await.unwrap().current_step, 1);

        mgr.complete_step("chain-demo", 1, false).await.unwrap();
        assert_eq!(mgr.get_session("chain-demo").await.unwrap().current_step, 2);
    }

    #[tokio::test]
    async fn current_step_never_exceeds_total() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_session("chain-demo", "demo", 1, Map::new(), None, false)
            .await
            .unwrap();
        mgr.complete_step("chain-demo", 1, false).await.unwrap();
        let session = mgr.get_session("chain-demo").await.unwrap();
        assert!(session.current_step <= session.total_steps);
        assert!(session.is_complete());
    }

    #[tokio::test]
    async fn sessions_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain-sessions.json");
        {
            let mgr = ChainSessionManager::load(
                path.clone(),
                Duration::from_secs(3600),
                Duration::from_secs(300),
            );
            mgr.create_session("chain-demo", "demo", 2, Map::new(), None, false)
                .await
                .unwrap();
            mgr.record_step_result("chain-demo", 1, "step one output".to_string())
                .await
                .unwrap();
            mgr.complete_step("chain-demo", 1, false).await.unwrap();
        }

        let reloaded = ChainSessionManager::load(
            path,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        let session = reloaded.get_session("chain-demo").await.unwrap();
        assert_eq!(session.current_step, 2);
        assert_eq!(
            session.chain_context.step_results.get(&1).map(String::as_str),
            Some("step one output")
        );
    }

    #[tokio::test]
    async fn chain_context_aliases_input_to_current_step_args() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_session("chain-demo", "demo", 2, Map::new(), None, false)
            .await
            .unwrap();
        let mut args = Map::new();
        args.insert("query".to_string(), serde_json::json!("find bugs"));
        mgr.set_step_args("chain-demo", 1, args.clone()).await.unwrap();
        mgr.record_step_result("chain-demo", 1, "done".to_string())
            .await
            .unwrap();

        let context = mgr.get_chain_context("chain-demo").await.unwrap();
        assert_eq!(context.chain_id, "demo");
        assert_eq!(context.current_step, 1);
        assert_eq!(context.input, args);
        assert_eq!(context.current_step_args, args);
        assert_eq!(context.step_results.get(&1).map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn blueprint_snapshot_is_independent_of_source() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_session("chain-demo", "demo", 1, Map::new(), None, false)
            .await
            .unwrap();

        let mut blueprint = serde_json::json!({"plan": ["a"]});
        mgr.update_session_blueprint("chain-demo", &blueprint)
            .await
            .unwrap();
        blueprint["plan"] = serde_json::json!(["mutated"]);

        let stored = mgr.get_session_blueprint("chain-demo").await.unwrap().unwrap();
        assert_eq!(stored, serde_json::json!({"plan": ["a"]}));
    }

    #[tokio::test]
    async fn review_sessions_expire_before_chain_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ChainSessionManager::load(
            dir.path().join("chain-sessions.json"),
            Duration::from_secs(3600),
            Duration::from_secs(0),
        );
        mgr.create_session("chain-normal", "normal", 1, Map::new(), None, false)
            .await
            .unwrap();
        mgr.create_session("chain-review", "review", 1, Map::new(), None, false)
            .await
            .unwrap();
        mgr.set_pending_gate_review(
            "chain-review",
            Some(crate::gates::PendingGateReview {
                gate_id: "g".into(),
                gate_name: "G".into(),
                step_number: 1,
                rendered_prompt: String::new(),
                attempt: 0,
                max_attempts: 3,
                preserve_context: false,
            }),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = mgr.cleanup_stale_sessions().await;
        assert_eq!(removed, 1);
        assert!(mgr.has_active_session("chain-normal").await);
        assert!(!mgr.has_active_session("chain-review").await);
    }
}

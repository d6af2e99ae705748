//! system_control tool handler: status, framework switching, gate toggles,
//! analytics, injection policy, and session administration.

use crate::error::{PromptForgeError, Result};
use crate::frameworks::Methodology;
use crate::injection::{InjectionFrequency, InjectionType};
use crate::server::PromptForgeServer;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::{json, Value};

/// Parameters for the `system_control` tool.
#[derive(Debug, serde::Deserialize)]
pub struct SystemControlParams {
    pub action: String,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub injection_type: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl PromptForgeServer {
    /// Handle the system_control tool call
    pub async fn handle_system_control(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult> {
        let args = request.arguments.ok_or_else(|| PromptForgeError::Mcp {
            message: "Missing parameters".into(),
        })?;
        let params: SystemControlParams =
            serde_json::from_value(Value::Object(args)).map_err(|e| {
                PromptForgeError::Serialization {
                    message: format!("Invalid parameters: {}", e),
                }
            })?;

        tracing::info!(
            action = %params.action,
            operation = params.operation.as_deref().unwrap_or(""),
            "system_control called"
        );

        match params.action.as_str() {
            "status" => self.status().await,
            "framework" => self.framework_control(&params).await,
            "gates" => self.gates_control(&params).await,
            "analytics" => self.analytics(),
            "config" => self.dump_config(),
            "maintenance" => self.maintenance(&params).await,
            "guide" => Ok(usage_guide()),
            "injection" => self.injection_control(&params).await,
            "session" => self.session_control(&params).await,
            other => Err(PromptForgeError::Validation {
                message: format!("unknown action '{}'", other),
            }),
        }
    }

    async fn status(&self) -> Result<CallToolResult> {
        let snapshot = self.services.registry.snapshot();
        let framework = self.services.framework_state.get().await;
        let gates = self.services.gate_state.get().await;
        Ok(CallToolResult::structured(json!({
            "uptime_secs": self.started.elapsed().as_secs(),
            "registry_generation": self.services.registry.generation(),
            "prompts": snapshot.prompts.len(),
            "gates": snapshot.gates.len(),
            "methodologies": snapshot.methodologies.len(),
            "styles": snapshot.styles.len(),
            "active_framework": framework.active_framework,
            "framework_system_enabled": framework.framework_system_enabled,
            "gate_system_enabled": gates.enabled,
            "active_sessions": self.services.sessions.session_count().await,
        })))
    }

    async fn framework_control(&self, params: &SystemControlParams) -> Result<CallToolResult> {
        let operation = params.operation.as_deref().unwrap_or("status");
        match operation {
            "status" => {
                let state = self.services.framework_state.get().await;
                Ok(CallToolResult::structured(json!({
                    "active_framework": state.active_framework,
                    "framework_system_enabled": state.framework_system_enabled,
                })))
            }
            "list" => {
                let snapshot = self.services.registry.snapshot();
                let mut entries: Vec<Value> = snapshot
                    .methodologies
                    .values()
                    .map(|m| {
                        json!({
                            "id": m.id,
                            "name": m.name,
                            "phases": m.phases.len(),
                            "enabled": m.enabled,
                        })
                    })
                    .collect();
                entries.sort_by_key(|v| v["id"].as_str().map(String::from));
                Ok(CallToolResult::structured(json!({ "methodologies": entries })))
            }
            "switch" => {
                let id = params
                    .framework
                    .as_deref()
                    .ok_or_else(|| PromptForgeError::Validation {
                        message: "'framework' is required for operation=switch".to_string(),
                    })?;
                let canonical = Methodology::canonical_id(id);
                let snapshot = self.services.registry.snapshot();
                let methodology = snapshot.methodology(&canonical).ok_or_else(|| {
                    PromptForgeError::Resolution {
                        kind: "methodology".to_string(),
                        id: id.to_string(),
                    }
                })?;
                if !methodology.enabled {
                    return Err(PromptForgeError::Validation {
                        message: format!("methodology '{}' is disabled", canonical),
                    });
                }
                let state = self
                    .services
                    .framework_state
                    .update(|state| state.active_framework = Some(canonical.clone()))
                    .await?;
                Ok(CallToolResult::structured(json!({
                    "active_framework": state.active_framework,
                })))
            }
            "clear" => {
                let state = self
                    .services
                    .framework_state
                    .update(|state| state.active_framework = None)
                    .await?;
                Ok(CallToolResult::structured(json!({
                    "active_framework": state.active_framework,
                })))
            }
            "enable" | "disable" => {
                let enable = operation == "enable";
                let state = self
                    .services
                    .framework_state
                    .update(|state| state.framework_system_enabled = enable)
                    .await?;
                Ok(CallToolResult::structured(json!({
                    "framework_system_enabled": state.framework_system_enabled,
                })))
            }
            other => Err(PromptForgeError::Validation {
                message: format!("unknown framework operation '{}'", other),
            }),
        }
    }

    async fn gates_control(&self, params: &SystemControlParams) -> Result<CallToolResult> {
        let operation = params.operation.as_deref().unwrap_or("status");
        match operation {
            "status" => {
                let state = self.services.gate_state.get().await;
                Ok(CallToolResult::structured(json!({ "enabled": state.enabled })))
            }
            "enable" | "disable" => {
                let enable = operation == "enable";
                let state = self
                    .services
                    .gate_state
                    .update(|state| state.enabled = enable)
                    .await?;
                Ok(CallToolResult::structured(json!({ "enabled": state.enabled })))
            }
            "list" => {
                let snapshot = self.services.registry.snapshot();
                let mut entries: Vec<Value> = snapshot
                    .gates
                    .values()
                    .map(|g| {
                        json!({
                            "id": g.id,
                            "name": g.name,
                            "type": g.gate_type,
                            "criteria": g.criteria.len(),
                        })
                    })
                    .collect();
                entries.sort_by_key(|v| v["id"].as_str().map(String::from));
                Ok(CallToolResult::structured(json!({ "gates": entries })))
            }
            other => Err(PromptForgeError::Validation {
                message: format!("unknown gates operation '{}'", other),
            }),
        }
    }

    fn analytics(&self) -> Result<CallToolResult> {
        let ring = self
            .services
            .analytics
            .lock()
            .map_err(|_| PromptForgeError::Internal {
                message: "analytics ring poisoned".to_string(),
            })?;

        let executions = ring.len();
        let total_ms: u64 = ring.iter().map(|r| r.duration_ms).sum();
        let warnings: usize = ring.iter().map(|r| r.warnings).sum();
        let errors: usize = ring.iter().map(|r| r.errors).sum();
        let mut source_counts: std::collections::BTreeMap<&str, usize> = Default::default();
        for record in ring.iter() {
            for (source, count) in &record.gate_sources {
                *source_counts.entry(source).or_insert(0) += count;
            }
        }
        let recent: Vec<Value> = ring
            .iter()
            .rev()
            .take(10)
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect();

        Ok(CallToolResult::structured(json!({
            "executions": executions,
            "avg_duration_ms": if executions > 0 { total_ms / executions as u64 } else { 0 },
            "warnings": warnings,
            "errors": errors,
            "gate_source_counts": source_counts,
            "recent": recent,
        })))
    }

    fn dump_config(&self) -> Result<CallToolResult> {
        let config = &self.services.config;
        Ok(CallToolResult::structured(json!({
            "system": config.system,
            "sessions": config.sessions,
            "gates": config.gates,
            "resolver": config.resolver,
        })))
    }

    async fn maintenance(&self, params: &SystemControlParams) -> Result<CallToolResult> {
        let operation = params.operation.as_deref().unwrap_or("cleanup_sessions");
        match operation {
            "cleanup_sessions" => {
                let removed = self.services.sessions.cleanup_stale_sessions().await;
                Ok(CallToolResult::structured(json!({ "removed_sessions": removed })))
            }
            "reload" => {
                let summary = self.services.registry.reload();
                Ok(CallToolResult::structured(json!({
                    "generation": summary.generation,
                    "errors": summary.errors,
                })))
            }
            other => Err(PromptForgeError::Validation {
                message: format!("unknown maintenance operation '{}'", other),
            }),
        }
    }

    async fn injection_control(&self, params: &SystemControlParams) -> Result<CallToolResult> {
        let operation = params.operation.as_deref().unwrap_or("status");
        match operation {
            "status" => {
                let policy = self.services.injection.read().await.clone();
                Ok(CallToolResult::structured(serde_json::to_value(policy)?))
            }
            "set" => {
                let kind = match params.injection_type.as_deref() {
                    Some("system-prompt") => InjectionType::SystemPrompt,
                    Some("gate-guidance") => InjectionType::GateGuidance,
                    Some("style-guidance") => InjectionType::StyleGuidance,
                    other => {
                        return Err(PromptForgeError::Validation {
                            message: format!(
                                "injection_type must be system-prompt|gate-guidance|style-guidance, got '{}'",
                                other.unwrap_or("")
                            ),
                        });
                    }
                };
                let raw = params
                    .frequency
                    .as_deref()
                    .ok_or_else(|| PromptForgeError::Validation {
                        message: "'frequency' is required for operation=set".to_string(),
                    })?;
                let frequency =
                    InjectionFrequency::parse(raw).ok_or_else(|| PromptForgeError::Validation {
                        message: format!(
                            "frequency must be always|first-only|never|every{{n}}, got '{}'",
                            raw
                        ),
                    })?;
                let mut policy = self.services.injection.write().await;
                policy.set_frequency(kind, frequency);
                Ok(CallToolResult::structured(serde_json::to_value(policy.clone())?))
            }
            other => Err(PromptForgeError::Validation {
                message: format!("unknown injection operation '{}'", other),
            }),
        }
    }

    async fn session_control(&self, params: &SystemControlParams) -> Result<CallToolResult> {
        let operation = params.operation.as_deref().unwrap_or("list");
        match operation {
            "list" => {
                let count = self.services.sessions.session_count().await;
                Ok(CallToolResult::structured(json!({ "active_sessions": count })))
            }
            "inspect" => {
                let session_id = params.session_id.as_deref().ok_or_else(|| {
                    PromptForgeError::Validation {
                        message: "'session_id' is required for operation=inspect".to_string(),
                    }
                })?;
                let session = self
                    .services
                    .sessions
                    .get_session(session_id)
                    .await
                    .ok_or_else(|| PromptForgeError::Session {
                        message: format!("unknown session '{}'", session_id),
                    })?;
                Ok(CallToolResult::structured(serde_json::to_value(&session)?))
            }
            "clear" => {
                let session_id = params.session_id.as_deref().ok_or_else(|| {
                    PromptForgeError::Validation {
                        message: "'session_id' is required for operation=clear".to_string(),
                    }
                })?;
                let removed = self.services.sessions.clear_session(session_id).await?;
                Ok(CallToolResult::structured(json!({
                    "session_id": session_id,
                    "removed": removed,
                })))
            }
            other => Err(PromptForgeError::Validation {
                message: format!("unknown session operation '{}'", other),
            }),
        }
    }
}

fn usage_guide() -> CallToolResult {
    CallToolResult::structured(json!({
        "text": "\
system_control actions:\n\
- status: registry generation, resource counts, active framework, gate flag, session count.\n\
- framework (operation: status|list|switch|clear|enable|disable): manage the active methodology.\n\
- gates (operation: status|list|enable|disable): toggle the gate system.\n\
- analytics: recent execution summaries and gate source counts.\n\
- config: effective configuration.\n\
- maintenance (operation: cleanup_sessions|reload): housekeeping.\n\
- injection (operation: status|set): per-type injection frequency (always|first-only|never|every{n}).\n\
- session (operation: list|inspect|clear): chain session administration."
    }))
}

//! resource_manager tool handler: CRUD, versioning, and analysis for
//! prompts, gates, and methodologies.

use crate::error::{PromptForgeError, Result};
use crate::frameworks::Methodology;
use crate::gates::Gate;
use crate::prompts::Prompt;
use crate::server::PromptForgeServer;
use crate::versioning::VersionStore;
use once_cell::sync::Lazy;
use regex::Regex;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Parameters for the `resource_manager` tool.
#[derive(Debug, serde::Deserialize)]
pub struct ResourceManagerParams {
    pub action: String,
    pub resource_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub definition: Option<Value>,
    #[serde(default)]
    pub confirm: Option<bool>,
    #[serde(default)]
    pub from_version: Option<u32>,
    #[serde(default)]
    pub to_version: Option<u32>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip_version: Option<bool>,
    #[serde(default)]
    pub persist: Option<bool>,
}

static ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_\-]+(?:/[a-z0-9_\-]+)*$").expect("id regex is valid"));

impl PromptForgeServer {
    /// Handle the resource_manager tool call
    pub async fn handle_resource_manager(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult> {
        let args = request.arguments.ok_or_else(|| PromptForgeError::Mcp {
            message: "Missing parameters".into(),
        })?;
        let params: ResourceManagerParams =
            serde_json::from_value(Value::Object(args)).map_err(|e| {
                PromptForgeError::Serialization {
                    message: format!("Invalid parameters: {}", e),
                }
            })?;

        tracing::info!(
            action = %params.action,
            resource_type = %params.resource_type,
            id = params.id.as_deref().unwrap_or(""),
            "resource_manager called"
        );

        validate_pair(&params.action, &params.resource_type)?;

        match params.action.as_str() {
            "reload" => self.reload(),
            "list" => self.list(&params.resource_type),
            "inspect" => self.inspect(&params.resource_type, &required_id(&params)?),
            "create" => self.create_or_update(&params, true).await,
            "update" => self.create_or_update(&params, false).await,
            "delete" => self.delete(&params).await,
            "switch" => self.switch_methodology(&required_id(&params)?).await,
            "analyze_type" => self.analyze_type(&required_id(&params)?),
            "analyze_gates" => self.analyze_gates(&required_id(&params)?),
            "guide" => Ok(authoring_guide()),
            "history" => self.history(&params),
            "rollback" => self.rollback(&params).await,
            "compare" => self.compare(&params),
            other => Err(PromptForgeError::Validation {
                message: format!("unknown action '{}'", other),
            }),
        }
    }

    fn reload(&self) -> Result<CallToolResult> {
        let summary = self.services.registry.reload();
        Ok(CallToolResult::structured(json!({
            "generation": summary.generation,
            "prompts": summary.prompts,
            "gates": summary.gates,
            "methodologies": summary.methodologies,
            "styles": summary.styles,
            "errors": summary.errors,
        })))
    }

    fn list(&self, resource_type: &str) -> Result<CallToolResult> {
        let snapshot = self.services.registry.snapshot();
        let text = match resource_type {
            "prompt" => {
                // Grouped by category, chains flagged
                let mut by_category: std::collections::BTreeMap<String, Vec<String>> =
                    Default::default();
                for prompt in snapshot.prompts.values() {
                    let label = if prompt.is_chain() {
                        format!(
                            ">>{} — {} (chain, {} steps)",
                            prompt.id,
                            prompt.name,
                            prompt.chain_steps.len()
                        )
                    } else {
                        format!(">>{} — {}", prompt.id, prompt.name)
                    };
                    by_category.entry(prompt.category.clone()).or_default().push(label);
                }
                let mut out = format!("{} prompts loaded:\n", snapshot.prompts.len());
                for (category, mut entries) in by_category {
                    entries.sort();
                    out.push_str(&format!("\n[{}]\n", category));
                    for entry in entries {
                        out.push_str(&format!("  {}\n", entry));
                    }
                }
                out
            }
            "gate" => {
                let mut entries: Vec<String> = snapshot
                    .gates
                    .values()
                    .map(|g| format!("{} — {} ({:?})", g.id, g.name, g.gate_type))
                    .collect();
                entries.sort();
                format!("{} gates loaded:\n{}", entries.len(), entries.join("\n"))
            }
            "methodology" => {
                let mut entries: Vec<String> = snapshot
                    .methodologies
                    .values()
                    .map(|m| {
                        format!(
                            "{} — {} ({} phases{})",
                            m.id,
                            m.name,
                            m.phases.len(),
                            if m.enabled { "" } else { ", disabled" }
                        )
                    })
                    .collect();
                entries.sort();
                format!(
                    "{} methodologies loaded:\n{}",
                    entries.len(),
                    entries.join("\n")
                )
            }
            other => {
                return Err(PromptForgeError::Validation {
                    message: format!("unknown resource_type '{}'", other),
                });
            }
        };
        Ok(CallToolResult::structured(json!({ "text": text })))
    }

    fn inspect(&self, resource_type: &str, id: &str) -> Result<CallToolResult> {
        let snapshot = self.services.registry.snapshot();
        let value = match resource_type {
            "prompt" => snapshot
                .prompt(id)
                .map(|p| serde_json::to_value(p))
                .transpose()?,
            "gate" => snapshot.gate(id).map(serde_json::to_value).transpose()?,
            "methodology" => snapshot
                .methodology(id)
                .map(serde_json::to_value)
                .transpose()?,
            other => {
                return Err(PromptForgeError::Validation {
                    message: format!("unknown resource_type '{}'", other),
                });
            }
        };
        let value = value.ok_or_else(|| PromptForgeError::Resolution {
            kind: resource_type.to_string(),
            id: id.to_string(),
        })?;
        Ok(CallToolResult::structured(value))
    }

    async fn create_or_update(
        &self,
        params: &ResourceManagerParams,
        creating: bool,
    ) -> Result<CallToolResult> {
        let id = required_id(params)?;
        let definition = params
            .definition
            .clone()
            .ok_or_else(|| PromptForgeError::Validation {
                message: "'definition' is required for create/update".to_string(),
            })?;

        let snapshot = self.services.registry.snapshot();
        let exists = match params.resource_type.as_str() {
            "prompt" => snapshot.prompt(&id).is_some(),
            "gate" => snapshot.gate(&id).is_some(),
            "methodology" => snapshot.methodology(&id).is_some(),
            _ => false,
        };
        if creating && exists {
            return Err(PromptForgeError::Validation {
                message: format!(
                    "{} '{}' already exists; use action=update",
                    params.resource_type, id
                ),
            });
        }
        if !creating && !exists {
            return Err(PromptForgeError::Resolution {
                kind: params.resource_type.clone(),
                id,
            });
        }

        let path = self.resource_file(&params.resource_type, &id)?;
        let content = render_resource(&params.resource_type, &id, definition.clone())?;

        // Record the version before touching the file
        if !params.skip_version.unwrap_or(false) {
            let store = VersionStore::new(
                &path,
                &params.resource_type,
                &id,
                self.services.config.system.max_versions,
            );
            let description = if creating { "created" } else { "updated" };
            store.save_version(definition, description)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        let summary = self.services.registry.reload();

        Ok(CallToolResult::structured(json!({
            "id": id,
            "resource_type": params.resource_type,
            "action": if creating { "created" } else { "updated" },
            "path": path.display().to_string(),
            "generation": summary.generation,
            "errors": summary.errors,
        })))
    }

    async fn delete(&self, params: &ResourceManagerParams) -> Result<CallToolResult> {
        let id = required_id(params)?;
        if !params.confirm.unwrap_or(false) {
            return Err(PromptForgeError::Validation {
                message: format!(
                    "deleting {} '{}' is destructive; repeat with confirm=true",
                    params.resource_type, id
                ),
            });
        }

        let path = self.resource_file(&params.resource_type, &id)?;
        if params.resource_type == "prompt" {
            if path.is_file() {
                std::fs::remove_file(&path)?;
            } else {
                return Err(PromptForgeError::Resolution {
                    kind: "prompt".to_string(),
                    id,
                });
            }
        } else {
            // Gates and methodologies occupy a directory
            let dir = path.parent().ok_or_else(|| PromptForgeError::Internal {
                message: format!("no parent directory for {}", path.display()),
            })?;
            if dir.is_dir() {
                std::fs::remove_dir_all(dir)?;
            } else {
                return Err(PromptForgeError::Resolution {
                    kind: params.resource_type.clone(),
                    id,
                });
            }
        }
        let summary = self.services.registry.reload();

        Ok(CallToolResult::structured(json!({
            "id": id,
            "resource_type": params.resource_type,
            "action": "deleted",
            "generation": summary.generation,
        })))
    }

    async fn switch_methodology(&self, id: &str) -> Result<CallToolResult> {
        let canonical = Methodology::canonical_id(id);
        let snapshot = self.services.registry.snapshot();
        let methodology =
            snapshot
                .methodology(&canonical)
                .ok_or_else(|| PromptForgeError::Resolution {
                    kind: "methodology".to_string(),
                    id: id.to_string(),
                })?;
        if !methodology.enabled {
            return Err(PromptForgeError::Validation {
                message: format!("methodology '{}' is disabled", canonical),
            });
        }

        let state = self
            .services
            .framework_state
            .update(|state| {
                state.active_framework = Some(canonical.clone());
            })
            .await?;

        Ok(CallToolResult::structured(json!({
            "active_framework": state.active_framework,
            "framework_system_enabled": state.framework_system_enabled,
        })))
    }

    fn analyze_type(&self, id: &str) -> Result<CallToolResult> {
        let snapshot = self.services.registry.snapshot();
        let prompt = snapshot.prompt(id).ok_or_else(|| PromptForgeError::Resolution {
            kind: "prompt".to_string(),
            id: id.to_string(),
        })?;

        let classification = if prompt.is_chain() {
            "chain"
        } else if !prompt.arguments.is_empty() || prompt.template.contains("{{") {
            "template"
        } else {
            "prompt"
        };

        Ok(CallToolResult::structured(json!({
            "id": prompt.id,
            "classification": classification,
            "category": prompt.category,
            "arguments": prompt.arguments.iter().map(|a| &a.name).collect::<Vec<_>>(),
            "chain_steps": prompt.chain_steps.len(),
            "script_tools": prompt.script_tools.iter().map(|t| &t.id).collect::<Vec<_>>(),
        })))
    }

    fn analyze_gates(&self, id: &str) -> Result<CallToolResult> {
        let snapshot = self.services.registry.snapshot();
        let prompt = snapshot.prompt(id).ok_or_else(|| PromptForgeError::Resolution {
            kind: "prompt".to_string(),
            id: id.to_string(),
        })?;

        let configured: Vec<&String> = prompt.gate_ids.iter().collect();
        let auto: Vec<&str> = snapshot
            .gates
            .values()
            .filter(|g| {
                g.activation.as_ref().is_some_and(|a| {
                    !a.explicit_request
                        && a.framework_context.is_empty()
                        && a.prompt_categories.iter().any(|c| *c == prompt.category)
                })
            })
            .map(|g| g.id.as_str())
            .collect();
        let chain_level: Vec<&String> = prompt
            .chain_steps
            .iter()
            .flat_map(|s| s.inline_gate_ids.iter())
            .collect();

        Ok(CallToolResult::structured(json!({
            "id": prompt.id,
            "prompt_config_gates": configured,
            "registry_auto_gates": auto,
            "chain_level_gates": chain_level,
        })))
    }

    fn history(&self, params: &ResourceManagerParams) -> Result<CallToolResult> {
        let id = required_id(params)?;
        let store = self.version_store(params, &id)?;
        let text = store.format_history(params.limit.unwrap_or(10));
        Ok(CallToolResult::structured(json!({ "text": text })))
    }

    async fn rollback(&self, params: &ResourceManagerParams) -> Result<CallToolResult> {
        let id = required_id(params)?;
        let target = params.version.ok_or_else(|| PromptForgeError::Validation {
            message: "'version' is required for rollback".to_string(),
        })?;
        let path = self.resource_file(&params.resource_type, &id)?;
        let store = self.version_store(params, &id)?;

        // Current on-disk state becomes a new version before restoring
        let current: Value = {
            let raw = std::fs::read_to_string(&path)?;
            let parsed: toml::Value =
                toml::from_str(&raw).map_err(|e| PromptForgeError::Serialization {
                    message: format!("current resource unreadable: {}", e),
                })?;
            serde_json::to_value(parsed)?
        };
        let snapshot = store.rollback(target, current)?;

        if params.persist.unwrap_or(true) {
            let content = render_resource(&params.resource_type, &id, snapshot.clone())?;
            std::fs::write(&path, content)?;
            self.services.registry.reload();
        }

        Ok(CallToolResult::structured(json!({
            "id": id,
            "restored_version": target,
            "current_version": store.current_version(),
            "persisted": params.persist.unwrap_or(true),
            "snapshot": snapshot,
        })))
    }

    fn compare(&self, params: &ResourceManagerParams) -> Result<CallToolResult> {
        let id = required_id(params)?;
        let from = params.from_version.ok_or_else(|| PromptForgeError::Validation {
            message: "'from_version' is required for compare".to_string(),
        })?;
        let to = params.to_version.ok_or_else(|| PromptForgeError::Validation {
            message: "'to_version' is required for compare".to_string(),
        })?;
        let store = self.version_store(params, &id)?;
        let (from_entry, to_entry) = store.compare(from, to)?;
        Ok(CallToolResult::structured(json!({
            "id": id,
            "from": { "version": from_entry.version, "snapshot": from_entry.snapshot },
            "to": { "version": to_entry.version, "snapshot": to_entry.snapshot },
        })))
    }

    fn version_store(&self, params: &ResourceManagerParams, id: &str) -> Result<VersionStore> {
        let path = self.resource_file(&params.resource_type, id)?;
        Ok(VersionStore::new(
            &path,
            &params.resource_type,
            id,
            self.services.config.system.max_versions,
        ))
    }

    /// Canonical file location for a resource id.
    fn resource_file(&self, resource_type: &str, id: &str) -> Result<PathBuf> {
        if !ID_RE.is_match(id) {
            return Err(PromptForgeError::Validation {
                message: format!(
                    "invalid id '{}': lowercase slugs with optional '/' nesting only",
                    id
                ),
            });
        }
        let base = self.services.registry.base_dir();
        let path = match resource_type {
            "prompt" => base.join("prompts").join(format!("{}.toml", id)),
            "gate" => base.join("gates").join(id).join("gate.toml"),
            "methodology" => base
                .join("methodologies")
                .join(id)
                .join("methodology.toml"),
            other => {
                return Err(PromptForgeError::Validation {
                    message: format!("unknown resource_type '{}'", other),
                });
            }
        };
        Ok(path)
    }
}

fn required_id(params: &ResourceManagerParams) -> Result<String> {
    params.id.clone().ok_or_else(|| PromptForgeError::Validation {
        message: format!("'id' is required for action '{}'", params.action),
    })
}

/// Action/resource-type pairs that only make sense together.
fn validate_pair(action: &str, resource_type: &str) -> Result<()> {
    if !matches!(resource_type, "prompt" | "gate" | "methodology") {
        return Err(PromptForgeError::Validation {
            message: format!("unknown resource_type '{}'", resource_type),
        });
    }
    match action {
        "switch" if resource_type != "methodology" => Err(PromptForgeError::Validation {
            message: "action 'switch' requires resource_type=methodology".to_string(),
        }),
        "analyze_type" | "analyze_gates" | "guide" if resource_type != "prompt" => {
            Err(PromptForgeError::Validation {
                message: format!("action '{}' requires resource_type=prompt", action),
            })
        }
        _ => Ok(()),
    }
}

/// Validate a definition against its typed model and render canonical TOML.
fn render_resource(resource_type: &str, id: &str, definition: Value) -> Result<String> {
    match resource_type {
        "prompt" => {
            let mut prompt: Prompt =
                serde_json::from_value(definition).map_err(|e| PromptForgeError::Validation {
                    message: format!("invalid prompt definition: {}", e),
                })?;
            prompt.id = id.to_string();
            prompt.validate()?;
            toml::to_string_pretty(&prompt).map_err(|e| PromptForgeError::Serialization {
                message: e.to_string(),
            })
        }
        "gate" => {
            let mut gate: Gate =
                serde_json::from_value(definition).map_err(|e| PromptForgeError::Validation {
                    message: format!("invalid gate definition: {}", e),
                })?;
            gate.id = id.to_string();
            toml::to_string_pretty(&gate).map_err(|e| PromptForgeError::Serialization {
                message: e.to_string(),
            })
        }
        "methodology" => {
            let mut methodology: Methodology =
                serde_json::from_value(definition).map_err(|e| PromptForgeError::Validation {
                    message: format!("invalid methodology definition: {}", e),
                })?;
            methodology.id = Methodology::canonical_id(id);
            methodology.validate()?;
            toml::to_string_pretty(&methodology).map_err(|e| PromptForgeError::Serialization {
                message: e.to_string(),
            })
        }
        other => Err(PromptForgeError::Validation {
            message: format!("unknown resource_type '{}'", other),
        }),
    }
}

fn authoring_guide() -> CallToolResult {
    CallToolResult::structured(json!({
        "text": "\
Prompt authoring guide:\n\
- One TOML file per prompt under prompts/; directories with prompt.toml nest ids with '/'.\n\
- Required: name, template. Optional: description, category, system_message.\n\
- [[arguments]]: name, type (string|number|boolean|array|object), required, validation {min_length, max_length, pattern}.\n\
- [[chain_steps]]: step_number (1-based, sequential), prompt_id, args, inline_gate_ids, conditional_execution {type, expression, target_step}.\n\
- Conditional expressions see `steps.<id>.result`, `vars.*`, and helpers utils.exists/contains/length/to_number/to_string/matches.\n\
- Templates use {{ variable }} plus {{ref:prompt_id}} and {{script:tool_id[.field]}} pre-resolution.\n\
- Hidden ('.') and underscore ('_') prefixed files are ignored."
    }))
}

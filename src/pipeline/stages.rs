//! The ordered stage list of the execution pipeline.
//!
//! Stage order matters and mirrors the request lifecycle: normalize, inject,
//! parse, register gates, plan, run scripts, resolve the framework, manage
//! the session, render, review, and format. Any stage may be a no-op for a
//! given request.

use super::command::{self, CommandStep};
use super::{
    CurrentStep, EngineResponse, ExecutionContext, ExecutionPlan, ExecutionRecord, Services,
    Stage, Strategy,
};
use crate::condition::{self, ConditionContext};
use crate::error::{PromptForgeError, Result};
use crate::frameworks::{self, DecisionInputs};
use crate::gates::{
    self, apply_verdict, parse_verdict, GateAction, GateSource, GateType, PendingGateReview,
    ResolvedGate, ReviewOutcome,
};
use crate::injection::InjectionType;
use crate::prompts::{ChainStep, ConditionalType, Prompt};
use crate::resolver::Resolver;
use crate::scripts::{self, ScriptTool};
use crate::sessions::StepStateKind;
use crate::template;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Assemble the ordered pipeline. The final cleanup stage is invoked by the
/// runner itself so it also covers failures and short-circuits.
pub fn build_pipeline() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(RequestNormalization),
        Box::new(DependencyInjection),
        Box::new(ExecutionLifecycle),
        Box::new(CommandParsing),
        Box::new(InlineGateRegistration),
        Box::new(OperatorValidation),
        Box::new(ExecutionPlanning),
        Box::new(ScriptExecution),
        Box::new(ScriptAutoExecute),
        Box::new(JudgeSelection),
        Box::new(GateEnhancement),
        Box::new(FrameworkResolution),
        Box::new(SessionManagement),
        Box::new(InjectionControl),
        Box::new(PromptGuidance),
        Box::new(ResponseCapture),
        Box::new(StepExecution),
        Box::new(GateReview),
        Box::new(CallToAction),
        Box::new(ResponseFormatting),
    ]
}

// ---------------------------------------------------------------------------
// 1. Request normalization
// ---------------------------------------------------------------------------

struct RequestNormalization;

#[async_trait]
impl Stage for RequestNormalization {
    fn name(&self) -> &'static str {
        "request_normalization"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        // Deprecated provisioning parameters fold into the single `gates` list
        let legacy_ids = std::mem::take(&mut ctx.request.gate_ids);
        if !legacy_ids.is_empty() {
            ctx.diagnostics.warn(
                self.name(),
                "'gate_ids' is deprecated; use 'gates' with plain id strings",
            );
            for id in legacy_ids {
                ctx.request.gates.push(Value::String(id));
            }
        }
        let legacy_defs = std::mem::take(&mut ctx.request.temporary_gates);
        if !legacy_defs.is_empty() {
            ctx.diagnostics.warn(
                self.name(),
                "'temporary_gates' is deprecated; use 'gates' with definitions",
            );
            ctx.request.gates.extend(legacy_defs);
        }

        // Conflicting resume parameters are rejected up front
        if ctx.request.chain_id.is_some() && ctx.request.command.is_some() {
            return Err(PromptForgeError::Conflict {
                message: "chain_id and command cannot both be set; omit command when resuming"
                    .to_string(),
            });
        }
        if ctx.request.chain_id.is_some() && ctx.request.force_restart {
            return Err(PromptForgeError::Conflict {
                message: "force_restart=true conflicts with chain_id; start a fresh chain with a command instead"
                    .to_string(),
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Dependency injection
// ---------------------------------------------------------------------------

struct DependencyInjection;

#[async_trait]
impl Stage for DependencyInjection {
    fn name(&self) -> &'static str {
        "dependency_injection"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        // The snapshot taken here is held for the whole request; a hot
        // reload mid-flight does not change what this request sees.
        ctx.snapshot = Some(services.registry.snapshot());
        ctx.registry_generation = services.registry.generation();
        let framework_state = services.framework_state.get().await;
        ctx.gate_system_enabled = services.gate_state.get().await.enabled;
        ctx.framework_state = Some(framework_state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 3. Execution lifecycle
// ---------------------------------------------------------------------------

struct ExecutionLifecycle;

#[async_trait]
impl Stage for ExecutionLifecycle {
    fn name(&self) -> &'static str {
        "execution_lifecycle"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        ctx.execution_id = uuid::Uuid::new_v4().to_string();
        ctx.started = std::time::Instant::now();
        ctx.diagnostics.info(
            self.name(),
            format!(
                "execution {} started (registry generation {})",
                ctx.execution_id, ctx.registry_generation
            ),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 4. Command parsing
// ---------------------------------------------------------------------------

struct CommandParsing;

#[async_trait]
impl Stage for CommandParsing {
    fn name(&self) -> &'static str {
        "command_parsing"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        let Some(raw) = ctx.request.command.clone() else {
            if ctx.request.chain_id.is_none() {
                return Err(PromptForgeError::Validation {
                    message: "either 'command' or 'chain_id' is required".to_string(),
                });
            }
            ctx.resuming = true;
            return Ok(());
        };

        let parsed = command::parse(&raw)?;
        ctx.diagnostics.info(
            self.name(),
            format!(
                "parsed '{}' (confidence {:.2})",
                if parsed.prompt_id.is_empty() {
                    parsed.chain_uri.as_deref().unwrap_or("<resume>")
                } else {
                    &parsed.prompt_id
                },
                parsed.confidence
            ),
        );

        // A chain URI inside the command is an alternate resume spelling
        if let Some(uri) = &parsed.chain_uri {
            if ctx.request.force_restart {
                return Err(PromptForgeError::Conflict {
                    message: "force_restart=true conflicts with a chain resume URI".to_string(),
                });
            }
            ctx.request.chain_id = Some(uri.clone());
            ctx.resuming = true;
        }

        ctx.command = Some(parsed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 5. Inline gate registration
// ---------------------------------------------------------------------------

struct InlineGateRegistration;

#[async_trait]
impl Stage for InlineGateRegistration {
    fn name(&self) -> &'static str {
        "inline_gate_registration"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        if !ctx.gate_system_enabled {
            ctx.diagnostics
                .info(self.name(), "gate system disabled; skipping registration");
            return Ok(());
        }

        if let Some(cmd) = &ctx.command {
            for criteria in cmd.inline_gate_criteria.clone() {
                let gate = gates::temporary_gate_from_criteria(&criteria);
                ctx.gates.add(gate.id.clone(), GateSource::InlineOperator);
                ctx.explicit_gate_ids.push(gate.id.clone());
                ctx.temporary_gates.insert(gate.id.clone(), gate);
            }
            for id in cmd.inline_gate_ids.clone() {
                ctx.gates.add(id.clone(), GateSource::InlineOperator);
                ctx.explicit_gate_ids.push(id);
            }
        }

        for provision in ctx.request.gates.clone() {
            match provision {
                Value::String(id) => {
                    ctx.gates.add(id.clone(), GateSource::ClientSelection);
                    ctx.explicit_gate_ids.push(id);
                }
                Value::Object(obj) => {
                    let gate = gate_from_provision(obj)?;
                    ctx.gates.add(gate.id.clone(), GateSource::TemporaryRequest);
                    ctx.explicit_gate_ids.push(gate.id.clone());
                    ctx.temporary_gates.insert(gate.id.clone(), gate);
                }
                other => {
                    return Err(PromptForgeError::Validation {
                        message: format!(
                            "each 'gates' entry must be an id string or a gate object, got {}",
                            other
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Build a gate from a `gates` array element: either a quick gate
/// (`{name, description}`) or a full definition.
fn gate_from_provision(obj: Map<String, Value>) -> Result<gates::Gate> {
    let is_quick = obj.contains_key("name")
        && obj.contains_key("description")
        && !obj.contains_key("criteria")
        && !obj.contains_key("id");
    if is_quick {
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut gate = gates::temporary_gate_from_criteria(&description);
        gate.name = name;
        return Ok(gate);
    }

    let mut gate: gates::Gate =
        serde_json::from_value(Value::Object(obj)).map_err(|e| PromptForgeError::Validation {
            message: format!("invalid gate definition: {}", e),
        })?;
    if gate.id.is_empty() {
        gate.id = format!("request-{}", uuid::Uuid::new_v4().simple());
    }
    Ok(gate)
}

// ---------------------------------------------------------------------------
// 6. Operator validation
// ---------------------------------------------------------------------------

struct OperatorValidation;

#[async_trait]
impl Stage for OperatorValidation {
    fn name(&self) -> &'static str {
        "operator_validation"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        let Some(operator) = ctx
            .command
            .as_ref()
            .and_then(|c| c.operator_framework.clone())
        else {
            return Ok(());
        };

        let snapshot = ctx.resources()?.clone();
        let Some(methodology) = snapshot.methodology(&operator) else {
            return Err(PromptForgeError::Resolution {
                kind: "methodology".to_string(),
                id: operator,
            });
        };
        if !methodology.enabled {
            return Err(PromptForgeError::Validation {
                message: format!("methodology '{}' is disabled", methodology.id),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 7. Execution planning
// ---------------------------------------------------------------------------

struct ExecutionPlanning;

#[async_trait]
impl Stage for ExecutionPlanning {
    fn name(&self) -> &'static str {
        "execution_planning"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let snapshot = ctx.resources()?.clone();

        if ctx.resuming {
            let session_id = ctx.request.chain_id.clone().unwrap_or_default();
            let Some(session) = services.sessions.get_session(&session_id).await else {
                return Err(PromptForgeError::Session {
                    message: format!(
                        "unknown session '{}'; start the chain again with its command",
                        session_id
                    ),
                });
            };
            ctx.resolved_prompt = snapshot.prompt(&session.chain_id).cloned();
            ctx.session_id = Some(session_id);
            // Resumed steps carry the same gate candidates as a fresh start
            if let Some(prompt) = &ctx.resolved_prompt {
                ctx.gates
                    .add_all(prompt.gate_ids.clone(), GateSource::PromptConfig);
                add_registry_auto_gates(&mut ctx.gates, &snapshot, &prompt.category);
            }
            ctx.plan = Some(ExecutionPlan {
                strategy: Strategy::Chain,
                requires_session: true,
                command_steps: Vec::new(),
            });
            return Ok(());
        }

        let cmd = ctx.command.as_ref().ok_or_else(|| PromptForgeError::Internal {
            message: "planning reached without a parsed command".to_string(),
        })?;
        let prompt = snapshot
            .prompt(&cmd.prompt_id)
            .cloned()
            .ok_or_else(|| PromptForgeError::Resolution {
                kind: "prompt".to_string(),
                id: cmd.prompt_id.clone(),
            })?;

        // Fill missing args from this session's argument history, then validate
        let mut args = cmd.args.clone();
        if let Some(client_session) = &ctx.request.session_id {
            if let Some(previous) = services.argument_history.last_args(client_session).await {
                for arg in &prompt.arguments {
                    if arg.required && !args.contains_key(&arg.name) {
                        if let Some(value) = previous.get(&arg.name) {
                            args.insert(arg.name.clone(), value.clone());
                            ctx.diagnostics.info(
                                self.name(),
                                format!("argument '{}' filled from history", arg.name),
                            );
                        }
                    }
                }
            }
        }
        prompt.validate_arguments(&args)?;

        let command_steps = cmd.steps.clone();
        let strategy = if prompt.is_chain() || !command_steps.is_empty() {
            Strategy::Chain
        } else if !prompt.arguments.is_empty() || prompt.template.contains("{{") {
            Strategy::Template
        } else {
            Strategy::Prompt
        };

        // Gate candidates from the prompt's own configuration
        ctx.gates
            .add_all(prompt.gate_ids.clone(), GateSource::PromptConfig);
        add_registry_auto_gates(&mut ctx.gates, &snapshot, &prompt.category);

        if let Some(cmd_mut) = ctx.command.as_mut() {
            cmd_mut.args = args;
        }
        ctx.plan = Some(ExecutionPlan {
            strategy,
            requires_session: strategy == Strategy::Chain,
            command_steps,
        });
        ctx.resolved_prompt = Some(prompt);
        ctx.diagnostics
            .info(self.name(), format!("strategy: {:?}", strategy));
        Ok(())
    }
}

/// Auto-activating registry gates for a prompt category.
fn add_registry_auto_gates(
    gates: &mut crate::gates::GateAccumulator,
    snapshot: &crate::registry::ResourceSet,
    category: &str,
) {
    for gate in snapshot.gates.values() {
        if let Some(activation) = &gate.activation {
            if !activation.explicit_request
                && activation.framework_context.is_empty()
                && activation.prompt_categories.iter().any(|c| c == category)
            {
                gates.add(gate.id.clone(), GateSource::RegistryAuto);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 8. Script execution
// ---------------------------------------------------------------------------

struct ScriptExecution;

#[async_trait]
impl Stage for ScriptExecution {
    fn name(&self) -> &'static str {
        "script_execution"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        // Shell verification declared on the command runs first
        if let Some(verify) = ctx.command.as_ref().and_then(|c| c.shell_verification.clone()) {
            self.run_shell_verification(ctx, services, &verify).await?;
        }

        let Some(prompt) = ctx.resolved_prompt.clone() else {
            return Ok(());
        };
        if prompt.script_tools.is_empty() {
            return Ok(());
        }

        let args = ctx.command.as_ref().map(|c| c.args.clone()).unwrap_or_default();
        let explicit = ctx.command.as_ref().and_then(|c| c.explicit_tool.as_deref().map(String::from));

        let mut matches = Vec::new();
        for tool in &prompt.script_tools {
            if let Some(m) = scripts::detect(tool, &args, explicit.as_deref()) {
                matches.push(m);
            }
        }
        if matches.is_empty() {
            return Ok(());
        }

        let partition = services.execution_modes.partition(matches).await;
        for skipped in &partition.skipped {
            ctx.diagnostics
                .info(self.name(), format!("script '{}' skipped", skipped.tool_id));
        }
        for pending in &partition.pending_confirmation {
            let tool = prompt
                .script_tools
                .iter()
                .find(|t| t.id == pending.tool_id);
            let message = tool
                .and_then(|t| t.confirm_message.clone())
                .unwrap_or_else(|| {
                    format!(
                        "script '{}' needs confirmation; repeat the request to approve it",
                        pending.tool_id
                    )
                });
            ctx.pending_confirmations.push(message.clone());
            ctx.diagnostics.warn(self.name(), message);
        }

        let timeout_default = services.config.system.script_timeout_ms;
        for ready in partition.ready {
            if ctx.cancel.is_cancelled() {
                ctx.diagnostics
                    .warn(self.name(), "cancelled before all scripts completed");
                break;
            }
            let Some(tool) = prompt.script_tools.iter().find(|t| t.id == ready.tool_id) else {
                continue;
            };
            let timeout = Duration::from_millis(tool.timeout_ms.unwrap_or(timeout_default));
            match tokio::time::timeout(
                timeout,
                services.runner.run_tool(tool, &ready.extracted_inputs),
            )
            .await
            {
                Ok(Ok(output)) => {
                    ctx.diagnostics
                        .info(self.name(), format!("script '{}' succeeded", tool.id));
                    ctx.script_outputs.insert(tool.id.clone(), output);
                }
                Ok(Err(e)) => {
                    if ready.explicit_request {
                        return Err(e);
                    }
                    ctx.diagnostics
                        .warn(self.name(), format!("script '{}' failed: {}", tool.id, e));
                }
                Err(_) => {
                    let e = PromptForgeError::Timeout {
                        operation: format!("script '{}'", tool.id),
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    if ready.explicit_request {
                        return Err(e);
                    }
                    ctx.diagnostics.warn(self.name(), e.to_string());
                }
            }
        }
        Ok(())
    }
}

impl ScriptExecution {
    async fn run_shell_verification(
        &self,
        ctx: &mut ExecutionContext,
        services: &Services,
        verify: &command::ShellVerification,
    ) -> Result<()> {
        let timeout = Duration::from_secs(verify.timeout_secs);
        let attempts = verify.max_attempts.max(1);
        let mut passed = false;

        for attempt in 1..=attempts {
            if ctx.cancel.is_cancelled() {
                ctx.diagnostics
                    .warn(self.name(), "cancelled during shell verification");
                break;
            }
            let outcome = services.runner.run_shell(&verify.command, timeout).await?;
            if outcome.passed() {
                ctx.diagnostics.info(
                    self.name(),
                    format!("verification '{}' PASS (attempt {})", verify.command, attempt),
                );
                passed = true;
                break;
            }
            ctx.diagnostics.warn(
                self.name(),
                format!(
                    "verification '{}' FAIL exit {} (attempt {}/{})",
                    verify.command, outcome.exit_code, attempt, attempts
                ),
            );
            if !verify.loop_until_pass {
                break;
            }
        }

        if !passed && verify.loop_until_pass {
            ctx.diagnostics.error(
                self.name(),
                format!(
                    "verification '{}' did not pass within {} attempts",
                    verify.command, attempts
                ),
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 9. Script auto-execute
// ---------------------------------------------------------------------------

struct ScriptAutoExecute;

#[async_trait]
impl Stage for ScriptAutoExecute {
    fn name(&self) -> &'static str {
        "script_auto_execute"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let Some(prompt) = ctx.resolved_prompt.clone() else {
            return Ok(());
        };

        // One continuation hop: an output may declare a follow-up tool, or
        // the tool's own config may.
        let outputs: Vec<(String, Value)> = ctx
            .script_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (tool_id, output) in outputs {
            let declared = output
                .as_object()
                .and_then(|o| o.get("auto_execute"))
                .and_then(|v| v.as_object())
                .and_then(|o| o.get("tool"))
                .and_then(|v| v.as_str())
                .map(String::from);
            let configured = prompt
                .script_tools
                .iter()
                .find(|t| t.id == tool_id)
                .and_then(|t| t.auto_execute.clone());
            let Some(next_id) = declared.or(configured) else {
                continue;
            };
            if ctx.script_outputs.contains_key(&next_id) {
                continue;
            }
            let Some(next_tool) = prompt.script_tools.iter().find(|t| t.id == next_id) else {
                ctx.diagnostics.warn(
                    self.name(),
                    format!("auto_execute target '{}' is not declared on this prompt", next_id),
                );
                continue;
            };
            if next_tool.confirm {
                ctx.diagnostics.warn(
                    self.name(),
                    format!("auto_execute target '{}' requires confirmation; not run", next_id),
                );
                continue;
            }

            let inputs = output
                .as_object()
                .and_then(|o| o.get("auto_execute"))
                .and_then(|v| v.as_object())
                .and_then(|o| o.get("inputs"))
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_else(|| {
                    let mut m = Map::new();
                    m.insert("input".to_string(), output.clone());
                    m
                });

            match services.runner.run_tool(next_tool, &inputs).await {
                Ok(result) => {
                    ctx.diagnostics.info(
                        self.name(),
                        format!("auto-executed '{}' after '{}'", next_id, tool_id),
                    );
                    ctx.script_outputs.insert(next_id, result);
                }
                Err(e) => {
                    ctx.diagnostics
                        .warn(self.name(), format!("auto_execute '{}' failed: {}", next_id, e));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 10. Judge selection
// ---------------------------------------------------------------------------

/// Category tag that marks a gate as an evaluation (judge) gate.
const JUDGE_CATEGORY: &str = "evaluation";

struct JudgeSelection;

#[async_trait]
impl Stage for JudgeSelection {
    fn name(&self) -> &'static str {
        "judge_selection"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        let judge = ctx.command.as_ref().is_some_and(|c| c.judge);
        if !judge || !ctx.gate_system_enabled {
            return Ok(());
        }

        let snapshot = ctx.resources()?.clone();
        let mut added = 0;
        for gate in snapshot.gates.values() {
            let is_judge = gate
                .activation
                .as_ref()
                .is_some_and(|a| a.prompt_categories.iter().any(|c| c == JUDGE_CATEGORY));
            if is_judge {
                ctx.gates.add(gate.id.clone(), GateSource::ClientSelection);
                ctx.explicit_gate_ids.push(gate.id.clone());
                added += 1;
            }
        }
        ctx.diagnostics
            .info(self.name(), format!("%judge selected {} evaluation gates", added));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 11. Gate enhancement
// ---------------------------------------------------------------------------

struct GateEnhancement;

#[async_trait]
impl Stage for GateEnhancement {
    fn name(&self) -> &'static str {
        "gate_enhancement"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        if !ctx.gate_system_enabled {
            return Ok(());
        }
        resolve_context_gates(ctx, None)?;
        Ok(())
    }
}

/// Resolve the accumulator into definitions, warning on unknown ids.
/// Re-run after framework resolution adds methodology gates.
fn resolve_context_gates(ctx: &mut ExecutionContext, active_framework: Option<&str>) -> Result<()> {
    let snapshot = ctx.resources()?.clone();
    let category = ctx
        .resolved_prompt
        .as_ref()
        .map(|p| p.category.clone())
        .unwrap_or_else(|| "general".to_string());
    let activation = gates::ActivationContext {
        prompt_category: &category,
        active_framework,
        explicit_request_ids: &ctx.explicit_gate_ids,
    };
    let (resolved, warnings) = gates::resolve_gates(
        &ctx.gates,
        |id| snapshot.gate(id).cloned(),
        &ctx.temporary_gates,
        &activation,
    );
    for warning in warnings {
        ctx.diagnostics.warn("gate_enhancement", warning);
    }
    ctx.resolved_gates = resolved;
    Ok(())
}

// ---------------------------------------------------------------------------
// 12. Framework resolution
// ---------------------------------------------------------------------------

struct FrameworkResolution;

#[async_trait]
impl Stage for FrameworkResolution {
    fn name(&self) -> &'static str {
        "framework_resolution"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _services: &Services) -> Result<()> {
        let state = ctx.framework_state.clone().unwrap_or_default();
        let inputs = DecisionInputs {
            modifiers: ctx
                .command
                .as_ref()
                .map(|c| c.modifiers.clone())
                .unwrap_or_default(),
            operator_override: ctx
                .command
                .as_ref()
                .and_then(|c| c.operator_framework.clone())
                .map(|f| crate::frameworks::Methodology::canonical_id(&f)),
            client_override: ctx.request.client_framework.clone(),
            global_active: state.active_framework.clone(),
            system_enabled: state.framework_system_enabled,
        };
        let decision = frameworks::decide(&inputs);

        if decision.should_apply {
            if let Some(id) = &decision.framework_id {
                let snapshot = ctx.resources()?.clone();
                if let Some(methodology) = snapshot.methodology(id) {
                    ctx.gates.add_all(
                        methodology.methodology_gates.clone(),
                        GateSource::Methodology,
                    );
                } else {
                    ctx.diagnostics.warn(
                        self.name(),
                        format!("active framework '{}' has no loaded methodology", id),
                    );
                }
            }
        }

        let active = decision.framework_id.clone();
        ctx.framework_decision = Some(decision);
        if ctx.gate_system_enabled {
            resolve_context_gates(ctx, active.as_deref())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 13. Session management
// ---------------------------------------------------------------------------

struct SessionManagement;

#[async_trait]
impl Stage for SessionManagement {
    fn name(&self) -> &'static str {
        "session_management"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let plan = match &ctx.plan {
            Some(plan) if plan.requires_session => plan.clone(),
            _ => return Ok(()),
        };

        if ctx.resuming {
            self.resume(ctx, services).await
        } else {
            self.start(ctx, services, &plan).await
        }
    }
}

impl SessionManagement {
    async fn start(
        &self,
        ctx: &mut ExecutionContext,
        services: &Services,
        plan: &ExecutionPlan,
    ) -> Result<()> {
        let cmd = ctx.command.as_ref().ok_or_else(|| PromptForgeError::Internal {
            message: "chain start without a parsed command".to_string(),
        })?;
        let prompt = ctx
            .resolved_prompt
            .as_ref()
            .ok_or_else(|| PromptForgeError::Internal {
                message: "chain start without a resolved prompt".to_string(),
            })?;

        let (chain_id, total_steps) = if plan.command_steps.is_empty() {
            (prompt.id.clone(), prompt.chain_steps.len())
        } else {
            (prompt.id.clone(), 1 + plan.command_steps.len())
        };
        let session_id = crate::sessions::ChainSessionManager::session_id_for(&chain_id, None);

        let blueprint = json!({
            "command": ctx.request.command,
            "prompt_id": cmd.prompt_id,
            "args": cmd.args,
            "strategy": plan.strategy,
            "command_steps": plan
                .command_steps
                .iter()
                .map(|s| json!({"prompt_id": s.prompt_id, "args": s.args}))
                .collect::<Vec<_>>(),
        });

        let session = services
            .sessions
            .create_session(
                &session_id,
                &chain_id,
                total_steps,
                Map::new(),
                Some(blueprint),
                ctx.request.force_restart,
            )
            .await?;

        // Step 1 args: chain-step config overlaid with the command args
        let mut step_args = first_step_args(prompt);
        for (k, v) in &cmd.args {
            step_args.insert(k.clone(), v.clone());
        }
        services
            .sessions
            .set_step_args(&session_id, 1, step_args.clone())
            .await?;
        services
            .sessions
            .set_step_state(&session_id, 1, StepStateKind::Rendered, false)
            .await?;

        if let Some(client_session) = &ctx.request.session_id {
            let _ = services
                .argument_history
                .record(client_session, &cmd.prompt_id, &cmd.args)
                .await;
        }

        ctx.session_id = Some(session_id);
        ctx.current_step = Some(CurrentStep {
            number: 1,
            prompt_id: step_prompt_id(prompt, &plan.command_steps, 1)
                .unwrap_or_else(|| prompt.id.clone()),
            args: step_args,
        });
        ctx.diagnostics.info(
            self.name(),
            format!("session '{}' created ({} steps)", session.session_id, total_steps),
        );

        // Chain-level gates for the first step
        self.add_step_gates(ctx, 1)?;
        Ok(())
    }

    async fn resume(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let session_id = ctx.session_id.clone().or_else(|| ctx.request.chain_id.clone());
        let Some(session_id) = session_id else {
            return Err(PromptForgeError::Session {
                message: "resume requested without a chain_id".to_string(),
            });
        };
        let session = services
            .sessions
            .get_session(&session_id)
            .await
            .ok_or_else(|| PromptForgeError::Session {
                message: format!("unknown session '{}'", session_id),
            })?;
        ctx.session_id = Some(session_id.clone());

        if let Some(review) = &session.pending_gate_review {
            // Suspended on a gate review; only a verdict (or gate_action)
            // moves the chain. The review stage owns that transition.
            ctx.pending_review = Some(review.clone());
            if ctx.request.gate_verdict.is_none() && ctx.request.gate_action.is_none() {
                ctx.response = Some(EngineResponse {
                    text: format!(
                        "A gate review is pending for step {} ('{}'). Reply with `{}` to continue.",
                        review.step_number,
                        review.gate_name,
                        gates::VERDICT_GRAMMAR
                    ),
                    metadata: Some(json!({ "chain_id": session_id, "awaiting": "gate_verdict" })),
                });
                return Ok(());
            }
            // Pre-classify a PASS so the rest of the pipeline renders the
            // next step; FAIL handling stays in the gate review stage.
            if let Some(raw) = &ctx.request.gate_verdict {
                let strict = services.config.gates.strict_verdicts;
                let verdict = parse_verdict(raw, strict)?;
                if verdict.passed {
                    let step = review.step_number;
                    services
                        .sessions
                        .set_pending_gate_review(&session_id, None)
                        .await?;
                    let result = ctx.request.user_response.clone().unwrap_or_default();
                    services
                        .sessions
                        .record_step_result(&session_id, step, result)
                        .await?;
                    services.sessions.complete_step(&session_id, step, false).await?;
                    ctx.diagnostics.info(
                        "gate_review",
                        format!("gate '{}' PASS: {}", review.gate_id, verdict.reason),
                    );
                    ctx.pending_review = None;
                    self.mark_success(services, &session_id, true).await;
                } else {
                    // Leave the pending review in place for stage 18
                    return Ok(());
                }
            } else {
                return Ok(());
            }
        } else if let Some(result) = ctx.request.user_response.clone() {
            let step = session.current_step;
            services
                .sessions
                .record_step_result(&session_id, step, result)
                .await?;
            services.sessions.complete_step(&session_id, step, false).await?;
            ctx.diagnostics
                .info(self.name(), format!("step {} completed", step));
            self.mark_success(services, &session_id, true).await;
        }

        // Re-read after mutations and find the next executable step
        let session = services
            .sessions
            .get_session(&session_id)
            .await
            .ok_or_else(|| PromptForgeError::Session {
                message: format!("session '{}' vanished mid-request", session_id),
            })?;

        if session.is_complete() {
            let results: Vec<String> = session
                .chain_context
                .step_results
                .values()
                .cloned()
                .collect();
            ctx.response = Some(EngineResponse {
                text: format!(
                    "Chain '{}' complete ({} steps).\n\nFinal result:\n{}",
                    session.chain_id,
                    session.total_steps,
                    results.last().cloned().unwrap_or_default()
                ),
                metadata: Some(json!({
                    "chain_id": session.session_id,
                    "total_steps": session.total_steps,
                    "complete": true,
                })),
            });
            return Ok(());
        }

        let next = self
            .next_executable_step(ctx, services, &session_id)
            .await?;
        let Some(step) = next else {
            // Trailing steps may have been skipped; re-read before reporting
            let session = services
                .sessions
                .get_session(&session_id)
                .await
                .unwrap_or(session);
            let text = if session.is_complete() {
                let last = session
                    .chain_context
                    .step_results
                    .values()
                    .next_back()
                    .cloned()
                    .unwrap_or_default();
                format!(
                    "Chain '{}' complete ({} steps).\n\nFinal result:\n{}",
                    session.chain_id, session.total_steps, last
                )
            } else {
                format!("Chain '{}' has no further executable steps.", session.chain_id)
            };
            ctx.response = Some(EngineResponse {
                text,
                metadata: Some(json!({ "chain_id": session.session_id, "complete": true })),
            });
            return Ok(());
        };

        self.add_step_gates(ctx, step.number)?;
        services
            .sessions
            .set_step_args(&session_id, step.number, step.args.clone())
            .await?;
        services
            .sessions
            .set_step_state(&session_id, step.number, StepStateKind::Rendered, false)
            .await?;
        ctx.current_step = Some(step);
        Ok(())
    }

    /// Outcome flag consumed by skip_if_error / skip_if_success.
    async fn mark_success(&self, services: &Services, session_id: &str, success: bool) {
        let _ = services
            .sessions
            .set_variable(session_id, "last_step_success", Value::Bool(success))
            .await;
    }

    /// Walk forward from the session's cursor, applying conditional
    /// execution. Skipped steps are marked and diagnosed; branch targets
    /// move the cursor.
    async fn next_executable_step(
        &self,
        ctx: &mut ExecutionContext,
        services: &Services,
        session_id: &str,
    ) -> Result<Option<CurrentStep>> {
        let timeout_ms = services.config.resolver.expression_timeout_ms;

        loop {
            let session = services
                .sessions
                .get_session(session_id)
                .await
                .ok_or_else(|| PromptForgeError::Session {
                    message: format!("unknown session '{}'", session_id),
                })?;
            if session.is_complete() || session.current_step == 0 {
                return Ok(None);
            }
            let number = session.current_step;
            let already_done = session
                .step_states
                .get(&number)
                .is_some_and(|s| s.state == StepStateKind::Completed);
            if already_done {
                return Ok(None);
            }

            let Some(definition) = self.step_definition(ctx, &session.chain_id, number) else {
                // Ad-hoc command chains carry no conditionals
                let args = session.step_args.get(&number).cloned().unwrap_or_default();
                let prompt_id = self
                    .adhoc_step_prompt_id(ctx, number)
                    .unwrap_or_else(|| session.chain_id.clone());
                return Ok(Some(CurrentStep {
                    number,
                    prompt_id,
                    args,
                }));
            };

            let decision = self
                .evaluate_conditional(ctx, services, &session, &definition, timeout_ms)
                .await;

            match decision {
                StepDecision::Execute => {
                    return Ok(Some(CurrentStep {
                        number,
                        prompt_id: definition.prompt_id.clone(),
                        args: definition.args.clone(),
                    }));
                }
                StepDecision::Skip(reason) => {
                    ctx.diagnostics.info(
                        "session_management",
                        format!("step {} ('{}') skipped: {}", number, definition.prompt_id, reason),
                    );
                    services
                        .sessions
                        .set_step_state(session_id, number, StepStateKind::Completed, true)
                        .await?;
                    if number >= session.total_steps {
                        return Ok(None);
                    }
                    services.sessions.branch_to(session_id, number + 1).await?;
                }
                StepDecision::Branch(target) => {
                    ctx.diagnostics.info(
                        "session_management",
                        format!("step {} branches to '{}'", number, target),
                    );
                    let Some(target_number) = self.find_step_number(ctx, &session.chain_id, &target)
                    else {
                        ctx.diagnostics.warn(
                            "session_management",
                            format!("branch target '{}' not found; skipping step", target),
                        );
                        services
                            .sessions
                            .set_step_state(session_id, number, StepStateKind::Completed, true)
                            .await?;
                        if number >= session.total_steps {
                            return Ok(None);
                        }
                        services.sessions.branch_to(session_id, number + 1).await?;
                        continue;
                    };
                    services
                        .sessions
                        .set_step_state(session_id, number, StepStateKind::Completed, true)
                        .await?;
                    services.sessions.branch_to(session_id, target_number).await?;
                }
            }
        }
    }

    fn step_definition(
        &self,
        ctx: &ExecutionContext,
        chain_id: &str,
        number: usize,
    ) -> Option<ChainStep> {
        let snapshot = ctx.snapshot.as_ref()?;
        let prompt = snapshot.prompt(chain_id)?;
        prompt.chain_steps.get(number.checked_sub(1)?).cloned()
    }

    fn adhoc_step_prompt_id(&self, ctx: &ExecutionContext, number: usize) -> Option<String> {
        let plan = ctx.plan.as_ref()?;
        if number == 1 {
            return ctx.command.as_ref().map(|c| c.prompt_id.clone());
        }
        plan.command_steps
            .get(number - 2)
            .map(|s: &CommandStep| s.prompt_id.clone())
    }

    fn find_step_number(&self, ctx: &ExecutionContext, chain_id: &str, target: &str) -> Option<usize> {
        let snapshot = ctx.snapshot.as_ref()?;
        let prompt = snapshot.prompt(chain_id)?;
        prompt
            .chain_steps
            .iter()
            .find(|s| s.prompt_id == target || step_key(&s.prompt_id) == target)
            .map(|s| s.step_number)
    }

    async fn evaluate_conditional(
        &self,
        ctx: &mut ExecutionContext,
        services: &Services,
        session: &crate::sessions::ChainSession,
        definition: &ChainStep,
        timeout_ms: u64,
    ) -> StepDecision {
        let Some(cond) = &definition.conditional_execution else {
            return StepDecision::Execute;
        };

        match cond.exec_type {
            ConditionalType::Always => StepDecision::Execute,
            ConditionalType::SkipIfError => {
                if last_step_succeeded(session) {
                    StepDecision::Execute
                } else {
                    StepDecision::Skip("previous step errored".to_string())
                }
            }
            ConditionalType::SkipIfSuccess => {
                if last_step_succeeded(session) {
                    StepDecision::Skip("previous step succeeded".to_string())
                } else {
                    StepDecision::Execute
                }
            }
            ConditionalType::BranchTo | ConditionalType::SkipTo => match &cond.target_step {
                Some(target) => StepDecision::Branch(target.clone()),
                None => StepDecision::Skip("branch without target".to_string()),
            },
            ConditionalType::Conditional => {
                let Some(expr) = &cond.expression else {
                    return StepDecision::Skip("conditional without expression".to_string());
                };
                let mut cond_ctx = ConditionContext::default();
                let snapshot = ctx.snapshot.clone();
                if let Some(prompt) =
                    snapshot.as_ref().and_then(|s| s.prompt(&session.chain_id))
                {
                    for step in &prompt.chain_steps {
                        if let Some(result) =
                            session.chain_context.step_results.get(&step.step_number)
                        {
                            cond_ctx.insert_step(step_key(&step.prompt_id), result, true);
                        }
                    }
                }
                cond_ctx.vars = session.chain_context.variables.clone();

                match condition::evaluate(expr, &cond_ctx, timeout_ms).await {
                    Ok(true) => StepDecision::Execute,
                    Ok(false) => StepDecision::Skip(format!("condition '{}' is false", expr)),
                    Err(e) => {
                        // Any evaluation failure downgrades to a skip; the
                        // chain proceeds.
                        ctx.diagnostics.warn(
                            "session_management",
                            format!("condition '{}' failed: {}; skipping step", expr, e),
                        );
                        StepDecision::Skip(format!("condition failed: {}", e))
                    }
                }
            }
        }
    }

    /// Chain-level gates attached to one step. Added after the main gate
    /// resolution ran, so the resolved set is rebuilt when anything new
    /// lands.
    fn add_step_gates(&self, ctx: &mut ExecutionContext, step_number: usize) -> Result<()> {
        let ids: Vec<String> = ctx
            .resolved_prompt
            .as_ref()
            .and_then(|p| p.chain_steps.get(step_number.wrapping_sub(1)))
            .map(|s| s.inline_gate_ids.clone())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(());
        }
        ctx.gates.add_all(ids, GateSource::ChainLevel);
        if ctx.gate_system_enabled {
            let active = ctx
                .framework_decision
                .as_ref()
                .and_then(|d| d.framework_id.clone());
            resolve_context_gates(ctx, active.as_deref())?;
        }
        Ok(())
    }
}

enum StepDecision {
    Execute,
    Skip(String),
    Branch(String),
}

/// Last path segment of a prompt id (`my_chain/data_check` -> `data_check`),
/// the key used for `steps.<id>` bindings in conditional expressions.
fn step_key(prompt_id: &str) -> &str {
    prompt_id.rsplit('/').next().unwrap_or(prompt_id)
}

fn last_step_succeeded(session: &crate::sessions::ChainSession) -> bool {
    session
        .chain_context
        .variables
        .get("last_step_success")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

fn first_step_args(prompt: &Prompt) -> Map<String, Value> {
    prompt
        .chain_steps
        .first()
        .map(|step| step.args.clone())
        .unwrap_or_default()
}

fn step_prompt_id(
    prompt: &Prompt,
    command_steps: &[CommandStep],
    number: usize,
) -> Option<String> {
    if let Some(step) = prompt.chain_steps.get(number.checked_sub(1)?) {
        return Some(step.prompt_id.clone());
    }
    if number == 1 {
        return Some(prompt.id.clone());
    }
    command_steps.get(number - 2).map(|s| s.prompt_id.clone())
}

// ---------------------------------------------------------------------------
// 14. Injection control
// ---------------------------------------------------------------------------

struct InjectionControl;

#[async_trait]
impl Stage for InjectionControl {
    fn name(&self) -> &'static str {
        "injection_control"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let policy = services.injection.read().await.clone();
        let step_number = ctx.current_step.as_ref().map(|s| s.number).unwrap_or(1);

        ctx.inject_gate_guidance = policy
            .frequency_for(InjectionType::GateGuidance)
            .applies_at(step_number);

        // System-prompt and style decisions are re-read by the guidance
        // stage from the same policy; only the suppression is worth a note.
        if !policy
            .frequency_for(InjectionType::SystemPrompt)
            .applies_at(step_number)
        {
            ctx.diagnostics.info(
                self.name(),
                format!("system-prompt injection suppressed at step {}", step_number),
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 15. Prompt guidance
// ---------------------------------------------------------------------------

struct PromptGuidance;

#[async_trait]
impl Stage for PromptGuidance {
    fn name(&self) -> &'static str {
        "prompt_guidance"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let policy = services.injection.read().await.clone();
        let step_number = ctx.current_step.as_ref().map(|s| s.number).unwrap_or(1);
        let snapshot = ctx.resources()?.clone();

        let system_prompt_applies = policy
            .frequency_for(InjectionType::SystemPrompt)
            .applies_at(step_number);

        if system_prompt_applies {
            if let Some(system_message) = ctx
                .resolved_prompt
                .as_ref()
                .and_then(|p| p.system_message.clone())
            {
                ctx.guidance_blocks.push(system_message);
            }
            if let Some(decision) = &ctx.framework_decision {
                if decision.should_apply {
                    if let Some(methodology) = decision
                        .framework_id
                        .as_deref()
                        .and_then(|id| snapshot.methodology(id))
                    {
                        ctx.guidance_blocks
                            .push(methodology.render_guidance(decision.lean));
                    }
                }
            }
        }

        let style_applies = policy
            .frequency_for(InjectionType::StyleGuidance)
            .applies_at(step_number);
        if style_applies {
            let style_id = ctx
                .request
                .options
                .as_ref()
                .and_then(|o| o.get("style"))
                .and_then(|v| v.as_str());
            if let Some(style_id) = style_id {
                match snapshot.style(style_id) {
                    Some(style) if style.enabled => {
                        ctx.guidance_blocks.push(style.render_guidance());
                    }
                    Some(_) => ctx
                        .diagnostics
                        .warn(self.name(), format!("style '{}' is disabled", style_id)),
                    None => ctx
                        .diagnostics
                        .warn(self.name(), format!("unknown style '{}'", style_id)),
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 16. Response capture
// ---------------------------------------------------------------------------

struct ResponseCapture;

#[async_trait]
impl Stage for ResponseCapture {
    fn name(&self) -> &'static str {
        "response_capture"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        if let Some(session_id) = &ctx.session_id {
            if let Ok(chain_context) = services.sessions.get_chain_context(session_id).await {
                let current = ctx
                    .current_step
                    .as_ref()
                    .map(|s| s.number)
                    .unwrap_or(chain_context.current_step);
                // The most recent completed result feeds {{previous_step_result}}
                let previous = chain_context
                    .step_results
                    .range(..current)
                    .next_back()
                    .map(|(_, v)| v.clone());
                if let Some(previous) = previous {
                    ctx.previous_step_output = previous;
                    return Ok(());
                }
            }
        }
        if let Some(user_response) = &ctx.request.user_response {
            ctx.previous_step_output = user_response.clone();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 17. Step execution
// ---------------------------------------------------------------------------

struct StepExecution;

#[async_trait]
impl Stage for StepExecution {
    fn name(&self) -> &'static str {
        "step_execution"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        // While a review is unresolved the step is not re-rendered here;
        // the gate review stage decides what the client sees next.
        if ctx.pending_review.is_some() {
            return Ok(());
        }

        let snapshot = ctx.resources()?.clone();
        let (prompt, args, step_number) = match (&ctx.current_step, &ctx.resolved_prompt) {
            (Some(step), _) => {
                let prompt = snapshot
                    .prompt(&step.prompt_id)
                    .cloned()
                    .or_else(|| ctx.resolved_prompt.clone())
                    .ok_or_else(|| PromptForgeError::Resolution {
                        kind: "prompt".to_string(),
                        id: step.prompt_id.clone(),
                    })?;
                (prompt, step.args.clone(), step.number)
            }
            (None, Some(prompt)) => {
                let args = ctx
                    .command
                    .as_ref()
                    .map(|c| c.args.clone())
                    .unwrap_or_default();
                (prompt.clone(), args, 1)
            }
            (None, None) => return Ok(()),
        };

        if ctx.cancel.is_cancelled() {
            return Err(PromptForgeError::Timeout {
                operation: "step execution".to_string(),
                timeout_ms: ctx.started.elapsed().as_millis() as u64,
            });
        }

        // Pre-resolve {{ref:..}} / {{script:..}} before the pure render
        let script_map: HashMap<String, ScriptTool> = prompt
            .script_tools
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        let lookup = |id: &str| snapshot.prompt(id).cloned();
        let mut resolver = Resolver::new(
            &lookup,
            &script_map,
            services.runner.as_ref(),
            services.config.resolver.max_ref_depth,
            services.config.resolver.lenient_refs,
        );
        let resolution = resolver.resolve(&prompt.id, &prompt.template, &args).await?;
        for warning in &resolution.report.warnings {
            ctx.diagnostics.warn(self.name(), warning.clone());
        }
        if resolution.report.references_resolved > 0 {
            ctx.diagnostics.info(
                self.name(),
                format!(
                    "resolved {} references in {}ms ({:?})",
                    resolution.report.references_resolved,
                    resolution.report.resolution_time_ms,
                    resolution.report.resolved_prompt_ids,
                ),
            );
        }

        // Declared-but-missing arguments render as empty strings
        let mut render_args = args.clone();
        for declared in &prompt.arguments {
            render_args
                .entry(declared.name.clone())
                .or_insert_with(|| Value::String(String::new()));
        }

        let step_results = if let Some(session_id) = &ctx.session_id {
            services
                .sessions
                .get_session(session_id)
                .await
                .map(|s| s.chain_context.step_results)
                .unwrap_or_default()
        } else {
            Default::default()
        };
        let vars = template::step_vars(&render_args, &ctx.previous_step_output, &step_results);
        let rendered = template::render(&resolution.text, &vars)?;
        ctx.diagnostics.info(
            self.name(),
            format!("rendered step {} of '{}'", step_number, prompt.id),
        );
        ctx.rendered = Some(rendered);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 18. Gate review
// ---------------------------------------------------------------------------

struct GateReview;

#[async_trait]
impl Stage for GateReview {
    fn name(&self) -> &'static str {
        "gate_review"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        if !ctx.gate_system_enabled {
            return Ok(());
        }

        // An unresolved pending review: the verdict was FAIL, or the user
        // sent a gate_action after exhausting retries.
        if let Some(review) = ctx.pending_review.clone() {
            return self.handle_pending(ctx, services, review).await;
        }

        // Fresh render of a chain step with validation gates: suspend for
        // self-review.
        let has_validation_gates = ctx
            .resolved_gates
            .iter()
            .any(|g| g.gate.gate_type == GateType::Validation);
        let (Some(session_id), Some(step), Some(rendered), true) = (
            ctx.session_id.clone(),
            ctx.current_step.clone(),
            ctx.rendered.clone(),
            has_validation_gates,
        ) else {
            return Ok(());
        };

        let primary = ctx
            .resolved_gates
            .iter()
            .find(|g| g.gate.gate_type == GateType::Validation)
            .cloned()
            .ok_or_else(|| PromptForgeError::Internal {
                message: "validation gate vanished between checks".to_string(),
            })?;
        let (max_attempts, preserve_context) = primary
            .gate
            .retry_config
            .as_ref()
            .map(|r| (r.max_attempts, r.preserve_context))
            .unwrap_or((services.config.gates.default_max_attempts, false));

        let review = PendingGateReview {
            gate_id: primary.gate.id.clone(),
            gate_name: primary.gate.name.clone(),
            step_number: step.number,
            rendered_prompt: rendered,
            attempt: 0,
            max_attempts,
            preserve_context,
        };
        services
            .sessions
            .set_pending_gate_review(&session_id, Some(review))
            .await?;
        ctx.diagnostics.info(
            self.name(),
            format!(
                "step {} suspended for gate '{}' review",
                step.number, primary.gate.id
            ),
        );
        Ok(())
    }
}

impl GateReview {
    async fn handle_pending(
        &self,
        ctx: &mut ExecutionContext,
        services: &Services,
        review: PendingGateReview,
    ) -> Result<()> {
        let session_id = ctx
            .session_id
            .clone()
            .ok_or_else(|| PromptForgeError::Internal {
                message: "pending review without a session".to_string(),
            })?;

        // After retries are exhausted the user chooses what happens next
        if let Some(action) = &ctx.request.gate_action {
            let action: GateAction = action.parse()?;
            match action {
                GateAction::Retry => {
                    let reset = PendingGateReview {
                        attempt: 0,
                        ..review.clone()
                    };
                    services
                        .sessions
                        .set_pending_gate_review(&session_id, Some(reset))
                        .await?;
                    ctx.response = Some(EngineResponse {
                        text: format!(
                            "{}\n\nRetry counter reset. Reply with `{}` when done.",
                            review.rendered_prompt,
                            gates::VERDICT_GRAMMAR
                        ),
                        metadata: Some(json!({ "chain_id": session_id, "gate": review.gate_id })),
                    });
                }
                GateAction::Skip => {
                    services
                        .sessions
                        .set_pending_gate_review(&session_id, None)
                        .await?;
                    let result = ctx.request.user_response.clone().unwrap_or_default();
                    services
                        .sessions
                        .record_step_result(&session_id, review.step_number, result)
                        .await?;
                    services
                        .sessions
                        .complete_step(&session_id, review.step_number, false)
                        .await?;
                    ctx.diagnostics.info(
                        self.name(),
                        format!("gate '{}' skipped by user", review.gate_id),
                    );
                    ctx.response = Some(EngineResponse {
                        text: format!(
                            "Gate '{}' skipped; step {} treated as passed. Resume with chain_id=\"{}\".",
                            review.gate_name, review.step_number, session_id
                        ),
                        metadata: Some(json!({ "chain_id": session_id })),
                    });
                }
                GateAction::Abort => {
                    services.sessions.clear_session(&session_id).await?;
                    ctx.diagnostics.warn(
                        self.name(),
                        format!("chain aborted at gate '{}'", review.gate_id),
                    );
                    ctx.response = Some(EngineResponse {
                        text: format!(
                            "Chain aborted at step {} (gate '{}').",
                            review.step_number, review.gate_name
                        ),
                        metadata: Some(json!({ "chain_id": session_id, "aborted": true })),
                    });
                }
            }
            return Ok(());
        }

        // A FAIL verdict (PASS was already applied during session management)
        let Some(raw) = &ctx.request.gate_verdict else {
            return Ok(());
        };
        let verdict = parse_verdict(raw, services.config.gates.strict_verdicts)?;
        match apply_verdict(&review, &verdict) {
            ReviewOutcome::Pass { .. } => Ok(()),
            ReviewOutcome::FailRetry { reason, attempt } => {
                let updated = PendingGateReview {
                    attempt,
                    ..review.clone()
                };
                services
                    .sessions
                    .set_pending_gate_review(&session_id, Some(updated))
                    .await?;
                ctx.diagnostics.warn(
                    self.name(),
                    format!(
                        "gate '{}' FAIL (attempt {}/{}): {}",
                        review.gate_id, attempt, review.max_attempts, reason
                    ),
                );
                ctx.response = Some(EngineResponse {
                    text: format!(
                        "{}\n\n## Retry hints\nPrevious attempt failed gate '{}': {}\nAddress the failure and reply with `{}`.",
                        review.rendered_prompt, review.gate_name, reason,
                        gates::VERDICT_GRAMMAR
                    ),
                    metadata: Some(json!({
                        "chain_id": session_id,
                        "gate": review.gate_id,
                        "attempt": attempt,
                        "max_attempts": review.max_attempts,
                    })),
                });
                Ok(())
            }
            ReviewOutcome::FailExceeded { reason } => {
                ctx.diagnostics.error(
                    self.name(),
                    format!("gate '{}' retries exhausted: {}", review.gate_id, reason),
                );
                ctx.response = Some(EngineResponse {
                    text: format!(
                        "Gate '{}' failed {} times (last reason: {}).\nChoose how to continue with gate_action: retry | skip | abort.",
                        review.gate_name, review.max_attempts, reason
                    ),
                    metadata: Some(json!({
                        "chain_id": session_id,
                        "gate": review.gate_id,
                        "awaiting": "gate_action",
                    })),
                });
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 19. Call to action
// ---------------------------------------------------------------------------

struct CallToAction;

#[async_trait]
impl Stage for CallToAction {
    fn name(&self) -> &'static str {
        "call_to_action"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        let Some(session_id) = ctx.session_id.clone() else {
            return Ok(());
        };
        let Some(session) = services.sessions.get_session(&session_id).await else {
            return Ok(());
        };

        let mut lines = Vec::new();
        if session.pending_gate_review.is_some() {
            lines.push(format!(
                "Complete the step, then reply with `{}` and your output as user_response.",
                gates::VERDICT_GRAMMAR
            ));
        } else if !session.is_complete() {
            lines.push(format!(
                "Step {} of {}. When done, resume with chain_id=\"{}\" and your output as user_response.",
                session.current_step, session.total_steps, session_id
            ));
        }
        for confirmation in &ctx.pending_confirmations {
            lines.push(confirmation.clone());
        }
        if !lines.is_empty() {
            ctx.call_to_action = Some(lines.join("\n"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 20. Response formatting
// ---------------------------------------------------------------------------

struct ResponseFormatting;

#[async_trait]
impl Stage for ResponseFormatting {
    fn name(&self) -> &'static str {
        "response_formatting"
    }

    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()> {
        if ctx.response.is_some() {
            return Ok(());
        }

        let mut sections: Vec<String> = Vec::new();
        for block in &ctx.guidance_blocks {
            if !block.trim().is_empty() {
                sections.push(block.trim_end().to_string());
            }
        }
        if ctx.inject_gate_guidance && !ctx.resolved_gates.is_empty() {
            let applicable: Vec<ResolvedGate> = ctx
                .resolved_gates
                .iter()
                .filter(|g| step_applies(g, ctx.current_step.as_ref().map(|s| s.number)))
                .cloned()
                .collect();
            let guidance = gates::render_guidance(&applicable);
            if !guidance.is_empty() {
                sections.push(guidance.trim_end().to_string());
            }
        }
        if let Some(rendered) = &ctx.rendered {
            sections.push(rendered.trim_end().to_string());
        }
        if let Some(call_to_action) = &ctx.call_to_action {
            sections.push(format!("---\n{}", call_to_action));
        }

        if sections.is_empty() {
            return Err(PromptForgeError::Internal {
                message: "nothing to format; no stage produced output".to_string(),
            });
        }

        let metadata = if let Some(session_id) = &ctx.session_id {
            let session = services.sessions.get_session(session_id).await;
            Some(json!({
                "execution_id": ctx.execution_id,
                "chain_id": session_id,
                "current_step": session.as_ref().map(|s| s.current_step),
                "total_steps": session.as_ref().map(|s| s.total_steps),
                "gates": ctx.resolved_gates.iter().map(|g| g.gate.id.clone()).collect::<Vec<_>>(),
                "registry_generation": ctx.registry_generation,
            }))
        } else {
            Some(json!({
                "execution_id": ctx.execution_id,
                "strategy": ctx.plan.as_ref().map(|p| p.strategy),
                "registry_generation": ctx.registry_generation,
            }))
        };

        ctx.response = Some(EngineResponse {
            text: sections.join("\n\n"),
            metadata,
        });
        Ok(())
    }
}

fn step_applies(gate: &ResolvedGate, step: Option<usize>) -> bool {
    if gate.gate.apply_to_steps.is_empty() {
        return true;
    }
    step.is_some_and(|n| gate.gate.apply_to_steps.contains(&n))
}

// ---------------------------------------------------------------------------
// 21. Post-formatting cleanup (invoked by the runner for every outcome)
// ---------------------------------------------------------------------------

pub(super) async fn cleanup(ctx: &mut ExecutionContext, services: &Services) {
    let started = std::time::Instant::now();

    // Temporary gates live for exactly one execution
    ctx.temporary_gates.clear();
    ctx.script_outputs.clear();

    let record = ExecutionRecord {
        execution_id: ctx.execution_id.clone(),
        prompt_id: ctx
            .resolved_prompt
            .as_ref()
            .map(|p| p.id.clone())
            .unwrap_or_default(),
        strategy: ctx.plan.as_ref().map(|p| p.strategy),
        duration_ms: ctx.started.elapsed().as_millis() as u64,
        gate_count: ctx.resolved_gates.len(),
        warnings: ctx.diagnostics.count(super::Severity::Warn),
        errors: ctx.diagnostics.count(super::Severity::Error),
        gate_sources: ctx.gates.source_counts(),
    };
    if let Ok(mut ring) = services.analytics.lock() {
        ring.push_back(record);
        while ring.len() > super::ANALYTICS_CAPACITY {
            ring.pop_front();
        }
    }

    ctx.stage_reports.push(super::StageReport {
        name: "post_formatting_cleanup".to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
    });
}

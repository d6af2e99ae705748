//! The prompt execution pipeline: an ordered stage machine over one
//! ephemeral execution context per request.
//!
//! Stages read and write the context, may short-circuit by setting the
//! response, and report their timing to the diagnostic trail. Services are
//! injected once per request; the registry snapshot taken at entry is held
//! for the whole request, so a hot reload mid-flight never changes what a
//! request sees.

pub mod command;
pub mod stages;

use crate::config::Config;
use crate::error::{PromptForgeError, Result};
use crate::frameworks::FrameworkDecision;
use crate::gates::{Gate, GateAccumulator, PendingGateReview, ResolvedGate};
use crate::injection::InjectionPolicy;
use crate::persist::{ArgumentHistory, FrameworkState, GateSystemState, StateStore};
use crate::prompts::Prompt;
use crate::registry::{Registry, ResourceSet};
use crate::scripts::{ExecutionModeService, ScriptRunner};
use crate::sessions::ChainSessionManager;
use async_trait::async_trait;
use command::ParsedCommand;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Severity levels for the diagnostic trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// One diagnostic entry. Never mutated after emission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub stage: String,
    pub message: String,
}

/// Per-request diagnostic collector. Single-owner; no locking needed.
#[derive(Debug, Default)]
pub struct DiagnosticAccumulator {
    entries: Vec<Diagnostic>,
}

impl DiagnosticAccumulator {
    pub fn push(&mut self, severity: Severity, stage: &str, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity,
            stage: stage.to_string(),
            message: message.into(),
        });
    }

    pub fn info(&mut self, stage: &str, message: impl Into<String>) {
        self.push(Severity::Info, stage, message);
    }

    pub fn warn(&mut self, stage: &str, message: impl Into<String>) {
        self.push(Severity::Warn, stage, message);
    }

    pub fn error(&mut self, stage: &str, message: impl Into<String>) {
        self.push(Severity::Error, stage, message);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries.iter().filter(|d| d.severity == severity).count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|d| d.message.contains(needle))
    }
}

/// Per-stage timing report
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageReport {
    pub name: String,
    pub duration_ms: u64,
}

/// Normalized request for the `prompt_engine` tool
#[derive(Debug, Clone, Default)]
pub struct EngineRequest {
    pub command: Option<String>,
    pub chain_id: Option<String>,
    pub user_response: Option<String>,
    pub force_restart: bool,
    pub gate_action: Option<String>,
    pub gate_verdict: Option<String>,
    pub gates: Vec<Value>,
    /// Deprecated provisioning parameters folded into `gates` by stage 1
    pub gate_ids: Vec<String>,
    pub temporary_gates: Vec<Value>,
    /// Client-session framework override
    pub client_framework: Option<String>,
    /// Opaque record forwarded downstream
    pub options: Option<Value>,
    /// Client session identity for argument history
    pub session_id: Option<String>,
}

/// Execution strategy chosen by the planning stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Prompt,
    Template,
    Chain,
}

/// The plan produced by stage 7
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub requires_session: bool,
    /// Ad-hoc chain steps from a `-->` command (empty for configured chains)
    pub command_steps: Vec<command::CommandStep>,
}

/// Metadata about the step being executed this request
#[derive(Debug, Clone)]
pub struct CurrentStep {
    pub number: usize,
    pub prompt_id: String,
    pub args: Map<String, Value>,
}

/// Final payload assembled by the formatting stage
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub text: String,
    pub metadata: Option<Value>,
}

/// Record kept for the analytics ring after each execution
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub prompt_id: String,
    pub strategy: Option<Strategy>,
    pub duration_ms: u64,
    pub gate_count: usize,
    pub warnings: usize,
    pub errors: usize,
    pub gate_sources: HashMap<&'static str, usize>,
}

/// Bounded in-memory record of recent executions
pub type AnalyticsRing = std::sync::Mutex<VecDeque<ExecutionRecord>>;

pub const ANALYTICS_CAPACITY: usize = 64;

/// Services injected into every request
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub sessions: Arc<ChainSessionManager>,
    pub framework_state: Arc<StateStore<FrameworkState>>,
    pub gate_state: Arc<StateStore<GateSystemState>>,
    pub injection: Arc<RwLock<InjectionPolicy>>,
    pub execution_modes: Arc<ExecutionModeService>,
    pub runner: Arc<dyn ScriptRunner>,
    pub argument_history: Arc<ArgumentHistory>,
    pub analytics: Arc<AnalyticsRing>,
}

/// Ephemeral per-request context threaded through every stage.
pub struct ExecutionContext {
    pub execution_id: String,
    pub started: Instant,
    pub cancel: CancellationToken,
    pub request: EngineRequest,

    // Snapshot taken at dependency injection; held for the whole request
    pub snapshot: Option<Arc<ResourceSet>>,
    pub registry_generation: u64,
    pub framework_state: Option<FrameworkState>,
    pub gate_system_enabled: bool,

    pub command: Option<ParsedCommand>,
    pub plan: Option<ExecutionPlan>,
    pub resolved_prompt: Option<Prompt>,

    pub gates: GateAccumulator,
    pub temporary_gates: HashMap<String, Gate>,
    pub resolved_gates: Vec<ResolvedGate>,
    pub explicit_gate_ids: Vec<String>,

    pub framework_decision: Option<FrameworkDecision>,

    pub session_id: Option<String>,
    pub resuming: bool,
    pub pending_review: Option<PendingGateReview>,
    pub current_step: Option<CurrentStep>,
    pub previous_step_output: String,

    /// Guidance blocks prepended to the rendered step, in order
    pub guidance_blocks: Vec<String>,
    pub inject_gate_guidance: bool,

    pub script_outputs: HashMap<String, Value>,
    pub pending_confirmations: Vec<String>,

    pub rendered: Option<String>,
    pub call_to_action: Option<String>,

    pub diagnostics: DiagnosticAccumulator,
    pub stage_reports: Vec<StageReport>,
    pub response: Option<EngineResponse>,
}

impl ExecutionContext {
    pub fn new(request: EngineRequest, cancel: CancellationToken) -> Self {
        Self {
            execution_id: String::new(),
            started: Instant::now(),
            cancel,
            request,
            snapshot: None,
            registry_generation: 0,
            framework_state: None,
            gate_system_enabled: true,
            command: None,
            plan: None,
            resolved_prompt: None,
            gates: GateAccumulator::new(),
            temporary_gates: HashMap::new(),
            resolved_gates: Vec::new(),
            explicit_gate_ids: Vec::new(),
            framework_decision: None,
            session_id: None,
            resuming: false,
            pending_review: None,
            current_step: None,
            previous_step_output: String::new(),
            guidance_blocks: Vec::new(),
            inject_gate_guidance: true,
            script_outputs: HashMap::new(),
            pending_confirmations: Vec::new(),
            rendered: None,
            call_to_action: None,
            diagnostics: DiagnosticAccumulator::default(),
            stage_reports: Vec::new(),
            response: None,
        }
    }

    /// Snapshot accessor; only valid after dependency injection ran.
    pub fn resources(&self) -> Result<&Arc<ResourceSet>> {
        self.snapshot.as_ref().ok_or_else(|| PromptForgeError::Internal {
            message: "resource snapshot not attached; dependency injection did not run".into(),
        })
    }
}

/// One pipeline stage. A stage that sets `ctx.response` short-circuits the
/// rest of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, ctx: &mut ExecutionContext, services: &Services) -> Result<()>;
}

/// Run the full stage list over a context.
///
/// A stage error is recorded on the diagnostic trail and propagated as the
/// structured tool error; the cleanup stage still runs for every outcome so
/// temporary state never leaks across requests.
pub async fn run(
    stages: &[Box<dyn Stage>],
    ctx: &mut ExecutionContext,
    services: &Services,
) -> Result<EngineResponse> {
    let mut failure: Option<PromptForgeError> = None;

    for stage in stages {
        if ctx.response.is_some() {
            break;
        }
        if ctx.cancel.is_cancelled() {
            ctx.diagnostics
                .warn(stage.name(), "request cancelled; aborting pipeline");
            failure = Some(PromptForgeError::Timeout {
                operation: "pipeline".to_string(),
                timeout_ms: ctx.started.elapsed().as_millis() as u64,
            });
            break;
        }

        let started = Instant::now();
        let result = stage.execute(ctx, services).await;
        ctx.stage_reports.push(StageReport {
            name: stage.name().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        if let Err(e) = result {
            ctx.diagnostics.error(stage.name(), e.to_string());
            warn!(stage = stage.name(), error = %e, "stage failed");
            failure = Some(e);
            break;
        }
        debug!(stage = stage.name(), "stage complete");
    }

    // Cleanup always runs, even after a failure or short-circuit.
    stages::cleanup(ctx, services).await;

    if let Some(e) = failure {
        return Err(e);
    }

    ctx.response.take().ok_or_else(|| PromptForgeError::Internal {
        message: "execution produced no response".to_string(),
    })
}

/// Execute one engine request end to end.
pub async fn execute(request: EngineRequest, services: &Services) -> Result<EngineResponse> {
    let cancel = CancellationToken::new();
    let mut ctx = ExecutionContext::new(request, cancel);
    let stages = stages::build_pipeline();
    run(&stages, &mut ctx, services).await
}

//! Gate system: definitions, source-priority accumulation, activation,
//! guidance rendering, verdict parsing, and the self-review retry machine.

use crate::error::{PromptForgeError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Classification of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateType {
    #[default]
    Validation,
    Guidance,
}

/// Severity attached to quick gates supplied via the `gates` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateSeverity {
    Low,
    #[default]
    Medium,
    High,
}

/// When a gate activates on its own
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateActivation {
    #[serde(default)]
    pub prompt_categories: Vec<String>,
    #[serde(default)]
    pub framework_context: Vec<String>,
    #[serde(default)]
    pub explicit_request: bool,
}

/// Retry behavior after a FAIL verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default)]
    pub preserve_context: bool,
}

/// A validation or guidance gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    /// Derived from the directory name by the loader; may be omitted in the file
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub gate_type: GateType,
    #[serde(default)]
    pub severity: GateSeverity,
    #[serde(default)]
    pub guidance: String,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub pass_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<GateActivation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    /// Steps a request-supplied gate applies to; empty means all
    #[serde(default)]
    pub apply_to_steps: Vec<usize>,
}

impl Gate {
    /// A gate tied to one or more frameworks only fires under those frameworks.
    pub fn is_framework_gate(&self) -> bool {
        self.activation
            .as_ref()
            .is_some_and(|a| !a.framework_context.is_empty())
    }
}

/// Where a gate id was collected from. Ordering is by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSource {
    InlineOperator,
    ClientSelection,
    TemporaryRequest,
    PromptConfig,
    ChainLevel,
    Methodology,
    RegistryAuto,
}

impl GateSource {
    pub fn priority(&self) -> u8 {
        match self {
            GateSource::InlineOperator => 100,
            GateSource::ClientSelection => 90,
            GateSource::TemporaryRequest => 80,
            GateSource::PromptConfig => 60,
            GateSource::ChainLevel => 50,
            GateSource::Methodology => 40,
            GateSource::RegistryAuto => 20,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GateSource::InlineOperator => "inline-operator",
            GateSource::ClientSelection => "client-selection",
            GateSource::TemporaryRequest => "temporary-request",
            GateSource::PromptConfig => "prompt-config",
            GateSource::ChainLevel => "chain-level",
            GateSource::Methodology => "methodology",
            GateSource::RegistryAuto => "registry-auto",
        }
    }
}

/// Per-request gate collector. Single owner (the execution context), so no
/// locking; resolution keeps the highest-priority source per id.
#[derive(Debug, Default)]
pub struct GateAccumulator {
    entries: HashMap<String, GateSource>,
    order: Vec<String>,
}

impl GateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, source: GateSource) {
        let id = id.into();
        match self.entries.get(&id) {
            Some(existing) if existing.priority() >= source.priority() => {}
            Some(_) => {
                self.entries.insert(id, source);
            }
            None => {
                self.entries.insert(id.clone(), source);
                self.order.push(id);
            }
        }
    }

    pub fn add_all<I, S>(&mut self, ids: I, source: GateSource)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.add(id, source);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Winning (id, source) pairs in first-seen order.
    pub fn resolved(&self) -> Vec<(String, GateSource)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|s| (id.clone(), *s)))
            .collect()
    }

    /// How many winning entries each source contributed.
    pub fn source_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for source in self.entries.values() {
            *counts.entry(source.label()).or_insert(0) += 1;
        }
        counts
    }
}

/// A gate definition paired with the source that won it a slot.
#[derive(Debug, Clone)]
pub struct ResolvedGate {
    pub gate: Gate,
    pub source: GateSource,
}

/// Context fed to the activation predicate.
pub struct ActivationContext<'a> {
    pub prompt_category: &'a str,
    pub active_framework: Option<&'a str>,
    pub explicit_request_ids: &'a [String],
}

/// Resolve accumulated ids into gate definitions.
///
/// Unknown ids are dropped with a warning string (for the diagnostic trail),
/// inactive gates are dropped unless explicitly requested, and framework
/// gates are kept only when their framework is the active one.
pub fn resolve_gates<F>(
    accumulator: &GateAccumulator,
    lookup: F,
    temporary: &HashMap<String, Gate>,
    ctx: &ActivationContext<'_>,
) -> (Vec<ResolvedGate>, Vec<String>)
where
    F: Fn(&str) -> Option<Gate>,
{
    let mut warnings = Vec::new();
    let mut inline: Vec<ResolvedGate> = Vec::new();
    let mut regular: Vec<ResolvedGate> = Vec::new();

    for (id, source) in accumulator.resolved() {
        let gate = temporary.get(&id).cloned().or_else(|| lookup(&id));
        let Some(gate) = gate else {
            warnings.push(format!("unknown gate '{}' (from {})", id, source.label()));
            continue;
        };

        let explicitly_requested = ctx.explicit_request_ids.contains(&gate.id)
            || matches!(
                source,
                GateSource::InlineOperator | GateSource::TemporaryRequest
            );

        if gate.is_framework_gate() {
            // Strict: no active framework means no framework gates at all.
            let Some(active) = ctx.active_framework else {
                continue;
            };
            let applies = gate
                .activation
                .as_ref()
                .is_some_and(|a| a.framework_context.iter().any(|f| f.eq_ignore_ascii_case(active)));
            if !applies {
                continue;
            }
        } else if let Some(activation) = &gate.activation {
            let category_ok = activation.prompt_categories.is_empty()
                || activation
                    .prompt_categories
                    .iter()
                    .any(|c| c == ctx.prompt_category);
            let explicit_only = activation.explicit_request;
            let active = if explicit_only {
                explicitly_requested
            } else {
                category_ok
            };
            if !active && !explicitly_requested {
                continue;
            }
        }

        let resolved = ResolvedGate { gate, source };
        if matches!(
            source,
            GateSource::InlineOperator | GateSource::TemporaryRequest
        ) {
            inline.push(resolved);
        } else {
            regular.push(resolved);
        }
    }

    // Inline gates render ahead of everything else.
    inline.extend(regular);
    (inline, warnings)
}

/// Render the gate-guidance block injected ahead of a prompt.
pub fn render_guidance(gates: &[ResolvedGate]) -> String {
    if gates.is_empty() {
        return String::new();
    }

    let mut out = String::from("## Quality Gates\n\n");
    out.push_str(
        "Review your response against each gate below before replying. \
         Finish with a verdict line: `GATE_REVIEW: PASS - <reason>` or \
         `GATE_REVIEW: FAIL - <reason>`.\n\n",
    );
    for resolved in gates {
        let gate = &resolved.gate;
        out.push_str(&format!("### {} ({})\n", gate.name, gate.id));
        if !gate.guidance.is_empty() {
            out.push_str(&gate.guidance);
            out.push('\n');
        }
        if !gate.criteria.is_empty() {
            out.push_str("Criteria:\n");
            for criterion in &gate.criteria {
                out.push_str(&format!("- {}\n", criterion));
            }
        }
        if !gate.pass_criteria.is_empty() {
            out.push_str("Pass when:\n");
            for criterion in &gate.pass_criteria {
                out.push_str(&format!("- {}\n", criterion));
            }
        }
        out.push('\n');
    }
    out
}

/// Build an ephemeral gate from inline `::"criteria"` text.
pub fn temporary_gate_from_criteria(criteria: &str) -> Gate {
    let id = format!("inline-{}", uuid::Uuid::new_v4().simple());
    Gate {
        id,
        name: "Inline gate".to_string(),
        gate_type: GateType::Validation,
        severity: GateSeverity::Medium,
        guidance: String::new(),
        criteria: vec![criteria.to_string()],
        pass_criteria: vec![],
        activation: None,
        retry_config: None,
        apply_to_steps: vec![],
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Parsed self-review verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

pub const VERDICT_GRAMMAR: &str = "GATE_REVIEW: PASS|FAIL - <reason>";

static VERDICT_RE: Lazy<Regex> = Lazy::new(|| {
    // Canonical and accepted shorthand forms:
    //   GATE_REVIEW: PASS - reason
    //   GATE_REVIEW: FAIL: reason
    //   GATE PASS - reason
    //   PASS - reason
    Regex::new(r"^\s*(?P<prefix>GATE_REVIEW\s*:\s*|GATE\s+)?(?P<verdict>PASS|FAIL)\s*(?:[-:]\s*)?(?P<reason>.*?)\s*$")
        .expect("verdict grammar regex is valid")
});

/// Parse a verdict string against the flexible grammar.
///
/// With `strict`, the `GATE_REVIEW:` prefix is mandatory.
pub fn parse_verdict(text: &str, strict: bool) -> Result<Verdict> {
    let first_line = text.lines().next().unwrap_or_default();
    let caps = VERDICT_RE
        .captures(first_line)
        .ok_or_else(|| grammar_error(text))?;

    if strict {
        let prefix = caps.name("prefix").map(|m| m.as_str()).unwrap_or_default();
        if !prefix.trim_end().trim_end_matches(':').trim_end().eq("GATE_REVIEW") {
            return Err(grammar_error(text));
        }
    }

    let passed = &caps["verdict"] == "PASS";
    let reason = caps["reason"].trim().to_string();
    Ok(Verdict { passed, reason })
}

fn grammar_error(text: &str) -> PromptForgeError {
    PromptForgeError::VerdictGrammar {
        message: format!(
            "could not parse '{}'; expected `{}`",
            text.trim(),
            VERDICT_GRAMMAR
        ),
    }
}

// ---------------------------------------------------------------------------
// Retry state machine
// ---------------------------------------------------------------------------

/// User choice after the retry limit is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Retry,
    Skip,
    Abort,
}

impl std::str::FromStr for GateAction {
    type Err = PromptForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "retry" => Ok(GateAction::Retry),
            "skip" => Ok(GateAction::Skip),
            "abort" => Ok(GateAction::Abort),
            other => Err(PromptForgeError::Validation {
                message: format!(
                    "gate_action must be one of retry|skip|abort, got '{}'",
                    other
                ),
            }),
        }
    }
}

/// A paused self-review recorded on the chain session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingGateReview {
    pub gate_id: String,
    pub gate_name: String,
    /// Step the review belongs to
    pub step_number: usize,
    /// Rendered prompt to re-issue on retry
    pub rendered_prompt: String,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub preserve_context: bool,
}

/// Outcome of feeding a verdict into a pending review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Verdict passed; the chain may advance.
    Pass { reason: String },
    /// Verdict failed with attempts remaining; re-render with retry hints.
    FailRetry { reason: String, attempt: u32 },
    /// Attempts exhausted; the user must choose a gate_action.
    FailExceeded { reason: String },
}

/// Advance the retry state machine with a parsed verdict.
pub fn apply_verdict(review: &PendingGateReview, verdict: &Verdict) -> ReviewOutcome {
    if verdict.passed {
        return ReviewOutcome::Pass {
            reason: verdict.reason.clone(),
        };
    }
    let next_attempt = review.attempt + 1;
    if next_attempt < review.max_attempts {
        ReviewOutcome::FailRetry {
            reason: verdict.reason.clone(),
            attempt: next_attempt,
        }
    } else {
        ReviewOutcome::FailExceeded {
            reason: verdict.reason.clone(),
        }
    }
}

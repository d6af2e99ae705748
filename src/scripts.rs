//! Script-tool detection and execution gating.
//!
//! The subprocess runtime itself lives behind the [`ScriptRunner`] trait;
//! this module owns the declarative tool model, schema-driven detection,
//! and the execution-mode service that decides what actually runs.

use crate::error::{PromptForgeError, Result};
use crate::prompts::ArgType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// When a script tool is considered for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptTrigger {
    /// Only when the user names the tool (`tool=<id>`)
    Explicit,
    /// When user args satisfy the tool's schema
    #[default]
    SchemaMatch,
    Always,
    Never,
}

/// One declared script parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptParam {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: ArgType,
    #[serde(default)]
    pub required: bool,
}

fn default_param_type() -> ArgType {
    ArgType::String
}

/// A per-prompt script tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptTool {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger: ScriptTrigger,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub strict: bool,
    /// Detection confidence floor in [0, 1]
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_message: Option<String>,
    #[serde(default)]
    pub params: Vec<ScriptParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Tool id to invoke with this tool's output, when declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_execute: Option<String>,
}

/// Why a detection matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExplicitRequest,
    SchemaMatch,
    AlwaysTrigger,
}

/// A candidate execution produced by detection
#[derive(Debug, Clone)]
pub struct DetectionMatch {
    pub tool_id: String,
    pub priority: u8,
    pub match_reason: MatchReason,
    pub extracted_inputs: Map<String, Value>,
    pub requires_confirmation: bool,
    pub explicit_request: bool,
}

/// Match user args against one tool's schema.
///
/// Strict tools require every declared param present with the right type and
/// tolerate no unknown keys; non-strict tools accept partial input as long
/// as required params are satisfied and the confidence floor is met.
pub fn detect(
    tool: &ScriptTool,
    args: &Map<String, Value>,
    explicit_tool: Option<&str>,
) -> Option<DetectionMatch> {
    let explicit = explicit_tool == Some(tool.id.as_str());

    match tool.trigger {
        ScriptTrigger::Never => return None,
        ScriptTrigger::Explicit if !explicit => return None,
        _ => {}
    }

    if explicit {
        let extracted = extract_inputs(tool, args);
        return Some(DetectionMatch {
            tool_id: tool.id.clone(),
            priority: 100,
            match_reason: MatchReason::ExplicitRequest,
            extracted_inputs: extracted,
            requires_confirmation: tool.confirm,
            explicit_request: true,
        });
    }

    if tool.trigger == ScriptTrigger::Always {
        return Some(DetectionMatch {
            tool_id: tool.id.clone(),
            priority: 60,
            match_reason: MatchReason::AlwaysTrigger,
            extracted_inputs: extract_inputs(tool, args),
            requires_confirmation: tool.confirm,
            explicit_request: false,
        });
    }

    // Schema match
    if tool.params.is_empty() {
        return None;
    }
    let mut present = 0usize;
    for param in &tool.params {
        match args.get(&param.name) {
            Some(value) if type_matches(param.param_type, value) => present += 1,
            Some(_) => return None,
            None if param.required => return None,
            None => {}
        }
    }
    if tool.strict {
        let declared: std::collections::HashSet<&str> =
            tool.params.iter().map(|p| p.name.as_str()).collect();
        if args.keys().any(|k| !declared.contains(k.as_str())) {
            return None;
        }
        if present != tool.params.len() {
            return None;
        }
    }
    let confidence = present as f64 / tool.params.len() as f64;
    if confidence < tool.confidence {
        return None;
    }

    Some(DetectionMatch {
        tool_id: tool.id.clone(),
        priority: (confidence * 80.0) as u8,
        match_reason: MatchReason::SchemaMatch,
        extracted_inputs: extract_inputs(tool, args),
        requires_confirmation: tool.confirm,
        explicit_request: false,
    })
}

fn type_matches(expected: ArgType, value: &Value) -> bool {
    match expected {
        ArgType::String => value.is_string(),
        ArgType::Number => value.is_number(),
        ArgType::Boolean => value.is_boolean(),
        ArgType::Array => value.is_array(),
        ArgType::Object => value.is_object(),
    }
}

fn extract_inputs(tool: &ScriptTool, args: &Map<String, Value>) -> Map<String, Value> {
    let mut inputs = Map::new();
    for param in &tool.params {
        if let Some(value) = args.get(&param.name) {
            inputs.insert(param.name.clone(), value.clone());
        }
    }
    inputs
}

/// Canonical form of (tool, inputs) used for confirmation and cache keys.
pub fn canonical_key(tool_id: &str, inputs: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = inputs.iter().collect();
    format!(
        "{}::{}",
        tool_id,
        serde_json::to_string(&sorted).unwrap_or_default()
    )
}

/// Partitioned detection matches
#[derive(Debug, Default)]
pub struct ExecutionPartition {
    pub ready: Vec<DetectionMatch>,
    pub pending_confirmation: Vec<DetectionMatch>,
    pub skipped: Vec<DetectionMatch>,
}

/// Tracks confirmation handshakes: a tool that required confirmation runs on
/// the next identical invocation, once, within the TTL.
pub struct ExecutionModeService {
    ttl: Duration,
    pending: Mutex<HashMap<String, Instant>>,
}

impl ExecutionModeService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Partition matches into ready / pending_confirmation / skipped.
    ///
    /// A match with `requires_confirmation` consumes a prior pending entry
    /// with identical inputs (single-use) and becomes ready; otherwise it is
    /// recorded as pending for the follow-up request.
    pub async fn partition(&self, matches: Vec<DetectionMatch>) -> ExecutionPartition {
        let mut out = ExecutionPartition::default();
        let mut pending = self.pending.lock().await;
        let now = Instant::now();
        pending.retain(|_, granted| now.duration_since(*granted) < self.ttl);

        let mut approved_one = false;
        for m in matches {
            if m.match_reason == MatchReason::SchemaMatch && m.priority == 0 {
                out.skipped.push(m);
                continue;
            }
            if !m.requires_confirmation {
                out.ready.push(m);
                continue;
            }
            let key = canonical_key(&m.tool_id, &m.extracted_inputs);
            if !approved_one && pending.remove(&key).is_some() {
                approved_one = true;
                out.ready.push(m);
            } else {
                pending.insert(key, now);
                out.pending_confirmation.push(m);
            }
        }
        out
    }
}

/// Outcome of one shell verification command.
#[derive(Debug, Clone)]
pub struct ShellOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutcome {
    /// Exit 0 is PASS, anything else is FAIL.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam to the out-of-scope subprocess runtime.
#[async_trait::async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run a script tool and return its JSON output.
    async fn run_tool(&self, tool: &ScriptTool, inputs: &Map<String, Value>) -> Result<Value>;

    /// Run a shell verification command.
    async fn run_shell(&self, command: &str, timeout: Duration) -> Result<ShellOutcome>;
}

/// Runner that refuses everything; installed when no runtime is wired up.
pub struct DisabledScriptRunner;

#[async_trait::async_trait]
impl ScriptRunner for DisabledScriptRunner {
    async fn run_tool(&self, tool: &ScriptTool, _inputs: &Map<String, Value>) -> Result<Value> {
        Err(PromptForgeError::Script {
            message: format!("script runtime is not available (tool '{}')", tool.id),
        })
    }

    async fn run_shell(&self, command: &str, _timeout: Duration) -> Result<ShellOutcome> {
        Err(PromptForgeError::Script {
            message: format!("script runtime is not available (command '{}')", command),
        })
    }
}

pub mod testing {
    //! A recording stub runner for tests (unit and integration).

    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct StubScriptRunner {
        outputs: StdMutex<HashMap<String, Value>>,
        pub calls: StdMutex<Vec<String>>,
    }

    impl StubScriptRunner {
        pub fn with_output(tool_id: &str, output: Value) -> Self {
            let stub = Self::default();
            stub.outputs
                .lock()
                .unwrap()
                .insert(tool_id.to_string(), output);
            stub
        }

        pub fn set_output(&self, tool_id: &str, output: Value) {
            self.outputs
                .lock()
                .unwrap()
                .insert(tool_id.to_string(), output);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ScriptRunner for StubScriptRunner {
        async fn run_tool(&self, tool: &ScriptTool, inputs: &Map<String, Value>) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push(canonical_key(&tool.id, inputs));
            self.outputs
                .lock()
                .unwrap()
                .get(&tool.id)
                .cloned()
                .ok_or_else(|| PromptForgeError::Script {
                    message: format!("stub has no output for '{}'", tool.id),
                })
        }

        async fn run_shell(&self, command: &str, _timeout: Duration) -> Result<ShellOutcome> {
            self.calls.lock().unwrap().push(format!("shell::{command}"));
            Ok(ShellOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> ScriptTool {
        ScriptTool {
            id: "word_count".to_string(),
            description: String::new(),
            trigger: ScriptTrigger::SchemaMatch,
            confirm: false,
            strict: false,
            confidence: 0.5,
            confirm_message: None,
            params: vec![
                ScriptParam {
                    name: "text".to_string(),
                    param_type: ArgType::String,
                    required: true,
                },
                ScriptParam {
                    name: "mode".to_string(),
                    param_type: ArgType::String,
                    required: false,
                },
            ],
            timeout_ms: None,
            auto_execute: None,
        }
    }

    #[test]
    fn schema_match_requires_required_params() {
        let t = tool();
        let mut args = Map::new();
        assert!(detect(&t, &args, None).is_none());

        args.insert("text".to_string(), json!("hello"));
        let m = detect(&t, &args, None).unwrap();
        assert_eq!(m.match_reason, MatchReason::SchemaMatch);
        assert_eq!(m.extracted_inputs.len(), 1);
    }

    #[test]
    fn wrong_type_disqualifies() {
        let t = tool();
        let mut args = Map::new();
        args.insert("text".to_string(), json!(42));
        assert!(detect(&t, &args, None).is_none());
    }

    #[test]
    fn strict_rejects_unknown_keys() {
        let mut t = tool();
        t.strict = true;
        let mut args = Map::new();
        args.insert("text".to_string(), json!("hi"));
        args.insert("mode".to_string(), json!("fast"));
        args.insert("extra".to_string(), json!(true));
        assert!(detect(&t, &args, None).is_none());
    }

    #[test]
    fn explicit_request_overrides_trigger() {
        let mut t = tool();
        t.trigger = ScriptTrigger::Explicit;
        let args = Map::new();
        assert!(detect(&t, &args, None).is_none());
        let m = detect(&t, &args, Some("word_count")).unwrap();
        assert!(m.explicit_request);
        assert_eq!(m.priority, 100);
    }

    #[tokio::test]
    async fn confirmation_auto_approves_identical_rerun_once() {
        let service = ExecutionModeService::new(Duration::from_secs(60));
        let mut t = tool();
        t.confirm = true;
        let mut args = Map::new();
        args.insert("text".to_string(), json!("hello"));

        let m = detect(&t, &args, None).unwrap();
        let first = service.partition(vec![m.clone()]).await;
        assert_eq!(first.pending_confirmation.len(), 1);
        assert!(first.ready.is_empty());

        let second = service.partition(vec![m.clone()]).await;
        assert_eq!(second.ready.len(), 1);
        assert!(second.pending_confirmation.is_empty());

        // Approval was single-use; a third run pends again
        let third = service.partition(vec![m]).await;
        assert_eq!(third.pending_confirmation.len(), 1);
    }
}

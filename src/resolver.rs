//! Reference pre-resolution: expands `{{ref:<prompt_id>}}` and
//! `{{script:<tool_id>[.field][ k=v ...]}}` before the template engine runs.
//!
//! Ref expansion is a guarded recursion over prompt templates with a cycle
//! set and a configurable depth cap; script expansion runs afterwards over
//! the flattened text, so script outputs are treated as data and never
//! re-scanned for further references.

use crate::error::{PromptForgeError, Result};
use crate::prompts::Prompt;
use crate::scripts::{canonical_key, ScriptRunner, ScriptTool};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;

static REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*ref:([A-Za-z0-9_\-/]+)\s*\}\}").expect("ref regex is valid")
});

static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\{\{\s*script:([A-Za-z0-9_\-]+)(?:\.([A-Za-z0-9_]+))?((?:\s+[A-Za-z0-9_]+=(?:'[^']*'|[^\s}]+))*)\s*\}\}",
    )
    .expect("script regex is valid")
});

static INLINE_ARG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9_]+)=(?:'([^']*)'|([^\s}]+))").expect("inline arg regex is valid")
});

/// Diagnostics for one resolution pass
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    pub resolution_time_ms: u64,
    pub references_resolved: usize,
    /// Ordered set of prompt ids expanded along the way
    pub resolved_prompt_ids: Vec<String>,
    pub warnings: Vec<String>,
}

/// Output of [`Resolver::resolve`]
#[derive(Debug, Clone)]
pub struct Resolution {
    pub text: String,
    pub report: ResolutionReport,
}

/// One-request resolver. The script cache lives for the life of the value,
/// so the same `{{script:..}}` reference resolves once per request.
pub struct Resolver<'a> {
    lookup: &'a (dyn Fn(&str) -> Option<Prompt> + Send + Sync),
    scripts: &'a HashMap<String, ScriptTool>,
    runner: &'a dyn ScriptRunner,
    max_depth: usize,
    lenient: bool,
    script_cache: HashMap<String, Value>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        lookup: &'a (dyn Fn(&str) -> Option<Prompt> + Send + Sync),
        scripts: &'a HashMap<String, ScriptTool>,
        runner: &'a dyn ScriptRunner,
        max_depth: usize,
        lenient: bool,
    ) -> Self {
        Self {
            lookup,
            scripts,
            runner,
            max_depth,
            lenient,
            script_cache: HashMap::new(),
        }
    }

    /// Fully resolve a template owned by `root_id`.
    pub async fn resolve(
        &mut self,
        root_id: &str,
        template: &str,
        args: &Map<String, Value>,
    ) -> Result<Resolution> {
        let started = Instant::now();
        let mut report = ResolutionReport::default();
        let mut chain = vec![root_id.to_string()];

        let expanded = self.expand_refs(template, &mut chain, &mut report)?;
        let finished = self.expand_scripts(&expanded, args, &mut report).await?;

        report.resolution_time_ms = started.elapsed().as_millis() as u64;
        Ok(Resolution {
            text: finished,
            report,
        })
    }

    fn expand_refs(
        &self,
        template: &str,
        chain: &mut Vec<String>,
        report: &mut ResolutionReport,
    ) -> Result<String> {
        if chain.len() > self.max_depth {
            return Err(PromptForgeError::MaxDepthExceeded {
                max: self.max_depth,
                chain: chain.clone(),
            });
        }

        let mut out = String::with_capacity(template.len());
        let mut cursor = 0;

        for caps in REF_RE.captures_iter(template) {
            let whole = caps.get(0).expect("group 0 always present");
            let target_id = &caps[1];
            out.push_str(&template[cursor..whole.start()]);
            cursor = whole.end();

            if chain.iter().any(|seen| seen == target_id) {
                let mut cycle = chain.clone();
                cycle.push(target_id.to_string());
                return Err(PromptForgeError::CircularReference { chain: cycle });
            }

            let Some(target) = (self.lookup)(target_id) else {
                if self.lenient {
                    report
                        .warnings
                        .push(format!("missing reference target '{}'", target_id));
                    continue;
                }
                return Err(PromptForgeError::MissingReference {
                    id: target_id.to_string(),
                });
            };

            chain.push(target_id.to_string());
            let expanded = self.expand_refs(&target.template, chain, report)?;
            chain.pop();

            report.references_resolved += 1;
            if !report.resolved_prompt_ids.iter().any(|id| id == target_id) {
                report.resolved_prompt_ids.push(target_id.to_string());
            }
            out.push_str(&expanded);
        }
        out.push_str(&template[cursor..]);
        Ok(out)
    }

    async fn expand_scripts(
        &mut self,
        text: &str,
        args: &Map<String, Value>,
        report: &mut ResolutionReport,
    ) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;

        // Collect first: captures borrow `text` and execution is async.
        let matches: Vec<(usize, usize, String, Option<String>, String)> = SCRIPT_RE
            .captures_iter(text)
            .map(|caps| {
                let whole = caps.get(0).expect("group 0 always present");
                (
                    whole.start(),
                    whole.end(),
                    caps[1].to_string(),
                    caps.get(2).map(|m| m.as_str().to_string()),
                    caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
                )
            })
            .collect();

        for (start, end, tool_id, field, inline_raw) in matches {
            out.push_str(&text[cursor..start]);
            cursor = end;

            let Some(tool) = self.scripts.get(&tool_id).cloned() else {
                return Err(PromptForgeError::Resolution {
                    kind: "script tool".to_string(),
                    id: tool_id,
                });
            };

            if tool.confirm {
                // Confirmation-gated tools never run inside resolution.
                report.warnings.push(format!(
                    "script '{}' requires confirmation and was skipped during resolution",
                    tool_id
                ));
                continue;
            }

            let mut inputs: Map<String, Value> = Map::new();
            for param in &tool.params {
                if let Some(v) = args.get(&param.name) {
                    inputs.insert(param.name.clone(), v.clone());
                }
            }
            // Inline args override context args for this reference only
            for caps in INLINE_ARG_RE.captures_iter(&inline_raw) {
                let key = caps[1].to_string();
                let value = match (caps.get(2), caps.get(3)) {
                    (Some(quoted), _) => Value::String(quoted.as_str().to_string()),
                    (None, Some(bare)) => parse_bare(bare.as_str()),
                    _ => Value::Null,
                };
                inputs.insert(key, value);
            }

            let key = canonical_key(&tool_id, &inputs);
            let output = match self.script_cache.get(&key) {
                Some(cached) => cached.clone(),
                None => {
                    let produced = self.runner.run_tool(&tool, &inputs).await?;
                    self.script_cache.insert(key, produced.clone());
                    produced
                }
            };
            report.references_resolved += 1;

            let rendered = match &field {
                Some(field_name) => match &output {
                    Value::Object(map) => match map.get(field_name) {
                        Some(value) => value_to_text(value),
                        None => {
                            return Err(PromptForgeError::InvalidFieldAccess {
                                tool_id,
                                field: field_name.clone(),
                            });
                        }
                    },
                    _ => {
                        return Err(PromptForgeError::InvalidScriptOutput {
                            tool_id,
                            message: format!(
                                "field access '.{}' requires an object output",
                                field_name
                            ),
                        });
                    }
                },
                None => value_to_text(&output),
            };
            out.push_str(&rendered);
        }
        out.push_str(&text[cursor..]);
        Ok(out)
    }
}

fn parse_bare(raw: &str) -> Value {
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::testing::StubScriptRunner;
    use crate::scripts::{ScriptParam, ScriptTrigger};
    use serde_json::json;

    fn prompt(id: &str, template: &str) -> Prompt {
        Prompt {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            category: "general".to_string(),
            template: template.to_string(),
            system_message: None,
            arguments: vec![],
            chain_steps: vec![],
            gate_ids: vec![],
            script_tools: vec![],
        }
    }

    fn script_tool(id: &str, confirm: bool) -> ScriptTool {
        ScriptTool {
            id: id.to_string(),
            description: String::new(),
            trigger: ScriptTrigger::SchemaMatch,
            confirm,
            strict: false,
            confidence: 0.0,
            confirm_message: None,
            params: vec![ScriptParam {
                name: "text".to_string(),
                param_type: crate::prompts::ArgType::String,
                required: false,
            }],
            timeout_ms: None,
            auto_execute: None,
        }
    }

    fn lookup_for(prompts: Vec<Prompt>) -> impl Fn(&str) -> Option<Prompt> {
        move |id: &str| prompts.iter().find(|p| p.id == id).cloned()
    }

    #[tokio::test]
    async fn zero_references_leaves_template_unchanged() {
        let lookup = lookup_for(vec![]);
        let scripts = HashMap::new();
        let runner = StubScriptRunner::default();
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let resolution = resolver
            .resolve("root", "plain {{ var }} text", &Map::new())
            .await
            .unwrap();
        assert_eq!(resolution.text, "plain {{ var }} text");
        assert_eq!(resolution.report.references_resolved, 0);
    }

    #[tokio::test]
    async fn nested_refs_expand_in_order() {
        let lookup = lookup_for(vec![
            prompt("outer", "A {{ref:mid}} Z"),
            prompt("mid", "B {{ref:inner}} Y"),
            prompt("inner", "C"),
        ]);
        let scripts = HashMap::new();
        let runner = StubScriptRunner::default();
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let resolution = resolver
            .resolve("root", "{{ref:outer}}", &Map::new())
            .await
            .unwrap();
        assert_eq!(resolution.text, "A B C Y Z");
        assert_eq!(
            resolution.report.resolved_prompt_ids,
            vec!["outer", "mid", "inner"]
        );
    }

    #[tokio::test]
    async fn circular_reference_reports_chain() {
        let lookup = lookup_for(vec![
            prompt("a", "{{ref:b}}"),
            prompt("b", "{{ref:a}} tail"),
        ]);
        let scripts = HashMap::new();
        let runner = StubScriptRunner::default();
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let err = resolver
            .resolve("a", "{{ref:b}}", &Map::new())
            .await
            .unwrap_err();
        match err {
            PromptForgeError::CircularReference { chain } => {
                assert_eq!(chain, vec!["a", "b", "a"]);
            }
            other => panic!("expected CircularReference, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn depth_cap_fails_with_chain() {
        let lookup = lookup_for(vec![
            prompt("p1", "{{ref:p2}}"),
            prompt("p2", "{{ref:p3}}"),
            prompt("p3", "{{ref:p4}}"),
            prompt("p4", "done"),
        ]);
        let scripts = HashMap::new();
        let runner = StubScriptRunner::default();
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 2, false);
        let err = resolver
            .resolve("p1", "{{ref:p2}}", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PromptForgeError::MaxDepthExceeded { .. }));
    }

    #[tokio::test]
    async fn missing_ref_lenient_mode_warns() {
        let lookup = lookup_for(vec![]);
        let scripts = HashMap::new();
        let runner = StubScriptRunner::default();

        let mut strict = Resolver::new(&lookup, &scripts, &runner, 10, false);
        assert!(matches!(
            strict
                .resolve("root", "{{ref:ghost}}", &Map::new())
                .await
                .unwrap_err(),
            PromptForgeError::MissingReference { .. }
        ));

        let mut lenient = Resolver::new(&lookup, &scripts, &runner, 10, true);
        let resolution = lenient
            .resolve("root", "x{{ref:ghost}}y", &Map::new())
            .await
            .unwrap();
        assert_eq!(resolution.text, "xy");
        assert_eq!(resolution.report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn script_results_are_cached_per_request() {
        let lookup = lookup_for(vec![]);
        let mut scripts = HashMap::new();
        scripts.insert("counter".to_string(), script_tool("counter", false));
        let runner = StubScriptRunner::with_output("counter", json!({"count": 7}));
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let resolution = resolver
            .resolve(
                "root",
                "{{script:counter.count}} and {{script:counter.count}}",
                &Map::new(),
            )
            .await
            .unwrap();
        assert_eq!(resolution.text, "7 and 7");
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn field_access_on_non_object_fails() {
        let lookup = lookup_for(vec![]);
        let mut scripts = HashMap::new();
        scripts.insert("raw".to_string(), script_tool("raw", false));
        let runner = StubScriptRunner::with_output("raw", json!("just text"));
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let err = resolver
            .resolve("root", "{{script:raw.field}}", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PromptForgeError::InvalidScriptOutput { .. }));
    }

    #[tokio::test]
    async fn missing_field_fails_with_field_error() {
        let lookup = lookup_for(vec![]);
        let mut scripts = HashMap::new();
        scripts.insert("obj".to_string(), script_tool("obj", false));
        let runner = StubScriptRunner::with_output("obj", json!({"a": 1}));
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let err = resolver
            .resolve("root", "{{script:obj.missing}}", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PromptForgeError::InvalidFieldAccess { .. }));
    }

    #[tokio::test]
    async fn inline_args_override_context_args() {
        let lookup = lookup_for(vec![]);
        let mut scripts = HashMap::new();
        scripts.insert("echo".to_string(), script_tool("echo", false));
        let runner = StubScriptRunner::with_output("echo", json!("ok"));
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);

        let mut args = Map::new();
        args.insert("text".to_string(), json!("from context"));
        resolver
            .resolve("root", "{{script:echo text='inline'}}", &args)
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].contains("inline"), "inline arg should win: {}", calls[0]);
    }

    #[tokio::test]
    async fn confirmation_gated_scripts_skip_with_warning() {
        let lookup = lookup_for(vec![]);
        let mut scripts = HashMap::new();
        scripts.insert("danger".to_string(), script_tool("danger", true));
        let runner = StubScriptRunner::with_output("danger", json!("boom"));
        let mut resolver = Resolver::new(&lookup, &scripts, &runner, 10, false);
        let resolution = resolver
            .resolve("root", "x{{script:danger}}y", &Map::new())
            .await
            .unwrap();
        assert_eq!(resolution.text, "xy");
        assert_eq!(resolution.report.warnings.len(), 1);
        assert_eq!(runner.call_count(), 0);
    }
}

//! Prompt data model: arguments, chain steps, and argument validation.

use crate::error::{PromptForgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared type of a prompt argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ArgType::String => value.is_string(),
            ArgType::Number => value.is_number(),
            ArgType::Boolean => value.is_boolean(),
            ArgType::Array => value.is_array(),
            ArgType::Object => value.is_object(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::Array => "array",
            ArgType::Object => "object",
        }
    }
}

/// Optional string-shape constraints on an argument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgValidation {
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// One declared prompt argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(rename = "type", default = "default_arg_type")]
    pub arg_type: ArgType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ArgValidation>,
}

fn default_arg_type() -> ArgType {
    ArgType::String
}

/// How a chain step decides whether to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalType {
    #[default]
    Always,
    Conditional,
    SkipIfError,
    SkipIfSuccess,
    BranchTo,
    /// Reserved alias of `branch_to`
    SkipTo,
}

/// Conditional-execution descriptor attached to a chain step
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConditionalExecution {
    #[serde(rename = "type", default)]
    pub exec_type: ConditionalType,
    /// Required when `type = "conditional"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Required when `type = "branch_to"` / `"skip_to"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<String>,
}

/// One step of a chain prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub step_number: usize,
    pub prompt_id: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub inline_gate_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_execution: Option<ConditionalExecution>,
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

/// A prompt resource. Presence of `chain_steps` classifies it as a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Derived from the file path by the loader; may be omitted in the file
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    #[serde(default)]
    pub chain_steps: Vec<ChainStep>,
    /// Gate ids attached at the prompt-config level
    #[serde(default)]
    pub gate_ids: Vec<String>,
    /// Per-prompt script tool definitions
    #[serde(default)]
    pub script_tools: Vec<crate::scripts::ScriptTool>,
}

fn default_category() -> String {
    "general".to_string()
}

impl Prompt {
    pub fn is_chain(&self) -> bool {
        !self.chain_steps.is_empty()
    }

    /// Structural validation applied at load time.
    ///
    /// Step prompt-id resolvability is checked by the loader once the full
    /// set is known; this covers the per-prompt invariants.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for arg in &self.arguments {
            if !seen.insert(arg.name.as_str()) {
                return Err(PromptForgeError::Validation {
                    message: format!(
                        "prompt '{}' declares argument '{}' more than once",
                        self.id, arg.name
                    ),
                });
            }
            if let Some(validation) = &arg.validation {
                if let Some(pattern) = &validation.pattern {
                    regex::Regex::new(pattern).map_err(|e| PromptForgeError::Validation {
                        message: format!(
                            "prompt '{}' argument '{}' has invalid pattern: {}",
                            self.id, arg.name, e
                        ),
                    })?;
                }
            }
        }

        for (i, step) in self.chain_steps.iter().enumerate() {
            if step.step_number != i + 1 {
                return Err(PromptForgeError::Validation {
                    message: format!(
                        "prompt '{}' step {} has step_number {}, expected {}",
                        self.id,
                        i,
                        step.step_number,
                        i + 1
                    ),
                });
            }
            if let Some(cond) = &step.conditional_execution {
                if cond.exec_type == ConditionalType::Conditional && cond.expression.is_none() {
                    return Err(PromptForgeError::Validation {
                        message: format!(
                            "prompt '{}' step {} is conditional but has no expression",
                            self.id, step.step_number
                        ),
                    });
                }
                if matches!(
                    cond.exec_type,
                    ConditionalType::BranchTo | ConditionalType::SkipTo
                ) && cond.target_step.is_none()
                {
                    return Err(PromptForgeError::Validation {
                        message: format!(
                            "prompt '{}' step {} branches but names no target step",
                            self.id, step.step_number
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    /// Validate user-supplied args against the declared arguments.
    ///
    /// Failures produce a single-block message with the constraint that was
    /// violated and a ready-to-paste retry command.
    pub fn validate_arguments(&self, args: &Map<String, Value>) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        for arg in &self.arguments {
            let value = args.get(&arg.name);
            let Some(value) = value else {
                if arg.required {
                    problems.push(format!("'{}' is required but missing", arg.name));
                }
                continue;
            };

            if !arg.arg_type.matches(value) {
                problems.push(format!(
                    "'{}' must be a {}",
                    arg.name,
                    arg.arg_type.label()
                ));
                continue;
            }

            if let (Some(validation), Some(text)) = (&arg.validation, value.as_str()) {
                if let Some(min) = validation.min_length {
                    if text.chars().count() < min {
                        problems.push(format!(
                            "'{}' must be at least {} chars (got {})",
                            arg.name,
                            min,
                            text.chars().count()
                        ));
                    }
                }
                if let Some(max) = validation.max_length {
                    if text.chars().count() > max {
                        problems.push(format!(
                            "'{}' must be at most {} chars (got {})",
                            arg.name,
                            max,
                            text.chars().count()
                        ));
                    }
                }
                if let Some(pattern) = &validation.pattern {
                    if let Ok(re) = regex::Regex::new(pattern) {
                        if !re.is_match(text) {
                            problems.push(format!(
                                "'{}' must match pattern {} {}",
                                arg.name,
                                pattern,
                                pattern_example(pattern)
                            ));
                        }
                    }
                }
            }
        }

        if problems.is_empty() {
            return Ok(());
        }

        Err(PromptForgeError::Validation {
            message: format!(
                "Argument Validation Failed for '{}':\n- {}\n\nRetry with:\n```\n{}\n```",
                self.id,
                problems.join("\n- "),
                self.retry_command(args)
            ),
        })
    }

    /// Build a ready-to-paste symbolic command with placeholder values where
    /// arguments were missing or invalid.
    fn retry_command(&self, args: &Map<String, Value>) -> String {
        let mut cmd = format!(">>{}", self.id);
        for arg in &self.arguments {
            let placeholder = match args.get(&arg.name) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                _ => "…".to_string(),
            };
            cmd.push_str(&format!(" {}=\"{}\"", arg.name, placeholder));
        }
        cmd
    }
}

/// A worked example for common patterns, so retry hints are actionable.
fn pattern_example(pattern: &str) -> String {
    if pattern.contains("https?") || pattern.contains("http") {
        "(e.g. \"https://example.com/page\")".to_string()
    } else if pattern.contains("[0-9]") || pattern.contains("\\d") {
        "(e.g. \"42\")".to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prompt_with_min_length() -> Prompt {
        Prompt {
            id: "summarize".to_string(),
            name: "Summarize".to_string(),
            description: String::new(),
            category: "general".to_string(),
            template: "Summarize {{topic}}".to_string(),
            system_message: None,
            arguments: vec![PromptArgument {
                name: "topic".to_string(),
                arg_type: ArgType::String,
                required: true,
                description: None,
                validation: Some(ArgValidation {
                    min_length: Some(10),
                    max_length: None,
                    pattern: None,
                }),
            }],
            chain_steps: vec![],
            gate_ids: vec![],
            script_tools: vec![],
        }
    }

    #[test]
    fn short_argument_yields_retry_block() {
        let prompt = prompt_with_min_length();
        let mut args = Map::new();
        args.insert("topic".to_string(), json!("ai"));
        let err = prompt.validate_arguments(&args).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Argument Validation Failed"));
        assert!(message.contains("topic"));
        assert!(message.contains("at least 10 chars"));
        assert!(message.contains(">>summarize topic=\""));
    }

    #[test]
    fn duplicate_argument_names_rejected() {
        let mut prompt = prompt_with_min_length();
        prompt.arguments.push(PromptArgument {
            name: "topic".to_string(),
            arg_type: ArgType::String,
            required: false,
            description: None,
            validation: None,
        });
        assert!(prompt.validate().is_err());
    }

    #[test]
    fn step_numbers_must_be_sequential() {
        let mut prompt = prompt_with_min_length();
        prompt.chain_steps = vec![ChainStep {
            step_number: 2,
            prompt_id: "other".to_string(),
            args: Map::new(),
            inline_gate_ids: vec![],
            conditional_execution: None,
            dependencies: vec![],
        }];
        assert!(prompt.validate().is_err());
    }

    #[test]
    fn conditional_without_expression_rejected() {
        let mut prompt = prompt_with_min_length();
        prompt.chain_steps = vec![ChainStep {
            step_number: 1,
            prompt_id: "other".to_string(),
            args: Map::new(),
            inline_gate_ids: vec![],
            conditional_execution: Some(ConditionalExecution {
                exec_type: ConditionalType::Conditional,
                expression: None,
                target_step: None,
            }),
            dependencies: vec![],
        }];
        assert!(prompt.validate().is_err());
    }
}

//! Command parsing for the `prompt_engine` tool.
//!
//! Three accepted formats:
//! - symbolic: `>>summarize topic="ai" @ReACT %lean ::"cite sources"`
//! - JSON object: `{"prompt_id": "summarize", "args": {"topic": "ai"}}`
//! - key=value: `summarize topic="ai"`
//!
//! Chained steps use `-->`, repetition `* N`, and shell verification
//! `:: verify:"cargo test" :fast`.

use crate::error::{PromptForgeError, Result};
use crate::frameworks::FrameworkModifier;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// How the command was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFormat {
    Symbolic,
    Json,
    KeyValue,
    BareId,
}

/// Shell verification presets (`:fast`, `:full`, `:extended`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellVerification {
    pub command: String,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub loop_until_pass: bool,
}

impl ShellVerification {
    fn with_preset(command: String, preset: &str) -> Option<Self> {
        let (max_attempts, timeout_secs) = match preset {
            "fast" => (1, 30),
            "full" => (5, 300),
            "extended" => (10, 600),
            _ => return None,
        };
        Some(Self {
            command,
            max_attempts,
            timeout_secs,
            loop_until_pass: false,
        })
    }
}

/// One step of a (possibly chained) command
#[derive(Debug, Clone)]
pub struct CommandStep {
    pub prompt_id: String,
    pub args: Map<String, Value>,
}

/// Fully parsed command
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub prompt_id: String,
    pub args: Map<String, Value>,
    /// Additional steps when the command chains prompts with `-->`
    pub steps: Vec<CommandStep>,
    pub modifiers: Vec<FrameworkModifier>,
    /// `%judge` modifier
    pub judge: bool,
    /// `@Framework` operator
    pub operator_framework: Option<String>,
    /// Registered gate ids referenced inline (`::gate_id`)
    pub inline_gate_ids: Vec<String>,
    /// Quoted inline criteria (`::"..."`), each becoming a temporary gate
    pub inline_gate_criteria: Vec<String>,
    pub shell_verification: Option<ShellVerification>,
    /// `tool=<id>` explicit script-tool request
    pub explicit_tool: Option<String>,
    /// Resume token recognized inside the command text
    pub chain_uri: Option<String>,
    pub format: CommandFormat,
    pub confidence: f32,
}

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_\-]+(?:/[a-z0-9_\-]+)*$").expect("slug regex is valid"));

static CHAIN_URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^chain-[a-z0-9_\-/]+(?:#\d+)?$").expect("chain uri regex is valid"));

/// Parse a raw command string.
pub fn parse(raw: &str) -> Result<ParsedCommand> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PromptForgeError::Validation {
            message: "command is empty".to_string(),
        });
    }

    if trimmed.starts_with('{') {
        return parse_json(trimmed);
    }

    let tokens = tokenize(trimmed)?;
    parse_tokens(&tokens, trimmed)
}

fn parse_json(raw: &str) -> Result<ParsedCommand> {
    let value: Value = serde_json::from_str(raw).map_err(|e| PromptForgeError::Validation {
        message: format!("malformed JSON command: {}", e),
    })?;
    let obj = value.as_object().ok_or_else(|| PromptForgeError::Validation {
        message: "JSON command must be an object".to_string(),
    })?;

    let prompt_id = obj
        .get("prompt_id")
        .or_else(|| obj.get("id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| PromptForgeError::Validation {
            message: "JSON command needs a 'prompt_id' field".to_string(),
        })?
        .to_string();

    let args = obj
        .get("args")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let operator_framework = obj
        .get("framework")
        .and_then(|v| v.as_str())
        .map(String::from);

    Ok(ParsedCommand {
        prompt_id,
        explicit_tool: args.get("tool").and_then(|v| v.as_str()).map(String::from),
        args,
        steps: Vec::new(),
        modifiers: Vec::new(),
        judge: false,
        operator_framework,
        inline_gate_ids: Vec::new(),
        inline_gate_criteria: Vec::new(),
        shell_verification: None,
        chain_uri: None,
        format: CommandFormat::Json,
        confidence: 1.0,
    })
}

/// A token in the symbolic grammar
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// `>>id` or `/id`
    StepStart(String),
    /// `-->`
    ChainArrow,
    /// `key=value` (value already unquoted)
    Arg(String, String),
    /// `@Framework`
    Operator(String),
    /// `%clean` etc.
    Modifier(String),
    /// `::"criteria"` or `::gate_id`
    InlineGate(String, bool), // (text, quoted)
    /// `:: verify:"cmd"` payload
    Verify(String),
    /// `:fast` / `:full` / `:extended`
    Preset(String),
    /// `max:N` / `timeout:N` / `loop:true`
    Option(String, String),
    /// `*` or `*N`
    Repeat(Option<usize>),
    /// anything else
    Word(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        // Skip whitespace
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let start = i;
        let mut word = String::new();
        let mut in_quote: Option<char> = None;
        while i < chars.len() {
            let c = chars[i];
            match in_quote {
                Some(q) => {
                    word.push(c);
                    if c == q {
                        in_quote = None;
                    }
                    i += 1;
                }
                None => {
                    if c.is_whitespace() {
                        break;
                    }
                    if c == '"' || c == '\'' {
                        in_quote = Some(c);
                    }
                    word.push(c);
                    i += 1;
                }
            }
        }
        if in_quote.is_some() {
            return Err(PromptForgeError::Validation {
                message: format!("unterminated quote starting near byte {}", start),
            });
        }

        // `:: "criteria"` and `:: verify:".."` are accepted with a space
        if word == "::" {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            let mut next = String::new();
            let mut in_quote: Option<char> = None;
            while i < chars.len() {
                let c = chars[i];
                match in_quote {
                    Some(q) => {
                        next.push(c);
                        if c == q {
                            in_quote = None;
                        }
                        i += 1;
                    }
                    None => {
                        if c.is_whitespace() {
                            break;
                        }
                        if c == '"' || c == '\'' {
                            in_quote = Some(c);
                        }
                        next.push(c);
                        i += 1;
                    }
                }
            }
            word.push_str(&next);
        }

        tokens.push(classify(&word)?);
    }

    Ok(tokens)
}

fn unquote(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_string()
    }
}

fn classify(word: &str) -> Result<Token> {
    if word == "-->" {
        return Ok(Token::ChainArrow);
    }
    if let Some(id) = word.strip_prefix(">>") {
        return Ok(Token::StepStart(id.to_string()));
    }
    if word == "*" {
        return Ok(Token::Repeat(None));
    }
    if let Some(n) = word.strip_prefix('*') {
        if let Ok(count) = n.parse::<usize>() {
            return Ok(Token::Repeat(Some(count)));
        }
    }
    if let Some(op) = word.strip_prefix('@') {
        return Ok(Token::Operator(op.to_string()));
    }
    if let Some(modifier) = word.strip_prefix('%') {
        return Ok(Token::Modifier(modifier.to_string()));
    }
    if let Some(rest) = word.strip_prefix("::") {
        if rest.is_empty() {
            // bare `::` ahead of a separate quoted token is not accepted
            return Err(PromptForgeError::Validation {
                message: "'::' must be followed by quoted criteria or a gate id".to_string(),
            });
        }
        if let Some(cmd) = rest.strip_prefix("verify:") {
            return Ok(Token::Verify(unquote(cmd)));
        }
        if rest.starts_with('"') || rest.starts_with('\'') {
            return Ok(Token::InlineGate(unquote(rest), true));
        }
        return Ok(Token::InlineGate(rest.to_string(), false));
    }
    if let Some(preset) = word.strip_prefix(':') {
        if matches!(preset, "fast" | "full" | "extended") {
            return Ok(Token::Preset(preset.to_string()));
        }
    }
    if let Some((key, value)) = word.split_once(':') {
        if matches!(key, "max" | "timeout" | "loop") {
            return Ok(Token::Option(key.to_string(), value.to_string()));
        }
    }
    if let Some((key, value)) = word.split_once('=') {
        if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Ok(Token::Arg(key.to_string(), unquote(value)));
        }
    }
    if let Some(id) = word.strip_prefix('/') {
        return Ok(Token::StepStart(id.to_string()));
    }
    Ok(Token::Word(word.to_string()))
}

fn arg_value(raw: &str) -> Value {
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

fn parse_tokens(tokens: &[Token], raw: &str) -> Result<ParsedCommand> {
    let mut steps: Vec<CommandStep> = Vec::new();
    let mut current: Option<CommandStep> = None;
    let mut modifiers: Vec<FrameworkModifier> = Vec::new();
    let mut judge = false;
    let mut operator_framework: Option<String> = None;
    let mut inline_gate_ids = Vec::new();
    let mut inline_gate_criteria = Vec::new();
    let mut shell_verification: Option<ShellVerification> = None;
    let mut explicit_tool: Option<String> = None;
    let mut chain_uri: Option<String> = None;
    let mut repeat: usize = 1;
    let mut format = CommandFormat::Symbolic;
    let mut saw_step_marker = false;
    let mut pending_repeat_count = false;

    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        match token {
            Token::StepStart(id) => {
                saw_step_marker = true;
                if let Some(step) = current.take() {
                    steps.push(step);
                }
                current = Some(CommandStep {
                    prompt_id: id.clone(),
                    args: Map::new(),
                });
            }
            Token::ChainArrow => {
                if current.is_none() {
                    return Err(PromptForgeError::Validation {
                        message: "'-->' must follow a step".to_string(),
                    });
                }
                if let Some(step) = current.take() {
                    steps.push(step);
                }
                // Every chained step needs its own prompt-id prefix
                match iter.peek() {
                    Some(Token::StepStart(_)) => {}
                    _ => {
                        return Err(PromptForgeError::Validation {
                            message:
                                "every chained step needs a prompt-id prefix ('>>' or '/')"
                                    .to_string(),
                        });
                    }
                }
            }
            Token::Arg(key, value) => {
                if key == "tool" {
                    explicit_tool = Some(value.clone());
                }
                match current.as_mut() {
                    Some(step) => {
                        step.args.insert(key.clone(), arg_value(value));
                    }
                    None => {
                        return Err(PromptForgeError::Validation {
                            message: format!(
                                "argument '{}' appears before any prompt id",
                                key
                            ),
                        });
                    }
                }
            }
            Token::Operator(name) => {
                if let Some(existing) = &operator_framework {
                    if !existing.eq_ignore_ascii_case(name) {
                        return Err(PromptForgeError::Conflict {
                            message: format!(
                                "conflicting framework operators '@{}' and '@{}'",
                                existing, name
                            ),
                        });
                    }
                }
                operator_framework = Some(name.clone());
            }
            Token::Modifier(name) => match name.as_str() {
                "clean" => modifiers.push(FrameworkModifier::Clean),
                "lean" => modifiers.push(FrameworkModifier::Lean),
                "framework" => modifiers.push(FrameworkModifier::Framework),
                "judge" => judge = true,
                other => {
                    return Err(PromptForgeError::Validation {
                        message: format!("unknown modifier '%{}'", other),
                    });
                }
            },
            Token::InlineGate(text, quoted) => {
                if *quoted {
                    inline_gate_criteria.push(text.clone());
                } else {
                    inline_gate_ids.push(text.clone());
                }
            }
            Token::Verify(cmd) => {
                shell_verification = Some(ShellVerification {
                    command: cmd.clone(),
                    max_attempts: 1,
                    timeout_secs: 30,
                    loop_until_pass: false,
                });
            }
            Token::Preset(preset) => {
                let Some(current_verify) = shell_verification.take() else {
                    return Err(PromptForgeError::Validation {
                        message: format!("':{}' requires a preceding verify:\"..\"", preset),
                    });
                };
                shell_verification =
                    ShellVerification::with_preset(current_verify.command, preset);
            }
            Token::Option(key, value) => {
                let Some(verify) = shell_verification.as_mut() else {
                    return Err(PromptForgeError::Validation {
                        message: format!("'{}:{}' requires a preceding verify:\"..\"", key, value),
                    });
                };
                match key.as_str() {
                    "max" => {
                        verify.max_attempts =
                            value.parse().map_err(|_| PromptForgeError::Validation {
                                message: format!("max:{} is not a number", value),
                            })?;
                    }
                    "timeout" => {
                        verify.timeout_secs =
                            value.parse().map_err(|_| PromptForgeError::Validation {
                                message: format!("timeout:{} is not a number", value),
                            })?;
                    }
                    "loop" => {
                        verify.loop_until_pass = value == "true";
                    }
                    _ => unreachable!("classify only emits max/timeout/loop"),
                }
            }
            Token::Repeat(count) => match count {
                Some(n) => repeat = (*n).max(1),
                None => pending_repeat_count = true,
            },
            Token::Word(word) => {
                if pending_repeat_count {
                    repeat = word.parse::<usize>().unwrap_or(1).max(1);
                    pending_repeat_count = false;
                    continue;
                }
                if CHAIN_URI_RE.is_match(word) {
                    chain_uri = Some(word.clone());
                    continue;
                }
                if current.is_none() && SLUG_RE.is_match(word) {
                    // key=value format: bare leading prompt id
                    format = CommandFormat::KeyValue;
                    current = Some(CommandStep {
                        prompt_id: word.clone(),
                        args: Map::new(),
                    });
                    continue;
                }
                return Err(PromptForgeError::Validation {
                    message: format!("unrecognized token '{}' in command", word),
                });
            }
        }
    }

    if let Some(step) = current.take() {
        steps.push(step);
    }

    if steps.is_empty() {
        if let Some(uri) = chain_uri {
            // A bare resume token is a valid command
            return Ok(ParsedCommand {
                prompt_id: String::new(),
                args: Map::new(),
                steps: Vec::new(),
                modifiers,
                judge,
                operator_framework,
                inline_gate_ids,
                inline_gate_criteria,
                shell_verification,
                explicit_tool,
                chain_uri: Some(uri),
                format,
                confidence: 1.0,
            });
        }
        return Err(PromptForgeError::Validation {
            message: format!(
                "no prompt id found in command '{}'; start with '>>id' or '/id'",
                raw
            ),
        });
    }

    let conflict = modifiers.contains(&FrameworkModifier::Clean)
        && (modifiers.contains(&FrameworkModifier::Framework)
            || modifiers.contains(&FrameworkModifier::Lean));
    if conflict {
        return Err(PromptForgeError::Conflict {
            message: "%clean cannot be combined with %lean or %framework".to_string(),
        });
    }

    // `* N` repeats the first step with identical args
    if repeat > 1 && steps.len() == 1 {
        let template = steps[0].clone();
        for _ in 1..repeat {
            steps.push(template.clone());
        }
    }

    let first = steps.remove(0);
    if !saw_step_marker && format == CommandFormat::Symbolic {
        format = CommandFormat::KeyValue;
    }
    let confidence = match format {
        CommandFormat::Symbolic | CommandFormat::Json => 1.0,
        CommandFormat::KeyValue => {
            if first.args.is_empty() && steps.is_empty() {
                format = CommandFormat::BareId;
                0.5
            } else {
                0.8
            }
        }
        CommandFormat::BareId => 0.5,
    };

    Ok(ParsedCommand {
        prompt_id: first.prompt_id,
        args: first.args,
        steps,
        modifiers,
        judge,
        operator_framework,
        inline_gate_ids,
        inline_gate_criteria,
        shell_verification,
        explicit_tool,
        chain_uri: None,
        format,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_command_with_args() {
        let cmd = parse(">>summarize topic=\"ai safety\" depth=3 verbose=true").unwrap();
        assert_eq!(cmd.prompt_id, "summarize");
        assert_eq!(cmd.args.get("topic"), Some(&Value::String("ai safety".into())));
        assert_eq!(cmd.args.get("depth"), Some(&Value::Number(3.into())));
        assert_eq!(cmd.args.get("verbose"), Some(&Value::Bool(true)));
        assert_eq!(cmd.format, CommandFormat::Symbolic);
        assert_eq!(cmd.confidence, 1.0);
    }

    #[test]
    fn json_command() {
        let cmd = parse(r#"{"prompt_id": "summarize", "args": {"topic": "ai"}}"#).unwrap();
        assert_eq!(cmd.prompt_id, "summarize");
        assert_eq!(cmd.args.get("topic"), Some(&Value::String("ai".into())));
        assert_eq!(cmd.format, CommandFormat::Json);
    }

    #[test]
    fn key_value_command_has_lower_confidence() {
        let cmd = parse("summarize topic=\"ai\"").unwrap();
        assert_eq!(cmd.prompt_id, "summarize");
        assert_eq!(cmd.format, CommandFormat::KeyValue);
        assert!((cmd.confidence - 0.8).abs() < f32::EPSILON);

        let bare = parse("summarize").unwrap();
        assert_eq!(bare.format, CommandFormat::BareId);
        assert!((bare.confidence - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn chained_steps_need_prefixes() {
        let cmd = parse(">>collect source=\"web\" --> >>analyze").unwrap();
        assert_eq!(cmd.prompt_id, "collect");
        assert_eq!(cmd.steps.len(), 1);
        assert_eq!(cmd.steps[0].prompt_id, "analyze");

        let err = parse(">>collect --> analyze").unwrap_err();
        assert!(err.to_string().contains("prompt-id prefix"));
    }

    #[test]
    fn slash_prefix_starts_a_step() {
        let cmd = parse("/my_chain/step_one key=1").unwrap();
        assert_eq!(cmd.prompt_id, "my_chain/step_one");
    }

    #[test]
    fn modifiers_and_operator() {
        let cmd = parse(">>plan @ReACT %lean %judge").unwrap();
        assert_eq!(cmd.operator_framework.as_deref(), Some("ReACT"));
        assert!(cmd.modifiers.contains(&FrameworkModifier::Lean));
        assert!(cmd.judge);
    }

    #[test]
    fn conflicting_modifiers_error() {
        let err = parse(">>plan %clean %framework").unwrap_err();
        assert!(matches!(err, PromptForgeError::Conflict { .. }));
    }

    #[test]
    fn conflicting_operators_error() {
        let err = parse(">>plan @ReACT @CAGEERF").unwrap_err();
        assert!(matches!(err, PromptForgeError::Conflict { .. }));
    }

    #[test]
    fn inline_gates_quoted_and_ids() {
        let cmd = parse(">>review ::\"no TODOs left\" ::security-check").unwrap();
        assert_eq!(cmd.inline_gate_criteria, vec!["no TODOs left"]);
        assert_eq!(cmd.inline_gate_ids, vec!["security-check"]);
    }

    #[test]
    fn shell_verification_presets_and_overrides() {
        let cmd = parse(">>build ::verify:\"cargo test\" :full loop:true").unwrap();
        let verify = cmd.shell_verification.unwrap();
        assert_eq!(verify.command, "cargo test");
        assert_eq!(verify.max_attempts, 5);
        assert_eq!(verify.timeout_secs, 300);
        assert!(verify.loop_until_pass);

        let cmd = parse(">>build ::verify:\"make\" max:7 timeout:120").unwrap();
        let verify = cmd.shell_verification.unwrap();
        assert_eq!(verify.max_attempts, 7);
        assert_eq!(verify.timeout_secs, 120);
    }

    #[test]
    fn repetition_duplicates_step() {
        let cmd = parse(">>brainstorm idea=\"x\" *3").unwrap();
        assert_eq!(cmd.steps.len(), 2);
        assert_eq!(cmd.steps[0].prompt_id, "brainstorm");
        assert_eq!(cmd.steps[0].args.get("idea"), Some(&Value::String("x".into())));
    }

    #[test]
    fn explicit_tool_recognized() {
        let cmd = parse(">>analyze tool=word_count text=\"abc\"").unwrap();
        assert_eq!(cmd.explicit_tool.as_deref(), Some("word_count"));
    }

    #[test]
    fn bare_chain_uri_is_a_resume() {
        let cmd = parse("chain-analysis_chain#2").unwrap();
        assert_eq!(cmd.chain_uri.as_deref(), Some("chain-analysis_chain#2"));
        assert!(cmd.prompt_id.is_empty());
    }

    #[test]
    fn empty_command_fails() {
        assert!(parse("   ").is_err());
    }
}

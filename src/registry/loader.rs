//! Directory scanning for prompts, gates, methodologies, and styles.
//!
//! Layout under the resources root:
//!
//! ```text
//! resources/
//!   prompts/        # tree; nesting prefixes ids with '/'
//!     summarize.toml
//!     my_chain/
//!       prompt.toml
//!       step_one/prompt.toml     -> id "my_chain/step_one"
//!   gates/<id>/gate.toml (+ guidance.md)
//!   methodologies/<id>/methodology.toml (+ guidance.md)
//!   styles/<id>/style.toml (+ guidance.md)
//! ```
//!
//! Entries whose name starts with `.` or `_` are skipped along with their
//! whole subtree.

use super::ResourceSet;
use crate::condition;
use crate::frameworks::Methodology;
use crate::gates::Gate;
use crate::prompts::{ConditionalType, Prompt};
use crate::styles::Style;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Canonical entry file that turns a directory into a prompt.
pub const PROMPT_ENTRY_FILE: &str = "prompt.toml";

pub struct ScanResult {
    pub set: ResourceSet,
    pub errors: Vec<String>,
    /// Ids behind the errors, used to retain previous versions on reload
    failed_ids: Vec<String>,
}

#[derive(Default)]
struct Failures {
    errors: Vec<String>,
    ids: Vec<String>,
}

impl Failures {
    fn push(&mut self, id: &str, message: impl std::fmt::Display) {
        self.errors.push(format!("'{}': {}", id, message));
        self.ids.push(id.to_string());
    }
}

/// Scan the base directory into a fresh resource set.
///
/// When `previous` is given, a resource that fails to parse retains its
/// previous version instead of disappearing.
pub fn scan(base: &Path, previous: Option<&ResourceSet>) -> ScanResult {
    let mut set = ResourceSet::default();
    let mut failures = Failures::default();

    scan_prompts(&base.join("prompts"), "", &mut set.prompts, &mut failures);

    {
        let gates = &mut set.gates;
        scan_configured(
            &base.join("gates"),
            "gate.toml",
            &mut failures,
            |id, mut gate: Gate, guidance| {
                gate.id = id.to_string();
                if let Some(text) = guidance {
                    gate.guidance = text;
                }
                gates.insert(gate.id.clone(), gate);
                Ok(())
            },
        );
    }
    {
        let methodologies = &mut set.methodologies;
        scan_configured(
            &base.join("methodologies"),
            "methodology.toml",
            &mut failures,
            |id, mut methodology: Methodology, guidance| {
                methodology.id = Methodology::canonical_id(id);
                if let Some(text) = guidance {
                    methodology.system_prompt_guidance = text;
                }
                methodology.validate()?;
                methodologies.insert(methodology.id.clone(), methodology);
                Ok(())
            },
        );
    }
    {
        let styles = &mut set.styles;
        scan_configured(
            &base.join("styles"),
            "style.toml",
            &mut failures,
            |id, mut style: Style, guidance| {
                style.id = id.to_string();
                if let Some(text) = guidance {
                    style.guidance = text;
                }
                styles.insert(style.id.clone(), style);
                Ok(())
            },
        );
    }

    validate_prompt_set(&mut set.prompts, &mut failures);

    // A failed resource keeps its previous version rather than vanishing
    if let Some(previous) = previous {
        for id in &failures.ids {
            if let Some(old) = previous.prompts.get(id) {
                set.prompts.entry(id.clone()).or_insert_with(|| old.clone());
            }
            if let Some(old) = previous.gates.get(id) {
                set.gates.entry(id.clone()).or_insert_with(|| old.clone());
            }
            if let Some(old) = previous.methodologies.get(id) {
                set.methodologies
                    .entry(id.clone())
                    .or_insert_with(|| old.clone());
            }
            if let Some(old) = previous.styles.get(id) {
                set.styles.entry(id.clone()).or_insert_with(|| old.clone());
            }
        }
    }

    ScanResult {
        set,
        errors: failures.errors,
        failed_ids: failures.ids,
    }
}

impl ScanResult {
    pub fn failed_ids(&self) -> &[String] {
        &self.failed_ids
    }
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn scan_prompts(
    dir: &Path,
    prefix: &str,
    prompts: &mut HashMap<String, Prompt>,
    failures: &mut Failures,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if is_skipped(&name) {
            continue;
        }

        if path.is_dir() {
            let id = format!("{}{}", prefix, name);
            let entry_file = path.join(PROMPT_ENTRY_FILE);
            if entry_file.is_file() {
                load_prompt(&entry_file, &id, prompts, failures);
            }
            // Child prompts get '/'-prefixed ids through all ancestors
            scan_prompts(&path, &format!("{}/", id), prompts, failures);
        } else if name.ends_with(".toml") && name != PROMPT_ENTRY_FILE {
            let stem = name.trim_end_matches(".toml");
            let id = format!("{}{}", prefix, stem);
            load_prompt(&path, &id, prompts, failures);
        }
    }
}

fn load_prompt(
    path: &Path,
    id: &str,
    prompts: &mut HashMap<String, Prompt>,
    failures: &mut Failures,
) {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            failures.push(id, e);
            return;
        }
    };
    match toml::from_str::<Prompt>(&content) {
        Ok(mut prompt) => {
            prompt.id = id.to_string();
            if let Err(e) = prompt.validate() {
                failures.push(id, e);
                return;
            }
            debug!(id, path = %path.display(), "loaded prompt");
            prompts.insert(id.to_string(), prompt);
        }
        Err(e) => {
            failures.push(id, e);
        }
    }
}

/// Post-pass over the full prompt set: chain step targets must resolve and
/// conditional expressions must parse. Offending prompts are dropped.
fn validate_prompt_set(prompts: &mut HashMap<String, Prompt>, failures: &mut Failures) {
    let known: std::collections::HashSet<String> = prompts.keys().cloned().collect();
    let mut bad: Vec<String> = Vec::new();

    for prompt in prompts.values() {
        for step in &prompt.chain_steps {
            if !known.contains(&step.prompt_id) {
                failures.push(
                    &prompt.id,
                    format!(
                        "step {} references unknown prompt '{}'",
                        step.step_number, step.prompt_id
                    ),
                );
                bad.push(prompt.id.clone());
            }
            if let Some(cond) = &step.conditional_execution {
                if cond.exec_type == ConditionalType::Conditional {
                    if let Some(expr) = &cond.expression {
                        if let Err(e) = condition::check_expression(expr) {
                            failures.push(
                                &prompt.id,
                                format!("step {} expression invalid: {}", step.step_number, e),
                            );
                            bad.push(prompt.id.clone());
                        }
                    }
                }
            }
        }
    }

    for id in bad {
        prompts.remove(&id);
    }
}

fn scan_configured<T, F>(dir: &Path, entry_file: &str, failures: &mut Failures, mut install: F)
where
    T: serde::de::DeserializeOwned,
    F: FnMut(&str, T, Option<String>) -> crate::error::Result<()>,
{
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if is_skipped(&name) || !path.is_dir() {
            continue;
        }

        let config_path = path.join(entry_file);
        if !config_path.is_file() {
            continue;
        }
        let content = match std::fs::read_to_string(&config_path) {
            Ok(c) => c,
            Err(e) => {
                failures.push(&name, e);
                continue;
            }
        };
        let parsed: T = match toml::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                failures.push(&name, e);
                continue;
            }
        };
        let guidance = std::fs::read_to_string(path.join("guidance.md")).ok();
        if let Err(e) = install(&name, parsed, guidance) {
            failures.push(&name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    const SIMPLE_PROMPT: &str = r#"
name = "Simple"
template = "Do the thing with {{ input }}"
"#;

    #[test]
    fn nested_directories_prefix_ids() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = dir.path().join("prompts");
        write(&prompts.join("top.toml"), SIMPLE_PROMPT);
        write(&prompts.join("my_chain").join("prompt.toml"), SIMPLE_PROMPT);
        write(
            &prompts.join("my_chain").join("step_one").join("prompt.toml"),
            SIMPLE_PROMPT,
        );
        write(
            &prompts
                .join("my_chain")
                .join("deep")
                .join("deeper")
                .join("prompt.toml"),
            SIMPLE_PROMPT,
        );

        let result = scan(dir.path(), None);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        let mut ids: Vec<&str> = result.set.prompts.keys().map(String::as_str).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "my_chain",
                "my_chain/deep/deeper",
                "my_chain/step_one",
                "top"
            ]
        );
    }

    #[test]
    fn hidden_and_underscore_subtrees_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = dir.path().join("prompts");
        write(&prompts.join(".hidden").join("prompt.toml"), SIMPLE_PROMPT);
        write(&prompts.join("_draft").join("prompt.toml"), SIMPLE_PROMPT);
        write(&prompts.join("_notes.toml"), SIMPLE_PROMPT);
        write(&prompts.join(".secret.toml"), SIMPLE_PROMPT);
        write(&prompts.join("visible.toml"), SIMPLE_PROMPT);

        let result = scan(dir.path(), None);
        assert_eq!(result.set.prompts.len(), 1);
        assert!(result.set.prompts.contains_key("visible"));
    }

    #[test]
    fn chain_with_unknown_step_target_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = dir.path().join("prompts");
        write(
            &prompts.join("broken_chain.toml"),
            r#"
name = "Broken"
template = "chain"

[[chain_steps]]
step_number = 1
prompt_id = "missing_step"
"#,
        );

        let result = scan(dir.path(), None);
        assert!(result.set.prompts.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("missing_step"));
    }

    #[test]
    fn broken_resource_keeps_previous_version_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = dir.path().join("prompts");
        write(&prompts.join("stable.toml"), SIMPLE_PROMPT);
        let first = scan(dir.path(), None);
        assert_eq!(first.set.prompts.len(), 1);

        write(&prompts.join("stable.toml"), "not valid toml {{");
        let second = scan(dir.path(), Some(&first.set));
        assert_eq!(second.errors.len(), 1);
        assert!(
            second.set.prompts.contains_key("stable"),
            "previous version should be retained"
        );
    }

    #[test]
    fn gates_load_with_guidance_file() {
        let dir = tempfile::tempdir().unwrap();
        let gate_dir = dir.path().join("gates").join("security-check");
        write(
            &gate_dir.join("gate.toml"),
            r#"
name = "Security check"
type = "validation"
criteria = ["no secrets in output"]
pass_criteria = ["all criteria satisfied"]
"#,
        );
        write(&gate_dir.join("guidance.md"), "Check for leaked credentials.");

        let result = scan(dir.path(), None);
        let gate = result.set.gates.get("security-check").unwrap();
        assert_eq!(gate.guidance, "Check for leaked credentials.");
        assert_eq!(gate.criteria.len(), 1);
    }

    #[test]
    fn methodology_without_phases_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let m_dir = dir.path().join("methodologies").join("hollow");
        write(
            &m_dir.join("methodology.toml"),
            r#"
name = "Hollow"
phases = []
methodology_gates = []
"#,
        );
        let result = scan(dir.path(), None);
        assert!(result.set.methodologies.is_empty());
        assert_eq!(result.errors.len(), 1);
    }
}

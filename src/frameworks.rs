//! Methodologies (frameworks) and the decision authority that picks which
//! one, if any, shapes a given execution.

use serde::{Deserialize, Serialize};

use crate::error::{PromptForgeError, Result};

/// One phase of a methodology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A named house style: phases + guidance + gates.
///
/// `phases` and `methodology_gates` are required by the format; a definition
/// without them fails to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Methodology {
    /// Derived from the directory name by the loader; may be omitted in the file
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt_guidance: String,
    pub phases: Vec<Phase>,
    pub methodology_gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_descriptions: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Methodology {
    /// Ids are case-folded so `@CAGEERF` and `@cageerf` resolve alike.
    pub fn canonical_id(raw: &str) -> String {
        raw.to_lowercase()
    }

    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(PromptForgeError::Validation {
                message: format!("methodology '{}' must declare at least one phase", self.id),
            });
        }
        Ok(())
    }

    /// Render the guidance block injected ahead of a prompt.
    pub fn render_guidance(&self, lean: bool) -> String {
        let mut out = format!("## Methodology: {}\n\n", self.name);
        if !self.system_prompt_guidance.is_empty() {
            out.push_str(&self.system_prompt_guidance);
            out.push_str("\n\n");
        }
        if lean {
            return out;
        }
        out.push_str("Phases:\n");
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.description.is_empty() {
                out.push_str(&format!("{}. {}\n", i + 1, phase.name));
            } else {
                out.push_str(&format!("{}. {} — {}\n", i + 1, phase.name, phase.description));
            }
        }
        out
    }
}

/// Execution modifiers recognized in commands (`%clean`, `%lean`, `%framework`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkModifier {
    /// Disable framework injection for this execution
    Clean,
    /// Apply the framework with minimal guidance
    Lean,
    /// Force framework application even when globally disabled
    Framework,
}

/// Where the winning framework decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Modifier,
    Operator,
    Client,
    Global,
    None,
}

/// Immutable outcome of the framework decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkDecision {
    pub framework_id: Option<String>,
    pub should_apply: bool,
    pub lean: bool,
    pub source: DecisionSource,
}

impl FrameworkDecision {
    pub fn none() -> Self {
        Self {
            framework_id: None,
            should_apply: false,
            lean: false,
            source: DecisionSource::None,
        }
    }
}

/// Inputs to one framework decision
#[derive(Debug, Clone, Default)]
pub struct DecisionInputs {
    pub modifiers: Vec<FrameworkModifier>,
    /// `@framework` operator in the command
    pub operator_override: Option<String>,
    /// Framework requested by the client session
    pub client_override: Option<String>,
    /// Globally active framework from persisted state
    pub global_active: Option<String>,
    pub system_enabled: bool,
}

/// Decide which framework applies. Priority: modifiers > operator override >
/// client override > global selection.
pub fn decide(inputs: &DecisionInputs) -> FrameworkDecision {
    if inputs.modifiers.contains(&FrameworkModifier::Clean) {
        return FrameworkDecision {
            framework_id: None,
            should_apply: false,
            lean: false,
            source: DecisionSource::Modifier,
        };
    }

    let lean = inputs.modifiers.contains(&FrameworkModifier::Lean);
    let forced = inputs.modifiers.contains(&FrameworkModifier::Framework);

    let (framework_id, source) = if let Some(op) = &inputs.operator_override {
        (Some(op.clone()), DecisionSource::Operator)
    } else if let Some(client) = &inputs.client_override {
        (Some(client.clone()), DecisionSource::Client)
    } else if let Some(global) = &inputs.global_active {
        (Some(global.clone()), DecisionSource::Global)
    } else {
        (None, DecisionSource::None)
    };

    let should_apply = framework_id.is_some() && (inputs.system_enabled || forced);

    FrameworkDecision {
        framework_id: if should_apply { framework_id } else { None },
        should_apply,
        lean,
        source: if should_apply { source } else { DecisionSource::None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> DecisionInputs {
        DecisionInputs {
            modifiers: vec![],
            operator_override: None,
            client_override: None,
            global_active: Some("cageerf".to_string()),
            system_enabled: true,
        }
    }

    #[test]
    fn clean_modifier_beats_everything() {
        let mut inputs = base_inputs();
        inputs.modifiers.push(FrameworkModifier::Clean);
        inputs.operator_override = Some("react".to_string());
        let decision = decide(&inputs);
        assert!(!decision.should_apply);
        assert_eq!(decision.source, DecisionSource::Modifier);
    }

    #[test]
    fn operator_beats_client_and_global() {
        let mut inputs = base_inputs();
        inputs.operator_override = Some("react".to_string());
        inputs.client_override = Some("5w1h".to_string());
        let decision = decide(&inputs);
        assert_eq!(decision.framework_id.as_deref(), Some("react"));
        assert_eq!(decision.source, DecisionSource::Operator);
    }

    #[test]
    fn disabled_system_yields_no_framework_unless_forced() {
        let mut inputs = base_inputs();
        inputs.system_enabled = false;
        assert!(!decide(&inputs).should_apply);

        inputs.modifiers.push(FrameworkModifier::Framework);
        let decision = decide(&inputs);
        assert!(decision.should_apply);
        assert_eq!(decision.framework_id.as_deref(), Some("cageerf"));
    }

    #[test]
    fn lean_flag_propagates() {
        let mut inputs = base_inputs();
        inputs.modifiers.push(FrameworkModifier::Lean);
        let decision = decide(&inputs);
        assert!(decision.should_apply);
        assert!(decision.lean);
    }

    #[test]
    fn methodology_without_phases_fails_validation() {
        let methodology = Methodology {
            id: "empty".into(),
            name: "Empty".into(),
            system_prompt_guidance: String::new(),
            phases: vec![],
            methodology_gates: vec![],
            tool_descriptions: None,
            enabled: true,
        };
        assert!(methodology.validate().is_err());
    }
}

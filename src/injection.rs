//! Injection control: which guidance blocks get prepended to a rendered
//! step, and how often across a chain.

use serde::{Deserialize, Serialize};

/// What kind of block is being injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionType {
    SystemPrompt,
    GateGuidance,
    StyleGuidance,
}

/// How often a block is injected across chain steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionFrequency {
    #[default]
    Always,
    /// Only on the first step of a chain
    FirstOnly,
    /// Every n-th step (1-based)
    Every(usize),
    Never,
}

impl InjectionFrequency {
    /// Parse the configured string form: `always`, `first-only`, `never`, `every{n}`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "always" => Some(Self::Always),
            "first-only" => Some(Self::FirstOnly),
            "never" => Some(Self::Never),
            other => other
                .strip_prefix("every")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(Self::Every),
        }
    }

    /// Should this block be injected for the given 1-based step?
    pub fn applies_at(&self, step_number: usize) -> bool {
        match self {
            Self::Always => true,
            Self::FirstOnly => step_number <= 1,
            Self::Every(n) => step_number == 1 || (step_number - 1) % n == 0,
            Self::Never => false,
        }
    }
}

/// Per-type injection policy, configurable at runtime via `system_control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionPolicy {
    #[serde(default)]
    pub system_prompt: InjectionFrequency,
    #[serde(default)]
    pub gate_guidance: InjectionFrequency,
    #[serde(default)]
    pub style_guidance: InjectionFrequency,
}

impl Default for InjectionPolicy {
    fn default() -> Self {
        Self {
            system_prompt: InjectionFrequency::FirstOnly,
            gate_guidance: InjectionFrequency::Always,
            style_guidance: InjectionFrequency::FirstOnly,
        }
    }
}

impl InjectionPolicy {
    pub fn frequency_for(&self, kind: InjectionType) -> InjectionFrequency {
        match kind {
            InjectionType::SystemPrompt => self.system_prompt,
            InjectionType::GateGuidance => self.gate_guidance,
            InjectionType::StyleGuidance => self.style_guidance,
        }
    }

    pub fn set_frequency(&mut self, kind: InjectionType, frequency: InjectionFrequency) {
        match kind {
            InjectionType::SystemPrompt => self.system_prompt = frequency,
            InjectionType::GateGuidance => self.gate_guidance = frequency,
            InjectionType::StyleGuidance => self.style_guidance = frequency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_n() {
        assert_eq!(InjectionFrequency::parse("every3"), Some(InjectionFrequency::Every(3)));
        assert_eq!(InjectionFrequency::parse("every0"), None);
        assert_eq!(InjectionFrequency::parse("first-only"), Some(InjectionFrequency::FirstOnly));
        assert_eq!(InjectionFrequency::parse("sometimes"), None);
    }

    #[test]
    fn every_n_fires_on_first_and_nth() {
        let every3 = InjectionFrequency::Every(3);
        assert!(every3.applies_at(1));
        assert!(!every3.applies_at(2));
        assert!(every3.applies_at(4));
        assert!(every3.applies_at(7));
    }

    #[test]
    fn first_only_fires_once() {
        assert!(InjectionFrequency::FirstOnly.applies_at(1));
        assert!(!InjectionFrequency::FirstOnly.applies_at(2));
    }
}

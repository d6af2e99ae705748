//! Output style resources: named guidance blocks injected per the
//! injection-control policy.

use serde::{Deserialize, Serialize};

/// A named output style
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    /// Derived from the directory name by the loader; may be omitted in the file
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub guidance: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Style {
    pub fn render_guidance(&self) -> String {
        if self.guidance.is_empty() {
            return String::new();
        }
        format!("## Style: {}\n\n{}\n", self.name, self.guidance)
    }
}

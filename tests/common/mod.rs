//! Shared fixtures for integration tests: a server over a temp resources
//! tree and helpers for writing prompt files.

use prompt_forge::config::Config;
use prompt_forge::server::PromptForgeServer;
use std::path::Path;

pub fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Build a config rooted at a temp directory, with short timers suitable
/// for tests.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.system.resources_dir = root.join("resources").display().to_string();
    config.system.state_dir = root.join("runtime-state").display().to_string();
    config.system.reload_debounce_ms = 100;
    config.sessions.cleanup_interval_secs = 3600;
    config
}

pub async fn test_server(root: &Path) -> PromptForgeServer {
    PromptForgeServer::new(test_config(root)).await.expect("server should start")
}

/// A two-step analysis chain used by several scenarios.
pub fn write_analysis_chain(resources: &Path) {
    write_file(
        &resources.join("prompts/analysis_chain/prompt.toml"),
        r#"
name = "Analysis Chain"
description = "Two-step analysis"
category = "analysis"
template = "chain"

[[chain_steps]]
step_number = 1
prompt_id = "analysis_chain/step_one"

[[chain_steps]]
step_number = 2
prompt_id = "analysis_chain/step_two"
"#,
    );
    write_file(
        &resources.join("prompts/analysis_chain/step_one/prompt.toml"),
        r#"
name = "Step One"
template = "Gather the raw data for analysis."
"#,
    );
    write_file(
        &resources.join("prompts/analysis_chain/step_two/prompt.toml"),
        r#"
name = "Step Two"
template = "Analyze this: {{ previous_step_result }}"
"#,
    );
}

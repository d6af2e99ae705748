use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure loaded from prompt_forge.toml and environment variables
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub system: SystemConfig,
    pub sessions: SessionConfig,
    pub gates: GateConfig,
    pub resolver: ResolverConfig,
    /// Runtime configuration loaded from environment variables
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

/// System-level configuration for resources, reload, and versioning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    pub resources_dir: String,
    pub state_dir: String,
    pub reload_debounce_ms: u64,
    pub max_versions: usize,
    pub script_timeout_ms: u64,
}

/// Chain session lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// TTL for ordinary chain sessions, seconds
    pub chain_ttl_secs: u64,
    /// TTL for sessions paused on a gate review, seconds
    pub review_ttl_secs: u64,
    /// Interval between stale-session sweeps, seconds
    pub cleanup_interval_secs: u64,
    /// Bounded argument-history entries kept per session
    pub argument_history_limit: usize,
}

/// Gate system configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    /// Default max self-review attempts when a gate has no retry_config
    pub default_max_attempts: u32,
    /// Reject verdicts missing the GATE_REVIEW prefix
    pub strict_verdicts: bool,
}

/// Reference resolution and conditional evaluation limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    pub max_ref_depth: usize,
    /// Replace missing {{ref:..}} targets with "" instead of failing
    pub lenient_refs: bool,
    pub expression_timeout_ms: u64,
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub workspace_root: Option<PathBuf>,
    pub tool_timeout_ms: u64,
    pub mcp_no_log: bool,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            tool_timeout_ms: 30_000,
            mcp_no_log: false,
            log_level: "prompt_forge=info,rmcp=info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file and environment variables.
    /// Uses PROMPT_FORGE_CONFIG environment variable or defaults to "prompt_forge.toml"
    pub fn load() -> anyhow::Result<Self> {
        // Load environment variables with smart fallbacks:
        // 1) FORGE_ENV_FILE if set
        // 2) ./.env
        if let Ok(env_path) = std::env::var("FORGE_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::from_path(".env");
        }

        let config_path = std::env::var("PROMPT_FORGE_CONFIG")
            .unwrap_or_else(|_| "prompt_forge.toml".to_string());

        let mut config: Config = if let Ok(content) = std::fs::read_to_string(&config_path) {
            toml::from_str(&content)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", config_path);
            Self::default()
        };

        // Env overrides for resource and state paths (env-first)
        if let Ok(dir) = std::env::var("FORGE_RESOURCES") {
            config.system.resources_dir = dir;
        }
        if let Ok(dir) = std::env::var("FORGE_STATE_DIR") {
            config.system.state_dir = dir;
        }
        if let Some(debounce) = env_u64("FORGE_RELOAD_DEBOUNCE_MS") {
            config.system.reload_debounce_ms = debounce;
        }
        if let Some(ttl) = env_u64("FORGE_SESSION_TTL_SECS") {
            config.sessions.chain_ttl_secs = ttl;
        }
        if let Some(ttl) = env_u64("FORGE_REVIEW_TTL_SECS") {
            config.sessions.review_ttl_secs = ttl;
        }
        if let Some(interval) = env_u64("FORGE_CLEANUP_INTERVAL_SECS") {
            config.sessions.cleanup_interval_secs = interval;
        }
        if let Some(timeout) = env_u64("FORGE_EXPR_TIMEOUT_MS") {
            config.resolver.expression_timeout_ms = timeout;
        }
        if let Some(depth) = env_u64("FORGE_MAX_REF_DEPTH") {
            config.resolver.max_ref_depth = depth as usize;
        }
        if let Some(max) = env_u64("FORGE_MAX_VERSIONS") {
            config.system.max_versions = max as usize;
        }

        config.runtime = RuntimeConfig::load_from_env();

        // Validate and clamp
        if config.resolver.max_ref_depth == 0 {
            config.resolver.max_ref_depth = 1;
        } else if config.resolver.max_ref_depth > 64 {
            tracing::warn!(
                "max_ref_depth {} exceeds max 64, clamping to 64",
                config.resolver.max_ref_depth
            );
            config.resolver.max_ref_depth = 64;
        }
        if config.system.max_versions == 0 {
            config.system.max_versions = 1;
        }
        if config.sessions.review_ttl_secs >= config.sessions.chain_ttl_secs {
            tracing::warn!(
                "review_ttl_secs {} is not shorter than chain_ttl_secs {}; review sessions are expected to expire first",
                config.sessions.review_ttl_secs,
                config.sessions.chain_ttl_secs
            );
        }
        if config.gates.default_max_attempts == 0 {
            config.gates.default_max_attempts = 1;
        }

        Ok(config)
    }

    /// Resolved resources directory, honoring the workspace root when set
    pub fn resources_path(&self) -> PathBuf {
        resolve_path(&self.system.resources_dir, self.runtime.workspace_root.as_deref())
    }

    /// Resolved runtime-state directory, honoring the workspace root when set
    pub fn state_path(&self) -> PathBuf {
        resolve_path(&self.system.state_dir, self.runtime.workspace_root.as_deref())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Expand `~` and anchor relative paths at the workspace root when one is configured
fn resolve_path(raw: &str, root: Option<&std::path::Path>) -> PathBuf {
    let expanded = if let Some(stripped) = raw.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };
    if expanded.is_relative() {
        if let Some(root) = root {
            return root.join(expanded);
        }
    }
    expanded
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemConfig {
                resources_dir: "./resources".to_string(),
                state_dir: "./runtime-state".to_string(),
                reload_debounce_ms: 200,
                max_versions: 50,
                script_timeout_ms: 30_000,
            },
            sessions: SessionConfig {
                chain_ttl_secs: 3600,
                review_ttl_secs: 300,
                cleanup_interval_secs: 60,
                argument_history_limit: 32,
            },
            gates: GateConfig {
                default_max_attempts: 3,
                strict_verdicts: false,
            },
            resolver: ResolverConfig {
                max_ref_depth: 10,
                lenient_refs: false,
                expression_timeout_ms: 5_000,
            },
            runtime: RuntimeConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load runtime configuration from environment variables
    pub fn load_from_env() -> Self {
        Self {
            workspace_root: std::env::var("FORGE_WORKSPACE_ROOT").ok().map(PathBuf::from),
            tool_timeout_ms: env_u64("FORGE_TOOL_TIMEOUT_MS").unwrap_or(30_000),
            mcp_no_log: std::env::var("FORGE_NO_LOG")
                .ok()
                .is_some_and(|v| v == "true" || v == "1"),
            log_level: std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "prompt_forge=info,rmcp=info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.resolver.max_ref_depth, 10);
        assert!(config.sessions.review_ttl_secs < config.sessions.chain_ttl_secs);
    }

    #[test]
    fn relative_paths_anchor_at_workspace_root() {
        let resolved = resolve_path("./resources", Some(std::path::Path::new("/srv/forge")));
        assert_eq!(resolved, PathBuf::from("/srv/forge/./resources"));
    }
}

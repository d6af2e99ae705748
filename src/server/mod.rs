//! Server module containing the PromptForgeServer implementation

use crate::config::Config;
use crate::error::Result;
use crate::persist::{ArgumentHistory, StateStore};
use crate::pipeline::{AnalyticsRing, Services, ANALYTICS_CAPACITY};
use crate::registry::watcher::RegistryWatcher;
use crate::registry::Registry;
use crate::scripts::{DisabledScriptRunner, ExecutionModeService, ScriptRunner};
use crate::sessions::ChainSessionManager;
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, Implementation, InitializeRequestParam,
        InitializeResult, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo, ToolsCapability,
    },
    service::{RequestContext, RoleServer},
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Main prompt-forge server implementation
#[derive(Clone)]
pub struct PromptForgeServer {
    pub services: Services,
    pub started: std::time::Instant,
    /// Keeps the hot-reload watcher alive for the server's lifetime
    _watcher: Option<Arc<RegistryWatcher>>,
}

impl PromptForgeServer {
    /// Create a new server instance: load resources, restore persisted
    /// state, start the session cleanup sweep and the hot-reload watcher.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_runner(config, Arc::new(DisabledScriptRunner)).await
    }

    /// Same as [`PromptForgeServer::new`] with an explicit script runtime.
    pub async fn with_runner(config: Config, runner: Arc<dyn ScriptRunner>) -> Result<Self> {
        let state_dir = config.state_path();
        let resources_dir = config.resources_path();
        info!(
            resources = %resources_dir.display(),
            state = %state_dir.display(),
            "starting prompt-forge"
        );

        let (registry, summary) = Registry::load(resources_dir)?;
        info!(
            prompts = summary.prompts,
            gates = summary.gates,
            methodologies = summary.methodologies,
            styles = summary.styles,
            errors = summary.errors.len(),
            "resources loaded"
        );
        let registry = Arc::new(registry);

        let sessions = Arc::new(ChainSessionManager::load(
            state_dir.join("chain-sessions.json"),
            Duration::from_secs(config.sessions.chain_ttl_secs),
            Duration::from_secs(config.sessions.review_ttl_secs),
        ));
        sessions.start_cleanup_task(Duration::from_secs(config.sessions.cleanup_interval_secs));

        let framework_state = Arc::new(StateStore::load(state_dir.join("framework-state.json")));
        let gate_state = Arc::new(StateStore::load(state_dir.join("gate-system-state.json")));
        let argument_history = Arc::new(ArgumentHistory::load(
            state_dir.join("argument-history.json"),
            config.sessions.argument_history_limit,
        ));

        let watcher = match RegistryWatcher::start(
            Arc::clone(&registry),
            Duration::from_millis(config.system.reload_debounce_ms),
        ) {
            Ok(watcher) => Some(Arc::new(watcher)),
            Err(e) => {
                // Watching is best-effort; manual reloads still work
                tracing::warn!(error = %e, "hot reload unavailable");
                None
            }
        };

        let services = Services {
            config: Arc::new(config),
            registry,
            sessions,
            framework_state,
            gate_state,
            injection: Arc::new(RwLock::new(Default::default())),
            execution_modes: Arc::new(ExecutionModeService::new(Duration::from_secs(300))),
            runner,
            argument_history,
            analytics: Arc::new(AnalyticsRing::new(VecDeque::with_capacity(
                ANALYTICS_CAPACITY,
            ))),
        };

        Ok(Self {
            services,
            started: std::time::Instant::now(),
            _watcher: watcher,
        })
    }

    /// Flush persisted state and stop background tasks.
    pub async fn shutdown(&self) {
        self.services.sessions.shutdown().await;
        if let Err(e) = self.services.framework_state.flush().await {
            tracing::warn!(error = %e, "framework state flush failed");
        }
        if let Err(e) = self.services.gate_state.flush().await {
            tracing::warn!(error = %e, "gate state flush failed");
        }
        if let Err(e) = self.services.argument_history.flush().await {
            tracing::warn!(error = %e, "argument history flush failed");
        }
    }
}

impl ServerHandler for PromptForgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "prompt-forge".to_string(),
                title: Some("Prompt Forge".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                website_url: None,
                icons: None,
            },
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<InitializeResult, McpError> {
        let mut info = self.get_info();
        info.protocol_version = request.protocol_version.clone();
        Ok(info)
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        info!("tools/list requested");

        use rmcp::model::Tool;

        let tools = vec![
            Tool {
                name: "prompt_engine".into(),
                title: Some("Prompt Engine".into()),
                description: Some(
                    "Execute prompts, templates, and multi-step chains with gates and frameworks"
                        .into(),
                ),
                input_schema: crate::schemas::prompt_engine_schema(),
                icons: None,
                annotations: None,
                output_schema: None,
                meta: None,
            },
            Tool {
                name: "resource_manager".into(),
                title: Some("Resource Manager".into()),
                description: Some(
                    "Create, update, inspect, version, and reload prompts, gates, and methodologies"
                        .into(),
                ),
                input_schema: crate::schemas::resource_manager_schema(),
                icons: None,
                annotations: None,
                output_schema: None,
                meta: None,
            },
            Tool {
                name: "system_control".into(),
                title: Some("System Control".into()),
                description: Some(
                    "Server status, framework switching, gate toggles, analytics, and sessions"
                        .into(),
                ),
                input_schema: crate::schemas::system_control_schema(),
                icons: None,
                annotations: None,
                output_schema: None,
                meta: None,
            },
        ];

        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "prompt_engine" => self.handle_prompt_engine(request).await.map_err(|e| e.into()),
            "resource_manager" => self
                .handle_resource_manager(request)
                .await
                .map_err(|e| e.into()),
            "system_control" => self
                .handle_system_control(request)
                .await
                .map_err(|e| e.into()),
            _ => Err(McpError {
                code: rmcp::model::ErrorCode::METHOD_NOT_FOUND,
                message: format!("Unknown tool: {}", request.name).into(),
                data: None,
            }),
        }
    }
}

//! prompt_engine tool handler: runs the execution pipeline.

use crate::error::{PromptForgeError, Result};
use crate::pipeline::{self, EngineRequest};
use crate::server::PromptForgeServer;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::{json, Value};

/// Parameters for the `prompt_engine` tool.
#[derive(Debug, serde::Deserialize, Default)]
pub struct PromptEngineParams {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub user_response: Option<String>,
    #[serde(default)]
    pub force_restart: Option<bool>,
    #[serde(default)]
    pub gate_action: Option<String>,
    #[serde(default)]
    pub gate_verdict: Option<String>,
    #[serde(default)]
    pub gates: Vec<Value>,
    /// Deprecated; folded into `gates` by the pipeline
    #[serde(default)]
    pub gate_ids: Vec<String>,
    /// Deprecated; folded into `gates` by the pipeline
    #[serde(default)]
    pub temporary_gates: Vec<Value>,
    #[serde(default)]
    pub options: Option<Value>,
}

impl PromptForgeServer {
    /// Handle the prompt_engine tool call
    pub async fn handle_prompt_engine(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult> {
        let args = request.arguments.ok_or_else(|| PromptForgeError::Mcp {
            message: "Missing parameters".into(),
        })?;
        let params: PromptEngineParams =
            serde_json::from_value(Value::Object(args)).map_err(|e| {
                PromptForgeError::Serialization {
                    message: format!("Invalid parameters: {}", e),
                }
            })?;

        tracing::info!(
            command = params.command.as_deref().unwrap_or("<resume>"),
            chain_id = params.chain_id.as_deref().unwrap_or(""),
            "prompt_engine called"
        );

        let client_framework = params
            .options
            .as_ref()
            .and_then(|o| o.get("framework"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let session_id = params
            .options
            .as_ref()
            .and_then(|o| o.get("session_id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let engine_request = EngineRequest {
            command: params.command,
            chain_id: params.chain_id,
            user_response: params.user_response,
            force_restart: params.force_restart.unwrap_or(false),
            gate_action: params.gate_action,
            gate_verdict: params.gate_verdict,
            gates: params.gates,
            gate_ids: params.gate_ids,
            temporary_gates: params.temporary_gates,
            client_framework,
            options: params.options,
            session_id,
        };

        let response = pipeline::execute(engine_request, &self.services).await?;
        Ok(CallToolResult::structured(json!({
            "text": response.text,
            "metadata": response.metadata,
        })))
    }
}

//! Domain-specific error types for prompt-forge

use serde_json::json;
use std::error::Error as _;
use thiserror::Error;

/// Main error type for the prompt-forge MCP server
#[derive(Error, Debug)]
pub enum PromptForgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Resolution error: unknown {kind} '{id}'")]
    Resolution { kind: String, id: String },

    #[error("Circular reference: {}", chain.join(" -> "))]
    CircularReference { chain: Vec<String> },

    #[error("Reference depth exceeded ({max}): {}", chain.join(" -> "))]
    MaxDepthExceeded { max: usize, chain: Vec<String> },

    #[error("Missing reference target '{id}'")]
    MissingReference { id: String },

    #[error("Script error: {message}")]
    Script { message: String },

    #[error("Invalid script output for '{tool_id}': {message}")]
    InvalidScriptOutput { tool_id: String, message: String },

    #[error("Invalid field access '{field}' on output of '{tool_id}'")]
    InvalidFieldAccess { tool_id: String, field: String },

    #[error("Expression rejected: {message}")]
    ExpressionRejected { message: String },

    #[error("Expression timed out after {timeout_ms}ms")]
    ExpressionTimeout { timeout_ms: u64 },

    #[error("Expression evaluation failed: {message}")]
    ExpressionFailed { message: String },

    #[error("Gate error: {message}")]
    Gate { message: String },

    #[error("Gate verdict did not match grammar: {message}")]
    VerdictGrammar { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Conflicting parameters: {message}")]
    Conflict { message: String },

    #[error("Template error: {message}")]
    Template { message: String },

    #[error("MCP protocol error: {message}")]
    Mcp { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Timeout error: {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<anyhow::Error> for PromptForgeError {
    fn from(err: anyhow::Error) -> Self {
        PromptForgeError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PromptForgeError {
    fn from(err: serde_json::Error) -> Self {
        PromptForgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for PromptForgeError {
    fn from(err: std::io::Error) -> Self {
        PromptForgeError::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<tera::Error> for PromptForgeError {
    fn from(err: tera::Error) -> Self {
        // Tera nests the useful message one level down
        let detail = err
            .source()
            .map(|s| format!("{}: {}", err, s))
            .unwrap_or_else(|| err.to_string());
        PromptForgeError::Template { message: detail }
    }
}

impl From<rmcp::ErrorData> for PromptForgeError {
    fn from(err: rmcp::ErrorData) -> Self {
        PromptForgeError::Mcp {
            message: err.message.to_string(),
        }
    }
}

/// Convert PromptForgeError to MCP error
impl From<PromptForgeError> for rmcp::ErrorData {
    fn from(err: PromptForgeError) -> Self {
        use rmcp::model::ErrorCode;

        let (code, label, details) = match err {
            PromptForgeError::Config { message } => {
                (ErrorCode::INVALID_PARAMS, "Configuration error", message)
            }
            PromptForgeError::Validation { message } => {
                (ErrorCode::INVALID_PARAMS, "Validation error", message)
            }
            PromptForgeError::Resolution { kind, id } => (
                ErrorCode::INVALID_PARAMS,
                "Resolution error",
                format!("unknown {kind} '{id}'"),
            ),
            PromptForgeError::CircularReference { chain } => (
                ErrorCode::INVALID_PARAMS,
                "Circular reference",
                chain.join(" -> "),
            ),
            PromptForgeError::MaxDepthExceeded { max, chain } => (
                ErrorCode::INVALID_PARAMS,
                "Reference depth exceeded",
                format!("max {max}: {}", chain.join(" -> ")),
            ),
            PromptForgeError::MissingReference { id } => (
                ErrorCode::INVALID_PARAMS,
                "Missing reference",
                format!("no prompt with id '{id}'"),
            ),
            PromptForgeError::Script { message } => {
                (ErrorCode::INTERNAL_ERROR, "Script error", message)
            }
            PromptForgeError::InvalidScriptOutput { tool_id, message } => (
                ErrorCode::INTERNAL_ERROR,
                "Invalid script output",
                format!("{tool_id}: {message}"),
            ),
            PromptForgeError::InvalidFieldAccess { tool_id, field } => (
                ErrorCode::INVALID_PARAMS,
                "Invalid field access",
                format!("'{field}' on output of '{tool_id}'"),
            ),
            PromptForgeError::ExpressionRejected { message } => {
                (ErrorCode::INVALID_PARAMS, "Expression rejected", message)
            }
            PromptForgeError::ExpressionTimeout { timeout_ms } => (
                ErrorCode::INTERNAL_ERROR,
                "Expression timeout",
                format!("evaluation exceeded {timeout_ms}ms"),
            ),
            PromptForgeError::ExpressionFailed { message } => (
                ErrorCode::INTERNAL_ERROR,
                "Expression evaluation failed",
                message,
            ),
            PromptForgeError::Gate { message } => {
                (ErrorCode::INVALID_PARAMS, "Gate error", message)
            }
            PromptForgeError::VerdictGrammar { message } => {
                (ErrorCode::INVALID_PARAMS, "Gate verdict error", message)
            }
            PromptForgeError::Session { message } => {
                (ErrorCode::INVALID_PARAMS, "Session error", message)
            }
            PromptForgeError::Persistence { message } => {
                (ErrorCode::INTERNAL_ERROR, "Persistence error", message)
            }
            PromptForgeError::Conflict { message } => {
                (ErrorCode::INVALID_PARAMS, "Conflicting parameters", message)
            }
            PromptForgeError::Template { message } => {
                (ErrorCode::INTERNAL_ERROR, "Template error", message)
            }
            PromptForgeError::Mcp { message } => {
                (ErrorCode::INVALID_PARAMS, "MCP protocol error", message)
            }
            PromptForgeError::Serialization { message } => {
                (ErrorCode::INTERNAL_ERROR, "Serialization error", message)
            }
            PromptForgeError::Timeout {
                operation,
                timeout_ms,
            } => (
                ErrorCode::INTERNAL_ERROR,
                "Operation timeout",
                format!("{operation} timed out after {timeout_ms}ms"),
            ),
            PromptForgeError::Internal { message } => {
                (ErrorCode::INTERNAL_ERROR, "Internal error", message)
            }
        };

        rmcp::ErrorData {
            code,
            message: format!("{label}: {details}").into(),
            data: Some(json!({ "details": details })),
        }
    }
}

/// Result type alias for prompt-forge operations
pub type Result<T> = std::result::Result<T, PromptForgeError>;

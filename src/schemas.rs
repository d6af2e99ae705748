use serde_json::{json, Map, Value};
use std::sync::Arc;

pub fn prompt_engine_schema() -> Arc<Map<String, Value>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "command": {
                "type": "string",
                "description": "Prompt id plus args. Symbolic (>>id key=\"val\"), chained (>>a --> >>b), JSON object, or key=value. Modifiers: @Framework, ::\"criteria\", %clean/%lean/%framework/%judge; shell verification :: verify:\"cmd\" :fast|:full|:extended."
            },
            "chain_id": {
                "type": "string",
                "description": "Resume token (chain-<prompt> or chain-<prompt>#<run>). When set, command must be omitted."
            },
            "user_response": {
                "type": "string",
                "description": "Completed output for the previous step when resuming. Empty string is valid."
            },
            "force_restart": {"type": "boolean", "default": false},
            "gate_action": {
                "type": "string",
                "enum": ["retry", "skip", "abort"],
                "description": "User choice after gate retry-limit exhaustion"
            },
            "gate_verdict": {
                "type": "string",
                "description": "Self-review verdict: GATE_REVIEW: PASS|FAIL - <reason>"
            },
            "gates": {
                "type": "array",
                "items": {"type": ["string", "object"]},
                "description": "Registered ids, quick gates {name, description}, or full gate definitions"
            },
            "options": {"type": "object", "description": "Opaque record forwarded downstream"}
        }
    });
    Arc::new(schema.as_object().cloned().unwrap_or_else(Map::new))
}

pub fn resource_manager_schema() -> Arc<Map<String, Value>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["create", "update", "delete", "reload", "list", "inspect",
                         "analyze_type", "analyze_gates", "guide", "switch",
                         "history", "rollback", "compare"]
            },
            "resource_type": {"type": "string", "enum": ["prompt", "gate", "methodology"]},
            "id": {"type": "string"},
            "definition": {"type": "object", "description": "Resource body for create/update"},
            "confirm": {"type": "boolean", "description": "Required true for delete"},
            "from_version": {"type": "integer"},
            "to_version": {"type": "integer"},
            "version": {"type": "integer"},
            "limit": {"type": "integer"},
            "skip_version": {"type": "boolean"},
            "persist": {"type": "boolean"}
        },
        "required": ["action", "resource_type"]
    });
    Arc::new(schema.as_object().cloned().unwrap_or_else(Map::new))
}

pub fn system_control_schema() -> Arc<Map<String, Value>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["status", "framework", "gates", "analytics", "config",
                         "maintenance", "guide", "injection", "session"]
            },
            "operation": {
                "type": "string",
                "description": "Sub-action, e.g. framework: switch|enable|disable|list; gates: enable|disable; session: list|inspect|clear; injection: set"
            },
            "framework": {"type": "string"},
            "enabled": {"type": "boolean"},
            "injection_type": {
                "type": "string",
                "enum": ["system-prompt", "gate-guidance", "style-guidance"]
            },
            "frequency": {
                "type": "string",
                "description": "always | first-only | never | every{n}"
            },
            "session_id": {"type": "string"}
        },
        "required": ["action"]
    });
    Arc::new(schema.as_object().cloned().unwrap_or_else(Map::new))
}

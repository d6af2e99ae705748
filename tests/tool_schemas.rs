//! Schema shape tests for the three MCP tools.

use prompt_forge::schemas;
use serde_json::Value;

fn schema_has_property(schema: &serde_json::Map<String, Value>, property: &str) -> bool {
    schema["properties"][property].is_object()
}

#[test]
fn prompt_engine_schema_structure() {
    let schema = schemas::prompt_engine_schema();
    for property in [
        "command",
        "chain_id",
        "user_response",
        "force_restart",
        "gate_action",
        "gate_verdict",
        "gates",
        "options",
    ] {
        assert!(
            schema_has_property(&schema, property),
            "prompt_engine schema missing '{}'",
            property
        );
    }
    let actions: Vec<&str> = schema["properties"]["gate_action"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(actions, vec!["retry", "skip", "abort"]);
}

#[test]
fn resource_manager_schema_structure() {
    let schema = schemas::resource_manager_schema();
    assert!(schema_has_property(&schema, "action"));
    assert!(schema_has_property(&schema, "resource_type"));
    assert!(schema_has_property(&schema, "from_version"));
    assert!(schema_has_property(&schema, "persist"));

    let actions: Vec<&str> = schema["properties"]["action"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    for action in [
        "create", "update", "delete", "reload", "list", "inspect", "analyze_type",
        "analyze_gates", "guide", "switch", "history", "rollback", "compare",
    ] {
        assert!(actions.contains(&action), "missing action '{}'", action);
    }

    let types: Vec<&str> = schema["properties"]["resource_type"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(types, vec!["prompt", "gate", "methodology"]);

    let required: Vec<&str> = schema["required"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(required, vec!["action", "resource_type"]);
}

#[test]
fn system_control_schema_structure() {
    let schema = schemas::system_control_schema();
    let actions: Vec<&str> = schema["properties"]["action"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    for action in [
        "status", "framework", "gates", "analytics", "config", "maintenance", "guide",
        "injection", "session",
    ] {
        assert!(actions.contains(&action), "missing action '{}'", action);
    }
    assert!(schema_has_property(&schema, "operation"));
    assert!(schema_has_property(&schema, "injection_type"));
}

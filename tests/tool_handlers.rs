//! Tool-handler integration tests: resource_manager CRUD + versioning and
//! system_control administration against a temp resources tree.

mod common;

use common::{test_server, write_file};
use rmcp::model::CallToolRequestParam;
use serde_json::{json, Map, Value};

fn call(name: &'static str, args: Value) -> CallToolRequestParam {
    let map: Map<String, Value> = args.as_object().cloned().unwrap_or_default();
    CallToolRequestParam {
        name: name.into(),
        arguments: Some(map),
    }
}

fn structured(result: &rmcp::model::CallToolResult) -> Value {
    result
        .structured_content
        .clone()
        .expect("structured content expected")
}

#[tokio::test]
async fn create_update_rollback_prompt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("resources/prompts")).unwrap();
    let server = test_server(dir.path()).await;

    // create
    let result = server
        .handle_resource_manager(call(
            "resource_manager",
            json!({
                "action": "create",
                "resource_type": "prompt",
                "id": "greet",
                "definition": {
                    "name": "Greet",
                    "template": "Say hello to {{ who }}",
                    "arguments": [{"name": "who", "type": "string", "required": true}]
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(structured(&result)["action"], "created");
    assert!(server.services.registry.snapshot().prompt("greet").is_some());

    // duplicate create fails
    let err = server
        .handle_resource_manager(call(
            "resource_manager",
            json!({
                "action": "create",
                "resource_type": "prompt",
                "id": "greet",
                "definition": {"name": "Greet", "template": "x"}
            }),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));

    // update
    server
        .handle_resource_manager(call(
            "resource_manager",
            json!({
                "action": "update",
                "resource_type": "prompt",
                "id": "greet",
                "definition": {
                    "name": "Greet",
                    "template": "Wave at {{ who }}",
                    "arguments": [{"name": "who", "type": "string", "required": true}]
                }
            }),
        ))
        .await
        .unwrap();
    let snapshot = server.services.registry.snapshot();
    assert!(snapshot.prompt("greet").unwrap().template.contains("Wave"));

    // history shows both versions, newest first
    let result = server
        .handle_resource_manager(call(
            "resource_manager",
            json!({
                "action": "history",
                "resource_type": "prompt",
                "id": "greet"
            }),
        ))
        .await
        .unwrap();
    let text = structured(&result)["text"].as_str().unwrap().to_string();
    assert!(text.contains("v2"));
    assert!(text.contains("v1"));

    // rollback to v1 restores the original template on disk and in memory
    server
        .handle_resource_manager(call(
            "resource_manager",
            json!({
                "action": "rollback",
                "resource_type": "prompt",
                "id": "greet",
                "version": 1
            }),
        ))
        .await
        .unwrap();
    let snapshot = server.services.registry.snapshot();
    assert!(snapshot.prompt("greet").unwrap().template.contains("hello"));
}

#[tokio::test]
async fn delete_requires_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("resources/prompts/doomed.toml"),
        "name = \"Doomed\"\ntemplate = \"x\"\n",
    );
    let server = test_server(dir.path()).await;

    let err = server
        .handle_resource_manager(call(
            "resource_manager",
            json!({"action": "delete", "resource_type": "prompt", "id": "doomed"}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("confirm=true"));

    server
        .handle_resource_manager(call(
            "resource_manager",
            json!({"action": "delete", "resource_type": "prompt", "id": "doomed", "confirm": true}),
        ))
        .await
        .unwrap();
    assert!(server.services.registry.snapshot().prompt("doomed").is_none());
}

#[tokio::test]
async fn action_resource_type_pairs_validated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("resources/prompts")).unwrap();
    let server = test_server(dir.path()).await;

    let err = server
        .handle_resource_manager(call(
            "resource_manager",
            json!({"action": "switch", "resource_type": "prompt", "id": "x"}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("methodology"));

    let err = server
        .handle_resource_manager(call(
            "resource_manager",
            json!({"action": "analyze_gates", "resource_type": "gate", "id": "x"}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("resource_type=prompt"));
}

#[tokio::test]
async fn methodology_switch_persists_state() {
    let dir = tempfile::tempdir().unwrap();
    let resources = dir.path().join("resources");
    write_file(
        &resources.join("methodologies/cageerf/methodology.toml"),
        r#"
name = "CAGEERF"
methodology_gates = []

[[phases]]
name = "Context"

[[phases]]
name = "Analysis"
"#,
    );
    let server = test_server(dir.path()).await;

    server
        .handle_resource_manager(call(
            "resource_manager",
            json!({"action": "switch", "resource_type": "methodology", "id": "CAGEERF"}),
        ))
        .await
        .unwrap();

    let state = server.services.framework_state.get().await;
    assert_eq!(state.active_framework.as_deref(), Some("cageerf"));

    // Persisted on disk with a schema version
    let raw = std::fs::read_to_string(dir.path().join("runtime-state/framework-state.json")).unwrap();
    let value: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["active_framework"], "cageerf");
    assert!(value["version"].is_number());
}

#[tokio::test]
async fn system_control_status_and_injection() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("resources/prompts/p.toml"),
        "name = \"P\"\ntemplate = \"x\"\n",
    );
    let server = test_server(dir.path()).await;

    let result = server
        .handle_system_control(call("system_control", json!({"action": "status"})))
        .await
        .unwrap();
    let status = structured(&result);
    assert_eq!(status["prompts"], 1);
    assert_eq!(status["gate_system_enabled"], true);
    assert_eq!(status["registry_generation"], 1);

    // Change gate-guidance injection to every3 and read it back
    server
        .handle_system_control(call(
            "system_control",
            json!({
                "action": "injection",
                "operation": "set",
                "injection_type": "gate-guidance",
                "frequency": "every3"
            }),
        ))
        .await
        .unwrap();
    let result = server
        .handle_system_control(call(
            "system_control",
            json!({"action": "injection", "operation": "status"}),
        ))
        .await
        .unwrap();
    let policy = structured(&result);
    assert_eq!(policy["gate_guidance"]["every"], 3);
}

#[tokio::test]
async fn gates_toggle_disables_gate_system() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("resources/prompts")).unwrap();
    let server = test_server(dir.path()).await;

    server
        .handle_system_control(call(
            "system_control",
            json!({"action": "gates", "operation": "disable"}),
        ))
        .await
        .unwrap();
    assert!(!server.services.gate_state.get().await.enabled);

    let raw =
        std::fs::read_to_string(dir.path().join("runtime-state/gate-system-state.json")).unwrap();
    assert!(raw.contains("false"));
}

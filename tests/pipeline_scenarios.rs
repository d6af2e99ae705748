//! End-to-end scenarios for the execution pipeline, run through the same
//! services the MCP tools use.

mod common;

use common::{test_server, write_analysis_chain, write_file};
use prompt_forge::error::PromptForgeError;
use prompt_forge::gates::PendingGateReview;
use prompt_forge::pipeline::{self, EngineRequest};

fn command_request(command: &str) -> EngineRequest {
    EngineRequest {
        command: Some(command.to_string()),
        ..Default::default()
    }
}

// S1: argument validation failure produces an actionable retry block
#[tokio::test]
async fn validation_failure_includes_retry_block() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("resources/prompts/summarize.toml"),
        r#"
name = "Summarize"
template = "Summarize {{ topic }}"

[[arguments]]
name = "topic"
type = "string"
required = true

[arguments.validation]
min_length = 10
"#,
    );
    let server = test_server(dir.path()).await;

    let err = pipeline::execute(command_request(">>summarize topic='ai'"), &server.services)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Argument Validation Failed"), "{}", message);
    assert!(message.contains("topic"));
    assert!(message.contains("at least 10 chars"));
    assert!(message.contains(">>summarize topic=\""));
}

// S2: resuming a suspended chain with a PASS verdict advances the session
#[tokio::test]
async fn chain_resume_with_gate_pass_advances() {
    let dir = tempfile::tempdir().unwrap();
    write_analysis_chain(&dir.path().join("resources"));
    let server = test_server(dir.path()).await;
    let sessions = &server.services.sessions;

    // Start the chain, then suspend it on a review as if a gate fired
    pipeline::execute(command_request(">>analysis_chain"), &server.services)
        .await
        .unwrap();
    sessions
        .set_pending_gate_review(
            "chain-analysis_chain",
            Some(PendingGateReview {
                gate_id: "quality".into(),
                gate_name: "Quality".into(),
                step_number: 1,
                rendered_prompt: "Gather the raw data for analysis.".into(),
                attempt: 0,
                max_attempts: 3,
                preserve_context: false,
            }),
        )
        .await
        .unwrap();

    let request = EngineRequest {
        chain_id: Some("chain-analysis_chain".to_string()),
        user_response: Some("step one complete".to_string()),
        gate_verdict: Some("GATE_REVIEW: PASS - criteria met".to_string()),
        ..Default::default()
    };
    let response = pipeline::execute(request, &server.services).await.unwrap();

    let session = sessions.get_session("chain-analysis_chain").await.unwrap();
    assert_eq!(session.current_step, 2);
    assert_eq!(
        session.chain_context.step_results.get(&1).map(String::as_str),
        Some("step one complete")
    );
    assert!(session.pending_gate_review.is_none());
    assert!(
        response.text.contains("Analyze this: step one complete"),
        "next step should render with the previous result: {}",
        response.text
    );
}

// S3: conditional branching on result length
#[tokio::test]
async fn conditional_steps_branch_on_result_length() {
    let dir = tempfile::tempdir().unwrap();
    let resources = dir.path().join("resources");
    write_file(
        &resources.join("prompts/data_chain/prompt.toml"),
        r#"
name = "Data Chain"
template = "chain"

[[chain_steps]]
step_number = 1
prompt_id = "data_chain/data_check"

[[chain_steps]]
step_number = 2
prompt_id = "data_chain/simple_analysis"

[chain_steps.conditional_execution]
type = "conditional"
expression = "utils.length(steps.data_check.result) < 1000"

[[chain_steps]]
step_number = 3
prompt_id = "data_chain/complex_analysis"

[chain_steps.conditional_execution]
type = "conditional"
expression = "utils.length(steps.data_check.result) >= 1000"
"#,
    );
    write_file(
        &resources.join("prompts/data_chain/data_check/prompt.toml"),
        "name = \"Data Check\"\ntemplate = \"Check the data.\"\n",
    );
    write_file(
        &resources.join("prompts/data_chain/simple_analysis/prompt.toml"),
        "name = \"Simple\"\ntemplate = \"Run the simple analysis.\"\n",
    );
    write_file(
        &resources.join("prompts/data_chain/complex_analysis/prompt.toml"),
        "name = \"Complex\"\ntemplate = \"Run the complex analysis.\"\n",
    );
    let server = test_server(dir.path()).await;
    let sessions = &server.services.sessions;

    // Input A: a short result selects the simple branch
    pipeline::execute(command_request(">>data_chain"), &server.services)
        .await
        .unwrap();
    let request = EngineRequest {
        chain_id: Some("chain-data_chain".to_string()),
        user_response: Some("x".repeat(500)),
        ..Default::default()
    };
    let response = pipeline::execute(request, &server.services).await.unwrap();
    assert!(
        response.text.contains("Run the simple analysis."),
        "{}",
        response.text
    );

    // Finishing the simple branch skips the complex one and completes
    let request = EngineRequest {
        chain_id: Some("chain-data_chain".to_string()),
        user_response: Some("simple done".to_string()),
        ..Default::default()
    };
    let response = pipeline::execute(request, &server.services).await.unwrap();
    assert!(response.text.contains("complete"), "{}", response.text);

    // Input B: a long result selects the complex branch
    sessions.clear_session("chain-data_chain").await.unwrap();
    pipeline::execute(command_request(">>data_chain"), &server.services)
        .await
        .unwrap();
    let request = EngineRequest {
        chain_id: Some("chain-data_chain".to_string()),
        user_response: Some("y".repeat(2000)),
        ..Default::default()
    };
    let response = pipeline::execute(request, &server.services).await.unwrap();
    assert!(
        response.text.contains("Run the complex analysis."),
        "{}",
        response.text
    );
    let session = sessions.get_session("chain-data_chain").await.unwrap();
    // The skipped simple step is marked as a completed placeholder
    let skipped = session.step_states.get(&2).unwrap();
    assert!(skipped.is_placeholder);
}

// S4: circular references fail with the resolution chain attached
#[tokio::test]
async fn circular_reference_reports_chain() {
    let dir = tempfile::tempdir().unwrap();
    let resources = dir.path().join("resources");
    write_file(
        &resources.join("prompts/a.toml"),
        "name = \"A\"\ntemplate = \"{{ref:b}}\"\n",
    );
    write_file(
        &resources.join("prompts/b.toml"),
        "name = \"B\"\ntemplate = \"{{ref:a}} tail\"\n",
    );
    let server = test_server(dir.path()).await;

    let err = pipeline::execute(command_request(">>a"), &server.services)
        .await
        .unwrap_err();
    match err {
        PromptForgeError::CircularReference { chain } => {
            assert_eq!(chain, vec!["a", "b", "a"]);
        }
        other => panic!("expected CircularReference, got {:?}", other),
    }
}

// S5: starting a chain whose session exists requires force_restart
#[tokio::test]
async fn duplicate_session_suggests_force_restart() {
    let dir = tempfile::tempdir().unwrap();
    let resources = dir.path().join("resources");
    write_file(
        &resources.join("prompts/demo/prompt.toml"),
        r#"
name = "Demo"
template = "chain"

[[chain_steps]]
step_number = 1
prompt_id = "demo/only_step"
"#,
    );
    write_file(
        &resources.join("prompts/demo/only_step/prompt.toml"),
        "name = \"Only\"\ntemplate = \"Do the one thing.\"\n",
    );
    let server = test_server(dir.path()).await;

    pipeline::execute(command_request(">>demo"), &server.services)
        .await
        .unwrap();
    let err = pipeline::execute(command_request(">>demo"), &server.services)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("chain-demo"), "{}", message);
    assert!(message.contains("force_restart"), "{}", message);
}

// Conflicting resume parameters are rejected before any work happens
#[tokio::test]
async fn force_restart_conflicts_with_chain_id() {
    let dir = tempfile::tempdir().unwrap();
    write_analysis_chain(&dir.path().join("resources"));
    let server = test_server(dir.path()).await;

    let request = EngineRequest {
        chain_id: Some("chain-analysis_chain".to_string()),
        force_restart: true,
        ..Default::default()
    };
    let err = pipeline::execute(request, &server.services).await.unwrap_err();
    assert!(matches!(err, PromptForgeError::Conflict { .. }));
}

// Gate FAIL verdicts re-render with retry hints until attempts run out
#[tokio::test]
async fn gate_fail_retries_then_requires_action() {
    let dir = tempfile::tempdir().unwrap();
    write_analysis_chain(&dir.path().join("resources"));
    let server = test_server(dir.path()).await;
    let sessions = &server.services.sessions;

    pipeline::execute(command_request(">>analysis_chain"), &server.services)
        .await
        .unwrap();
    sessions
        .set_pending_gate_review(
            "chain-analysis_chain",
            Some(PendingGateReview {
                gate_id: "quality".into(),
                gate_name: "Quality".into(),
                step_number: 1,
                rendered_prompt: "Gather the raw data for analysis.".into(),
                attempt: 0,
                max_attempts: 2,
                preserve_context: false,
            }),
        )
        .await
        .unwrap();

    // First FAIL: retry hints, attempt bumped
    let request = EngineRequest {
        chain_id: Some("chain-analysis_chain".to_string()),
        gate_verdict: Some("GATE_REVIEW: FAIL - missing citations".to_string()),
        ..Default::default()
    };
    let response = pipeline::execute(request, &server.services).await.unwrap();
    assert!(response.text.contains("Retry hints"), "{}", response.text);
    assert!(response.text.contains("missing citations"));
    let review = sessions
        .get_pending_gate_review("chain-analysis_chain")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(review.attempt, 1);

    // Second FAIL exhausts attempts and asks for gate_action
    let request = EngineRequest {
        chain_id: Some("chain-analysis_chain".to_string()),
        gate_verdict: Some("GATE_REVIEW: FAIL - still missing".to_string()),
        ..Default::default()
    };
    let response = pipeline::execute(request, &server.services).await.unwrap();
    assert!(response.text.contains("gate_action"), "{}", response.text);

    // skip treats the gate as passed and advances
    let request = EngineRequest {
        chain_id: Some("chain-analysis_chain".to_string()),
        gate_action: Some("skip".to_string()),
        user_response: Some("partial output".to_string()),
        ..Default::default()
    };
    pipeline::execute(request, &server.services).await.unwrap();
    let session = sessions.get_session("chain-analysis_chain").await.unwrap();
    assert_eq!(session.current_step, 2);
    assert!(session.pending_gate_review.is_none());
}

// A malformed verdict quotes the canonical grammar back
#[tokio::test]
async fn malformed_verdict_quotes_grammar() {
    let dir = tempfile::tempdir().unwrap();
    write_analysis_chain(&dir.path().join("resources"));
    let server = test_server(dir.path()).await;

    pipeline::execute(command_request(">>analysis_chain"), &server.services)
        .await
        .unwrap();
    server
        .services
        .sessions
        .set_pending_gate_review(
            "chain-analysis_chain",
            Some(PendingGateReview {
                gate_id: "quality".into(),
                gate_name: "Quality".into(),
                step_number: 1,
                rendered_prompt: String::new(),
                attempt: 0,
                max_attempts: 3,
                preserve_context: false,
            }),
        )
        .await
        .unwrap();

    let request = EngineRequest {
        chain_id: Some("chain-analysis_chain".to_string()),
        gate_verdict: Some("looks good to me".to_string()),
        ..Default::default()
    };
    let err = pipeline::execute(request, &server.services).await.unwrap_err();
    assert!(err.to_string().contains("GATE_REVIEW: PASS|FAIL"));
}

// Unknown prompt ids surface as resolution errors
#[tokio::test]
async fn unknown_prompt_is_a_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("resources/prompts")).unwrap();
    let server = test_server(dir.path()).await;

    let err = pipeline::execute(command_request(">>ghost"), &server.services)
        .await
        .unwrap_err();
    assert!(matches!(err, PromptForgeError::Resolution { .. }));
}

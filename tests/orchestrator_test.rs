//! Integration tests for the invocation loop: connection lifecycle, iteration
//! ceiling and error feedback, driven by scripted LLM and bridge doubles.

mod common;

use agent_mcp::agent::{InvocationResult, LlmReply};
use agent_mcp::auth::SystemBrowser;
use agent_mcp::error::{AgentError, FailureKind};
use agent_mcp::mcp::OperationOutcome;
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn run_parts(
    llm: ScriptedLlm,
    connector: FakeConnector,
    max_iterations: u32,
) -> (
    agent_mcp::agent::InvocationOrchestrator,
    Arc<ScriptedLlm>,
    Arc<BridgeCounters>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(llm);
    let counters = Arc::clone(&connector.counters);
    let orchestrator = orchestrator(
        todo_registry(),
        credential_provider(dir.path(), Arc::new(SystemBrowser)),
        Arc::new(connector),
        llm.clone(),
        max_iterations,
    );
    (orchestrator, llm, counters, dir)
}

#[tokio::test]
async fn test_list_projects_completes() {
    let llm = ScriptedLlm::new(vec![
        LlmReply::calls(vec![tool_call("c1", "list_projects", json!({}))]),
        LlmReply::final_text("Groceries, Work"),
    ]);
    let connector = FakeConnector::new(&["list_projects", "add_task"]).with_invocations(vec![
        InvokeBehavior::Reply(OperationOutcome::Success("[\"Groceries\",\"Work\"]".to_string())),
    ]);
    let (orchestrator, llm, counters, _dir) = run_parts(llm, connector, 20);

    let result = orchestrator
        .invoke("todo", "list projects", CancellationToken::new())
        .await;

    assert_eq!(
        result,
        InvocationResult::Completed {
            text: "Groceries, Work".to_string()
        }
    );
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.closes(), 1);
    assert_eq!(counters.invokes(), 1);

    let seen = llm.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].tool_names, vec!["list_projects", "add_task"]);
    // instruction, assistant call, tool result
    assert_eq!(seen[1].turn_count, 3);
    assert!(seen[1].last_turn.contains("Groceries"));
}

#[tokio::test]
async fn test_iteration_ceiling_is_exact() {
    let llm = ScriptedLlm::always(LlmReply::calls(vec![tool_call(
        "c",
        "list_projects",
        json!({}),
    )]));
    let connector = FakeConnector::new(&["list_projects"]);
    let (orchestrator, llm, counters, _dir) = run_parts(llm, connector, 3);

    let result = orchestrator
        .invoke("todo", "keep going", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::IterationLimitExceeded));
    assert_eq!(counters.invokes(), 3);
    assert_eq!(llm.calls(), 3);
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn test_calls_beyond_ceiling_in_one_turn_are_not_forwarded() {
    let llm = ScriptedLlm::always(LlmReply::calls(vec![
        tool_call("a", "list_projects", json!({})),
        tool_call("b", "list_projects", json!({})),
    ]));
    let connector = FakeConnector::new(&["list_projects"]);
    let (orchestrator, llm, counters, _dir) = run_parts(llm, connector, 3);

    let result = orchestrator
        .invoke("todo", "keep going", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::IterationLimitExceeded));
    assert_eq!(counters.invokes(), 3);
    assert_eq!(llm.calls(), 2);
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn test_operation_error_is_fed_back() {
    let llm = ScriptedLlm::new(vec![
        LlmReply::calls(vec![tool_call("c1", "add_task", json!({"project": "Nope"}))]),
        LlmReply::calls(vec![tool_call("c2", "add_task", json!({"project": "Work"}))]),
        LlmReply::final_text("Added to Work"),
    ]);
    let connector = FakeConnector::new(&["add_task"]).with_invocations(vec![
        InvokeBehavior::Reply(OperationOutcome::Failed(
            "[Tool Error] project not found".to_string(),
        )),
        InvokeBehavior::Reply(OperationOutcome::Success("added".to_string())),
    ]);
    let (orchestrator, llm, counters, _dir) = run_parts(llm, connector, 5);

    let result = orchestrator
        .invoke("todo", "add a task", CancellationToken::new())
        .await;

    assert!(result.is_completed());
    assert_eq!(counters.invokes(), 2);
    let seen = llm.seen.lock().unwrap();
    assert!(seen[1].last_turn.contains("project not found"));
    assert!(seen[1].last_turn.contains("is_error: true"));
}

#[tokio::test]
async fn test_unknown_operation_is_fed_back_without_invoking() {
    let llm = ScriptedLlm::new(vec![
        LlmReply::calls(vec![tool_call("c1", "delete_everything", json!({}))]),
        LlmReply::final_text("I cannot do that"),
    ]);
    let connector = FakeConnector::new(&["list_projects"]);
    let (orchestrator, llm, counters, _dir) = run_parts(llm, connector, 5);

    let result = orchestrator
        .invoke("todo", "delete everything", CancellationToken::new())
        .await;

    assert!(result.is_completed());
    assert_eq!(counters.invokes(), 0);
    let seen = llm.seen.lock().unwrap();
    assert!(seen[1].last_turn.contains("unknown operation"));
}

#[tokio::test]
async fn test_transport_loss_fails_and_closes_once() {
    let llm = ScriptedLlm::always(LlmReply::calls(vec![tool_call(
        "c",
        "list_projects",
        json!({}),
    )]));
    let connector =
        FakeConnector::new(&["list_projects"]).with_default(InvokeBehavior::Disconnect);
    let (orchestrator, _llm, counters, _dir) = run_parts(llm, connector, 5);

    let result = orchestrator
        .invoke("todo", "list", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::ConnectionError));
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn test_panic_mid_acting_still_closes() {
    let llm = ScriptedLlm::always(LlmReply::calls(vec![tool_call(
        "c",
        "list_projects",
        json!({}),
    )]));
    let connector = FakeConnector::new(&["list_projects"]).with_default(InvokeBehavior::Panic);
    let (orchestrator, _llm, counters, _dir) = run_parts(llm, connector, 5);

    let result = orchestrator
        .invoke("todo", "list", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::UnexpectedFault));
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn test_llm_failure_is_unexpected_fault() {
    let connector = FakeConnector::new(&["list_projects"]);
    let (orchestrator, _llm, counters, _dir) =
        run_parts(ScriptedLlm::failing("rate limited"), connector, 5);

    let result = orchestrator
        .invoke("todo", "list", CancellationToken::new())
        .await;

    match result {
        InvocationResult::Failed { kind, message } => {
            assert_eq!(kind, FailureKind::UnexpectedFault);
            assert!(message.contains("rate limited"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn test_open_failure_skips_close() {
    let connector = FakeConnector::new(&["list_projects"])
        .failing_open(|| AgentError::connection("spawn failed"));
    let (orchestrator, llm, counters, _dir) =
        run_parts(ScriptedLlm::new(vec![]), connector, 5);

    let result = orchestrator
        .invoke("todo", "list", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::ConnectionError));
    assert_eq!(counters.opens(), 0);
    assert_eq!(counters.closes(), 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_discovery_failure_closes() {
    let connector = FakeConnector::new(&["list_projects"]).failing_discovery();
    let (orchestrator, llm, counters, _dir) =
        run_parts(ScriptedLlm::new(vec![]), connector, 5);

    let result = orchestrator
        .invoke("todo", "list", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::ConnectionError));
    assert_eq!(counters.closes(), 1);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_unknown_server_is_config_error() {
    let connector = FakeConnector::new(&[]);
    let (orchestrator, _llm, counters, _dir) =
        run_parts(ScriptedLlm::new(vec![]), connector, 5);

    let result = orchestrator
        .invoke("calendar", "list", CancellationToken::new())
        .await;

    assert_eq!(result.kind(), Some(FailureKind::ConfigError));
    assert_eq!(counters.opens(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let connector = FakeConnector::new(&["list_projects"]);
    let (orchestrator, llm, counters, _dir) =
        run_parts(ScriptedLlm::new(vec![]), connector, 5);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orchestrator.invoke("todo", "list", cancel).await;

    assert_eq!(result.kind(), Some(FailureKind::Cancelled));
    assert_eq!(counters.opens(), 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_cancelled_while_thinking_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(&["list_projects"]);
    let counters = Arc::clone(&connector.counters);
    let orchestrator = orchestrator(
        todo_registry(),
        credential_provider(dir.path(), Arc::new(SystemBrowser)),
        Arc::new(connector),
        Arc::new(StalledLlm),
        5,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = Arc::clone(&counters);
    tokio::spawn(async move {
        while watched.opens() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.invoke("todo", "list projects", cancel),
    )
    .await
    .unwrap();

    assert_eq!(result.kind(), Some(FailureKind::Cancelled));
    assert_eq!(counters.opens(), 1);
    assert_eq!(counters.closes(), 1);
    assert_eq!(counters.invokes(), 0);
}

#[tokio::test]
async fn test_failed_result_renders_kind_tag() {
    let result = InvocationResult::failed(FailureKind::AuthTimeout, "no redirect within 300s");
    assert_eq!(result.to_string(), "AuthTimeout: no redirect within 300s");
}

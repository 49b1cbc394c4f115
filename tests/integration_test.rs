// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests exercising the gateway, sessions, tools, and core agent
/// crates together — as opposed to each crate's own in-module unit tests.
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use vargos_config::{AgentConfig, AgentMode, Config, ToolsConfig};
use vargos_core::{sanitize_history, turn_limit_for_session_key, Agent, AgentEvent, AgentRuntimeContext};
use vargos_gateway::{connect_in_process, GatewayHub, NullHandler, Registration};
use vargos_model::{Message, MockProvider, Role};
use vargos_sessions::{
    service::registration as sessions_registration, FileSessionStore, Session, SessionKind,
    SessionsService,
};
use vargos_tools::{events::ToolEvent, ApprovalPolicy, ReadFileTool, ShellTool, Tool, ToolCall, ToolPolicy, ToolRegistry, WriteTool};

fn mock_agent(mode: AgentMode) -> Agent {
    let model: Arc<dyn vargos_model::ModelProvider> = Arc::new(MockProvider);
    let tools = Arc::new(ToolRegistry::default());
    let config = Arc::new(AgentConfig::default());
    let mode_lock = Arc::new(Mutex::new(mode));
    let (_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
    Agent::new(model, tools, config, AgentRuntimeContext::default(), mode_lock, tool_event_rx, 128_000)
}

#[tokio::test]
async fn agent_returns_mock_response() {
    let mut agent = mock_agent(AgentMode::Agent);
    let (tx, mut rx) = mpsc::channel(64);
    agent.submit("hello", tx).await.unwrap();

    let mut got_text = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::TextDelta(t) = event {
            assert!(t.contains("MOCK"));
            got_text = true;
        }
    }
    assert!(got_text, "expected at least one TextDelta event");
}

#[test]
fn config_defaults_are_valid() {
    let cfg = Config::default();
    assert_eq!(cfg.model.provider, "openai");
    assert!(cfg.agent.max_tool_rounds > 0);
    assert!(cfg.agent.compaction_threshold > 0.0);
}

#[test]
fn tool_policy_auto_approve() {
    let cfg = ToolsConfig::default();
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("cat /etc/hosts"), ApprovalPolicy::Auto);
    assert_eq!(policy.decide("ls /tmp"), ApprovalPolicy::Auto);
}

#[test]
fn tool_policy_deny() {
    let cfg = ToolsConfig { deny_patterns: vec!["rm -rf /*".into()], ..ToolsConfig::default() };
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("rm -rf /*"), ApprovalPolicy::Deny);
}

#[tokio::test]
async fn shell_tool_executes_echo() {
    let tool = ShellTool::default();
    let call = ToolCall { id: "1".into(), name: "shell".into(), args: serde_json::json!({ "shell_command": "echo hello_world" }) };
    let output = tool.execute(&call).await;
    assert!(!output.is_error);
    assert!(output.content.contains("hello_world"));
}

#[tokio::test]
async fn fs_tool_write_read_roundtrip() {
    let path = format!("/tmp/vargos_test_{}.txt", uuid::Uuid::new_v4());

    let write_call = ToolCall {
        id: "w1".into(),
        name: "write_file".into(),
        args: serde_json::json!({ "path": path, "text": "roundtrip", "append": false }),
    };
    let wo = WriteTool.execute(&write_call).await;
    assert!(!wo.is_error, "write failed: {}", wo.content);

    let read_call = ToolCall { id: "r1".into(), name: "read_file".into(), args: serde_json::json!({ "path": path }) };
    let ro = ReadFileTool.execute(&read_call).await;
    assert!(!ro.is_error);
    assert!(ro.content.contains("roundtrip"));

    let _ = std::fs::remove_file(&path);
}

// ── Session key grammar / sanitizer ───────────────────────────────────────────

#[test]
fn turn_limit_depends_on_session_key_grammar() {
    assert_eq!(turn_limit_for_session_key("slack:u123"), 30);
    assert_eq!(turn_limit_for_session_key("cli:local"), 50);
    assert_eq!(turn_limit_for_session_key("cron:heartbeat"), 10);
    assert_eq!(turn_limit_for_session_key("slack:u123:subagent:abc"), 10);
}

#[test]
fn sanitize_history_repairs_dangling_tool_call() {
    use vargos_model::{FunctionCall, MessageContent};
    let messages = vec![
        Message::user("do something"),
        Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: "call_1".into(),
                function: FunctionCall { name: "shell".into(), arguments: "{}".into() },
            },
        },
        // no matching ToolResult — the sanitizer must synthesize one
    ];
    let sanitized = sanitize_history(messages, 50);
    let has_result = sanitized
        .iter()
        .any(|m| matches!(&m.content, MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == "call_1"));
    assert!(has_result, "dangling tool call must get a synthetic result appended");
}

// ── Session Service over an in-process gateway ────────────────────────────────

#[tokio::test]
async fn session_service_create_and_fetch_round_trips_over_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path().join("sessions")));
    let sessions = SessionsService::new(store);

    let hub = GatewayHub::new();
    let sessions_client = connect_in_process(&hub, sessions_registration(), sessions.clone()).await.unwrap();
    sessions.attach_client(sessions_client);

    let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler))
        .await
        .unwrap();

    let created: Session = caller
        .call(
            "session.create",
            serde_json::json!({ "sessionKey": "cli:test", "kind": SessionKind::Main }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(created.session_key, "cli:test");

    let fetched: Option<Session> = caller
        .call("session.get", serde_json::json!({ "sessionKey": "cli:test" }), None)
        .await
        .unwrap();
    assert_eq!(fetched.unwrap().session_key, "cli:test");

    let _: serde_json::Value = caller
        .call(
            "session.addMessage",
            serde_json::json!({ "sessionKey": "cli:test", "role": "user", "content": "hi" }),
            None,
        )
        .await
        .unwrap();

    #[derive(serde::Deserialize)]
    struct MsgView {
        role: Role,
    }
    let messages: Vec<MsgView> = caller
        .call("session.getMessages", serde_json::json!({ "sessionKey": "cli:test" }), None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn session_service_list_filters_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path().join("sessions")));
    let sessions = SessionsService::new(store);

    let hub = GatewayHub::new();
    let sessions_client = connect_in_process(&hub, sessions_registration(), sessions.clone()).await.unwrap();
    sessions.attach_client(sessions_client);

    let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler))
        .await
        .unwrap();

    let _: Session = caller
        .call("session.create", serde_json::json!({ "sessionKey": "cli:a", "kind": SessionKind::Main }), None)
        .await
        .unwrap();
    let _: Session = caller
        .call(
            "session.create",
            serde_json::json!({ "sessionKey": "cli:a:subagent:1", "kind": SessionKind::Subagent }),
            None,
        )
        .await
        .unwrap();

    let mains: Vec<Session> = caller
        .call("session.list", serde_json::json!({ "kind": SessionKind::Main }), None)
        .await
        .unwrap();
    assert_eq!(mains.len(), 1);
    assert_eq!(mains[0].session_key, "cli:a");
}

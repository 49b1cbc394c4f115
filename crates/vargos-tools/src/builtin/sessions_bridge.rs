// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tools that let an agent reach across sessions over the gateway:
//! `sessions_spawn`, `sessions_list`, `sessions_history`, `sessions_send`.
//!
//! Every one of these names appears on `SUBAGENT_DENIED_TOOLS` in
//! `vargos-core`: a sub-agent session is denied the ability to fan out
//! further or rummage through sibling conversations. The denial happens at
//! the registry layer (`ToolRegistry::with_denylist`), not here — these
//! tools are written exactly as they'd behave for a session that is allowed
//! to call them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use vargos_gateway::GatewayClient;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `sessions_spawn` polls `agent.status` waiting for the child run
/// to reach a terminal state before giving up and returning what it has.
const SPAWN_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Creates a `:subagent:` child session under the calling session and runs
/// a task on it synchronously, returning the child's final response.
///
/// This is the gateway-addressable counterpart to the in-process `task`
/// tool: the child gets its own session history, its own turn-limit bucket,
/// and shows up in `session.list`/`session.getMessages` like any other
/// session, rather than existing only for the lifetime of one tool call.
pub struct SessionsSpawnTool {
    client: Arc<GatewayClient>,
    owner_session_key: String,
}

impl SessionsSpawnTool {
    pub fn new(client: Arc<GatewayClient>, owner_session_key: impl Into<String>) -> Self {
        Self { client, owner_session_key: owner_session_key.into() }
    }
}

#[async_trait]
impl Tool for SessionsSpawnTool {
    fn name(&self) -> &str {
        "sessions_spawn"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent in its own gateway session to complete a focused task, and wait for \
         its final reply. Unlike `task`, the sub-agent's history persists as a session you can \
         later inspect with sessions_history. Returns the sub-agent's final text response."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task to hand to the sub-agent"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the child session"
                }
            },
            "required": ["task"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let task = match call.args.get("task").and_then(|v| v.as_str()) {
            Some(t) => t.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'task'"),
        };
        let label = call.args.get("label").and_then(|v| v.as_str()).map(str::to_string);

        let child_key = format!("{}:subagent:{}", self.owner_session_key, Uuid::new_v4());

        let created = self
            .client
            .call::<_, Value>(
                "session.create",
                json!({ "sessionKey": child_key, "kind": "subagent", "label": label }),
                Some(CALL_TIMEOUT),
            )
            .await;
        if let Err(e) = created {
            return ToolOutput::err(&call.id, format!("failed to create sub-agent session: {e}"));
        }

        let run: Value = match self
            .client
            .call(
                "agent.run",
                json!({ "sessionKey": child_key, "task": task }),
                Some(CALL_TIMEOUT),
            )
            .await
        {
            Ok(v) => v,
            Err(e) => return ToolOutput::err(&call.id, format!("failed to start sub-agent run: {e}")),
        };
        let Some(run_id) = run.get("runId").and_then(|v| v.as_str()).map(str::to_string) else {
            return ToolOutput::err(&call.id, "agent.run returned no runId");
        };

        let deadline = tokio::time::Instant::now() + SPAWN_WAIT_TIMEOUT;
        loop {
            let status: Value = match self
                .client
                .call("agent.status", json!({ "runId": run_id }), Some(CALL_TIMEOUT))
                .await
            {
                Ok(v) => v,
                Err(e) => return ToolOutput::err(&call.id, format!("failed to poll sub-agent status: {e}")),
            };
            match status.get("status").and_then(|v| v.as_str()) {
                Some("completed") | Some("failed") | Some("aborted") => {
                    return match self.final_response(&child_key).await {
                        Ok(text) => ToolOutput::ok(
                            &call.id,
                            format!("[sub-agent session {child_key} {}]\n{text}", status["status"]),
                        ),
                        Err(e) => ToolOutput::err(&call.id, e),
                    };
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return ToolOutput::err(
                    &call.id,
                    format!("sub-agent {child_key} did not complete within {SPAWN_WAIT_TIMEOUT:?}"),
                );
            }
            tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
        }
    }
}

impl SessionsSpawnTool {
    async fn final_response(&self, session_key: &str) -> Result<String, String> {
        let messages: Value = self
            .client
            .call(
                "session.getMessages",
                json!({ "sessionKey": session_key }),
                Some(CALL_TIMEOUT),
            )
            .await
            .map_err(|e| format!("failed to read sub-agent history: {e}"))?;
        let Some(list) = messages.as_array() else {
            return Ok(String::new());
        };
        let text = list
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("assistant"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("(sub-agent produced no text response)")
            .to_string();
        Ok(text)
    }
}

/// Lists known sessions via `session.list`.
pub struct SessionsListTool {
    client: Arc<GatewayClient>,
}

impl SessionsListTool {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for SessionsListTool {
    fn name(&self) -> &str {
        "sessions_list"
    }

    fn description(&self) -> &str {
        "List known sessions, optionally filtered by kind (main, subagent, cron)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": {
                    "type": "string",
                    "enum": ["main", "subagent", "cron"],
                    "description": "Restrict the listing to this session kind"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of sessions to return"
                }
            },
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let mut params = json!({});
        if let Some(kind) = call.args.get("kind").and_then(|v| v.as_str()) {
            params["kind"] = json!(kind);
        }
        if let Some(limit) = call.args.get("limit").and_then(|v| v.as_u64()) {
            params["limit"] = json!(limit);
        }
        match self.client.call::<_, Value>("session.list", params, Some(CALL_TIMEOUT)).await {
            Ok(v) => ToolOutput::ok(&call.id, serde_json::to_string_pretty(&v).unwrap_or_default()),
            Err(e) => ToolOutput::err(&call.id, format!("session.list failed: {e}")),
        }
    }
}

/// Reads the message history of another session via `session.getMessages`.
pub struct SessionsHistoryTool {
    client: Arc<GatewayClient>,
}

impl SessionsHistoryTool {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for SessionsHistoryTool {
    fn name(&self) -> &str {
        "sessions_history"
    }

    fn description(&self) -> &str {
        "Read the message history of another session by key."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sessionKey": {
                    "type": "string",
                    "description": "The session to read"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of messages to return (most recent)"
                }
            },
            "required": ["sessionKey"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(session_key) = call.args.get("sessionKey").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'sessionKey'");
        };
        let mut params = json!({ "sessionKey": session_key });
        if let Some(limit) = call.args.get("limit").and_then(|v| v.as_u64()) {
            params["limit"] = json!(limit);
        }
        match self.client.call::<_, Value>("session.getMessages", params, Some(CALL_TIMEOUT)).await {
            Ok(v) => ToolOutput::ok(&call.id, serde_json::to_string_pretty(&v).unwrap_or_default()),
            Err(e) => ToolOutput::err(&call.id, format!("session.getMessages failed: {e}")),
        }
    }
}

/// Appends a message to another session via `session.addMessage`, without
/// triggering a run on it. Useful for leaving a note on a sibling session
/// the caller does not want to wake up immediately.
pub struct SessionsSendTool {
    client: Arc<GatewayClient>,
}

impl SessionsSendTool {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for SessionsSendTool {
    fn name(&self) -> &str {
        "sessions_send"
    }

    fn description(&self) -> &str {
        "Append a message to another session without triggering a run on it. The message shows \
         up the next time that session runs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sessionKey": {
                    "type": "string",
                    "description": "The session to send to"
                },
                "content": {
                    "type": "string",
                    "description": "The message text"
                }
            },
            "required": ["sessionKey", "content"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(session_key) = call.args.get("sessionKey").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'sessionKey'");
        };
        let Some(content) = call.args.get("content").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'content'");
        };
        let params = json!({
            "sessionKey": session_key,
            "role": "system",
            "content": content,
        });
        match self.client.call::<_, Value>("session.addMessage", params, Some(CALL_TIMEOUT)).await {
            Ok(_) => ToolOutput::ok(&call.id, format!("sent to {session_key}")),
            Err(e) => ToolOutput::err(&call.id, format!("session.addMessage failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_schema_requires_task() {
        let client = test_client();
        let t = SessionsSpawnTool::new(client, "whatsapp:u1");
        let required = t.parameters_schema()["required"].clone();
        assert_eq!(required, json!(["task"]));
    }

    #[test]
    fn history_schema_requires_session_key() {
        let client = test_client();
        let t = SessionsHistoryTool::new(client);
        let required = t.parameters_schema()["required"].clone();
        assert_eq!(required, json!(["sessionKey"]));
    }

    #[test]
    fn send_schema_requires_session_key_and_content() {
        let client = test_client();
        let t = SessionsSendTool::new(client);
        let required: Vec<String> = t.parameters_schema()["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(required.contains(&"sessionKey".to_string()));
        assert!(required.contains(&"content".to_string()));
    }

    /// Builds a `GatewayClient` connected to a throwaway hub, purely so tests
    /// can construct these tools without a live gateway.
    fn test_client() -> Arc<GatewayClient> {
        use vargos_gateway::{GatewayHub, NullHandler, Registration};
        let hub = GatewayHub::new();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            vargos_gateway::connect_in_process(
                &hub,
                Registration::new("test", "1"),
                Arc::new(NullHandler),
            )
            .await
            .unwrap()
        })
    }
}

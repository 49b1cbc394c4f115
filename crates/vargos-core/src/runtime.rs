// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent Service: a thin gateway shell in front of the per-session
//! dispatcher runtime that actually drives [`crate::Agent`].
//!
//! The gateway-facing pieces (`agent.run`/`agent.abort`/`agent.status`,
//! `run.started`/`run.delta`/`run.completed`) are new — grounded in
//! `vargos_sessions::SessionsService`'s "attach the client after
//! construction" pattern (a [`tokio::sync::OnceCell`] resolves the
//! handler-needs-client-but-client-needs-handler chicken/egg problem) and in
//! the subagent re-prompt design note: the completion handler calls back into
//! the gateway's own `agent.run` method rather than holding a direct
//! reference to a sibling session's dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tracing::{error, warn};
use uuid::Uuid;

use vargos_gateway::{ErrorKind, GatewayClient, Registration, RpcError, ServiceHandler};
use vargos_sessions::is_subagent_key;

use crate::events::AgentEvent;
use crate::Agent;

const MAX_ITERATIONS_DEFAULT: u32 = 10;
const TYPING_RETRIGGER_TASK: &str = "a sub-agent completed; summarize and continue";

/// The tools a `:subagent:` session is never allowed to call — spawning or
/// reading other sessions from inside a sub-agent would let it recurse past
/// the depth guard the Task tool already enforces in spirit.
pub const SUBAGENT_DENIED_TOOLS: &[&str] =
    &["sessions_spawn", "sessions_list", "sessions_history", "sessions_send"];

/// Builds a ready-to-run [`Agent`] for a given session key.
///
/// Implemented by `vargos-bootstrap`'s `AgentBuilder` wrapper so
/// `vargos-core` never depends on the tool-registry construction crate
/// (avoiding the circular `vargos-core` → `vargos-bootstrap` → `vargos-core`
/// import that a direct dependency would create).
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Construct (or resume) the agent that should handle `session_key`.
    /// Implementations decide the tool-set profile from the key: sessions
    /// matching `:subagent:` get the restricted sub-agent profile.
    async fn build_agent(&self, session_key: &str) -> anyhow::Result<Agent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRunInfo {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    pub status: RunStatus,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
}

struct RunHandle {
    info: AgentRunInfo,
    cancel: Option<oneshot::Sender<()>>,
}

/// One job handed to a session's dispatcher task.
struct RunJob {
    run_id: String,
    task: String,
    images: Vec<String>,
    retrigger: bool,
    cancel_rx: oneshot::Receiver<()>,
}

/// Owns one live [`Agent`] and processes [`RunJob`]s strictly in order —
/// the invariant that prevents interleaved tool-call/result
/// frames within one conversation.
struct SessionDispatcher {
    tx: mpsc::Sender<RunJob>,
}

impl SessionDispatcher {
    fn spawn(session_key: String, mut agent: Agent, runtime: Arc<RuntimeInner>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RunJob>(32);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                runtime.run_job(&session_key, &mut agent, job).await;
            }
        });
        Self { tx }
    }
}

struct RuntimeInner {
    client: OnceCell<Arc<GatewayClient>>,
    dispatchers: Mutex<HashMap<String, SessionDispatcher>>,
    runs: Mutex<HashMap<String, RunHandle>>,
    factory: Arc<dyn AgentFactory>,
    max_iterations: u32,
}

impl RuntimeInner {
    fn client(&self) -> Option<&Arc<GatewayClient>> {
        self.client.get()
    }

    fn emit(&self, name: &str, payload: serde_json::Value) {
        if let Some(client) = self.client() {
            client.emit(name, payload);
        } else {
            warn!(event = name, "agent runtime not yet attached to a gateway client; dropping event");
        }
    }

    /// Drive one run to completion, translating `AgentEvent`s into
    /// `run.delta` events and finishing with `run.completed`.
    async fn run_job(&self, session_key: &str, agent: &mut Agent, job: RunJob) {
        let RunJob { run_id, task, images, retrigger, cancel_rx } = job;
        let started_at = chrono::Utc::now();

        self.emit(
            "run.started",
            json!({ "sessionKey": session_key, "runId": run_id }),
        );

        if !task.is_empty() {
            self.persist_message(session_key, "user", &task).await;
        }

        let (tx, mut event_rx) = mpsc::channel::<AgentEvent>(64);
        let forward_run_id = run_id.clone();
        let forwarder_client = self.client.get().cloned();
        let forward_task = tokio::spawn(async move {
            let mut response = String::new();
            let mut aborted = false;
            while let Some(event) = event_rx.recv().await {
                match event {
                    AgentEvent::TextDelta(delta) => {
                        if let Some(client) = &forwarder_client {
                            client.emit("run.delta", json!({ "runId": forward_run_id, "delta": delta }));
                        }
                    }
                    AgentEvent::TextComplete(text) => response = text,
                    AgentEvent::Aborted { partial_text } => {
                        aborted = true;
                        if response.is_empty() {
                            response = partial_text;
                        }
                    }
                    AgentEvent::ToolCallStarted(call) => {
                        if let Some(client) = &forwarder_client {
                            client.emit(
                                "tool.started",
                                json!({ "runId": forward_run_id, "callId": call.id, "name": call.name }),
                            );
                        }
                    }
                    AgentEvent::ToolCallFinished { call_id, tool_name, is_error, .. } => {
                        if let Some(client) = &forwarder_client {
                            client.emit(
                                "tool.completed",
                                json!({ "runId": forward_run_id, "callId": call_id, "name": tool_name, "isError": is_error }),
                            );
                        }
                    }
                    _ => {}
                }
            }
            (response, aborted)
        });

        if !images.is_empty() {
            // `submit_with_parts` (the multimodal entry point) has no
            // cancellable variant yet; until it does, image attachments on a
            // cancellable run are dropped with a warning rather than losing
            // cancellation support.
            warn!(session_key, run_id, "dropping {} image(s): no cancellable multimodal submit path yet", images.len());
        }
        let result = agent.submit_with_cancel(&task, tx, cancel_rx).await;

        let (response, aborted) = forward_task.await.unwrap_or_default();

        let success = result.is_ok() && !aborted;
        let status = if aborted {
            RunStatus::Aborted
        } else if result.is_ok() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        if let Err(err) = &result {
            error!(session_key, run_id, error = %err, "agent run failed");
        }

        if success && !response.is_empty() {
            self.persist_message(session_key, "assistant", &response).await;
        }

        {
            let mut runs = self.runs.lock().await;
            if let Some(handle) = runs.get_mut(&run_id) {
                handle.info.status = status;
                handle.cancel = None;
            }
        }

        self.emit(
            "run.completed",
            json!({
                "sessionKey": session_key,
                "runId": run_id,
                "success": success,
                "response": if response.is_empty() { serde_json::Value::Null } else { json!(response) },
            }),
        );

        if success && is_subagent_key(session_key) && !retrigger {
            let duration_ms = (chrono::Utc::now() - started_at).num_milliseconds().max(0);
            self.reprompt_parent_after_subagent(session_key, &response, status, duration_ms).await;
        }
    }

    /// Append one turn to the durable session log via the Session Service
    /// ("the only writer per session is its agent runtime
    /// dispatcher"). Best-effort: a failure here is logged, not fatal — the
    /// in-memory `Agent` already holds the turn, so the conversation
    /// continues even if persistence is briefly unavailable.
    async fn persist_message(&self, session_key: &str, role: &str, content: &str) {
        let Some(client) = self.client() else { return };
        let result = client
            .call::<_, serde_json::Value>(
                "session.addMessage",
                json!({ "sessionKey": session_key, "role": role, "content": content }),
                None,
            )
            .await;
        if let Err(err) = result {
            warn!(session_key, role, error = %err, "failed to persist session message");
        }
    }

    /// Sub-agent announcement & re-prompt: tell the parent
    /// session what happened and, if its root is channel-rooted, re-enqueue
    /// it so it can summarize and continue.
    async fn reprompt_parent_after_subagent(
        &self,
        child_key: &str,
        response: &str,
        status: RunStatus,
        duration_ms: i64,
    ) {
        let Some((parent_key, child_id)) = vargos_sessions::split_subagent_key(child_key) else {
            return;
        };
        let Some(client) = self.client() else { return };

        // The prose stays the primary payload (advisory, may change freely),
        // but `metadata` carries the same facts structured so a parent-side
        // LLM can read either representation without a format migration.
        let preview: String = response.chars().take(500).collect();
        let note = format!(
            "Sub-agent `{child_id}` completed (status: {status:?}, {duration_ms}ms).\n\nResponse preview:\n{preview}"
        );
        let append = client
            .call::<_, serde_json::Value>(
                "session.addMessage",
                json!({
                    "sessionKey": parent_key,
                    "role": "system",
                    "content": note,
                    "metadata": {
                        "type": "subagent_completion",
                        "childSessionKey": child_key,
                        "childId": child_id,
                        "status": status,
                        "durationMs": duration_ms,
                        "responsePreview": preview,
                    },
                }),
                None,
            )
            .await;
        if let Err(err) = append {
            warn!(parent_key, error = %err, "failed to append sub-agent completion note to parent session");
            return;
        }

        // Only channel-rooted parents (not cli:/cron: roots) get an automatic
        // re-prompt — a human or cron trigger drives those explicitly.
        if parent_key.starts_with("cli:") || parent_key.starts_with("cron:") {
            return;
        }

        let _ = client
            .call::<_, serde_json::Value>(
                "agent.run",
                json!({
                    "sessionKey": parent_key,
                    "task": TYPING_RETRIGGER_TASK,
                    "retrigger": true,
                }),
                None,
            )
            .await;
    }
}

/// Per-session FIFO dispatch over [`Agent`], exposed through the gateway as
/// `agent.run` / `agent.abort` / `agent.status`.
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                client: OnceCell::new(),
                dispatchers: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
                factory,
                max_iterations: MAX_ITERATIONS_DEFAULT,
            }),
        }
    }

    pub fn registration() -> Registration {
        Registration::new("agent", "1")
            .methods(["agent.run", "agent.abort", "agent.status"])
            .events(["run.started", "run.delta", "run.completed"])
            .subscriptions(["message.received", "cron.trigger", "run.completed"])
    }

    /// Supply the connected client once `connect_in_process`/`connect_ws`
    /// returns it. Must be called exactly once before any method is handled.
    pub fn attach_client(&self, client: Arc<GatewayClient>) {
        let _ = self.inner.client.set(client);
    }

    async fn dispatcher_for(&self, session_key: &str) -> anyhow::Result<mpsc::Sender<RunJob>> {
        let mut dispatchers = self.inner.dispatchers.lock().await;
        if let Some(d) = dispatchers.get(session_key) {
            return Ok(d.tx.clone());
        }
        let agent = self.inner.factory.build_agent(session_key).await?;
        let dispatcher = SessionDispatcher::spawn(session_key.to_string(), agent, self.inner.clone());
        let tx = dispatcher.tx.clone();
        dispatchers.insert(session_key.to_string(), dispatcher);
        Ok(tx)
    }
}

#[derive(Debug, Deserialize)]
struct RunParams {
    #[serde(rename = "sessionKey")]
    session_key: String,
    #[serde(default)]
    task: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    retrigger: bool,
    // model/provider/channel/bootstrapOverrides are accepted for API
    // compatibility but the current factory resolves them from config; a
    // future revision can thread per-call overrides through `AgentFactory`.
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AbortParams {
    #[serde(rename = "runId")]
    run_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusParams {
    #[serde(default, rename = "runId")]
    run_id: Option<String>,
}

#[async_trait]
impl ServiceHandler for AgentRuntime {
    async fn handle_method(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        match method {
            "agent.run" => {
                let p: RunParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let _ = (&p.model, &p.provider, &p.channel);

                let run_id = Uuid::new_v4().to_string();
                let (cancel_tx, cancel_rx) = oneshot::channel();
                self.inner.runs.lock().await.insert(
                    run_id.clone(),
                    RunHandle {
                        info: AgentRunInfo {
                            run_id: run_id.clone(),
                            session_key: p.session_key.clone(),
                            status: RunStatus::Running,
                            started_at: chrono::Utc::now(),
                        },
                        cancel: Some(cancel_tx),
                    },
                );

                let tx = self
                    .dispatcher_for(&p.session_key)
                    .await
                    .map_err(|e| RpcError::new(ErrorKind::Fatal, e.to_string()))?;

                tx.send(RunJob {
                    run_id: run_id.clone(),
                    task: p.task,
                    images: p.images,
                    retrigger: p.retrigger,
                    cancel_rx,
                })
                .await
                .map_err(|_| RpcError::new(ErrorKind::Disconnected, "session dispatcher gone"))?;

                Ok(json!({ "runId": run_id, "sessionKey": p.session_key }))
            }
            "agent.abort" => {
                let p: AbortParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let mut runs = self.inner.runs.lock().await;
                let Some(handle) = runs.get_mut(&p.run_id) else {
                    return Err(RpcError::new(ErrorKind::NotFound, format!("no such run `{}`", p.run_id)));
                };
                if let Some(cancel) = handle.cancel.take() {
                    let _ = cancel.send(());
                }
                let _ = &p.reason;
                Ok(json!({ "runId": p.run_id }))
            }
            "agent.status" => {
                let p: StatusParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let runs = self.inner.runs.lock().await;
                match p.run_id {
                    Some(id) => {
                        let handle = runs
                            .get(&id)
                            .ok_or_else(|| RpcError::new(ErrorKind::NotFound, format!("no such run `{id}`")))?;
                        Ok(serde_json::to_value(&handle.info).unwrap())
                    }
                    None => {
                        let all: Vec<&AgentRunInfo> = runs.values().map(|h| &h.info).collect();
                        Ok(json!({ "runs": all }))
                    }
                }
            }
            other => Err(RpcError::new(ErrorKind::NotFound, format!("no such method `{other}`"))),
        }
    }

    async fn handle_event(&self, name: &str, payload: serde_json::Value) {
        match name {
            "message.received" | "cron.trigger" => {
                let Some(session_key) = payload.get("sessionKey").and_then(|v| v.as_str()) else {
                    warn!(event = name, "missing sessionKey on inbound event");
                    return;
                };
                let task = payload
                    .get("content")
                    .or_else(|| payload.get("task"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(client) = self.inner.client() {
                    let _ = client
                        .call::<_, serde_json::Value>(
                            "agent.run",
                            json!({ "sessionKey": session_key, "task": task }),
                            None,
                        )
                        .await;
                }
            }
            "run.completed" => {
                let success = payload.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
                if !success {
                    return;
                }
                let Some(session_key) = payload.get("sessionKey").and_then(|v| v.as_str()) else {
                    return;
                };
                // Sub-agent completions are handled by `reprompt_parent_after_subagent`,
                // and `cli:`/`cron:` roots have no channel to reply on.
                if is_subagent_key(session_key) || session_key.starts_with("cli:") || session_key.starts_with("cron:") {
                    return;
                }
                let Some((channel, user_id)) = session_key.split_once(':') else {
                    return;
                };
                let Some(response) = payload.get("response").and_then(|v| v.as_str()) else {
                    return;
                };
                if let Some(client) = self.inner.client() {
                    // Heartbeat-token stripping and chunking are the channel
                    // adapter's concern (it owns the outbound text pipeline);
                    // this handler only routes the raw response to it.
                    let _ = client
                        .call::<_, serde_json::Value>(
                            "channel.send",
                            json!({ "channel": channel, "userId": user_id, "text": response }),
                            None,
                        )
                        .await;
                }
            }
            _ => {}
        }
    }
}

// The `max_iterations` field currently mirrors the agent loop's own default
// and is not yet threaded through to `Agent`; kept here so a future
// per-session override has somewhere to live without another field added to
// the hot path.
#[allow(dead_code)]
fn _assert_max_iterations_field_used(rt: &AgentRuntime) -> u32 {
    rt.inner.max_iterations
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
